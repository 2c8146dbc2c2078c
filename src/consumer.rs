// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer runtime: the object that receives the
//! deliveries of one broker-level consumer, turns them into typed messages
//! and runs the user handler for each of them.
//!
//! For every delivery the runtime:
//! 1. Opens a consumer span parented on the trace context in the headers
//! 2. Decodes the JSON payload into the message type
//! 3. Resolves a fresh handler instance from the `ServiceResolver`
//! 4. Invokes the handler
//! 5. Settles the delivery: ack, or reject when the handler failed and the
//!    failure policy asks for it
//!
//! Decoding and resolution failures count as handler failures. Consumers
//! are identified by their (message type, handler type) pair.

use crate::{
    codec, otel,
    resolver::{resolve_handler, ServiceResolver},
    transport::{DeliveryListener, IncomingDelivery},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    any::{type_name, TypeId},
    borrow::Cow,
    error::Error,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{debug, error};
use uuid::Uuid;

/// Error returned by message handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerFailurePolicy {
    /// Acknowledge anyway, the message is dropped
    #[default]
    Ack,
    /// Negative-acknowledge without requeue, so a dead letter exchange
    /// configured on the queue receives it
    Reject,
}

/// Broker metadata of the delivery being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Id of the published `EventDocument`
    pub message_id: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

impl From<&IncomingDelivery> for DeliveryContext {
    fn from(delivery: &IncomingDelivery) -> Self {
        let message_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .or(delivery.properties.message_id().as_ref())
            .map(|id| id.to_string());

        DeliveryContext {
            message_id,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
        }
    }
}

/// Handles messages of type `M`.
///
/// A new handler is resolved for every delivery.
#[async_trait]
pub trait Handler<M: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: M, context: &DeliveryContext) -> Result<(), HandlerError>;
}

/// Identity of a consumer registration: the message type and the handler
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    message: TypeId,
    handler: TypeId,
    message_name: &'static str,
    handler_name: &'static str,
}

impl ConsumerKey {
    pub fn of<M: 'static, H: 'static>() -> ConsumerKey {
        ConsumerKey {
            message: TypeId::of::<M>(),
            handler: TypeId::of::<H>(),
            message_name: type_name::<M>(),
            handler_name: type_name::<H>(),
        }
    }

    pub fn message_name(&self) -> &'static str {
        self.message_name
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }
}

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.message_name, self.handler_name)
    }
}

/// A consumer registered against a binding.
pub trait EventingConsumer: DeliveryListener {
    fn key(&self) -> ConsumerKey;

    /// Tag of the broker-level consumer currently feeding this consumer.
    fn consumer_tag(&self) -> Option<String>;

    /// Epoch of the channel the current broker-level consumer runs on.
    fn channel_epoch(&self) -> Option<u64>;

    /// Generates and records the tag for a new broker-level consumer on
    /// `queue`, started on the channel of `channel_epoch`.
    fn next_consumer_tag(&self, queue: &str, channel_epoch: u64) -> String;

    /// Stops handling deliveries. Deliveries still in flight are left
    /// unsettled and will be redelivered by the broker.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    fn as_listener(self: Arc<Self>) -> Arc<dyn DeliveryListener>;
}

/// Consumer runtime decoding `M` and dispatching it to a resolved `H`.
pub struct AsyncConsumer<M, H> {
    resolver: Arc<dyn ServiceResolver>,
    policy: HandlerFailurePolicy,
    tag: Mutex<Option<(String, u64)>>,
    disposed: AtomicBool,
    _types: PhantomData<fn() -> (M, H)>,
}

impl<M, H> AsyncConsumer<M, H>
where
    M: DeserializeOwned + Send + 'static,
    H: Handler<M>,
{
    pub fn new(resolver: Arc<dyn ServiceResolver>, policy: HandlerFailurePolicy) -> Self {
        AsyncConsumer {
            resolver,
            policy,
            tag: Mutex::new(None),
            disposed: AtomicBool::new(false),
            _types: PhantomData,
        }
    }

    fn current_tag(&self) -> Option<(String, u64)> {
        self.tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn dispatch(&self, data: &[u8], context: &DeliveryContext) -> Result<(), HandlerError> {
        let message = codec::decode::<M>(data)?;
        let handler = resolve_handler::<H>(self.resolver.as_ref())?;

        handler.handle(message, context).await
    }
}

#[async_trait]
impl<M, H> DeliveryListener for AsyncConsumer<M, H>
where
    M: DeserializeOwned + Send + 'static,
    H: Handler<M>,
{
    async fn on_delivery(&self, delivery: IncomingDelivery) {
        if self.is_disposed() {
            debug!(
                delivery_tag = delivery.delivery_tag,
                "consumer disposed, leaving delivery unsettled"
            );
            return;
        }

        let (_ctx, mut span) = otel::new_span(
            &delivery.properties,
            &global::tracer("amqp consumer"),
            type_name::<M>(),
        );
        let context = DeliveryContext::from(&delivery);

        debug!(
            message_id = context.message_id,
            exchange = context.exchange,
            routing_key = context.routing_key,
            "received message"
        );

        let result = self.dispatch(&delivery.data, &context).await;

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                message_id = context.message_id,
                exchange = context.exchange,
                routing_key = context.routing_key,
                handler = type_name::<H>(),
                "error while handling msg"
            );
            span.record_error(&**err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
        }

        let settled = match (&result, self.policy) {
            (Err(_), HandlerFailurePolicy::Reject) => delivery.reject().await,
            _ => delivery.ack().await,
        };

        match settled {
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to settle msg"),
                });
            }
            Ok(_) if result.is_ok() => {
                debug!(message_id = context.message_id, "message successfully processed");
                span.set_status(Status::Ok);
            }
            Ok(_) => {}
        }
    }
}

impl<M, H> EventingConsumer for AsyncConsumer<M, H>
where
    M: DeserializeOwned + Send + 'static,
    H: Handler<M>,
{
    fn key(&self) -> ConsumerKey {
        ConsumerKey::of::<M, H>()
    }

    fn consumer_tag(&self) -> Option<String> {
        self.current_tag().map(|(tag, _)| tag)
    }

    fn channel_epoch(&self) -> Option<u64> {
        self.current_tag().map(|(_, epoch)| epoch)
    }

    fn next_consumer_tag(&self, queue: &str, channel_epoch: u64) -> String {
        let tag = format!("{}.{}", queue, Uuid::new_v4());
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = Some((tag.clone(), channel_epoch));
        tag
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn as_listener(self: Arc<Self>) -> Arc<dyn DeliveryListener> {
        self
    }
}
