// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Driver Interface
//!
//! The resilience layer never talks to a broker library directly. It drives
//! the primitive AMQP operations through the traits in this module:
//!
//! - `Transport`: opens connections
//! - `AmqpConnection`: a live connection that opens channels
//! - `AmqpChannel`: declare, bind, publish, consume, cancel and delete
//!
//! Connections and channels expose their failure signals through
//! `on_failure`. The production implementation lives in `driver` and is
//! backed by lapin.

use crate::{
    binding::BindingKind,
    errors::AmqpError,
    listeners::{FailureCallback, ListenerHandle},
};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use std::{fmt, sync::Arc};

/// Flags applied when declaring exchanges and queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Broker address without credentials, for diagnostics.
    fn endpoint(&self) -> String;

    /// Registers a callback for shutdown, callback-exception and blocked
    /// signals of this connection.
    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self);
}

/// A channel multiplexed over a connection.
///
/// Channels are not safe for concurrent use by multiple logical operations;
/// callers go through a `ChannelProxy` which serializes access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: BindingKind,
        options: DeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: DeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    ///
    /// Deliveries are handed to `listener` one at a time, in broker order.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<(), AmqpError>;

    async fn close(&self);
}

/// Settles a single delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Receives the deliveries of one broker-level consumer.
#[async_trait]
pub trait DeliveryListener: Send + Sync {
    async fn on_delivery(&self, delivery: IncomingDelivery);
}

/// A message delivered by the broker to a consumer.
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Arc<dyn Acknowledge>,
}

impl IncomingDelivery {
    /// Positive acknowledgement of this delivery only.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negative acknowledgement without requeue, dead-lettering the message
    /// when the queue has a dead letter exchange.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        self.acker.nack(false).await
    }
}

impl fmt::Debug for IncomingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}
