// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport Driver
//!
//! This module implements the transport traits on top of lapin. It
//! establishes connections from the client configuration, opens channels,
//! and maps every lapin failure onto `AmqpError`, distinguishing transport
//! faults (socket errors, closed connection or channel) from broker-side
//! refusals.
//!
//! Failure signals are forwarded to `Listeners`:
//! - lapin connection and channel errors become `FailureEvent::Shutdown`
//! - an error surfacing from a consumer stream becomes
//!   `FailureEvent::CallbackException` on the channel owning the consumer

use crate::{
    binding::BindingKind,
    config::RabbitConfig,
    errors::AmqpError,
    listeners::{FailureCallback, FailureEvent, ListenerHandle, Listeners},
    transport::{
        Acknowledge, AmqpChannel, AmqpConnection, DeclareOptions, DeliveryListener,
        IncomingDelivery, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections to the broker described by a `RabbitConfig`.
pub struct LapinTransport {
    uri: String,
    endpoint: String,
    connection_name: String,
}

impl LapinTransport {
    pub fn new(cfg: &RabbitConfig) -> LapinTransport {
        LapinTransport {
            uri: cfg.uri(),
            endpoint: cfg.endpoint(),
            connection_name: cfg.app_name.clone(),
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(endpoint = self.endpoint, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    endpoint = self.endpoint,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!(endpoint = self.endpoint, "amqp connected");

        Ok(Arc::new(LapinConnection::new(conn, self.endpoint.clone())))
    }
}

/// A lapin connection with its failure listeners.
pub struct LapinConnection {
    connection: Connection,
    endpoint: String,
    listeners: Listeners,
}

impl LapinConnection {
    fn new(connection: Connection, endpoint: String) -> LapinConnection {
        let listeners = Listeners::default();

        let notifier = listeners.clone();
        connection.on_error(move |err| {
            notifier.notify(FailureEvent::Shutdown(err.to_string()));
        });

        LapinConnection {
            connection,
            endpoint,
            listeners,
        }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle {
        self.listeners.register(callback)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.connection.close(REPLY_SUCCESS, "OK").await {
            debug!(error = err.to_string(), "connection was already closed");
        }
    }
}

/// A lapin channel with its failure listeners.
pub struct LapinChannel {
    channel: Channel,
    listeners: Listeners,
}

impl LapinChannel {
    fn new(channel: Channel) -> LapinChannel {
        let listeners = Listeners::default();

        let notifier = listeners.clone();
        channel.on_error(move |err| {
            notifier.notify(FailureEvent::Shutdown(err.to_string()));
        });

        LapinChannel { channel, listeners }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle {
        self.listeners.register(callback)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: BindingKind,
        options: DeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                exchange,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: false,
                    nowait: false,
                },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to declare the exchange"
                );
                Err(classify(err, |_| {
                    AmqpError::DeclareExchangeError(exchange.to_owned())
                }))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: DeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to declare the queue");
                Err(classify(err, |_| AmqpError::DeclareQueueError(queue.to_owned())))
            }
            _ => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(err, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                }))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(classify(err, AmqpError::PublishingError))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<(), AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(classify(err, |_| {
                    AmqpError::BindingConsumerError(queue.to_owned())
                }))
            }
            Ok(c) => Ok(c),
        }?;

        let listeners = self.listeners.clone();
        let tag = consumer_tag.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => listener.on_delivery(incoming(delivery)).await,
                    Err(err) => {
                        error!(error = err.to_string(), consumer = tag, "errors consume msg");
                        listeners.notify(FailureEvent::CallbackException(err.to_string()));
                        return;
                    }
                }
            }

            debug!(consumer = tag, "consumer stream finished");
        });

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), consumer = consumer_tag, "error to cancel the consumer");
                classify(err, |_| AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            })
    }

    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused,
                    if_empty: false,
                    nowait: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to delete the queue");
                Err(classify(err, |_| AmqpError::DeleteQueueError(queue.to_owned())))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = err.to_string(), "channel was already closed");
        }
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while acking msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while nacking msg");
                AmqpError::NackMessageError
            })
    }
}

fn incoming(delivery: Delivery) -> IncomingDelivery {
    IncomingDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
        acker: Arc::new(LapinAcker(delivery.acker)),
    }
}

/// Maps a lapin error to `TransportError` when the socket, connection or
/// channel is gone, and to the operation specific error otherwise.
fn classify<F>(err: lapin::Error, otherwise: F) -> AmqpError
where
    F: FnOnce(String) -> AmqpError,
{
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::MissingHeartbeatError => AmqpError::TransportError(err.to_string()),
        other => otherwise(other.to_string()),
    }
}
