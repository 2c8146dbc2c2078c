// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing `EventDocument`s. A
//! publish:
//! 1. Fails fast when the publish connection cannot be (re)established
//! 2. Declares the document's exchange, queue and binding
//! 3. Encodes the payload and injects the OpenTelemetry context in the
//!    headers
//! 4. Publishes, retrying transient transport failures with exponential
//!    backoff
//!
//! Declaration and encoding failures are not retried. Every operation on
//! the publisher channel goes through the channel proxy lock, so concurrent
//! publishes are serialized on the channel.

use crate::{
    channel::ChannelProxy,
    codec,
    config::RabbitConfig,
    connection::{ConnectionManager, ConnectionRole, PersistentConnection},
    envelope::EventDocument,
    errors::AmqpError,
    otel,
    retry::RetryPolicy,
    topology::{self, TopologyOptions},
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Publishes event documents over the publish connection.
pub struct RabbitMQPublisher {
    connection: Arc<PersistentConnection>,
    channel: Arc<ChannelProxy>,
    options: TopologyOptions,
    retry: RetryPolicy,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `connection` - The supervised connection to publish on
    /// * `options` - Flags used when declaring exchanges and queues
    /// * `retry` - Retry policy for transient publish failures
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(
        connection: Arc<PersistentConnection>,
        options: TopologyOptions,
        retry: RetryPolicy,
    ) -> Arc<RabbitMQPublisher> {
        let channel = ChannelProxy::new("publish", connection.clone(), None);

        Arc::new(RabbitMQPublisher {
            connection,
            channel,
            options,
            retry,
        })
    }

    /// Builds a publisher on the publish connection of `connections`.
    pub fn from_config(connections: &ConnectionManager, cfg: &RabbitConfig) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::new(
            connections.connection(ConnectionRole::Publish),
            TopologyOptions::from(cfg),
            RetryPolicy::from_config(cfg),
        )
    }

    /// Publishes `document` under the current OpenTelemetry context.
    pub async fn publish<T>(&self, document: &EventDocument<T>) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        self.publish_with_context(&Context::current(), document).await
    }

    /// Publishes `document`, propagating `ctx` in the message headers.
    ///
    /// The propagator's keys are written from `ctx` and take precedence over
    /// document headers of the same name, so consumers always parent their
    /// span on the publishing span.
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the message, or the error of the
    /// failed step (after retries for transient transport failures)
    pub async fn publish_with_context<T>(
        &self,
        ctx: &Context,
        document: &EventDocument<T>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let amqp = document.amqp();
        let message_id = document.id().to_string();

        if self.channel.is_disposed() || self.connection.is_disposed() {
            return Err(AmqpError::Disposed);
        }

        if !self.connection.ensure_connected().await {
            error!(
                exchange = amqp.exchange(),
                queue = amqp.queue(),
                message_id,
                "connection unavailable, message not published"
            );
            return Err(AmqpError::ConnectionUnavailable);
        }

        {
            let channel = self.channel.acquire().await?;
            if let Err(err) = topology::declare_path(&*channel, &self.options, amqp).await {
                error!(
                    error = err.to_string(),
                    exchange = amqp.exchange(),
                    queue = amqp.queue(),
                    message_id,
                    "failure to declare topology"
                );
                return Err(err);
            }
        }

        let payload = codec::encode(document.event())?;
        let properties = document.properties(otel::inject_context(ctx));

        let payload = payload.as_slice();
        let properties = &properties;
        let channel = &self.channel;

        match self
            .retry
            .execute("publish", || async move {
                let lease = channel.acquire().await?;
                lease
                    .basic_publish(
                        amqp.exchange(),
                        amqp.routing_key(),
                        payload,
                        properties.clone(),
                    )
                    .await
            })
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = amqp.exchange(),
                    routing_key = amqp.routing_key(),
                    message_id,
                    "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(
                    exchange = amqp.exchange(),
                    routing_key = amqp.routing_key(),
                    message_id,
                    "message published"
                );
                Ok(())
            }
        }
    }

    pub async fn dispose(&self) {
        self.channel.dispose().await;
    }
}
