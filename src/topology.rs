// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the broker objects a binding needs before it is published to
//! or consumed from. The declaration path is always:
//!
//! 1. the exchange (skipped for the default exchange)
//! 2. the queue, with the binding's queue arguments
//! 3. the queue binding (skipped for the default exchange)
//!
//! Declarations are idempotent on the broker side, so the path is replayed
//! freely before every publish and every (re)subscription.

use crate::{
    binding::{AmqpModel, AMQP_HEADERS_EXPIRES},
    config::RabbitConfig,
    errors::AmqpError,
    transport::{AmqpChannel, DeclareOptions},
};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortString};
use std::time::Duration;
use tracing::debug;

/// Declaration flags shared by every binding of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// `x-expires` applied to queues whose binding sets none
    pub queue_expiration: Option<Duration>,
}

impl From<&RabbitConfig> for TopologyOptions {
    fn from(cfg: &RabbitConfig) -> Self {
        TopologyOptions {
            durable: cfg.durable,
            auto_delete: cfg.auto_delete,
            exclusive: cfg.exclusive,
            queue_expiration: cfg.queue_expiration(),
        }
    }
}

impl Default for TopologyOptions {
    fn default() -> Self {
        TopologyOptions::from(&RabbitConfig::default())
    }
}

impl TopologyOptions {
    fn exchange_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable,
            exclusive: false,
            auto_delete: self.auto_delete,
        }
    }

    fn queue_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }

    fn queue_arguments(&self, amqp: &AmqpModel) -> FieldTable {
        let mut arguments = amqp.queue_arguments();

        if let Some(expiration) = self.queue_expiration {
            if !amqp.has_queue_argument(AMQP_HEADERS_EXPIRES) {
                let millis = i64::try_from(expiration.as_millis()).unwrap_or(i64::MAX);
                arguments.insert(
                    ShortString::from(AMQP_HEADERS_EXPIRES),
                    AMQPValue::LongLongInt(LongLongInt::from(millis)),
                );
            }
        }

        arguments
    }
}

/// Declares exchange, queue and binding of `amqp` on `channel`.
pub async fn declare_path(
    channel: &dyn AmqpChannel,
    options: &TopologyOptions,
    amqp: &AmqpModel,
) -> Result<(), AmqpError> {
    if !amqp.is_default_exchange() {
        debug!(
            exchange = amqp.exchange(),
            kind = amqp.kind().as_str(),
            "declaring exchange"
        );
        channel
            .exchange_declare(
                amqp.exchange(),
                amqp.kind(),
                options.exchange_options(),
                amqp.exchange_arguments(),
            )
            .await?;
    }

    debug!(queue = amqp.queue(), "declaring queue");
    channel
        .queue_declare(
            amqp.queue(),
            options.queue_options(),
            options.queue_arguments(amqp),
        )
        .await?;

    if !amqp.is_default_exchange() {
        debug!(
            exchange = amqp.exchange(),
            queue = amqp.queue(),
            routing_key = amqp.routing_key(),
            "binding queue"
        );
        channel
            .queue_bind(amqp.queue(), amqp.exchange(), amqp.routing_key())
            .await?;
    }

    Ok(())
}
