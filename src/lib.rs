// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod binding;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod driver;
pub mod envelope;
pub mod errors;
pub mod listeners;
pub mod publisher;
pub mod rabbit;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod subscription;
pub mod topology;
pub mod transport;

pub use binding::{AmqpModel, BindingKind};
pub use config::RabbitConfig;
pub use consumer::{DeliveryContext, Handler, HandlerError, HandlerFailurePolicy};
pub use envelope::{DeliveryMode, EventDocument};
pub use errors::AmqpError;
pub use rabbit::Rabbit;
pub use resolver::{HandlerRegistry, ServiceResolver};
