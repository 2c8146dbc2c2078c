// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! `Rabbit` wires the connection manager, the publisher and the
//! subscription manager of one application together. It is the entry point
//! most applications need:
//!
//! ```no_run
//! use rabbitmq_resilience::{AmqpModel, EventDocument, HandlerRegistry, Rabbit, RabbitConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), rabbitmq_resilience::AmqpError> {
//! let rabbit = Rabbit::connect(RabbitConfig::default(), Arc::new(HandlerRegistry::new())).await;
//! let orders = AmqpModel::fanout("orders", "billing")?;
//! rabbit
//!     .publish(&EventDocument::new(serde_json::json!({ "id": 1 }), orders))
//!     .await?;
//! rabbit.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    binding::AmqpModel,
    config::RabbitConfig,
    connection::ConnectionManager,
    consumer::Handler,
    driver::LapinTransport,
    envelope::EventDocument,
    errors::AmqpError,
    publisher::RabbitMQPublisher,
    resolver::ServiceResolver,
    subscription::Subscription,
    transport::Transport,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Publishing and subscribing over one set of supervised connections.
pub struct Rabbit {
    cfg: RabbitConfig,
    connections: Arc<ConnectionManager>,
    publisher: Arc<RabbitMQPublisher>,
    subscription: Subscription,
}

impl Rabbit {
    /// Builds a client on lapin for the broker of `cfg`.
    pub async fn connect(cfg: RabbitConfig, resolver: Arc<dyn ServiceResolver>) -> Rabbit {
        let transport = Arc::new(LapinTransport::new(&cfg));
        Rabbit::with_transport(cfg, transport, resolver).await
    }

    /// Builds a client on any transport and connects eagerly.
    ///
    /// An unreachable broker is not an error here: the connections are
    /// established again on first use.
    pub async fn with_transport(
        cfg: RabbitConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Rabbit {
        let connections = Arc::new(ConnectionManager::new(&cfg, transport));
        let publisher = RabbitMQPublisher::from_config(&connections, &cfg);
        let subscription = Subscription::from_config(&connections, &cfg, resolver);

        if connections.connect_all().await {
            info!(endpoint = cfg.endpoint(), "rabbitmq client ready");
        } else {
            warn!(
                endpoint = cfg.endpoint(),
                "broker unreachable, connecting on first use"
            );
        }

        Rabbit {
            cfg,
            connections,
            publisher,
            subscription,
        }
    }

    pub fn config(&self) -> &RabbitConfig {
        &self.cfg
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn publisher(&self) -> &Arc<RabbitMQPublisher> {
        &self.publisher
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub async fn publish<T>(&self, document: &EventDocument<T>) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        self.publisher.publish(document).await
    }

    pub async fn publish_with_context<T>(
        &self,
        ctx: &Context,
        document: &EventDocument<T>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        self.publisher.publish_with_context(ctx, document).await
    }

    pub async fn subscribe<M, H>(&self, amqp: &AmqpModel) -> bool
    where
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
    {
        self.subscription.subscribe::<M, H>(amqp).await
    }

    pub async fn unsubscribe(&self, amqp: &AmqpModel) -> bool {
        self.subscription.unsubscribe(amqp).await
    }

    /// Stops every consumer and closes the channels, then the connections.
    pub async fn shutdown(&self) {
        self.subscription.dispose().await;
        self.publisher.dispose().await;
        self.connections.dispose().await;
        info!(endpoint = self.cfg.endpoint(), "rabbitmq client stopped");
    }
}
