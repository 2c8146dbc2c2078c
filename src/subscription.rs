// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Management
//!
//! `Subscription` starts and stops consumers on the consume connection and
//! keeps every active subscription in a `SubscriptionRegistry`.
//!
//! Subscribing declares the binding's topology, starts a broker-level
//! consumer and records it. When the consume channel fails, or its
//! connection comes back after an outage, the channel proxy calls back into
//! `resubscribe_all`, which replays the declaration and restarts every
//! registered consumer, so callers never have to subscribe again after a
//! broker or network failure. A binding that cannot be restored is logged
//! and left registered for the next resync.
//!
//! A subscription and its broker-side start happen under the channel lease,
//! which orders them with channel recoveries: a consumer is either started
//! on the recovered channel by `subscribe` or restarted by the recovery,
//! never both.

use crate::{
    binding::AmqpModel,
    channel::{ChannelLease, ChannelProxy, RecoveryHook},
    config::RabbitConfig,
    connection::{ConnectionManager, ConnectionRole, PersistentConnection},
    consumer::{AsyncConsumer, ConsumerKey, EventingConsumer, Handler, HandlerFailurePolicy},
    errors::AmqpError,
    registry::SubscriptionRegistry,
    resolver::ServiceResolver,
    topology::{self, TopologyOptions},
};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

struct SubscriptionInner {
    channel: Arc<ChannelProxy>,
    registry: SubscriptionRegistry,
    resolver: Arc<dyn ServiceResolver>,
    options: TopologyOptions,
    policy: HandlerFailurePolicy,
}

/// Subscribes handlers to bindings and keeps them subscribed.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn new(
        connection: Arc<PersistentConnection>,
        resolver: Arc<dyn ServiceResolver>,
        options: TopologyOptions,
        policy: HandlerFailurePolicy,
    ) -> Subscription {
        let inner = Arc::new_cyclic(|this: &Weak<SubscriptionInner>| {
            let this = this.clone();
            let hook: RecoveryHook = Arc::new(move || {
                let this = this.clone();
                async move {
                    if let Some(inner) = this.upgrade() {
                        inner.resubscribe_all().await;
                    }
                }
                .boxed()
            });

            SubscriptionInner {
                channel: ChannelProxy::new("consume", connection, Some(hook)),
                registry: SubscriptionRegistry::new(),
                resolver,
                options,
                policy,
            }
        });

        Subscription { inner }
    }

    /// Builds a subscription manager on the consume connection of
    /// `connections`.
    pub fn from_config(
        connections: &ConnectionManager,
        cfg: &RabbitConfig,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Subscription {
        Subscription::new(
            connections.connection(ConnectionRole::Consume),
            resolver,
            TopologyOptions::from(cfg),
            cfg.handler_failure,
        )
    }

    /// Subscribes handler `H` to the messages of type `M` arriving on
    /// `amqp`'s queue.
    ///
    /// Returns false when the same (M, H) pair is already subscribed to the
    /// binding, or when the broker refused the declaration or the consumer.
    /// A refused subscription is not kept, so it may be retried.
    pub async fn subscribe<M, H>(&self, amqp: &AmqpModel) -> bool
    where
        M: DeserializeOwned + Send + 'static,
        H: Handler<M>,
    {
        let key = ConsumerKey::of::<M, H>();
        if self.inner.registry.has_subscription(amqp, &key) {
            warn!(binding = %amqp, consumer = %key, "consumer already subscribed");
            return false;
        }

        let channel = match self.inner.channel.acquire().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), binding = %amqp, "no channel to subscribe on");
                return false;
            }
        };

        let consumer: Arc<dyn EventingConsumer> = Arc::new(AsyncConsumer::<M, H>::new(
            self.inner.resolver.clone(),
            self.inner.policy,
        ));
        if !self.inner.registry.add_subscription(amqp, consumer.clone()) {
            warn!(binding = %amqp, consumer = %key, "consumer already subscribed");
            return false;
        }

        match self.inner.start(&channel, amqp, &consumer).await {
            Ok(_) => {
                info!(binding = %amqp, consumer = %key, "consumer subscribed");
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    binding = %amqp,
                    consumer = %key,
                    "failure to subscribe"
                );
                self.inner.registry.remove_consumer(amqp, &key);
                consumer.dispose();
                false
            }
        }
    }

    /// Removes every consumer of `amqp`, cancels them on the broker and
    /// deletes the queue if no other consumer uses it.
    ///
    /// Returns false when nothing was subscribed to the binding or the queue
    /// could not be deleted; the registration is gone in both cases.
    pub async fn unsubscribe(&self, amqp: &AmqpModel) -> bool {
        let Some(consumers) = self.inner.registry.remove_subscription(amqp) else {
            debug!(binding = %amqp, "nothing subscribed to binding");
            return false;
        };

        let result = self.inner.stop(amqp, &consumers).await;
        for consumer in &consumers {
            consumer.dispose();
        }

        match result {
            Ok(_) => {
                info!(binding = %amqp, "binding unsubscribed");
                true
            }
            Err(err) => {
                error!(error = err.to_string(), binding = %amqp, "failure to unsubscribe");
                false
            }
        }
    }

    /// Restarts every registered consumer on the current consume channel.
    pub async fn resubscribe_all(&self) {
        self.inner.resubscribe_all().await;
    }

    pub fn is_subscribed<M, H>(&self, amqp: &AmqpModel) -> bool
    where
        M: 'static,
        H: 'static,
    {
        self.inner
            .registry
            .has_subscription(amqp, &ConsumerKey::of::<M, H>())
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Closes the consume channel and drops every subscription.
    pub async fn dispose(&self) {
        self.inner.channel.dispose().await;
        self.inner.registry.clear();
    }
}

impl SubscriptionInner {
    async fn start(
        &self,
        channel: &ChannelLease<'_>,
        amqp: &AmqpModel,
        consumer: &Arc<dyn EventingConsumer>,
    ) -> Result<(), AmqpError> {
        topology::declare_path(&**channel, &self.options, amqp).await?;

        let tag = consumer.next_consumer_tag(amqp.queue(), channel.epoch());
        channel
            .basic_consume(amqp.queue(), &tag, consumer.clone().as_listener())
            .await
    }

    async fn stop(
        &self,
        amqp: &AmqpModel,
        consumers: &[Arc<dyn EventingConsumer>],
    ) -> Result<(), AmqpError> {
        let channel = self.channel.acquire().await?;

        for consumer in consumers {
            // consumers of an older channel died with it
            if consumer.channel_epoch() != Some(channel.epoch()) {
                continue;
            }
            if let Some(tag) = consumer.consumer_tag() {
                if let Err(err) = channel.basic_cancel(&tag).await {
                    warn!(error = err.to_string(), consumer = tag, "failure to cancel consumer");
                }
            }
        }

        channel.queue_delete(amqp.queue(), true).await
    }

    async fn resubscribe_all(&self) {
        let snapshot = self.registry.handlers();
        info!(bindings = snapshot.len(), "resubscribing consumers");

        for (amqp, consumers) in snapshot {
            let channel = match self.channel.acquire().await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(error = err.to_string(), binding = %amqp, "no channel to resubscribe on");
                    continue;
                }
            };

            if let Err(err) = topology::declare_path(&*channel, &self.options, &amqp).await {
                error!(error = err.to_string(), binding = %amqp, "failure to redeclare binding");
                continue;
            }

            for consumer in consumers {
                if consumer.is_disposed() || consumer.channel_epoch() == Some(channel.epoch()) {
                    continue;
                }

                let tag = consumer.next_consumer_tag(amqp.queue(), channel.epoch());
                if let Err(err) = channel
                    .basic_consume(amqp.queue(), &tag, consumer.clone().as_listener())
                    .await
                {
                    error!(
                        error = err.to_string(),
                        binding = %amqp,
                        consumer = %consumer.key(),
                        "failure to restart consumer"
                    );
                }
            }
        }
    }
}
