// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! In-memory index of `AmqpModel → [consumer]` holding every subscription
//! of a client. It is the source of truth used to restart consumers after a
//! channel recovery.
//!
//! Entries live in a `DashMap`, so operations on different bindings run in
//! parallel while operations on the same binding are serialized by its
//! shard lock. Within a binding consumers keep their insertion order and
//! are unique by (message type, handler type).

use crate::{
    binding::AmqpModel,
    consumer::{ConsumerKey, EventingConsumer},
};
use dashmap::DashMap;
use std::sync::Arc;

/// Registered consumers, by binding.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: DashMap<AmqpModel, Vec<Arc<dyn EventingConsumer>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Appends `consumer` to the binding's entry. Returns false, leaving the
    /// registry untouched, when an equal consumer is already registered.
    pub fn add_subscription(&self, binding: &AmqpModel, consumer: Arc<dyn EventingConsumer>) -> bool {
        let mut consumers = self.handlers.entry(binding.clone()).or_default();
        if consumers.iter().any(|c| c.key() == consumer.key()) {
            return false;
        }

        consumers.push(consumer);
        true
    }

    /// Removes the whole entry of `binding`, returning its consumers.
    pub fn remove_subscription(&self, binding: &AmqpModel) -> Option<Vec<Arc<dyn EventingConsumer>>> {
        self.handlers.remove(binding).map(|(_, consumers)| consumers)
    }

    /// Removes a single consumer, dropping the entry when it becomes empty.
    pub fn remove_consumer(&self, binding: &AmqpModel, key: &ConsumerKey) -> bool {
        let removed = match self.handlers.get_mut(binding) {
            Some(mut consumers) => {
                let before = consumers.len();
                consumers.retain(|c| c.key() != *key);
                before != consumers.len()
            }
            None => false,
        };

        self.handlers.remove_if(binding, |_, consumers| consumers.is_empty());
        removed
    }

    #[inline]
    pub fn has_subscription(&self, binding: &AmqpModel, key: &ConsumerKey) -> bool {
        match self.handlers.get(binding) {
            Some(consumers) => consumers.iter().any(|c| c.key() == *key),
            None => false,
        }
    }

    /// Point-in-time copy of every entry.
    pub fn handlers(&self) -> Vec<(AmqpModel, Vec<Arc<dyn EventingConsumer>>)> {
        self.handlers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn handlers_for(&self, binding: &AmqpModel) -> Vec<Arc<dyn EventingConsumer>> {
        self.handlers
            .get(binding)
            .map(|consumers| consumers.clone())
            .unwrap_or_default()
    }

    /// Disposes every consumer and empties the registry.
    pub fn clear(&self) {
        self.handlers.retain(|_, consumers| {
            for consumer in consumers.iter() {
                consumer.dispose();
            }
            false
        });
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
