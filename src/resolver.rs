// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Resolution
//!
//! Consumers never hold a handler instance. For every delivery they ask a
//! `ServiceResolver` for a fresh one, which is dropped as soon as the
//! delivery has been handled. `HandlerRegistry` is the resolver shipped
//! with the crate: a map from handler type to factory closure.

use crate::errors::AmqpError;
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// Creates handler instances by type.
pub trait ServiceResolver: Send + Sync {
    /// Returns a new boxed instance of the type identified by `type_id`,
    /// or `None` when the type is unknown.
    fn resolve(&self, type_id: TypeId) -> Option<Box<dyn Any + Send>>;
}

type Factory = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Resolver backed by one factory closure per handler type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<TypeId, Factory>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers the factory used to build `H` for each delivery. A second
    /// registration for the same type replaces the first.
    pub fn register<H, F>(mut self, factory: F) -> Self
    where
        H: Send + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || Box::new(factory()) as Box<dyn Any + Send>),
        );
        self
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<H>())
    }
}

impl ServiceResolver for HandlerRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<Box<dyn Any + Send>> {
        self.factories.get(&type_id).map(|factory| factory())
    }
}

/// Resolves a new `H` from `resolver`.
pub(crate) fn resolve_handler<H: 'static>(resolver: &dyn ServiceResolver) -> Result<Box<H>, AmqpError> {
    resolver
        .resolve(TypeId::of::<H>())
        .and_then(|instance| instance.downcast::<H>().ok())
        .ok_or_else(|| AmqpError::HandlerNotRegistered(type_name::<H>().to_owned()))
}
