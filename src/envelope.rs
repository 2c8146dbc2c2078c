// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! An `EventDocument` wraps a payload with everything needed to publish it:
//! the binding it targets, a unique id, persistence, expiration and custom
//! headers. The id is generated when the document is created and travels
//! as both the AMQP message id and correlation id, so consumers see it in
//! their `DeliveryContext`.

use crate::{binding::AmqpModel, codec::JSON_CONTENT_TYPE};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// AMQP delivery mode of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Kept in memory only
    Transient = 1,
    /// Written to disk by the broker when the queue is durable
    #[default]
    Persistent = 2,
}

/// A payload ready to be published to a binding.
#[derive(Debug, Clone)]
pub struct EventDocument<T> {
    id: Uuid,
    event: T,
    amqp: AmqpModel,
    delivery_mode: DeliveryMode,
    expiration: Option<Duration>,
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl<T> EventDocument<T> {
    pub fn new(event: T, amqp: AmqpModel) -> EventDocument<T> {
        EventDocument {
            id: Uuid::new_v4(),
            event,
            amqp,
            delivery_mode: DeliveryMode::default(),
            expiration: None,
            headers: BTreeMap::default(),
        }
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Drops the message if it is not consumed within `ttl`.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Adds a custom header, replacing any value previously set for `key`.
    ///
    /// Keys used by the trace context propagator (`traceparent`,
    /// `tracestate`, `baggage`) are reserved: the publisher overwrites them
    /// with the context of the publishing span.
    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event(&self) -> &T {
        &self.event
    }

    pub fn amqp(&self) -> &AmqpModel {
        &self.amqp
    }

    pub fn mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.expiration
    }

    pub fn headers(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.headers
    }

    /// Builds the publish properties, merging the document headers into
    /// `headers`, which already carries the trace context. Trace keys are
    /// never overwritten by document headers.
    pub(crate) fn properties(&self, mut headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        for (key, value) in &self.headers {
            headers.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let id = ShortString::from(self.id.to_string());
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(self.delivery_mode as u8)
            .with_message_id(id.clone())
            .with_correlation_id(id)
            .with_headers(FieldTable::from(headers));

        match self.expiration {
            Some(ttl) => properties.with_expiration(ShortString::from(ttl.as_millis().to_string())),
            None => properties,
        }
    }
}
