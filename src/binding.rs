// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Descriptors
//!
//! An `AmqpModel` describes one exchange → queue binding: the exchange type,
//! the exchange and queue names, the routing key and optional declare
//! arguments. Descriptors are built once through the named constructors and
//! are immutable afterwards, which makes them usable as keys of the
//! subscription registry.
//!
//! Identity is defined by (kind, exchange, queue, routing key) only. Two
//! descriptors that differ just in their declare arguments (TTL, dead
//! lettering, ...) refer to the same subscription.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    time::Duration,
};

/// Queue argument holding the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument holding the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument holding the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument holding the idle time after which the queue is deleted
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// The exchange types a binding can route through.
///
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Fanout,
    Direct,
    Topic,
}

impl BindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingKind::Fanout => "fanout",
            BindingKind::Direct => "direct",
            BindingKind::Topic => "topic",
        }
    }
}

impl From<BindingKind> for lapin::ExchangeKind {
    fn from(kind: BindingKind) -> lapin::ExchangeKind {
        match kind {
            BindingKind::Fanout => lapin::ExchangeKind::Fanout,
            BindingKind::Direct => lapin::ExchangeKind::Direct,
            BindingKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Immutable description of an exchange/queue/routing-key binding.
#[derive(Debug, Clone)]
pub struct AmqpModel {
    kind: BindingKind,
    exchange: String,
    queue: String,
    routing_key: String,
    exchange_args: BTreeMap<ShortString, AMQPValue>,
    queue_args: BTreeMap<ShortString, AMQPValue>,
}

impl AmqpModel {
    /// Binds `queue` to a fanout `exchange`. The routing key is empty.
    pub fn fanout(exchange: &str, queue: &str) -> Result<AmqpModel, AmqpError> {
        required("exchange", exchange)?;
        required("queue", queue)?;

        Ok(AmqpModel::build(BindingKind::Fanout, exchange, queue, ""))
    }

    /// Binds `queue` to a direct `exchange`.
    ///
    /// The routing key defaults to the queue name when none (or a blank one)
    /// is given.
    pub fn direct(
        exchange: &str,
        queue: &str,
        routing_key: Option<&str>,
    ) -> Result<AmqpModel, AmqpError> {
        required("exchange", exchange)?;
        required("queue", queue)?;

        let routing_key = routing_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or(queue);

        Ok(AmqpModel::build(BindingKind::Direct, exchange, queue, routing_key))
    }

    /// Binds `queue` to a topic `exchange` with a routing pattern.
    pub fn topic(exchange: &str, queue: &str, routing_key: &str) -> Result<AmqpModel, AmqpError> {
        required("exchange", exchange)?;
        required("queue", queue)?;
        required("routing key", routing_key)?;

        Ok(AmqpModel::build(BindingKind::Topic, exchange, queue, routing_key))
    }

    /// Targets `queue` through the broker default exchange.
    ///
    /// No exchange is declared and no binding is made; messages are routed
    /// to the queue by using its name as routing key.
    pub fn default_exchange(queue: &str) -> Result<AmqpModel, AmqpError> {
        required("queue", queue)?;

        Ok(AmqpModel::build(BindingKind::Direct, "", queue, queue))
    }

    fn build(kind: BindingKind, exchange: &str, queue: &str, routing_key: &str) -> AmqpModel {
        AmqpModel {
            kind,
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            exchange_args: BTreeMap::default(),
            queue_args: BTreeMap::default(),
        }
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// True when messages go through the nameless broker default exchange.
    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }

    pub fn exchange_arguments(&self) -> FieldTable {
        FieldTable::from(self.exchange_args.clone())
    }

    pub fn queue_arguments(&self) -> FieldTable {
        FieldTable::from(self.queue_args.clone())
    }

    pub(crate) fn has_queue_argument(&self, key: &str) -> bool {
        self.queue_args.contains_key(key)
    }

    /// Adds an argument sent with the exchange declaration.
    pub fn with_exchange_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.exchange_args.insert(ShortString::from(key), value);
        self
    }

    /// Adds an argument sent with the queue declaration.
    pub fn with_queue_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.queue_args.insert(ShortString::from(key), value);
        self
    }

    /// Deletes the queue after it has been unused for `expiration`.
    pub fn with_queue_expiration(self, expiration: Duration) -> Self {
        self.with_queue_argument(AMQP_HEADERS_EXPIRES, millis(expiration))
    }

    /// Discards messages that stay in the queue longer than `ttl`.
    pub fn with_message_ttl(self, ttl: Duration) -> Self {
        self.with_queue_argument(AMQP_HEADERS_MESSAGE_TTL, millis(ttl))
    }

    /// Limits the number of ready messages the queue holds.
    pub fn with_max_length(self, max: i64) -> Self {
        self.with_queue_argument(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongLongInt(max))
    }

    /// Routes rejected and expired messages to `exchange`.
    ///
    /// When `routing_key` is omitted the broker keeps the original one.
    pub fn with_dead_letter(self, exchange: &str, routing_key: Option<&str>) -> Self {
        let model = self.with_queue_argument(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        );

        match routing_key {
            Some(key) => model.with_queue_argument(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                AMQPValue::LongString(LongString::from(key)),
            ),
            None => model,
        }
    }
}

impl PartialEq for AmqpModel {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.exchange == other.exchange
            && self.queue == other.queue
            && self.routing_key == other.routing_key
    }
}

impl Eq for AmqpModel {}

impl Hash for AmqpModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.exchange.hash(state);
        self.queue.hash(state);
        self.routing_key.hash(state);
    }
}

impl fmt::Display for AmqpModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} ({})",
            self.kind.as_str(),
            self.exchange,
            self.queue,
            self.routing_key
        )
    }
}

fn required(field: &str, value: &str) -> Result<(), AmqpError> {
    if value.trim().is_empty() {
        return Err(AmqpError::InvalidBinding(format!("{} must not be empty", field)));
    }

    Ok(())
}

fn millis(duration: Duration) -> AMQPValue {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    AMQPValue::LongLongInt(LongLongInt::from(millis))
}
