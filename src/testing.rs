// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and helpers shared by the unit tests.
//!
//! `FakeBroker` implements the transport traits with exchanges, queues,
//! fanout/direct/topic routing, manual-ack consumers and failure
//! injection, so publish/subscribe flows can be exercised end to end
//! without a RabbitMQ server.

use crate::{
    binding::BindingKind,
    consumer::{DeliveryContext, Handler, HandlerError},
    errors::AmqpError,
    listeners::{FailureCallback, FailureEvent, ListenerHandle, Listeners},
    resolver::{HandlerRegistry, ServiceResolver},
    transport::{
        Acknowledge, AmqpChannel, AmqpConnection, DeclareOptions, DeliveryListener,
        IncomingDelivery, Transport,
    },
};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// Polls `condition` until it holds or `limit` elapses.
pub(crate) async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    assert!(
        wait_until(Duration::from_secs(5), condition).await,
        "condition not reached in time"
    );
}

/// Acknowledger counting how deliveries were settled.
#[derive(Default)]
pub(crate) struct RecordingAcker {
    acks: AtomicUsize,
    nacks: AtomicUsize,
    requeued: AtomicBool,
}

impl RecordingAcker {
    pub(crate) fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }

    pub(crate) fn requeued(&self) -> bool {
        self.requeued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledge for RecordingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        self.requeued.fetch_or(requeue, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ping {
    pub(crate) seq: u32,
}

pub(crate) type Seen = Arc<Mutex<Vec<(Ping, DeliveryContext)>>>;

/// Records every message it handles.
pub(crate) struct RecordingHandler {
    seen: Seen,
}

#[async_trait]
impl Handler<Ping> for RecordingHandler {
    async fn handle(&self, message: Ping, context: &DeliveryContext) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .map_err(|_| "recorder poisoned")?
            .push((message, context.clone()));
        Ok(())
    }
}

pub(crate) struct AuditHandler;

#[async_trait]
impl Handler<Ping> for AuditHandler {
    async fn handle(&self, _: Ping, _: &DeliveryContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Resolver building `RecordingHandler`s over `seen`, and `AuditHandler`s.
pub(crate) fn resolver(seen: &Seen) -> Arc<dyn ServiceResolver> {
    let seen = seen.clone();
    Arc::new(
        HandlerRegistry::new()
            .register(move || RecordingHandler { seen: seen.clone() })
            .register(|| AuditHandler),
    )
}

pub(crate) fn seen_count(seen: &Seen) -> usize {
    seen.lock().map(|s| s.len()).unwrap_or_default()
}

struct Message {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
}

struct Subscriber {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<IncomingDelivery>,
}

#[derive(Default)]
struct Queue {
    arguments: FieldTable,
    backlog: VecDeque<Message>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, BindingKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String, String)>,
}

#[derive(Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    refuse_connections: AtomicBool,
    publish_failure: Mutex<Option<AmqpError>>,
    ids: AtomicU64,
    delivery_tags: AtomicU64,
    connects: AtomicUsize,
    channels: AtomicUsize,
    publish_attempts: AtomicUsize,
    deletes: AtomicUsize,
    cancels: AtomicUsize,
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

impl BrokerState {
    fn topology(&self) -> std::sync::MutexGuard<'_, Topology> {
        self.topology
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn deliver(self: &Arc<Self>, queue: &mut Queue, message: Message) {
        if queue.subscribers.is_empty() {
            queue.backlog.push_back(message);
            return;
        }

        let index = queue.next % queue.subscribers.len();
        queue.next = queue.next.wrapping_add(1);

        let delivery = IncomingDelivery {
            delivery_tag: self.delivery_tags.fetch_add(1, Ordering::SeqCst) + 1,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: false,
            properties: message.properties,
            data: message.data,
            acker: Arc::new(FakeAcker {
                broker: self.clone(),
            }),
        };
        let _ = queue.subscribers[index].sender.send(delivery);
    }

    /// Drops every consumer started on `channel`.
    fn forget_channel(&self, channel: u64) {
        for queue in self.topology().queues.values_mut() {
            queue.subscribers.retain(|s| s.channel != channel);
        }
    }
}

/// In-memory AMQP broker.
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state.channels.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn deletes(&self) -> usize {
        self.state.deletes.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn acks(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn nacks(&self) -> usize {
        self.state.nacks.load(Ordering::SeqCst)
    }

    pub(crate) fn has_exchange(&self, exchange: &str) -> bool {
        self.state.topology().exchanges.contains_key(exchange)
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.state.topology().queues.contains_key(queue)
    }

    pub(crate) fn is_bound(&self, exchange: &str, queue: &str) -> bool {
        self.state
            .topology()
            .bindings
            .iter()
            .any(|(e, q, _)| e == exchange && q == queue)
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .topology()
            .queues
            .get(queue)
            .map(|q| q.subscribers.len())
            .unwrap_or_default()
    }

    pub(crate) fn backlog(&self, queue: &str) -> usize {
        self.state
            .topology()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or_default()
    }

    pub(crate) fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state
            .topology()
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes every publish fail with `failure` until reset with `None`.
    pub(crate) fn fail_publishes(&self, failure: Option<AmqpError>) {
        *self
            .state
            .publish_failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = failure;
    }

    /// Breaks every open channel carrying consumers, the way a failing
    /// consumer dispatch does.
    pub(crate) fn fail_consumer_channels(&self) {
        for channel in self.open_channels() {
            if channel.has_consumers() {
                channel.shut(FailureEvent::CallbackException(
                    "consumer dispatch failed".to_owned(),
                ));
            }
        }
    }

    /// Breaks every open channel carrying consumers and reports one callback
    /// exception per consumer stream, as the lapin driver does when the
    /// channel under several consumers dies.
    pub(crate) fn break_consumer_streams(&self) {
        for channel in self.open_channels() {
            let streams = channel.consumer_count();
            if streams == 0 {
                continue;
            }

            channel.open.store(false, Ordering::SeqCst);
            self.state.forget_channel(channel.id);
            for stream in 0..streams {
                channel.listeners.notify(FailureEvent::CallbackException(format!(
                    "consumer stream {} ended",
                    stream
                )));
            }
        }
    }

    /// Redeclares `exchange` with another kind behind the client's back, so
    /// later declarations of the original kind are refused.
    pub(crate) fn redefine_exchange(&self, exchange: &str, kind: BindingKind) {
        self.state
            .topology()
            .exchanges
            .insert(exchange.to_owned(), kind);
    }

    /// Drops every connection, as a broker restart would.
    pub(crate) fn drop_connections(&self) {
        let connections: Vec<Arc<FakeConnection>> = self
            .state
            .connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();

        for connection in connections {
            connection.drop_connection();
        }
    }

    fn open_channels(&self) -> Vec<Arc<FakeChannel>> {
        let connections: Vec<Arc<FakeConnection>> = self
            .state
            .connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();

        connections
            .iter()
            .flat_map(|c| c.channels())
            .filter(|c| c.is_open())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            state: self.state.clone(),
            open: Arc::new(AtomicBool::new(true)),
            listeners: Listeners::default(),
            channels: Mutex::new(Vec::new()),
        });
        if let Ok(mut connections) = self.state.connections.lock() {
            connections.push(connection.clone());
        }

        Ok(connection)
    }
}

struct FakeConnection {
    state: Arc<BrokerState>,
    open: Arc<AtomicBool>,
    listeners: Listeners,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn drop_connection(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        self.listeners
            .notify(FailureEvent::Shutdown("connection reset by peer".to_owned()));

        // consumer streams fail with their connection
        for channel in self.channels() {
            let event = if channel.has_consumers() {
                FailureEvent::CallbackException("consumer stream ended".to_owned())
            } else {
                FailureEvent::Shutdown("connection closed".to_owned())
            };
            channel.shut(event);
        }
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        "fake:5672".to_owned()
    }

    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle {
        self.listeners.register(callback)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::TransportError("connection closed".to_owned()));
        }

        self.state.channels.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(FakeChannel {
            id: self.state.ids.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
            open: AtomicBool::new(true),
            connection_open: self.open.clone(),
            listeners: Listeners::default(),
        });
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(channel.clone());
        }

        Ok(channel)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels() {
            channel.open.store(false, Ordering::SeqCst);
            self.state.forget_channel(channel.id);
        }
    }
}

struct FakeChannel {
    id: u64,
    state: Arc<BrokerState>,
    open: AtomicBool,
    connection_open: Arc<AtomicBool>,
    listeners: Listeners,
}

impl FakeChannel {
    fn has_consumers(&self) -> bool {
        self.consumer_count() > 0
    }

    fn consumer_count(&self) -> usize {
        self.state
            .topology()
            .queues
            .values()
            .map(|q| q.subscribers.iter().filter(|s| s.channel == self.id).count())
            .sum()
    }

    fn shut(&self, event: FailureEvent) {
        self.open.store(false, Ordering::SeqCst);
        self.state.forget_channel(self.id);
        self.listeners.notify(event);
    }

    fn check_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            return Ok(());
        }
        Err(AmqpError::TransportError("channel closed".to_owned()))
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    fn on_failure(&self, callback: FailureCallback) -> ListenerHandle {
        self.listeners.register(callback)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: BindingKind,
        _: DeclareOptions,
        _: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut topology = self.state.topology();
        match topology.exchanges.get(exchange) {
            Some(existing) if *existing != kind => {
                Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
            }
            _ => {
                topology.exchanges.insert(exchange.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _: DeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.state
            .topology()
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| Queue {
                arguments,
                ..Queue::default()
            });
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut topology = self.state.topology();
        if !topology.exchanges.contains_key(exchange) || !topology.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (exchange.to_owned(), queue.to_owned(), routing_key.to_owned());
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self
            .state
            .publish_failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
        {
            return Err(failure);
        }
        self.check_open()?;

        let mut topology = self.state.topology();
        let targets: BTreeSet<String> = if exchange.is_empty() {
            topology
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let kind = *topology
                .exchanges
                .get(exchange)
                .ok_or_else(|| AmqpError::PublishingError(format!("no exchange `{}`", exchange)))?;

            topology
                .bindings
                .iter()
                .filter(|(e, _, key)| e == exchange && routes(kind, key, routing_key))
                .map(|(_, q, _)| q.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = topology.queues.get_mut(&target) {
                self.state.deliver(
                    queue,
                    Message {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        properties: properties.clone(),
                        data: payload.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<IncomingDelivery>();

        {
            let mut topology = self.state.topology();
            let target = topology
                .queues
                .get_mut(queue)
                .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;

            target.subscribers.push(Subscriber {
                tag: consumer_tag.to_owned(),
                channel: self.id,
                sender,
            });

            while let Some(message) = target.backlog.pop_front() {
                self.state.deliver(target, message);
            }
        }

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                listener.on_delivery(delivery).await;
            }
        });

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.check_open()?;
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        for queue in self.state.topology().queues.values_mut() {
            queue.subscribers.retain(|s| s.tag != consumer_tag);
        }
        Ok(())
    }

    async fn queue_delete(&self, queue: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.check_open()?;
        let mut topology = self.state.topology();
        let in_use = topology
            .queues
            .get(queue)
            .is_some_and(|q| !q.subscribers.is_empty());
        if if_unused && in_use {
            return Err(AmqpError::DeleteQueueError(queue.to_owned()));
        }

        self.state.deletes.fetch_add(1, Ordering::SeqCst);
        topology.queues.remove(queue);
        topology.bindings.retain(|(_, q, _)| q != queue);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.state.forget_channel(self.id);
    }
}

struct FakeAcker {
    broker: Arc<BrokerState>,
}

#[async_trait]
impl Acknowledge for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, _: bool) -> Result<(), AmqpError> {
        self.broker.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn routes(kind: BindingKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        BindingKind::Fanout => true,
        BindingKind::Direct => binding_key == routing_key,
        BindingKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((part, key_rest))) => word == part && topic_matches(rest, key_rest),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards_follow_amqp_rules() {
        assert!(routes(BindingKind::Topic, "order.*", "order.created"));
        assert!(!routes(BindingKind::Topic, "order.*", "order.created.eu"));
        assert!(routes(BindingKind::Topic, "order.#", "order.created.eu"));
        assert!(routes(BindingKind::Topic, "order.#", "order"));
        assert!(routes(BindingKind::Topic, "#", "anything.at.all"));
        assert!(!routes(BindingKind::Topic, "payment.*", "order.created"));
    }
}
