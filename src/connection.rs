// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Supervision
//!
//! A `PersistentConnection` owns one broker connection for the lifetime of
//! the service. It connects lazily (or eagerly through `connect`), watches
//! the connection's failure signals and reconnects on shutdown, blocked and
//! callback-exception events. All connection attempts are serialized by an
//! async mutex, so concurrent callers of `ensure_connected` wait for a
//! single attempt instead of racing each other.
//!
//! Every successful connect starts a new generation. A failure reported by
//! a connection from an older generation is ignored, so a late signal from
//! a replaced connection never tears down its successor. Every generation
//! after the first is announced to the `on_reconnected` listeners, which
//! the consume side uses to restart its consumers.
//!
//! `ConnectionManager` groups the supervisors of a client: one shared
//! connection, or a second dedicated one for consumers.

use crate::{
    config::RabbitConfig,
    errors::AmqpError,
    listeners::{spawn_reaction, FailureEvent, ListenerHandle, Listeners, ReconnectCallback},
    transport::{AmqpChannel, AmqpConnection, Transport},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, PoisonError, Weak,
};
use tokio::{runtime::Handle, sync::Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, no reconnect happens after disposal
    Disposed,
}

#[derive(Default)]
struct ConnectionSlot {
    connection: Option<Arc<dyn AmqpConnection>>,
    listener: Option<ListenerHandle>,
    generation: u64,
}

impl ConnectionSlot {
    fn is_open(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
    }
}

/// A broker connection that re-establishes itself after failures.
pub struct PersistentConnection {
    name: String,
    transport: Arc<dyn Transport>,
    runtime: Option<Handle>,
    slot: Mutex<ConnectionSlot>,
    state: StdMutex<ConnectionState>,
    disposed: AtomicBool,
    reconnected: Listeners<u64>,
    this: Weak<PersistentConnection>,
}

impl PersistentConnection {
    /// Creates a disconnected supervisor. Failure reactions are spawned on
    /// the tokio runtime current at construction time.
    pub fn new(name: &str, transport: Arc<dyn Transport>) -> Arc<PersistentConnection> {
        Arc::new_cyclic(|this| PersistentConnection {
            name: name.to_owned(),
            transport,
            runtime: Handle::try_current().ok(),
            slot: Mutex::new(ConnectionSlot::default()),
            state: StdMutex::new(ConnectionState::Disconnected),
            disposed: AtomicBool::new(false),
            reconnected: Listeners::default(),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Registers a callback run, with the new generation, each time a
    /// connection replaces a previous one. Callbacks run while the
    /// connection is locked and must not wait on it.
    pub fn on_reconnected(&self, callback: ReconnectCallback) -> ListenerHandle {
        self.reconnected.register(callback)
    }

    /// Replaces the current connection with a new one.
    ///
    /// Returns false when the broker could not be reached; the failure is
    /// logged, never returned.
    pub async fn connect(&self) -> bool {
        let mut slot = self.slot.lock().await;
        self.open(&mut slot).await
    }

    /// Returns true when a live connection exists, connecting first if
    /// needed.
    pub async fn ensure_connected(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.is_open() {
            return true;
        }

        self.open(&mut slot).await
    }

    /// Opens a new channel on the live connection, connecting first if
    /// needed.
    pub async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }

        let connection = {
            let mut slot = self.slot.lock().await;
            if !slot.is_open() && !self.open(&mut slot).await {
                error!(connection = self.name, "could not create channel, no connection");
                return Err(AmqpError::ChannelCreationFailed);
            }
            slot.connection.clone()
        }
        .ok_or(AmqpError::ChannelCreationFailed)?;

        connection.create_channel().await
    }

    /// Closes the connection for good. Failure callbacks are detached
    /// before the close so it does not trigger a reconnect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut slot = self.slot.lock().await;
        slot.listener = None;
        if let Some(connection) = slot.connection.take() {
            connection.close().await;
        }

        self.set_state(ConnectionState::Disposed);
        debug!(connection = self.name, "connection disposed");
    }

    async fn open(&self, slot: &mut ConnectionSlot) -> bool {
        if self.is_disposed() {
            return false;
        }

        self.set_state(ConnectionState::Connecting);

        slot.listener = None;
        if let Some(stale) = slot.connection.take() {
            stale.close().await;
        }

        match self.transport.connect().await {
            Ok(connection) => {
                slot.generation += 1;
                let generation = slot.generation;
                let this = self.this.clone();

                slot.listener = Some(connection.on_failure(Arc::new(move |event| {
                    if let Some(this) = this.upgrade() {
                        this.handle_failure(generation, event);
                    }
                })));

                info!(
                    connection = self.name,
                    endpoint = connection.endpoint(),
                    "amqp connection acquired"
                );
                slot.connection = Some(connection);
                self.set_state(ConnectionState::Connected);

                if generation > 1 {
                    self.reconnected.notify(generation);
                }
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    connection = self.name,
                    "failure to connect"
                );
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn handle_failure(self: Arc<Self>, generation: u64, event: FailureEvent) {
        if self.is_disposed() {
            return;
        }

        warn!(
            connection = self.name,
            event = ?event,
            "connection failure, reconnecting"
        );

        let runtime = self.runtime.clone();
        spawn_reaction(&runtime, async move {
            self.reconnect(generation).await;
        });
    }

    async fn reconnect(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            debug!(
                connection = self.name,
                generation, "ignoring failure of a replaced connection"
            );
            return;
        }

        self.open(&mut slot).await;
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != ConnectionState::Disposed {
            *current = state;
        }
    }
}

/// Which workload a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Publish = 0,
    Consume = 1,
}

/// The connections of one client, by role.
///
/// With `use_secondary_connection_for_consumers` unset both roles share a
/// single connection.
pub struct ConnectionManager {
    publish: Arc<PersistentConnection>,
    consume: Arc<PersistentConnection>,
}

impl ConnectionManager {
    pub fn new(cfg: &RabbitConfig, transport: Arc<dyn Transport>) -> ConnectionManager {
        if cfg.use_secondary_connection_for_consumers {
            return ConnectionManager {
                publish: PersistentConnection::new(
                    &format!("{}-publish", cfg.app_name),
                    transport.clone(),
                ),
                consume: PersistentConnection::new(&format!("{}-consume", cfg.app_name), transport),
            };
        }

        let shared = PersistentConnection::new(&cfg.app_name, transport);
        ConnectionManager {
            publish: shared.clone(),
            consume: shared,
        }
    }

    pub fn connection(&self, role: ConnectionRole) -> Arc<PersistentConnection> {
        match role {
            ConnectionRole::Publish => self.publish.clone(),
            ConnectionRole::Consume => self.consume.clone(),
        }
    }

    /// True when both roles use the same connection.
    pub fn is_shared(&self) -> bool {
        Arc::ptr_eq(&self.publish, &self.consume)
    }

    /// Eagerly connects every connection. Returns true when all succeeded.
    pub async fn connect_all(&self) -> bool {
        let publish = self.publish.ensure_connected().await;
        if self.is_shared() {
            return publish;
        }

        let consume = self.consume.ensure_connected().await;
        publish && consume
    }

    pub async fn dispose(&self) {
        self.publish.dispose().await;
        self.consume.dispose().await;
    }
}
