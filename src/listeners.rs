// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Listeners
//!
//! Connections and channels report failures, and connections report
//! reconnects, through a `Listeners` registry.
//! Registering a callback returns a `ListenerHandle`; dropping or
//! unregistering the handle removes the callback, so the owner of a
//! connection or channel can always detach itself before closing the
//! underlying handle and never observe its own teardown.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::runtime::Handle;
use tracing::error;

/// Failure signals raised by a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureEvent {
    /// The broker or the socket closed the connection/channel
    Shutdown(String),
    /// A dispatcher callback (consumer delivery loop) failed
    CallbackException(String),
    /// The broker blocked the connection (resource alarm)
    Blocked(String),
}

/// Callback invoked with the events of a `Listeners` set.
pub type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

pub type FailureCallback = Callback<FailureEvent>;

/// Invoked with the new connection generation after a reconnect.
pub type ReconnectCallback = Callback<u64>;

struct Registered<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// Set of callbacks attached to one connection or channel.
pub struct Listeners<E = FailureEvent> {
    inner: Arc<Mutex<Registered<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Listeners {
            inner: Arc::new(Mutex::new(Registered {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Listeners {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + 'static> Listeners<E> {
    pub fn register(&self, callback: Callback<E>) -> ListenerHandle {
        let mut registered = lock(&self.inner);
        let id = registered.next_id;
        registered.next_id += 1;
        registered.callbacks.push((id, callback));

        let listeners: Weak<dyn Unregister> = Arc::<Mutex<Registered<E>>>::downgrade(&self.inner);
        ListenerHandle { id, listeners }
    }

    /// Invokes every registered callback with `event`.
    ///
    /// Callbacks run outside the registry lock, so they may register or
    /// unregister listeners themselves.
    pub fn notify(&self, event: E) {
        let callbacks: Vec<Callback<E>> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

trait Unregister: Send + Sync {
    fn unregister(&self, id: u64);
}

impl<E> Unregister for Mutex<Registered<E>> {
    fn unregister(&self, id: u64) {
        lock(self).callbacks.retain(|(registered, _)| *registered != id);
    }
}

/// Deregistration handle for a callback added to `Listeners`.
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<dyn Unregister>,
}

impl ListenerHandle {
    pub fn unregister(self) {
        drop(self)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.unregister(self.id);
        }
    }
}

fn lock<E>(inner: &Mutex<Registered<E>>) -> MutexGuard<'_, Registered<E>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a failure reaction on the runtime captured when its owner was built.
///
/// Driver callbacks fire on threads the driver owns, which usually have no
/// tokio context of their own.
pub(crate) fn spawn_reaction<F>(runtime: &Option<Handle>, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match runtime.clone().or_else(|| Handle::try_current().ok()) {
        Some(handle) => {
            handle.spawn(task);
        }
        None => error!("no tokio runtime available to react to a broker failure"),
    }
}
