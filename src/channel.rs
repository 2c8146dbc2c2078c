// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! A `ChannelProxy` owns the channel of one workload (publishing or
//! consuming) on top of a `PersistentConnection`. The channel is created on
//! first use and replaced whenever it is found closed. Access goes through
//! `acquire`, which returns a lease holding the proxy mutex: AMQP channels
//! must not be used by two logical operations at once, so every operation
//! on a proxy's channel is totally ordered.
//!
//! Channel failures are handled in two ways:
//! - a shutdown is only logged, the next `acquire` opens a new channel
//! - a callback exception (the consumer dispatch failed) recreates the
//!   channel right away and then runs the recovery hook, which the
//!   subscription layer uses to restart its consumers
//!
//! Failure callbacks are bound to the channel epoch they were registered
//! for. Once a channel has been replaced, further signals from it only run
//! the hook, they never replace its successor. When the channel cannot be
//! recreated (broker down) recovery keeps retrying with a doubling delay,
//! and a proxy with a hook also runs it whenever its connection is
//! re-established.

use crate::{
    connection::PersistentConnection,
    errors::AmqpError,
    listeners::{spawn_reaction, FailureEvent, ListenerHandle},
    transport::AmqpChannel,
};
use futures_util::future::BoxFuture;
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, info, warn};

const RECOVERY_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Invoked after a channel has been recreated following a callback
/// exception.
pub type RecoveryHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ChannelSlot {
    channel: Option<Arc<dyn AmqpChannel>>,
    listener: Option<ListenerHandle>,
    epoch: u64,
}

/// Exclusive access to the proxy channel. The proxy stays locked until the
/// lease is dropped.
pub struct ChannelLease<'a> {
    _guard: MutexGuard<'a, ChannelSlot>,
    channel: Arc<dyn AmqpChannel>,
    epoch: u64,
}

impl ChannelLease<'_> {
    /// Number of the channel within its proxy, increased on every
    /// recreation and on every failed recovery attempt. Consumers started
    /// under different epochs run on different channels.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Deref for ChannelLease<'_> {
    type Target = dyn AmqpChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

/// Lazily (re)created channel over a supervised connection.
pub struct ChannelProxy {
    name: String,
    connection: Arc<PersistentConnection>,
    on_recovered: Option<RecoveryHook>,
    runtime: Option<Handle>,
    slot: Mutex<ChannelSlot>,
    disposed: AtomicBool,
    _reconnected: Option<ListenerHandle>,
    this: Weak<ChannelProxy>,
}

impl ChannelProxy {
    pub fn new(
        name: &str,
        connection: Arc<PersistentConnection>,
        on_recovered: Option<RecoveryHook>,
    ) -> Arc<ChannelProxy> {
        Arc::new_cyclic(|this: &Weak<ChannelProxy>| {
            let reconnected = on_recovered.as_ref().map(|_| {
                let this = this.clone();
                connection.on_reconnected(Arc::new(move |generation: u64| {
                    if let Some(this) = this.upgrade() {
                        this.handle_reconnect(generation);
                    }
                }))
            });

            ChannelProxy {
                name: name.to_owned(),
                connection,
                on_recovered,
                runtime: Handle::try_current().ok(),
                slot: Mutex::new(ChannelSlot::default()),
                disposed: AtomicBool::new(false),
                _reconnected: reconnected,
                this: this.clone(),
            }
        })
    }

    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.connection
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Locks the proxy and returns its live channel, opening a new one when
    /// the cached channel is missing or closed.
    pub async fn acquire(&self) -> Result<ChannelLease<'_>, AmqpError> {
        let mut slot = self.slot.lock().await;
        let channel = self.ensure(&mut slot).await?;
        let epoch = slot.epoch;

        Ok(ChannelLease {
            _guard: slot,
            channel,
            epoch,
        })
    }

    /// Returns the live channel without keeping the proxy locked.
    pub async fn get_or_create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut slot = self.slot.lock().await;
        self.ensure(&mut slot).await
    }

    /// Closes the channel; the proxy is unusable afterwards. Calling it
    /// again is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut slot = self.slot.lock().await;
        slot.listener = None;
        if let Some(channel) = slot.channel.take() {
            channel.close().await;
        }
        debug!(proxy = self.name, "channel proxy disposed");
    }

    async fn ensure(&self, slot: &mut ChannelSlot) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.is_disposed() {
            return Err(AmqpError::Disposed);
        }

        if let Some(channel) = slot.channel.clone().filter(|c| c.is_open()) {
            return Ok(channel);
        }

        self.replace(slot).await
    }

    async fn replace(&self, slot: &mut ChannelSlot) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        slot.listener = None;
        if let Some(stale) = slot.channel.take() {
            stale.close().await;
        }

        let channel = self.connection.create_channel().await?;

        let epoch = slot.epoch + 1;
        let this = self.this.clone();
        slot.listener = Some(channel.on_failure(Arc::new(move |event| {
            if let Some(this) = this.upgrade() {
                this.handle_failure(epoch, event);
            }
        })));
        slot.channel = Some(channel.clone());
        slot.epoch = epoch;

        debug!(proxy = self.name, epoch = slot.epoch, "channel created");
        Ok(channel)
    }

    fn handle_failure(self: Arc<Self>, epoch: u64, event: FailureEvent) {
        if self.is_disposed() {
            return;
        }

        match event {
            FailureEvent::CallbackException(reason) => {
                warn!(proxy = self.name, epoch, reason, "channel callback exception, recovering");
                let runtime = self.runtime.clone();
                spawn_reaction(&runtime, async move { self.recover(epoch).await });
            }
            other => {
                debug!(proxy = self.name, epoch, event = ?other, "channel failure observed");
            }
        }
    }

    fn handle_reconnect(self: Arc<Self>, generation: u64) {
        if self.is_disposed() {
            return;
        }

        info!(proxy = self.name, generation, "connection re-established, resyncing channel");
        let runtime = self.runtime.clone();
        spawn_reaction(&runtime, async move { self.run_hook().await });
    }

    /// Replaces the channel of `epoch` unless it was already replaced, then
    /// runs the recovery hook.
    async fn recover(&self, mut epoch: u64) {
        let mut delay = RECOVERY_INITIAL_DELAY;

        loop {
            {
                let mut slot = self.slot.lock().await;
                if self.is_disposed() {
                    return;
                }

                if slot.epoch != epoch {
                    // a failed attempt of another recovery leaves no channel
                    // behind, that recovery is still retrying
                    if !slot.channel.as_ref().is_some_and(|c| c.is_open()) {
                        return;
                    }
                    debug!(proxy = self.name, epoch, "channel already replaced");
                    break;
                }

                match self.replace(&mut slot).await {
                    Ok(_) => break,
                    Err(err) => {
                        slot.epoch += 1;
                        epoch = slot.epoch;
                        error!(
                            error = err.to_string(),
                            proxy = self.name,
                            retry_in = ?delay,
                            "could not recreate the channel"
                        );
                    }
                }
            }

            if self.on_recovered.is_none() {
                return;
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECOVERY_MAX_DELAY);
        }

        self.run_hook().await;
    }

    async fn run_hook(&self) {
        if self.is_disposed() {
            return;
        }

        if let Some(hook) = &self.on_recovered {
            hook().await;
        }
    }
}
