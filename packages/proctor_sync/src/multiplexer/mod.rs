//! ChannelMultiplexer: one transport subscription per (resource, filter),
//! shared by every logical consumer of that key.
//!
//! - First `subscribe` for a key opens the transport; later ones attach
//! - Events fan out to current subscribers in arrival order
//! - Unexpected closes reconnect after a fixed delay while subscribers exist
//! - A periodic sweep tears down connections with no subscribers that have
//!   been idle past the inactivity timeout, so quick remounts reuse them

mod connection;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MultiplexerConfig;
use crate::metrics::SyncMetrics;
use crate::notice::NoticeBus;
use crate::scheduler::{ScheduledTask, Scheduler};

use connection::{Connection, ConnectionTask, Registry, Subscriber};

pub use connection::{ChangeCallback, ConnectionState, SubscriberCallbacks};
pub use transport::{
    ChangeEvent, ChangeKind, ChannelKey, PushTransport, TransportHandle, TransportSignal,
};

/// Diagnostic view of one shared connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub key: ChannelKey,
    pub state: ConnectionState,
    pub subscribers: Vec<String>,
    pub idle_for: Duration,
}

pub struct ChannelMultiplexer {
    transport: Arc<dyn PushTransport>,
    config: MultiplexerConfig,
    registry: Registry,
    notices: NoticeBus,
    metrics: Arc<SyncMetrics>,
    scheduler: Scheduler,
    /// Parent of every connection's cancellation token
    cancel: CancellationToken,
    sweep: std::sync::Mutex<Option<ScheduledTask>>,
    next_generation: AtomicU64,
    next_slot: AtomicU64,
}

impl ChannelMultiplexer {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        config: MultiplexerConfig,
        notices: NoticeBus,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            transport,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            notices,
            metrics,
            scheduler: Scheduler::new(),
            cancel: CancellationToken::new(),
            sweep: std::sync::Mutex::new(None),
            next_generation: AtomicU64::new(1),
            next_slot: AtomicU64::new(1),
        }
    }

    /// Start the periodic idle-connection sweep.
    pub fn start(self: &Arc<Self>) {
        info!(
            "Starting channel multiplexer with cleanup interval: {:?}",
            self.config.cleanup_interval
        );
        let this = Arc::downgrade(self);
        let task = self
            .scheduler
            .every("channel-sweep", self.config.cleanup_interval, move || {
                let this = this.clone();
                async move {
                    if let Some(mux) = this.upgrade() {
                        mux.sweep_idle().await;
                    }
                }
            });
        if let Ok(mut sweep) = self.sweep.lock() {
            *sweep = Some(task);
        }
    }

    /// Attach a subscriber to the shared connection for (resource, filter),
    /// opening the transport if this is the first subscriber for the key.
    ///
    /// Re-using a live `subscriber_id` on the same key replaces the previous
    /// registration; the old `Subscription` handle becomes inert.
    pub async fn subscribe(
        &self,
        resource: &str,
        filter: &str,
        callbacks: SubscriberCallbacks,
        subscriber_id: &str,
    ) -> Subscription {
        let key = ChannelKey::new(resource, filter);
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            id: subscriber_id.to_string(),
            slot,
            callbacks,
            active: active.clone(),
        };

        if self.cancel.is_cancelled() {
            warn!(channel = %key, "subscribe after shutdown, subscription is inert");
            active.store(false, Ordering::SeqCst);
        } else {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(&key) {
                Some(conn) => {
                    if let Some(pos) = conn.subscribers.iter().position(|s| s.id == subscriber_id) {
                        let replaced = conn.subscribers.remove(pos);
                        replaced.active.store(false, Ordering::SeqCst);
                        debug!(channel = %key, subscriber = %subscriber_id, "replaced existing registration");
                    }
                    conn.subscribers.push(subscriber);
                    conn.touch();
                    if conn.parked {
                        conn.parked = false;
                        conn.wake.notify_one();
                    }
                    debug!(
                        channel = %key,
                        subscriber = %subscriber_id,
                        subscribers = conn.subscribers.len(),
                        "attached to shared connection"
                    );
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    let cancel = self.cancel.child_token();
                    let mut conn = Connection::new(generation, cancel.clone());
                    conn.subscribers.push(subscriber);
                    let task = ConnectionTask {
                        key: key.clone(),
                        generation,
                        transport: self.transport.clone(),
                        registry: self.registry.clone(),
                        config: self.config.clone(),
                        notices: self.notices.clone(),
                        metrics: self.metrics.clone(),
                        cancel,
                        wake: conn.wake.clone(),
                    };
                    registry.insert(key.clone(), conn);
                    self.metrics.connection_opened();
                    info!(channel = %key, subscriber = %subscriber_id, "opening shared connection");
                    tokio::spawn(task.run());
                }
            }
        }

        Subscription {
            key,
            subscriber_id: subscriber_id.to_string(),
            slot,
            active,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Whether the shared connection for (resource, filter) is connected.
    pub async fn get_status(&self, resource: &str, filter: &str) -> bool {
        let key = ChannelKey::new(resource, filter);
        self.registry
            .lock()
            .await
            .get(&key)
            .is_some_and(|conn| conn.state == ConnectionState::Connected)
    }

    pub async fn subscriber_count(&self, resource: &str, filter: &str) -> usize {
        let key = ChannelKey::new(resource, filter);
        self.registry
            .lock()
            .await
            .get(&key)
            .map(|conn| conn.subscribers.len())
            .unwrap_or(0)
    }

    /// Explicit unsubscribe-all: drop every subscriber for the key and close
    /// the transport without reconnecting. Returns how many were removed.
    pub async fn unsubscribe_all(&self, resource: &str, filter: &str) -> usize {
        let key = ChannelKey::new(resource, filter);
        let mut registry = self.registry.lock().await;
        let Some(mut conn) = registry.remove(&key) else {
            return 0;
        };
        let removed = conn.subscribers.len();
        conn.teardown();
        self.metrics.connection_closed();
        info!(channel = %key, removed, "closed shared connection");
        removed
    }

    /// Tear down zero-subscriber connections idle past the inactivity
    /// timeout. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let stale: Vec<ChannelKey> = registry
            .iter()
            .filter(|(_, conn)| {
                conn.subscribers.is_empty()
                    && conn.last_activity.elapsed() >= self.config.inactivity_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(mut conn) = registry.remove(key) {
                conn.teardown();
                self.metrics.connection_swept();
                self.metrics.connection_closed();
                debug!(channel = %key, "swept idle connection");
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up idle connections");
        }
        stale.len()
    }

    /// List all connections for diagnostics.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = self.registry.lock().await;
        let mut infos: Vec<ConnectionInfo> = registry
            .iter()
            .map(|(key, conn)| ConnectionInfo {
                key: key.clone(),
                state: conn.state,
                subscribers: conn.subscribers.iter().map(|s| s.id.clone()).collect(),
                idle_for: conn.last_activity.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Close every connection without reconnecting and stop the sweep.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.shutdown();
        if let Ok(mut sweep) = self.sweep.lock() {
            sweep.take();
        }
        let mut registry = self.registry.lock().await;
        for (_, mut conn) in registry.drain() {
            conn.teardown();
            self.metrics.connection_closed();
        }
        info!("channel multiplexer shut down");
    }
}

/// Handle returned by `subscribe`. Callbacks stop the moment `unsubscribe`
/// is called or the handle is dropped, whether or not the shared connection
/// is torn down.
pub struct Subscription {
    key: ChannelKey,
    subscriber_id: String,
    slot: u64,
    active: Arc<AtomicBool>,
    registry: std::sync::Weak<Mutex<HashMap<ChannelKey, Connection>>>,
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// False once unsubscribed, replaced, or torn down with the connection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn unsubscribe(self) {
        self.active.store(false, Ordering::SeqCst);
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().await;
        detach(&mut registry, &self.key, self.slot, &self.subscriber_id);
    }
}

/// A handle dropped without `unsubscribe` still releases its slot so the
/// sweep can reclaim the connection.
impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(mut guard) = registry.try_lock() {
            detach(&mut guard, &self.key, self.slot, &self.subscriber_id);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.key, subscriber = %self.subscriber_id, "subscription dropped outside a runtime");
            return;
        };
        let key = self.key.clone();
        let slot = self.slot;
        let subscriber_id = std::mem::take(&mut self.subscriber_id);
        runtime.spawn(async move {
            let mut guard = registry.lock().await;
            detach(&mut guard, &key, slot, &subscriber_id);
        });
    }
}

fn detach(
    registry: &mut HashMap<ChannelKey, Connection>,
    key: &ChannelKey,
    slot: u64,
    subscriber_id: &str,
) {
    if let Some(conn) = registry.get_mut(key) {
        let before = conn.subscribers.len();
        conn.subscribers.retain(|s| s.slot != slot);
        if conn.subscribers.len() != before {
            conn.touch();
            debug!(
                channel = %key,
                subscriber = %subscriber_id,
                remaining = conn.subscribers.len(),
                "unsubscribed"
            );
        }
    }
}
