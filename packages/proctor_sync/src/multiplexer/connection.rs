//! One shared transport subscription and the task that drives it.
//!
//! Each connection owns a single background task. The task opens the
//! transport, drains its signal queue in order, dispatches events to the
//! current subscribers, and reconnects after an unexpected close. Because one
//! task drains one queue, subscribers of a connection see events in exactly
//! the order the transport delivered them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MultiplexerConfig;
use crate::metrics::SyncMetrics;
use crate::notice::{Notice, NoticeBus};

use super::transport::{ChangeEvent, ChangeKind, ChannelKey, PushTransport, TransportSignal};

/// Subscriber callback. Returning `Err` (or panicking) is logged and does not
/// stop delivery to the other subscribers.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Insert/update/delete callbacks for one subscriber. Missing callbacks
/// ignore that kind of event.
#[derive(Clone, Default)]
pub struct SubscriberCallbacks {
    on_insert: Option<ChangeCallback>,
    on_update: Option<ChangeCallback>,
    on_delete: Option<ChangeCallback>,
}

impl SubscriberCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_insert = Some(Arc::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Same callback for every kind of change.
    pub fn on_any<F>(self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f: ChangeCallback = Arc::new(f);
        Self {
            on_insert: Some(f.clone()),
            on_update: Some(f.clone()),
            on_delete: Some(f),
        }
    }

    fn for_kind(&self, kind: ChangeKind) -> Option<&ChangeCallback> {
        match kind {
            ChangeKind::Insert => self.on_insert.as_ref(),
            ChangeKind::Update => self.on_update.as_ref(),
            ChangeKind::Delete => self.on_delete.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Registration of one logical consumer on a connection.
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub id: String,
    /// Unique per registration, so a stale handle never removes a newer
    /// registration that reused the same subscriber id.
    pub slot: u64,
    pub callbacks: SubscriberCallbacks,
    pub active: Arc<AtomicBool>,
}

pub(crate) struct Connection {
    pub generation: u64,
    pub state: ConnectionState,
    /// In registration order
    pub subscribers: Vec<Subscriber>,
    pub last_activity: Instant,
    pub cancel: CancellationToken,
    /// Set while the task waits for subscribers before reconnecting
    pub parked: bool,
    pub wake: Arc<Notify>,
}

impl Connection {
    pub fn new(generation: u64, cancel: CancellationToken) -> Self {
        Self {
            generation,
            state: ConnectionState::Connecting,
            subscribers: Vec::new(),
            last_activity: Instant::now(),
            cancel,
            parked: false,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Deactivate every subscriber and stop the task without reconnecting.
    pub fn teardown(&mut self) {
        for sub in self.subscribers.drain(..) {
            sub.active.store(false, Ordering::SeqCst);
        }
        self.state = ConnectionState::Disconnected;
        self.cancel.cancel();
    }
}

pub(crate) type Registry = Arc<Mutex<HashMap<ChannelKey, Connection>>>;

/// Everything the connection task needs, cloned out of the multiplexer.
pub(crate) struct ConnectionTask {
    pub key: ChannelKey,
    pub generation: u64,
    pub transport: Arc<dyn PushTransport>,
    pub registry: Registry,
    pub config: MultiplexerConfig,
    pub notices: NoticeBus,
    pub metrics: Arc<SyncMetrics>,
    pub cancel: CancellationToken,
    pub wake: Arc<Notify>,
}

impl ConnectionTask {
    pub async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            let (tx, mut rx) = mpsc::channel(self.config.event_queue_capacity);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.open(&self.key, tx) => result,
            };

            match opened {
                Ok(mut handle) => {
                    self.metrics.transport_opened();
                    debug!(channel = %self.key, "transport opened");

                    let reason = loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                handle.close();
                                debug!(channel = %self.key, "connection cancelled");
                                return;
                            }
                            signal = rx.recv() => match signal {
                                Some(TransportSignal::Opened) => {
                                    self.set_state(ConnectionState::Connected).await;
                                    info!(channel = %self.key, "channel connected");
                                }
                                Some(TransportSignal::Event(event)) => {
                                    self.dispatch(&event).await;
                                }
                                Some(TransportSignal::Closed { reason }) => {
                                    break reason.unwrap_or_else(|| "closed by transport".to_string());
                                }
                                Some(TransportSignal::Error(message)) => {
                                    warn!(channel = %self.key, error = %message, "transport error");
                                    break message;
                                }
                                None => break "signal queue closed".to_string(),
                            }
                        }
                    };
                    handle.close();
                    info!(channel = %self.key, reason = %reason, "channel closed unexpectedly");
                }
                Err(e) => {
                    warn!(channel = %self.key, error = %e, "failed to open transport");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            if self.mark_disconnected().await {
                self.metrics.reconnect_scheduled();
                self.notices
                    .publish(Notice::info("reconnecting", "Connection lost, reconnecting…"));
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
                info!(channel = %self.key, "reconnecting");
            } else {
                debug!(channel = %self.key, "no subscribers, waiting before reconnect");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                }
            }
        }
        debug!(channel = %self.key, "connection task finished");
    }

    /// Record the disconnect. Returns whether subscribers are waiting, i.e.
    /// whether to reconnect right away. Otherwise the connection parks.
    async fn mark_disconnected(&self) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(conn) = registry.get_mut(&self.key) else {
            return false;
        };
        if conn.generation != self.generation {
            return false;
        }
        conn.state = ConnectionState::Disconnected;
        let has_subscribers = !conn.subscribers.is_empty();
        conn.parked = !has_subscribers;
        has_subscribers
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut registry = self.registry.lock().await;
        if let Some(conn) = registry.get_mut(&self.key) {
            if conn.generation == self.generation {
                conn.state = state;
            }
        }
    }

    async fn dispatch(&self, event: &ChangeEvent) {
        // Snapshot under the lock, invoke outside it
        let subscribers: Vec<Subscriber> = {
            let registry = self.registry.lock().await;
            match registry.get(&self.key) {
                Some(conn) if conn.generation == self.generation => conn.subscribers.clone(),
                _ => return,
            }
        };

        for sub in &subscribers {
            // Unsubscribed since the snapshot
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let Some(callback) = sub.callbacks.for_kind(event.kind) else {
                continue;
            };
            self.metrics.event_dispatched();
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.metrics.callback_failed();
                    error!(channel = %self.key, subscriber = %sub.id, error = %e, "subscriber callback failed");
                }
                Err(_) => {
                    self.metrics.callback_failed();
                    error!(channel = %self.key, subscriber = %sub.id, "subscriber callback panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn callbacks_route_by_kind() {
        let callbacks = SubscriberCallbacks::new().on_update(|_| Ok(()));
        assert!(callbacks.for_kind(ChangeKind::Update).is_some());
        assert!(callbacks.for_kind(ChangeKind::Insert).is_none());
        assert!(callbacks.for_kind(ChangeKind::Delete).is_none());
    }

    #[test]
    fn on_any_covers_every_kind() {
        let callbacks = SubscriberCallbacks::new().on_any(|_| Ok(()));
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            assert!(callbacks.for_kind(kind).is_some());
        }
    }

    #[tokio::test]
    async fn teardown_deactivates_subscribers() {
        let mut conn = Connection::new(1, CancellationToken::new());
        let active = Arc::new(AtomicBool::new(true));
        conn.subscribers.push(Subscriber {
            id: "a".into(),
            slot: 1,
            callbacks: SubscriberCallbacks::new().on_insert(|e| {
                assert_eq!(e.record, json!({}));
                Ok(())
            }),
            active: active.clone(),
        });

        conn.teardown();

        assert!(!active.load(Ordering::SeqCst));
        assert!(conn.subscribers.is_empty());
        assert!(conn.cancel.is_cancelled());
        assert_eq!(conn.state, ConnectionState::Disconnected);
    }
}
