//! In-memory collaborators.
//!
//! Stand-ins for the push transport, the durable datastore and the local
//! key/value store. Tests use them to inject failures; the `proctor simulate`
//! command runs a whole session against them.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::multiplexer::{ChangeEvent, ChannelKey, PushTransport, TransportHandle, TransportSignal};
use crate::progress::Datastore;
use crate::recovery::KeyValueStore;
use crate::recovery::kv::StoredEntry;

fn poisoned(what: &str) -> SyncError {
    SyncError::Storage(format!("{} lock poisoned", what))
}

// =============================================================================
// Push transport
// =============================================================================

struct OpenChannel {
    tx: mpsc::Sender<TransportSignal>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct TransportState {
    channels: HashMap<ChannelKey, Vec<OpenChannel>>,
    opens: HashMap<ChannelKey, usize>,
    fail_next: usize,
}

/// Push transport whose subscriptions are driven by the caller.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

struct MemoryHandle {
    closed: Arc<AtomicBool>,
}

impl TransportHandle for MemoryHandle {
    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = n;
        }
    }

    /// How many times `open` succeeded for `key`.
    pub fn open_count(&self, key: &ChannelKey) -> usize {
        self.state
            .lock()
            .map(|state| state.opens.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Subscriptions for `key` that are open and not closed by their owner.
    pub fn live_count(&self, key: &ChannelKey) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .channels
                    .get(key)
                    .map(|chans| {
                        chans
                            .iter()
                            .filter(|c| !c.closed.load(Ordering::SeqCst))
                            .count()
                    })
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn live_senders(&self, key: &ChannelKey) -> Vec<(mpsc::Sender<TransportSignal>, Arc<AtomicBool>)> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let Some(chans) = state.channels.get_mut(key) else {
            return Vec::new();
        };
        chans.retain(|c| !c.closed.load(Ordering::SeqCst));
        chans.iter().map(|c| (c.tx.clone(), c.closed.clone())).collect()
    }

    /// Push an event to every live subscription for `key`. Returns how many
    /// subscriptions received it.
    pub async fn emit(&self, key: &ChannelKey, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        for (tx, _) in self.live_senders(key) {
            if tx.send(TransportSignal::Event(event.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Simulate the server dropping every live subscription for `key`.
    pub async fn drop_connection(&self, key: &ChannelKey) {
        for (tx, closed) in self.live_senders(key) {
            closed.store(true, Ordering::SeqCst);
            let _ = tx
                .send(TransportSignal::Closed {
                    reason: Some("connection dropped".to_string()),
                })
                .await;
        }
    }

    /// Simulate a transport-level error on every live subscription for `key`.
    pub async fn raise_error(&self, key: &ChannelKey, message: &str) {
        for (tx, _) in self.live_senders(key) {
            let _ = tx.send(TransportSignal::Error(message.to_string())).await;
        }
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn open(
        &self,
        key: &ChannelKey,
        signals: mpsc::Sender<TransportSignal>,
    ) -> Result<Box<dyn TransportHandle>> {
        let mut state = self.state.lock().map_err(|_| poisoned("transport"))?;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::transport(key, "connection refused"));
        }

        let closed = Arc::new(AtomicBool::new(false));
        // Fresh channel, so there is room for the first signal
        let _ = signals.try_send(TransportSignal::Opened);
        state.channels.entry(key.clone()).or_default().push(OpenChannel {
            tx: signals,
            closed: closed.clone(),
        });
        *state.opens.entry(key.clone()).or_default() += 1;
        Ok(Box::new(MemoryHandle { closed }))
    }
}

// =============================================================================
// Durable datastore
// =============================================================================

#[derive(Default)]
struct DatastoreState {
    rows: BTreeMap<(String, String), serde_json::Value>,
    fail_next: usize,
}

/// Datastore that keeps rows in memory and counts writes.
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    state: Arc<Mutex<DatastoreState>>,
    writes: Arc<AtomicU64>,
    latency: Option<Duration>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps this long first, to make overlap observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `n` upserts fail.
    pub fn fail_next_writes(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = n;
        }
    }

    /// Successful upserts so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .ok()?
            .rows
            .get(&(table.to_string(), key.to_string()))
            .cloned()
    }

    /// Delete a row behind the store's back.
    pub fn remove(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .ok()?
            .rows
            .remove(&(table.to_string(), key.to_string()))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.rows.keys().filter(|(t, _)| t == table).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn upsert(&self, table: &str, key: &str, fields: serde_json::Value) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().map_err(|_| poisoned("datastore"))?;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::Persistence(format!(
                "upsert into {} rejected",
                table
            )));
        }

        let row = state
            .rows
            .entry((table.to_string(), key.to_string()))
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        match (row.as_object_mut(), fields) {
            (Some(existing), serde_json::Value::Object(new_fields)) => {
                for (field, value) in new_fields {
                    existing.insert(field, value);
                }
            }
            (_, other) => *row = other,
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let state = self.state.lock().map_err(|_| poisoned("datastore"))?;
        Ok(state.rows.get(&(table.to_string(), key.to_string())).cloned())
    }
}

// =============================================================================
// Local key/value store
// =============================================================================

/// Key/value store held in memory.
#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<BTreeMap<String, StoredEntry>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("kv"))?;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("kv"))?;
        entries.insert(key.to_string(), StoredEntry::new(key, value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("kv"))?;
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("kv"))?;
        entries.retain(|_, entry| !entry.is_expired());
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("kv"))?;
        let before = entries.len();
        entries.retain(|key, entry| !(key.starts_with(prefix) && entry.is_expired()));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn datastore_upsert_merges_fields() {
        let store = MemoryDatastore::new();
        store
            .upsert("t", "k", json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        store.upsert("t", "k", json!({"b": 3})).await.unwrap();

        assert_eq!(store.row("t", "k"), Some(json!({"a": 1, "b": 3})));
        assert_eq!(store.row_count("t"), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn datastore_injected_failures() {
        let store = MemoryDatastore::new();
        store.fail_next_writes(1);

        let err = store.upsert("t", "k", json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "persistence_error");
        assert!(store.upsert("t", "k", json!({})).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn kv_expiry() {
        let kv = MemoryKeyValueStore::new();
        kv.set("a", "1", None).await.unwrap();
        kv.set("b", "2", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.get("b").await.unwrap(), None);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn transport_open_failures_then_success() {
        let transport = MemoryTransport::new();
        let key = ChannelKey::new("r", "f");
        transport.fail_next_opens(1);

        let (tx, mut rx) = mpsc::channel(4);
        assert!(transport.open(&key, tx.clone()).await.is_err());
        let mut handle = transport.open(&key, tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportSignal::Opened)));
        assert_eq!(transport.open_count(&key), 1);
        assert_eq!(transport.live_count(&key), 1);

        handle.close();
        assert_eq!(transport.live_count(&key), 0);
        assert_eq!(transport.emit(&key, ChangeEvent::insert(json!({}))).await, 0);
    }
}
