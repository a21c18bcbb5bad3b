//! Local key/value storage for recovery tickets.
//!
//! Independent of the durable datastore so a ticket can be read back after a
//! restart without any network round trip. Entries may carry a TTL; expired
//! entries read as absent and are removed on the read that notices them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`. With a TTL the entry expires that long from now.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove expired entries under `prefix`, returning how many went.
    async fn purge_expired(&self, prefix: &str) -> Result<usize>;
}

/// Stored form of one entry, shared by the memory and file stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn new(key: &str, value: &str, ttl: Option<Duration>) -> Self {
        // A TTL too large to represent never expires
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        Self {
            key: key.to_string(),
            value: value.to_string(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// One JSON file per key inside a directory.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are hex-encoded so any key maps to a valid, unique file name.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<StoredEntry>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<StoredEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable entry");
                remove_if_present(path).await?;
                Ok(None)
            }
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let Some(entry) = self.read_entry(&path).await? else {
            return Ok(None);
        };
        if entry.is_expired() {
            debug!(key = %key, "pruning expired entry");
            remove_if_present(&path).await?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = StoredEntry::new(key, value, ttl);
        let bytes = serde_json::to_vec(&entry)?;
        // Write then rename so a crash never leaves a half-written entry
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to commit {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_present(&self.path_for(key)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(entry) = self.read_entry(&path).await? else {
                continue;
            };
            if entry.is_expired() {
                remove_if_present(&path).await?;
                continue;
            }
            if entry.key.starts_with(prefix) {
                keys.push(entry.key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self, prefix: &str) -> Result<usize> {
        let mut purged = 0;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(entry) = self.read_entry(&path).await? else {
                continue;
            };
            if entry.key.starts_with(prefix) && entry.is_expired() {
                remove_if_present(&path).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged, prefix = %prefix, "purged expired entries");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();

        store.set("ticket:abc", "{\"n\":1}", None).await.unwrap();
        assert_eq!(
            store.get("ticket:abc").await.unwrap().as_deref(),
            Some("{\"n\":1}")
        );

        store.delete("ticket:abc").await.unwrap();
        assert_eq!(store.get("ticket:abc").await.unwrap(), None);
        // Deleting twice is fine
        store.delete("ticket:abc").await.unwrap();
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKeyValueStore::open(dir.path()).await.unwrap();
            store
                .set("ticket:1", "v", Some(Duration::from_secs(3600)))
                .await
                .unwrap();
        }
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("ticket:1").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent_and_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();

        store.set("ticket:old", "v", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.get("ticket:old").await.unwrap(), None);
        assert!(!store.path_for("ticket:old").exists());
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();

        store.set("ticket:b", "1", None).await.unwrap();
        store.set("ticket:a", "1", None).await.unwrap();
        store.set("other:x", "1", None).await.unwrap();
        store.set("ticket:gone", "1", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(
            store.keys("ticket:").await.unwrap(),
            vec!["ticket:a".to_string(), "ticket:b".to_string()]
        );
    }

    #[tokio::test]
    async fn purge_expired_counts_only_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();

        store.set("ticket:a", "1", Some(Duration::ZERO)).await.unwrap();
        store.set("ticket:b", "1", None).await.unwrap();
        store.set("other:c", "1", Some(Duration::ZERO)).await.unwrap();

        assert_eq!(store.purge_expired("ticket:").await.unwrap(), 1);
        assert!(store.path_for("other:c").exists());
        assert_eq!(store.get("ticket:b").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn corrupt_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("ticket:bad"), b"not json").unwrap();

        assert_eq!(store.get("ticket:bad").await.unwrap(), None);
        assert!(!store.path_for("ticket:bad").exists());
    }
}
