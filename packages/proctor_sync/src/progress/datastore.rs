//! Durable datastore contract used by the progress store.

use async_trait::async_trait;

use crate::error::Result;

/// Row-oriented durable storage (a hosted database table API, for instance).
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Insert the row, or merge `fields` into the existing row for `key`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Persistence` if the write does not land.
    async fn upsert(&self, table: &str, key: &str, fields: serde_json::Value) -> Result<()>;

    /// Fetch a row by key.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Persistence` if the read fails. A missing row is
    /// `Ok(None)`.
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>>;
}
