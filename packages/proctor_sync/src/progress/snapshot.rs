//! In-memory session progress and its content hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    NotStarted,
    InProgress,
    Paused,
    Submitted,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub current_question_index: u32,
    pub time_remaining_seconds: u64,
    /// question id → answer payload
    pub answers: BTreeMap<String, Value>,
    pub session_state: SessionState,
    /// Content hash of the last snapshot that reached durable storage
    pub last_persisted_hash: Option<String>,
    pub last_persisted_at: Option<DateTime<Utc>>,
}

/// Fields that make up the content hash. Persistence metadata is excluded so
/// recording a save never makes the snapshot look changed.
#[derive(Serialize)]
struct HashedContent<'a> {
    session_id: &'a str,
    current_question_index: u32,
    time_remaining_seconds: u64,
    answers: &'a BTreeMap<String, Value>,
    session_state: SessionState,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl ProgressSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_question_index: 0,
            time_remaining_seconds: 0,
            answers: BTreeMap::new(),
            session_state: SessionState::default(),
            last_persisted_hash: None,
            last_persisted_at: None,
        }
    }

    /// SHA-256 over the canonical JSON of the session content.
    pub fn content_hash(&self) -> String {
        let content = HashedContent {
            session_id: &self.session_id,
            current_question_index: self.current_question_index,
            time_remaining_seconds: self.time_remaining_seconds,
            answers: &self.answers,
            session_state: self.session_state,
        };
        // Struct fields serialize in declaration order and maps are sorted,
        // so equal content always yields equal bytes
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Content differs from what was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.last_persisted_hash.as_deref() != Some(self.content_hash().as_str())
    }

    pub fn apply(&mut self, update: ProgressUpdate) {
        if let Some(index) = update.current_question_index {
            self.current_question_index = index;
        }
        if let Some(remaining) = update.time_remaining_seconds {
            self.time_remaining_seconds = remaining;
        }
        if let Some(state) = update.session_state {
            self.session_state = state;
        }
        self.answers.extend(update.answers);
    }

    /// Row for the session table.
    pub(crate) fn session_row(&self, hash: &str, persisted_at: DateTime<Utc>) -> Value {
        json!({
            "session_id": self.session_id,
            "current_question_index": self.current_question_index,
            "time_remaining_seconds": self.time_remaining_seconds,
            "session_state": self.session_state,
            "answered_question_ids": self.answers.keys().collect::<Vec<_>>(),
            "content_hash": hash,
            "persisted_at": persisted_at,
        })
    }

    /// Rebuild from a session row plus its answers. The snapshot only counts
    /// as persisted when the answers found reproduce the stored hash.
    pub(crate) fn from_session_row(row: &Value, answers: BTreeMap<String, Value>) -> Result<Self> {
        let stored: StoredSession = serde_json::from_value(row.clone())?;
        let mut snapshot = Self {
            session_id: stored.session_id,
            current_question_index: stored.current_question_index,
            time_remaining_seconds: stored.time_remaining_seconds,
            answers,
            session_state: stored.session_state,
            last_persisted_hash: None,
            last_persisted_at: stored.persisted_at,
        };
        let hash = snapshot.content_hash();
        snapshot.last_persisted_hash = (stored.content_hash.as_deref() == Some(hash.as_str())).then_some(hash);
        Ok(snapshot)
    }
}

#[derive(Deserialize)]
struct StoredSession {
    session_id: String,
    #[serde(default)]
    current_question_index: u32,
    #[serde(default)]
    time_remaining_seconds: u64,
    #[serde(default)]
    session_state: SessionState,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    persisted_at: Option<DateTime<Utc>>,
}

/// Question ids listed in a stored session row.
pub(crate) fn answered_question_ids(row: &Value) -> Result<Vec<String>> {
    match row.get("answered_question_ids") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(ids) => serde_json::from_value(ids.clone()).map_err(SyncError::from),
    }
}

/// Partial update merged into the snapshot. Answers merge per question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub current_question_index: Option<u32>,
    pub time_remaining_seconds: Option<u64>,
    pub session_state: Option<SessionState>,
    #[serde(default)]
    pub answers: BTreeMap<String, Value>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn question_index(mut self, index: u32) -> Self {
        self.current_question_index = Some(index);
        self
    }

    pub fn time_remaining(mut self, seconds: u64) -> Self {
        self.time_remaining_seconds = Some(seconds);
        self
    }

    pub fn state(mut self, state: SessionState) -> Self {
        self.session_state = Some(state);
        self
    }

    pub fn answer(mut self, question_id: impl Into<String>, answer: Value) -> Self {
        self.answers.insert(question_id.into(), answer);
        self
    }
}
