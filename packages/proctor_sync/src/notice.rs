//! User-facing notices.
//!
//! Components publish short notices that the UI layer renders as toasts or
//! banners. Delivery is best effort: publishing with nobody listening is fine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Transient, e.g. "reconnecting"
    Info,
    /// Recoverable, e.g. "save failed, will retry"
    Warning,
    /// Terminal, needs the user to do something
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    /// Terminal notices stay up until the user acknowledges them.
    pub requires_ack: bool,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message, false)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message, false)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message, true)
    }

    fn new(severity: Severity, code: &str, message: impl Into<String>, requires_ack: bool) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            requires_ack,
            at: Utc::now(),
        }
    }
}

/// Fan-out of notices to every interested listener.
#[derive(Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        // No receivers is not an error
        let _ = self.tx.send(notice);
    }
}
