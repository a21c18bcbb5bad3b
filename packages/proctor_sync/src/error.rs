//! Error taxonomy for the sync layer and the notice severity each maps to.

use crate::notice::Severity;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Connect/send failure on the push transport. Recovered by reconnecting.
    #[error("transport error on {channel}: {message}")]
    Transport { channel: String, message: String },

    /// Call rejected by a circuit breaker without being attempted.
    #[error("circuit open for {name}")]
    BreakerOpen { name: String },

    /// Durable write or read failed. The in-memory snapshot is untouched.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Finalize retries used up. Needs the user to act (refresh).
    #[error("maximum retries exceeded for {instance_id} after {attempts} attempts")]
    RecoveryExhausted { instance_id: String, attempts: u32 },

    #[error("no active session")]
    NoActiveSession,

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Local key/value store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn transport(channel: impl ToString, message: impl ToString) -> Self {
        Self::Transport {
            channel: channel.to_string(),
            message: message.to_string(),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Persistence(_) => "persistence_error",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::NoActiveSession => "no_active_session",
            Self::Serialization(_) => "serialization_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Severity used when this error has to be shown to the user.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Transport { .. } => Severity::Info,
            Self::BreakerOpen { .. } | Self::Persistence(_) | Self::Storage(_) => {
                Severity::Warning
            }
            Self::RecoveryExhausted { .. } | Self::NoActiveSession | Self::Serialization(_) => {
                Severity::Error
            }
        }
    }

    /// Whether retrying later can succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::BreakerOpen { .. } | Self::Persistence(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
