use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key prefix for tickets in the local key/value store.
pub const TICKET_PREFIX: &str = "recovery_ticket:";

pub fn ticket_key(instance_id: &str) -> String {
    format!("{}{}", TICKET_PREFIX, instance_id)
}

/// Local marker tracking finalize retries for one assessment instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTicket {
    pub instance_id: String,
    /// Retries made so far. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Delay waited before the most recent attempt
    pub backoff_delay_ms: u64,
    pub max_attempts: u32,
    /// Retries are used up; only clearing the ticket (or its expiry) lifts it
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RecoveryTicket {
    pub fn new(instance_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            attempt_count: 0,
            last_attempt_at: None,
            backoff_delay_ms: 0,
            max_attempts,
            terminal: false,
            last_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.terminal || self.attempt_count >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}
