//! Sync layer metrics for observability
//!
//! Counters are shared by every component built with the same `Arc<SyncMetrics>`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide sync metrics
#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Channel metrics
    /// Live shared connections
    pub active_connections: AtomicU64,
    /// Transports opened, including reconnects
    pub transports_opened: AtomicU64,
    /// Reconnects scheduled after an unexpected close
    pub reconnects: AtomicU64,
    /// Callback invocations
    pub events_dispatched: AtomicU64,
    /// Subscriber callbacks that returned an error or panicked
    pub callback_failures: AtomicU64,
    /// Idle connections removed by the sweep
    pub connections_swept: AtomicU64,

    // Persistence metrics
    pub saves_written: AtomicU64,
    /// Saves skipped because the content hash was unchanged
    pub saves_skipped: AtomicU64,
    pub saves_failed: AtomicU64,

    // Recovery metrics
    pub recovery_attempts: AtomicU64,
    pub recoveries_succeeded: AtomicU64,
    pub recoveries_exhausted: AtomicU64,

    start_time: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a sweep and a shutdown may race to close the same key
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn transport_opened(&self) {
        self.transports_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_failed(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_swept(&self) {
        self.connections_swept.fetch_add(1, Ordering::Relaxed);
    }

    // Save tracking
    pub fn save_written(&self) {
        self.saves_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_skipped(&self) {
        self.saves_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_failed(&self) {
        self.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Recovery tracking
    pub fn recovery_attempted(&self) {
        self.recovery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery_succeeded(&self) {
        self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery_exhausted(&self) {
        self.recoveries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            channels: ChannelMetrics {
                active_connections: self.active_connections.load(Ordering::Relaxed),
                transports_opened: self.transports_opened.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
                callback_failures: self.callback_failures.load(Ordering::Relaxed),
                connections_swept: self.connections_swept.load(Ordering::Relaxed),
            },
            saves: SaveMetrics {
                written: self.saves_written.load(Ordering::Relaxed),
                skipped: self.saves_skipped.load(Ordering::Relaxed),
                failed: self.saves_failed.load(Ordering::Relaxed),
            },
            recovery: RecoveryMetrics {
                attempts: self.recovery_attempts.load(Ordering::Relaxed),
                succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
                exhausted: self.recoveries_exhausted.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub channels: ChannelMetrics,
    pub saves: SaveMetrics,
    pub recovery: RecoveryMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub active_connections: u64,
    pub transports_opened: u64,
    pub reconnects: u64,
    pub events_dispatched: u64,
    pub callback_failures: u64,
    pub connections_swept: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMetrics {
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub attempts: u64,
    pub succeeded: u64,
    pub exhausted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = SyncMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = SyncMetrics::new();
        metrics.transport_opened();
        metrics.save_written();
        metrics.save_skipped();
        metrics.save_skipped();
        metrics.recovery_attempted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.channels.transports_opened, 1);
        assert_eq!(snapshot.saves.written, 1);
        assert_eq!(snapshot.saves.skipped, 2);
        assert_eq!(snapshot.recovery.attempts, 1);
    }
}
