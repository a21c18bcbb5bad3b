//! RecoveryCoordinator: bounded retries for the idempotent finalize call.
//!
//! A failed finalize is retried with `min(base * 2^(n-1), cap)` backoff. Each
//! attempt is recorded in a ticket in the local key/value store, so a reload
//! picks up the attempt count where it left off. Once `max_attempts` retries
//! have failed the ticket turns terminal and every further `retry` fails with
//! `RecoveryExhausted` until the ticket is cleared or expires.

pub mod kv;
mod ticket;

use chrono::Utc;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::notice::{Notice, NoticeBus};

pub use kv::{FileKeyValueStore, KeyValueStore};
pub use ticket::{RecoveryTicket, TICKET_PREFIX, ticket_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The operation succeeded on retry number `attempts`
    Recovered { attempts: u32 },
    /// Another `retry` for this instance is already running
    AlreadyInFlight,
    /// The ticket was cleared while the retry loop was running
    Cancelled,
}

struct InFlight {
    id: u64,
    cancel: CancellationToken,
}

pub struct RecoveryCoordinator {
    store: Arc<dyn KeyValueStore>,
    config: RecoveryConfig,
    notices: NoticeBus,
    metrics: Arc<SyncMetrics>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

/// Releases the in-flight slot when a retry loop ends, however it ends.
struct InFlightGuard<'a> {
    coordinator: &'a RecoveryCoordinator,
    instance_id: &'a str,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.coordinator.lock();
        // A clear followed by a new retry may already own the slot
        if in_flight.get(self.instance_id).is_some_and(|f| f.id == self.id) {
            in_flight.remove(self.instance_id);
        }
    }
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: RecoveryConfig,
        notices: NoticeBus,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            notices,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `ticket` with the configured TTL.
    pub async fn persist_ticket(&self, ticket: &RecoveryTicket) -> Result<()> {
        let value = serde_json::to_string(ticket)?;
        self.store
            .set(
                &ticket_key(&ticket.instance_id),
                &value,
                Some(self.config.ticket_ttl),
            )
            .await
    }

    /// The live ticket for `instance_id`. Expired or unreadable tickets read
    /// as absent.
    pub async fn load_ticket(&self, instance_id: &str) -> Result<Option<RecoveryTicket>> {
        let key = ticket_key(instance_id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&value) {
            Ok(ticket) => Ok(Some(ticket)),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "dropping unreadable recovery ticket");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Delete the ticket and stop any retry loop running for it.
    pub async fn clear_ticket(&self, instance_id: &str) -> Result<()> {
        if let Some(flight) = self.lock().remove(instance_id) {
            info!(instance_id = %instance_id, "cancelling in-flight recovery");
            flight.cancel.cancel();
        }
        self.store.delete(&ticket_key(instance_id)).await
    }

    /// Every live ticket, ordered by instance id.
    pub async fn tickets(&self) -> Result<Vec<RecoveryTicket>> {
        let mut tickets = Vec::new();
        for key in self.store.keys(TICKET_PREFIX).await? {
            let instance_id = &key[TICKET_PREFIX.len()..];
            if let Some(ticket) = self.load_ticket(instance_id).await? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    pub async fn prune_expired(&self) -> Result<usize> {
        let pruned = self.store.purge_expired(TICKET_PREFIX).await?;
        if pruned > 0 {
            info!(pruned, "pruned expired recovery tickets");
        }
        Ok(pruned)
    }

    pub fn is_in_flight(&self, instance_id: &str) -> bool {
        self.lock().contains_key(instance_id)
    }

    /// Retry `operation` until it succeeds, the retries run out, or the
    /// ticket is cleared. Call after the first finalize attempt failed.
    ///
    /// # Errors
    ///
    /// `SyncError::RecoveryExhausted` once `max_attempts` retries have failed,
    /// and immediately (without calling `operation`) while a terminal ticket
    /// exists. Key/value store failures propagate as-is.
    pub async fn retry<F, Fut, E>(&self, instance_id: &str, mut operation: F) -> Result<RecoveryOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        let (id, cancel) = {
            let mut in_flight = self.lock();
            if in_flight.contains_key(instance_id) {
                debug!(instance_id = %instance_id, "recovery already in flight");
                return Ok(RecoveryOutcome::AlreadyInFlight);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            in_flight.insert(
                instance_id.to_string(),
                InFlight {
                    id,
                    cancel: cancel.clone(),
                },
            );
            (id, cancel)
        };
        let _guard = InFlightGuard {
            coordinator: self,
            instance_id,
            id,
        };

        let mut ticket = self
            .load_ticket(instance_id)
            .await?
            .unwrap_or_else(|| RecoveryTicket::new(instance_id, self.config.max_attempts));

        if ticket.is_exhausted() {
            if !ticket.terminal {
                ticket.terminal = true;
                self.persist_ticket(&ticket).await?;
            }
            warn!(instance_id = %instance_id, attempts = ticket.attempt_count, "recovery ticket is terminal");
            return Err(self.exhausted(&ticket));
        }

        self.persist_ticket(&ticket).await?;

        loop {
            let attempt = ticket.attempt_count + 1;
            let delay = self.config.backoff_delay(attempt);
            ticket.backoff_delay_ms = delay.as_millis() as u64;
            info!(instance_id = %instance_id, attempt, delay = ?delay, "scheduling finalize retry");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(instance_id = %instance_id, "recovery cancelled");
                    return Ok(RecoveryOutcome::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Cleared by another process while we waited
            if self.load_ticket(instance_id).await?.is_none() {
                info!(instance_id = %instance_id, "ticket cleared elsewhere, stopping recovery");
                return Ok(RecoveryOutcome::Cancelled);
            }

            ticket.attempt_count = attempt;
            ticket.last_attempt_at = Some(Utc::now());
            self.metrics.recovery_attempted();

            let result = operation().await;
            if cancel.is_cancelled() {
                return Ok(RecoveryOutcome::Cancelled);
            }

            match result {
                Ok(()) => {
                    // Finalize already succeeded, a leftover ticket expires with its TTL
                    if let Err(e) = self.store.delete(&ticket_key(instance_id)).await {
                        warn!(instance_id = %instance_id, error = %e, "failed to delete recovery ticket");
                    }
                    self.metrics.recovery_succeeded();
                    info!(instance_id = %instance_id, attempts = attempt, "finalize recovered");
                    return Ok(RecoveryOutcome::Recovered { attempts: attempt });
                }
                Err(e) => {
                    ticket.last_error = Some(e.to_string());
                    if attempt >= ticket.max_attempts {
                        ticket.terminal = true;
                        self.persist_ticket(&ticket).await?;
                        self.metrics.recovery_exhausted();
                        error!(instance_id = %instance_id, attempts = attempt, error = %e, "finalize retries exhausted");
                        return Err(self.exhausted(&ticket));
                    }
                    warn!(
                        instance_id = %instance_id,
                        attempt,
                        remaining = ticket.remaining_attempts(),
                        error = %e,
                        "finalize retry failed"
                    );
                    self.persist_ticket(&ticket).await?;
                }
            }
        }
    }

    fn exhausted(&self, ticket: &RecoveryTicket) -> SyncError {
        self.notices.publish(Notice::error(
            "recovery_exhausted",
            "Maximum retries exceeded. Please refresh the page.",
        ));
        SyncError::RecoveryExhausted {
            instance_id: ticket.instance_id.clone(),
            attempts: ticket.attempt_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKeyValueStore;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            ticket_ttl: Duration::from_secs(3600),
        }
    }

    fn coordinator(kv: &MemoryKeyValueStore) -> Arc<RecoveryCoordinator> {
        Arc::new(RecoveryCoordinator::new(
            Arc::new(kv.clone()),
            config(),
            NoticeBus::new(),
            Arc::new(SyncMetrics::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_and_clears_ticket() {
        let kv = MemoryKeyValueStore::new();
        let coordinator = coordinator(&kv);
        let calls = &AtomicU32::new(0);

        let outcome = coordinator
            .retry("inst-1", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("503")
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 3 });
        assert!(coordinator.load_ticket("inst-1").await.unwrap().is_none());
        assert!(!coordinator.is_in_flight("inst-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_records_attempts_between_retries() {
        let kv = MemoryKeyValueStore::new();
        let coordinator = coordinator(&kv);

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .retry("inst-1", || async { Err::<(), _>("down") })
                    .await
            })
        };

        // First retry after 2s, second after a further 4s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let ticket = coordinator.load_ticket("inst-1").await.unwrap().unwrap();
        assert_eq!(ticket.attempt_count, 1);
        assert_eq!(ticket.backoff_delay_ms, 2000);
        assert_eq!(ticket.last_error.as_deref(), Some("down"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let ticket = coordinator.load_ticket("inst-1").await.unwrap().unwrap();
        assert_eq!(ticket.attempt_count, 2);
        assert_eq!(ticket.backoff_delay_ms, 4000);

        coordinator.clear_ticket("inst-1").await.unwrap();
        assert_eq!(running.await.unwrap().unwrap(), RecoveryOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_retry_is_not_restarted() {
        let kv = MemoryKeyValueStore::new();
        let coordinator = coordinator(&kv);

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.retry("inst-1", || async { Ok::<(), String>(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.is_in_flight("inst-1"));

        let second = coordinator
            .retry("inst-1", || async { Ok::<(), String>(()) })
            .await
            .unwrap();
        assert_eq!(second, RecoveryOutcome::AlreadyInFlight);
        assert_eq!(
            first.await.unwrap().unwrap(),
            RecoveryOutcome::Recovered { attempts: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_publishes_terminal_notice() {
        let kv = MemoryKeyValueStore::new();
        let notices = NoticeBus::new();
        let mut rx = notices.subscribe();
        let metrics = Arc::new(SyncMetrics::new());
        let coordinator = RecoveryCoordinator::new(
            Arc::new(kv.clone()),
            RecoveryConfig {
                max_attempts: 2,
                ..config()
            },
            notices,
            metrics.clone(),
        );

        let err = coordinator
            .retry("inst-1", || async { Err::<(), _>("gone") })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RecoveryExhausted { attempts: 2, .. }));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.code, "recovery_exhausted");
        assert!(notice.requires_ack);

        let ticket = coordinator.load_ticket("inst-1").await.unwrap().unwrap();
        assert!(ticket.terminal);
        assert_eq!(ticket.attempt_count, 2);
        assert_eq!(metrics.snapshot().recovery.exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tickets_and_prune() {
        let kv = MemoryKeyValueStore::new();
        let coordinator = coordinator(&kv);
        coordinator
            .persist_ticket(&RecoveryTicket::new("b", 5))
            .await
            .unwrap();
        coordinator
            .persist_ticket(&RecoveryTicket::new("a", 5))
            .await
            .unwrap();
        kv.set(&ticket_key("old"), "{}", Some(Duration::ZERO))
            .await
            .unwrap();

        let ids: Vec<String> = coordinator
            .tickets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.instance_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        kv.set(&ticket_key("old"), "{}", Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(coordinator.prune_expired().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_ticket_reads_as_absent() {
        let kv = MemoryKeyValueStore::new();
        let coordinator = coordinator(&kv);
        kv.set(&ticket_key("inst-1"), "not json", None).await.unwrap();

        assert!(coordinator.load_ticket("inst-1").await.unwrap().is_none());
        assert!(kv.is_empty());
    }

    /// Store whose deletes always fail.
    #[derive(Clone, Default)]
    struct StuckStore(MemoryKeyValueStore);

    #[async_trait::async_trait]
    impl KeyValueStore for StuckStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            self.0.set(key, value, ttl).await
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(SyncError::Storage("read-only filesystem".into()))
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.keys(prefix).await
        }

        async fn purge_expired(&self, prefix: &str) -> Result<usize> {
            self.0.purge_expired(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ticket_delete_still_reports_recovered() {
        let coordinator = RecoveryCoordinator::new(
            Arc::new(StuckStore::default()),
            config(),
            NoticeBus::new(),
            Arc::new(SyncMetrics::new()),
        );

        let outcome = coordinator
            .retry("inst-1", || async { Ok::<(), &str>(()) })
            .await
            .unwrap();

        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 1 });
        assert!(!coordinator.is_in_flight("inst-1"));
    }
}
