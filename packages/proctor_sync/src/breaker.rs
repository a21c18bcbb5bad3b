//! Circuit breaker for risky operations (durable writes, remote calls).
//!
//! # State Transitions
//! ```text
//! Closed → Open:       failure_count >= failure_threshold
//! Open → HalfOpen:     recovery_timeout elapsed (evaluated on next use)
//! HalfOpen → Closed:   trial call succeeds
//! HalfOpen → Open:     trial call fails (timer restarts)
//! ```
//!
//! Gating uses the absolute failure count since the last success. The failure
//! rate over the monitoring window is reported by `metrics()` but never gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Failures / total within the monitoring window (0.0 when empty)
    pub failure_rate: f64,
    pub window_total: usize,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    /// Time left before a trial is admitted, while open
    pub retry_in_ms: Option<u64>,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    /// (when, succeeded), oldest first
    window: VecDeque<(Instant, bool)>,
    next_retry_at: Option<Instant>,
    trial_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            window: VecDeque::new(),
            next_retry_at: None,
            trial_in_flight: false,
            last_failure_at: None,
            last_success_at: None,
            last_state_change: Utc::now(),
        }
    }

    fn transition(&mut self, name: &str, to: BreakerState) {
        if self.state != to {
            info!(breaker = %name, from = %self.state, to = %to, "circuit breaker transition");
            self.state = to;
            self.last_state_change = Utc::now();
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admitted call. A trial that is dropped before finishing (its future was
/// cancelled) frees the half-open slot without counting as an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl Admission<'_> {
    fn finish(mut self, succeeded: bool) {
        self.finished = true;
        if succeeded {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.finished {
            self.breaker.lock().trial_in_flight = false;
            debug!(breaker = %self.breaker.name, "trial call abandoned");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Never held across an await; a poisoned lock still has usable state
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_error(&self) -> SyncError {
        SyncError::BreakerOpen {
            name: self.name.clone(),
        }
    }

    /// Move open → half-open once the recovery timeout has passed.
    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == BreakerState::Open
            && inner.next_retry_at.is_some_and(|at| now >= at)
        {
            inner.transition(&self.name, BreakerState::HalfOpen);
            inner.trial_in_flight = false;
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(&(at, _)) = inner.window.front() {
            if now.duration_since(at) > self.config.monitoring_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(breaker = %self.name, "admitting trial call");
                true
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                debug!(breaker = %self.name, state = %inner.state, "call rejected");
                return Err(self.open_error());
            }
        };
        Ok(Admission {
            breaker: self,
            trial,
            finished: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.window.push_back((now, true));
        self.prune(&mut inner, now);
        inner.success_count = inner.success_count.saturating_add(1);
        inner.failure_count = 0;
        inner.last_success_at = Some(Utc::now());
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.state == BreakerState::HalfOpen {
            inner.next_retry_at = None;
            inner.transition(&self.name, BreakerState::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.window.push_back((now, false));
        self.prune(&mut inner, now);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        if trial {
            inner.trial_in_flight = false;
        }

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failure_count >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            inner.next_retry_at = Some(now + self.config.recovery_timeout);
            inner.transition(&self.name, BreakerState::Open);
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                retry_in = ?self.config.recovery_timeout,
                "circuit opened"
            );
        }
    }

    /// Run `operation` through the breaker. While open (or while a half-open
    /// trial is outstanding) the operation is not invoked and the call fails
    /// with `SyncError::BreakerOpen`.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = operation().await;
        admission.finish(result.is_ok());
        result
    }

    /// Like `execute`, but a rejected call runs `fallback` instead of failing.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(&self, operation: F, fallback: G) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.admit() {
            Ok(admission) => {
                let result = operation().await;
                admission.finish(result.is_ok());
                result
            }
            Err(_) => {
                debug!(breaker = %self.name, "using fallback");
                fallback().await
            }
        }
    }

    /// Current state, applying a due open → half-open transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.next_retry_at = Some(Instant::now() + self.config.recovery_timeout);
        inner.trial_in_flight = false;
        inner.transition(&self.name, BreakerState::Open);
        warn!(breaker = %self.name, "circuit forced open");
    }

    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.next_retry_at = None;
        inner.trial_in_flight = false;
        inner.transition(&self.name, BreakerState::Closed);
        info!(breaker = %self.name, "circuit forced closed");
    }

    /// Back to a fresh closed breaker: counts and window cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::new();
        info!(breaker = %self.name, "circuit reset");
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        self.prune(&mut inner, now);

        let window_total = inner.window.len();
        let window_failures = inner.window.iter().filter(|(_, ok)| !ok).count();
        let failure_rate = if window_total == 0 {
            0.0
        } else {
            window_failures as f64 / window_total as f64
        };
        let retry_in_ms = match (inner.state, inner.next_retry_at) {
            (BreakerState::Open, Some(at)) => {
                Some(at.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };

        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_rate,
            window_total,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            last_state_change: inner.last_state_change,
            retry_in_ms,
        }
    }
}

/// Named breakers, one per operation name, living as long as the registry.
/// Owned by whoever wires the session together and handed to the components
/// that need it.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Breaker for `name`, created with the default config on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.default_config.clone())
    }

    /// Breaker for `name`. `config` only applies if it does not exist yet.
    pub fn get_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Metrics for every breaker, sorted by name.
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut metrics: Vec<BreakerMetrics> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(10),
            monitoring_window: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(|| async { Err::<(), _>(SyncError::Persistence("down".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("save", config(3));
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BreakerOpen { ref name } if name == "save"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("save", config(3));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("finalize", config(1));
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_restarts_timer() {
        let breaker = CircuitBreaker::new("finalize", config(1));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(10)).await;

        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_rejection_resolves_without_waiting() {
        let breaker = CircuitBreaker::new("finalize", config(1));
        breaker.force_open();

        let mut call = tokio_test::task::spawn(breaker.execute(|| std::future::pending::<Result<()>>()));
        let result = tokio_test::assert_ready!(call.poll());
        assert!(matches!(result, Err(SyncError::BreakerOpen { .. })));
    }

    #[test]
    fn test_second_call_rejected_while_trial_outstanding() {
        let breaker = CircuitBreaker::new("finalize", config(1));
        breaker.force_open();
        {
            // Due immediately
            let mut inner = breaker.lock();
            inner.next_retry_at = Some(Instant::now());
        }

        let mut trial = tokio_test::task::spawn(breaker.execute(|| std::future::pending::<Result<()>>()));
        tokio_test::assert_pending!(trial.poll());

        let mut second = tokio_test::task::spawn(breaker.execute(|| async { Ok(()) }));
        let result = tokio_test::assert_ready!(second.poll());
        assert!(matches!(result, Err(SyncError::BreakerOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_while_open() {
        let breaker = CircuitBreaker::new("answers", config(1));
        fail(&breaker).await.ok();

        let value = breaker
            .execute_with_fallback(|| async { Ok("remote") }, || async { Ok("cached") })
            .await
            .unwrap();
        assert_eq!(value, "cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new("finalize", config(1));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(10)).await;

        {
            let trial = breaker.execute(|| std::future::pending::<Result<()>>());
            // Poll once so the trial is admitted, then drop it
            let _ = tokio::time::timeout(Duration::from_millis(1), trial).await;
        }

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_is_reported_not_gating() {
        let breaker = CircuitBreaker::new("save", config(5));
        succeed(&breaker).await.ok();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        let metrics = breaker.metrics();
        assert_eq!(metrics.window_total, 4);
        assert!((metrics.failure_rate - 0.75).abs() < f64::EPSILON);
        // 75% failures but below the absolute threshold
        assert_eq!(metrics.state, BreakerState::Closed);

        tokio::time::advance(Duration::from_secs(61)).await;
        let metrics = breaker.metrics();
        assert_eq!(metrics.window_total, 0);
        assert_eq!(metrics.failure_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_controls() {
        let breaker = CircuitBreaker::new("save", config(3));
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.metrics().retry_in_ms.is_some());

        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(succeed(&breaker).await.is_ok());

        fail(&breaker).await.ok();
        breaker.reset();
        let metrics = breaker.metrics();
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.window_total, 0);
    }

    #[test]
    fn test_registry_shares_instances_per_name() {
        let registry = BreakerRegistry::new(config(3));
        let a = registry.get("save");
        let b = registry.get("save");
        assert!(Arc::ptr_eq(&a, &b));

        let custom = registry.get_with("finalize", config(1));
        assert_eq!(custom.config().failure_threshold, 1);
        // Config only applies on creation
        assert_eq!(registry.get_with("save", config(9)).config().failure_threshold, 3);

        let names: Vec<String> = registry.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["finalize".to_string(), "save".to_string()]);
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"half-open\"");
    }
}
