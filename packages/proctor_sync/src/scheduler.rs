//! Cancellable scheduled tasks.
//!
//! Debounce timers, periodic flushes and sweeps are all `ScheduledTask`s.
//! Everything waits on `tokio::time`, so tests can drive it with paused time.
//!
//! Cancellation only aborts the wait. Once a task's delay has elapsed its body
//! runs to completion, which keeps a save that already started from being cut
//! off halfway through a write.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Issues scheduled tasks that can all be cancelled together.
#[derive(Clone, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`.
    pub fn after<F, Fut>(&self, name: &'static str, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "scheduled task cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    task().await;
                }
            }
        });
        ScheduledTask { token, handle }
    }

    /// Run `task` every `period`, first run one period from now.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = name, "periodic task stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        task().await;
                    }
                }
            }
        });
        ScheduledTask { token, handle }
    }

    /// Cancel every task issued by this scheduler.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Handle to a scheduled task. Dropping it cancels the task.
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the task has run (or observed its cancellation).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> (Arc<AtomicU32>, impl Fn() -> u32) {
        let count = Arc::new(AtomicU32::new(0));
        let read = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    #[tokio::test(start_paused = true)]
    async fn after_runs_once_when_delay_elapses() {
        let scheduler = Scheduler::new();
        let (count, read) = counter();

        let _task = scheduler.after("test", Duration::from_secs(2), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(read(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(read(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let scheduler = Scheduler::new();
        let (count, read) = counter();

        let task = scheduler.after("test", Duration::from_secs(1), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(read(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_ticks_each_period() {
        let scheduler = Scheduler::new();
        let (count, read) = counter();

        let task = scheduler.every("test", Duration::from_secs(10), move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(read(), 3);

        task.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(read(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let scheduler = Scheduler::new();
        let (count, read) = counter();

        let c1 = count.clone();
        let _a = scheduler.after("a", Duration::from_secs(1), move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let _b = scheduler.every("b", Duration::from_secs(1), move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(read(), 0);
        assert!(scheduler.is_shut_down());
    }
}
