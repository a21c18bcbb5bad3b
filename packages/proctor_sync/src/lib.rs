//! Proctor Sync - resilience layer for live, timed assessment sessions
//!
//! Keeps a session consistent and recoverable over an unreliable network:
//! shared push subscriptions with reconnection, circuit breakers around risky
//! calls, debounced durable progress and bounded finalize retries. The push
//! transport, the durable datastore and the local key/value store are
//! supplied by the caller through traits.
//!
//! # Example
//!
//! ```no_run
//! use proctor_sync::{
//!     BreakerRegistry, ChannelMultiplexer, NoticeBus, ProgressStore, ProgressUpdate,
//!     SubscriberCallbacks, SyncConfig, SyncMetrics,
//!     memory::{MemoryDatastore, MemoryTransport},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let notices = NoticeBus::new();
//!     let metrics = Arc::new(SyncMetrics::new());
//!     let breakers = BreakerRegistry::new(config.breaker.clone());
//!
//!     let mux = Arc::new(ChannelMultiplexer::new(
//!         Arc::new(MemoryTransport::new()),
//!         config.multiplexer.clone(),
//!         notices.clone(),
//!         metrics.clone(),
//!     ));
//!     mux.start();
//!     let _sub = mux
//!         .subscribe(
//!             "assessment_instances",
//!             "id=eq.123",
//!             SubscriberCallbacks::new().on_update(|event| {
//!                 println!("instance changed: {}", event.record);
//!                 Ok(())
//!             }),
//!             "timer",
//!         )
//!         .await;
//!
//!     let store = Arc::new(
//!         ProgressStore::new(
//!             Arc::new(MemoryDatastore::new()),
//!             config.progress.clone(),
//!             notices.clone(),
//!             metrics.clone(),
//!         )
//!         .with_breaker(breakers.get("save")),
//!     );
//!     store.load("session-1").await.unwrap();
//!     store.start();
//!     store.update(ProgressUpdate::new().question_index(2)).unwrap();
//! }
//! ```

pub mod breaker;
pub mod config;
mod error;
pub mod memory;
pub mod metrics;
pub mod multiplexer;
pub mod notice;
pub mod progress;
pub mod recovery;
pub mod scheduler;

pub use breaker::{BreakerMetrics, BreakerRegistry, BreakerState, CircuitBreaker};
pub use config::{
    BreakerConfig, FileConfig, MultiplexerConfig, ProgressConfig, RecoveryConfig, SyncConfig,
    load_config,
};
pub use error::{Result, SyncError};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use multiplexer::{
    ChangeEvent, ChangeKind, ChannelKey, ChannelMultiplexer, ConnectionState, PushTransport,
    SubscriberCallbacks, Subscription,
};
pub use notice::{Notice, NoticeBus, Severity};
pub use progress::{Datastore, ProgressSnapshot, ProgressStore, ProgressUpdate, SaveOutcome, SessionState};
pub use recovery::{
    FileKeyValueStore, KeyValueStore, RecoveryCoordinator, RecoveryOutcome, RecoveryTicket,
};
pub use scheduler::{ScheduledTask, Scheduler};
