//! `proctor simulate`: one scripted assessment session against the in-memory
//! collaborators, printed as a JSON report.

use anyhow::Result;
use proctor_sync::memory::{MemoryDatastore, MemoryKeyValueStore, MemoryTransport};
use proctor_sync::{
    BreakerMetrics, BreakerRegistry, ChangeEvent, ChannelKey, ChannelMultiplexer, MetricsSnapshot,
    Notice, NoticeBus, ProgressStore, ProgressUpdate, RecoveryCoordinator, RecoveryOutcome,
    SessionState, SubscriberCallbacks, SyncConfig, SyncError, SyncMetrics,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProctorConfig;

pub struct SimulateOptions {
    pub flaky_writes: usize,
    pub finalize_failures: u32,
    pub fast: bool,
}

#[derive(Serialize)]
struct SimulationReport {
    session_id: String,
    instance_id: String,
    /// Callback invocations across both subscribers
    deliveries: u32,
    saved_answers: usize,
    finalize: String,
    notices: Vec<Notice>,
    breakers: Vec<BreakerMetrics>,
    metrics: MetricsSnapshot,
}

/// Every delay cut down so a full run, reconnect and retries included,
/// finishes in about a second.
fn fast(mut config: SyncConfig) -> SyncConfig {
    config.multiplexer.reconnect_delay = Duration::from_millis(50);
    config.multiplexer.cleanup_interval = Duration::from_millis(200);
    config.multiplexer.inactivity_timeout = Duration::from_millis(200);
    config.breaker.recovery_timeout = Duration::from_millis(200);
    config.progress.debounce = Duration::from_millis(50);
    config.progress.autosave_interval = Duration::from_millis(500);
    config.recovery.base_delay = Duration::from_millis(20);
    config.recovery.max_delay = Duration::from_millis(200);
    config
}

pub async fn simulate_command(config: &ProctorConfig, options: SimulateOptions) -> Result<()> {
    let sync = if options.fast {
        fast(config.sync())
    } else {
        config.sync()
    };
    let report = run(sync, &options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(sync: SyncConfig, options: &SimulateOptions) -> Result<SimulationReport> {
    let session_id = Uuid::new_v4().to_string();
    let instance_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, instance_id = %instance_id, "starting simulated session");

    let notices = NoticeBus::new();
    let mut notice_rx = notices.subscribe();
    let metrics = Arc::new(SyncMetrics::new());
    let breakers = BreakerRegistry::new(sync.breaker.clone());

    let transport = MemoryTransport::new();
    let datastore = MemoryDatastore::new();
    datastore.fail_next_writes(options.flaky_writes);

    // Live updates: two views share one channel
    let mux = Arc::new(ChannelMultiplexer::new(
        Arc::new(transport.clone()),
        sync.multiplexer.clone(),
        notices.clone(),
        metrics.clone(),
    ));
    mux.start();

    let filter = format!("id=eq.{}", instance_id);
    let key = ChannelKey::new("assessment_instances", &filter);
    let deliveries = Arc::new(AtomicU32::new(0));
    let mut subscriptions = Vec::new();
    for view in ["timer", "status-banner"] {
        let deliveries = deliveries.clone();
        let callbacks = SubscriberCallbacks::new().on_update(move |event| {
            deliveries.fetch_add(1, Ordering::SeqCst);
            info!(view, record = %event.record, "instance update");
            Ok(())
        });
        subscriptions.push(mux.subscribe(&key.resource, &key.filter, callbacks, view).await);
    }
    settle(&sync).await;

    transport
        .emit(&key, ChangeEvent::update(json!({"id": instance_id, "status": "in_progress"})))
        .await;

    // Network blip: the channel reconnects on its own
    transport.drop_connection(&key).await;
    tokio::time::sleep(sync.multiplexer.reconnect_delay * 2).await;
    transport
        .emit(&key, ChangeEvent::update(json!({"id": instance_id, "status": "in_progress", "extended": true})))
        .await;
    settle(&sync).await;

    // Progress: answers are debounced and written through the "save" breaker
    let store = Arc::new(
        ProgressStore::new(
            Arc::new(datastore.clone()),
            sync.progress.clone(),
            notices.clone(),
            metrics.clone(),
        )
        .with_breaker(breakers.get("save")),
    );
    store.load(&session_id).await?;
    store.start();
    store.update(ProgressUpdate::new().state(SessionState::InProgress).time_remaining(1800))?;
    for (index, answer) in ["b", "d", "a", "c", "b"].iter().enumerate() {
        store.update(
            ProgressUpdate::new()
                .question_index(index as u32)
                .answer(format!("q{}", index + 1), json!({"choice": answer})),
        )?;
        tokio::time::sleep(sync.progress.debounce / 4).await;
    }
    tokio::time::sleep(sync.progress.debounce * 2).await;

    // Whatever the flaky writes left behind goes out before submitting
    for _ in 0..=options.flaky_writes {
        match store.force_save().await {
            Ok(_) => break,
            Err(SyncError::BreakerOpen { name }) => {
                warn!(breaker = %name, "breaker open, waiting for recovery timeout");
                tokio::time::sleep(sync.breaker.recovery_timeout).await;
            }
            Err(e) => warn!(error = %e, "save failed"),
        }
    }
    let saved_answers = datastore.row_count(proctor_sync::progress::ANSWERS_TABLE);

    // Finalize, recovering through the coordinator if the first call fails
    let remaining_failures = Arc::new(AtomicU32::new(options.finalize_failures));
    let finalize = {
        let remaining = remaining_failures.clone();
        move || {
            let remaining = remaining.clone();
            async move {
                let failing = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    Err("finalize endpoint returned 503")
                } else {
                    Ok(())
                }
            }
        }
    };

    let outcome = match finalize().await {
        Ok(()) => "finalized".to_string(),
        Err(e) => {
            warn!(instance_id = %instance_id, error = %e, "finalize failed, starting recovery");
            let coordinator = RecoveryCoordinator::new(
                Arc::new(MemoryKeyValueStore::new()),
                sync.recovery.clone(),
                notices.clone(),
                metrics.clone(),
            );
            match coordinator.retry(&instance_id, finalize).await {
                Ok(RecoveryOutcome::Recovered { attempts }) => {
                    format!("recovered after {} retries", attempts)
                }
                Ok(other) => format!("{:?}", other),
                Err(e) => e.to_string(),
            }
        }
    };

    store.update(ProgressUpdate::new().state(SessionState::Submitted))?;
    store.shutdown().await.ok();
    store.clear();

    for subscription in subscriptions {
        subscription.unsubscribe().await;
    }
    mux.shutdown().await;

    let mut collected = Vec::new();
    while let Ok(notice) = notice_rx.try_recv() {
        collected.push(notice);
    }

    Ok(SimulationReport {
        session_id,
        instance_id,
        deliveries: deliveries.load(Ordering::SeqCst),
        saved_answers,
        finalize: outcome,
        notices: collected,
        breakers: breakers.metrics(),
        metrics: metrics.snapshot(),
    })
}

/// Give connection tasks time to drain their queues.
async fn settle(sync: &SyncConfig) {
    tokio::time::sleep(sync.multiplexer.reconnect_delay.min(Duration::from_millis(20))).await;
}
