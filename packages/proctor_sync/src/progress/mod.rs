//! ProgressStore: in-memory session progress flushed to durable storage.
//!
//! - `update()` merges into the snapshot and (re)arms a debounce timer
//! - A periodic flush bounds the time between saves under constant activity
//! - A save is skipped when the content hash matches the last persisted one
//! - Saves for the session run one at a time
//! - A failed write warns and keeps everything in memory for the next save

mod datastore;
mod snapshot;

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::ProgressConfig;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::notice::{Notice, NoticeBus};
use crate::scheduler::{ScheduledTask, Scheduler};

pub use datastore::Datastore;
pub use snapshot::{ProgressSnapshot, ProgressUpdate, SessionState};

/// One row per session, keyed by session id.
pub const PROGRESS_TABLE: &str = "assessment_progress";
/// One row per answer, keyed by `session_id:question_id`.
pub const ANSWERS_TABLE: &str = "assessment_answers";

pub fn answer_key(session_id: &str, question_id: &str) -> String {
    format!("{}:{}", session_id, question_id)
}

fn answer_hash(answer: &Value) -> String {
    snapshot::sha256_hex(&serde_json::to_vec(answer).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Content was written; `answers` is how many answer rows were upserted
    Written { answers: usize },
    /// Content matched the last persisted hash
    Skipped,
}

#[derive(Default)]
struct StoreState {
    snapshot: Option<ProgressSnapshot>,
    /// question id → hash of the answer as last written
    persisted_answers: HashMap<String, String>,
    debounce: Option<ScheduledTask>,
    autosave: Option<ScheduledTask>,
}

impl StoreState {
    fn cancel_timers(&mut self) {
        // Dropping a ScheduledTask cancels it
        self.debounce = None;
        self.autosave = None;
    }
}

/// What one save has to write, captured under the state lock.
struct PendingWrite {
    snapshot: ProgressSnapshot,
    hash: String,
    answers: BTreeMap<String, (Value, String)>,
}

pub struct ProgressStore {
    datastore: Arc<dyn Datastore>,
    config: ProgressConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    notices: NoticeBus,
    metrics: Arc<SyncMetrics>,
    scheduler: Scheduler,
    state: Mutex<StoreState>,
    /// Held for the whole of a save so writes for the session never overlap
    save_lock: tokio::sync::Mutex<()>,
}

impl ProgressStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        config: ProgressConfig,
        notices: NoticeBus,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            datastore,
            config,
            breaker: None,
            notices,
            metrics,
            scheduler: Scheduler::new(),
            state: Mutex::new(StoreState::default()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Route durable writes through `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load `session_id` from durable storage, or start a fresh snapshot if
    /// nothing was stored yet. Replaces whatever session was loaded before.
    pub async fn load(&self, session_id: &str) -> Result<ProgressSnapshot> {
        // A save still in flight belongs to the previous session
        let _serial = self.save_lock.lock().await;
        let row = self.datastore.read(PROGRESS_TABLE, session_id).await?;

        let (snapshot, persisted_answers) = match row {
            None => {
                debug!(session_id = %session_id, "no stored progress, starting fresh");
                (ProgressSnapshot::new(session_id), HashMap::new())
            }
            Some(row) => {
                let mut answers = BTreeMap::new();
                let mut hashes = HashMap::new();
                for question_id in snapshot::answered_question_ids(&row)? {
                    let key = answer_key(session_id, &question_id);
                    let Some(answer_row) = self.datastore.read(ANSWERS_TABLE, &key).await? else {
                        warn!(session_id = %session_id, question_id = %question_id, "answer row missing");
                        continue;
                    };
                    let answer = answer_row.get("answer").cloned().unwrap_or(Value::Null);
                    hashes.insert(question_id.clone(), answer_hash(&answer));
                    answers.insert(question_id, answer);
                }
                let snapshot = ProgressSnapshot::from_session_row(&row, answers)?;
                info!(
                    session_id = %session_id,
                    question_index = snapshot.current_question_index,
                    answers = snapshot.answers.len(),
                    "resumed session progress"
                );
                (snapshot, hashes)
            }
        };

        let mut state = self.lock();
        state.debounce = None;
        state.snapshot = Some(snapshot.clone());
        state.persisted_answers = persisted_answers;
        Ok(snapshot)
    }

    /// Merge `update` into the snapshot and restart the debounce timer.
    pub fn update(self: &Arc<Self>, update: ProgressUpdate) -> Result<()> {
        let mut state = self.lock();
        let snapshot = state.snapshot.as_mut().ok_or(SyncError::NoActiveSession)?;
        snapshot.apply(update);
        let session_id = snapshot.session_id.clone();

        let this = Arc::downgrade(self);
        // Replacing the previous handle cancels its wait
        state.debounce = Some(self.scheduler.after(
            "progress-debounce",
            self.config.debounce,
            move || async move {
                if let Some(store) = this.upgrade() {
                    if let Err(e) = store.save().await {
                        debug!(session_id = %session_id, error = %e, "debounced save failed");
                    }
                }
            },
        ));
        Ok(())
    }

    pub fn set_answer(self: &Arc<Self>, question_id: &str, answer: Value) -> Result<()> {
        self.update(ProgressUpdate::new().answer(question_id, answer))
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.lock().snapshot.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.lock().snapshot.as_ref().is_some_and(|s| s.is_dirty())
    }

    /// Arm the periodic fallback flush.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let task = self
            .scheduler
            .every("progress-autosave", self.config.autosave_interval, move || {
                let this = this.clone();
                async move {
                    if let Some(store) = this.upgrade() {
                        if let Err(e) = store.save().await {
                            debug!(error = %e, "periodic save failed");
                        }
                    }
                }
            });
        self.lock().autosave = Some(task);
    }

    /// Write the snapshot if its content changed since the last successful
    /// write. Waits behind a save already in flight.
    pub async fn save(&self) -> Result<SaveOutcome> {
        let _serial = self.save_lock.lock().await;

        let Some(pending) = self.prepare()? else {
            self.metrics.save_skipped();
            return Ok(SaveOutcome::Skipped);
        };

        let persisted_at = Utc::now();
        let write = || self.write_rows(&pending, persisted_at);
        let result = match &self.breaker {
            Some(breaker) => breaker.execute(write).await,
            None => write().await,
        };

        match result {
            Ok(()) => {
                let mut guard = self.lock();
                let state = &mut *guard;
                if let Some(current) = state
                    .snapshot
                    .as_mut()
                    .filter(|s| s.session_id == pending.snapshot.session_id)
                {
                    current.last_persisted_hash = Some(pending.hash.clone());
                    current.last_persisted_at = Some(persisted_at);
                    for (question_id, (_, hash)) in &pending.answers {
                        state.persisted_answers.insert(question_id.clone(), hash.clone());
                    }
                }
                drop(guard);
                self.metrics.save_written();
                debug!(
                    session_id = %pending.snapshot.session_id,
                    answers = pending.answers.len(),
                    "progress saved"
                );
                Ok(SaveOutcome::Written {
                    answers: pending.answers.len(),
                })
            }
            Err(e) => {
                self.metrics.save_failed();
                warn!(
                    session_id = %pending.snapshot.session_id,
                    error = %e,
                    "failed to save progress, keeping it in memory"
                );
                self.notices
                    .publish(Notice::warning("save_failed", "Save failed, will retry"));
                Err(e)
            }
        }
    }

    /// Cancel any pending debounce and save now.
    pub async fn force_save(&self) -> Result<SaveOutcome> {
        self.lock().debounce = None;
        self.save().await
    }

    /// Stop the timers and flush what is left.
    pub async fn shutdown(&self) -> Result<SaveOutcome> {
        let has_session = {
            let mut state = self.lock();
            state.cancel_timers();
            state.snapshot.is_some()
        };
        if !has_session {
            return Ok(SaveOutcome::Skipped);
        }
        let outcome = self.save().await?;
        info!("progress store shut down");
        Ok(outcome)
    }

    /// Drop the session (it was submitted). Pending timers are cancelled.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.cancel_timers();
        if let Some(snapshot) = state.snapshot.take() {
            info!(session_id = %snapshot.session_id, "cleared session progress");
        }
        state.persisted_answers.clear();
    }

    /// Capture the write, or `None` when nothing changed.
    fn prepare(&self) -> Result<Option<PendingWrite>> {
        let state = self.lock();
        let snapshot = state.snapshot.as_ref().ok_or(SyncError::NoActiveSession)?;
        let hash = snapshot.content_hash();
        if snapshot.last_persisted_hash.as_deref() == Some(hash.as_str()) {
            debug!(session_id = %snapshot.session_id, "progress unchanged, skipping save");
            return Ok(None);
        }

        let answers = snapshot
            .answers
            .iter()
            .filter_map(|(question_id, answer)| {
                let hash = answer_hash(answer);
                let unchanged = state.persisted_answers.get(question_id) == Some(&hash);
                (!unchanged).then(|| (question_id.clone(), (answer.clone(), hash)))
            })
            .collect();

        Ok(Some(PendingWrite {
            snapshot: snapshot.clone(),
            hash,
            answers,
        }))
    }

    async fn write_rows(&self, pending: &PendingWrite, persisted_at: chrono::DateTime<Utc>) -> Result<()> {
        let session_id = &pending.snapshot.session_id;
        for (question_id, (answer, _)) in &pending.answers {
            self.datastore
                .upsert(
                    ANSWERS_TABLE,
                    &answer_key(session_id, question_id),
                    json!({
                        "session_id": session_id,
                        "question_id": question_id,
                        "answer": answer,
                        "updated_at": persisted_at,
                    }),
                )
                .await?;
        }
        // Session row last: its hash only lands once every answer has
        self.datastore
            .upsert(
                PROGRESS_TABLE,
                session_id,
                pending.snapshot.session_row(&pending.hash, persisted_at),
            )
            .await
    }
}
