//! Run progress, shared between the orchestrator and any number of pollers.
//!
//! Each run is recorded under its own id. The "current" view is what a poller
//! without a run id sees; it returns to `idle` a fixed delay after the current
//! run reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use super::artifact::{BackupArtifact, BackupTrigger};
use crate::errors::BackupError;

const RUN_HISTORY: usize = 16;
const ABANDONED: &str = "aborted";

/// What happens when a run is triggered while another is still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrentTriggerPolicy {
    /// The newer run takes over the current view; both keep running.
    #[default]
    Overwrite,
    /// The newer trigger fails with a conflict.
    Reject,
    /// The newer trigger waits until the active run finishes.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Idle,
    Creating,
    Uploading,
    Completed,
    Error,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressError {
    pub kind: String,
    pub message: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub run_id: Option<Uuid>,
    pub trigger: Option<BackupTrigger>,
    pub status: BackupStatus,
    pub progress_percent: u8,
    pub current_step: String,
    pub start_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub estimated_duration_ms: u64,
    pub error: Option<ProgressError>,
    pub backup_info: Option<BackupArtifact>,
}

impl ProgressState {
    pub fn idle(estimated_duration_ms: u64) -> Self {
        Self {
            run_id: None,
            trigger: None,
            status: BackupStatus::Idle,
            progress_percent: 0,
            current_step: "Idle".to_string(),
            start_time: None,
            updated_at: Utc::now(),
            estimated_duration_ms,
            error: None,
            backup_info: None,
        }
    }
}

#[derive(Default)]
struct Runs {
    current: Option<Uuid>,
    states: HashMap<Uuid, ProgressState>,
    order: VecDeque<Uuid>,
}

impl Runs {
    fn insert(&mut self, state: ProgressState, run_id: Uuid) {
        self.states.insert(run_id, state);
        self.order.push_back(run_id);
        while self.order.len() > RUN_HISTORY {
            if let Some(old) = self.order.pop_front() {
                if self.current != Some(old) {
                    self.states.remove(&old);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    runs: Arc<RwLock<Runs>>,
    gate: Arc<Semaphore>,
    policy: ConcurrentTriggerPolicy,
    reset_delay: Duration,
    estimated_duration_ms: u64,
}

impl ProgressTracker {
    pub fn new(policy: ConcurrentTriggerPolicy, reset_delay: Duration, estimated_duration_ms: u64) -> Self {
        Self {
            runs: Arc::new(RwLock::new(Runs::default())),
            gate: Arc::new(Semaphore::new(1)),
            policy,
            reset_delay,
            estimated_duration_ms,
        }
    }

    /// The current run's state, or `idle` when there is none.
    pub async fn current(&self) -> ProgressState {
        let runs = self.runs.read().await;
        runs.current
            .and_then(|id| runs.states.get(&id).cloned())
            .unwrap_or_else(|| ProgressState::idle(self.estimated_duration_ms))
    }

    pub async fn get(&self, run_id: Uuid) -> Option<ProgressState> {
        self.runs.read().await.states.get(&run_id).cloned()
    }

    /// Starts a run: applies the concurrent-trigger policy, then resets the
    /// current view to a fresh `creating` state owned by the new run.
    pub async fn begin(&self, trigger: BackupTrigger) -> Result<RunHandle, BackupError> {
        let permit = match self.policy {
            ConcurrentTriggerPolicy::Overwrite => None,
            ConcurrentTriggerPolicy::Reject => Some(
                self.gate
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| BackupError::RunInProgress)?,
            ),
            ConcurrentTriggerPolicy::Queue => Some(
                self.gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| BackupError::RunInProgress)?,
            ),
        };

        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let state = ProgressState {
            run_id: Some(run_id),
            trigger: Some(trigger),
            status: BackupStatus::Creating,
            progress_percent: 0,
            current_step: "Starting backup".to_string(),
            start_time: Some(now),
            updated_at: now,
            estimated_duration_ms: self.estimated_duration_ms,
            error: None,
            backup_info: None,
        };

        {
            let mut runs = self.runs.write().await;
            if let Some(previous) = runs.current {
                if runs.states.get(&previous).is_some_and(|s| !s.status.is_terminal()) {
                    tracing::warn!(previous = %previous, run_id = %run_id, "New run replaces an active run in the current view");
                }
            }
            runs.insert(state, run_id);
            runs.current = Some(run_id);
        }

        tracing::info!(run_id = %run_id, trigger = %trigger, "Backup run started");
        Ok(RunHandle {
            run_id,
            tracker: self.clone(),
            finished: false,
            _permit: permit,
        })
    }

    async fn update<F>(&self, run_id: Uuid, apply: F)
    where
        F: FnOnce(&mut ProgressState),
    {
        let mut runs = self.runs.write().await;
        if let Some(state) = runs.states.get_mut(&run_id) {
            apply(state);
            state.updated_at = Utc::now();
        }
    }

    fn schedule_reset(&self, run_id: Uuid) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.reset_delay).await;
            let mut runs = tracker.runs.write().await;
            let still_current = runs.current == Some(run_id)
                && runs.states.get(&run_id).is_some_and(|s| s.status.is_terminal());
            if still_current {
                runs.current = None;
                tracing::debug!(run_id = %run_id, "Progress reset to idle");
            }
        });
    }
}

fn record_failure(state: &mut ProgressState, kind: &str, message: String) {
    let step = std::mem::take(&mut state.current_step);
    state.status = BackupStatus::Error;
    state.current_step = format!("Failed: {}", step);
    state.error = Some(ProgressError {
        kind: kind.to_string(),
        message,
        step,
    });
}

/// Write access to one run's progress. Dropping the handle releases the
/// concurrent-trigger guard; dropping it before `complete` or `fail` marks
/// the run as failed.
pub struct RunHandle {
    run_id: Uuid,
    tracker: ProgressTracker,
    finished: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Moves the run forward. The percentage never decreases within a run.
    pub async fn advance(&self, status: BackupStatus, percent: u8, step: &str) {
        let step = step.to_string();
        self.tracker
            .update(self.run_id, move |state| {
                state.status = status;
                state.progress_percent = state.progress_percent.max(percent.min(100));
                state.current_step = step;
            })
            .await;
    }

    pub async fn complete(mut self, artifact: BackupArtifact) {
        self.finished = true;
        self.tracker
            .update(self.run_id, move |state| {
                state.status = BackupStatus::Completed;
                state.progress_percent = 100;
                state.current_step = "Backup completed".to_string();
                state.backup_info = Some(artifact);
            })
            .await;
        self.tracker.schedule_reset(self.run_id);
    }

    pub async fn fail(mut self, error: &BackupError) {
        self.finished = true;
        let (kind, message) = (error.kind(), error.to_string());
        self.tracker
            .update(self.run_id, move |state| record_failure(state, kind, message))
            .await;
        self.tracker.schedule_reset(self.run_id);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let run_id = self.run_id;
        let tracker = self.tracker.clone();
        tracing::warn!(run_id = %run_id, "Backup run dropped before it finished");
        runtime.spawn(async move {
            tracker
                .update(run_id, |state| {
                    if !state.status.is_terminal() {
                        record_failure(state, ABANDONED, "run was cancelled before it finished".to_string());
                    }
                })
                .await;
            tracker.schedule_reset(run_id);
        });
    }
}
