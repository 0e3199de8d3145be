//! Execution registry.
//!
//! Tracks every submission from admission until its result is consumed:
//! its phase, timestamps, the cancel handle of the live sandbox, and (for
//! async submissions) the terminal envelope. Synchronous entries are removed
//! by the dispatcher as soon as their envelope exists; asynchronous entries
//! stay until the reaper expires them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::envelope::{FailurePhase, ResultEnvelope};

/// Lifecycle phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Compiling,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl Phase {
    /// A sandbox exists and the cancel handle is valid.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Compiling | Self::Running)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }

    /// Terminal phase for an execution that produced `envelope`.
    pub const fn for_envelope(envelope: &ResultEnvelope) -> Self {
        if envelope.is_cancelled() {
            Self::Cancelled
        } else if matches!(envelope.phase_at_failure, FailurePhase::Sandbox) {
            Self::Failed
        } else {
            Self::Finished
        }
    }
}

/// Submission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Synchronous,
    Asynchronous,
}

/// Registry entry.
#[derive(Debug)]
pub struct ExecutionState {
    pub execution_id: String,
    pub language_id: String,
    pub mode: Mode,
    pub phase: Phase,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set iff `phase.is_live()`.
    cancel_handle: Option<CancellationToken>,
    result: Option<ResultEnvelope>,
    /// When the entry reached a terminal phase (retention clock).
    terminal_since: Option<Instant>,
}

impl ExecutionState {
    fn new(execution_id: String, language_id: String, mode: Mode) -> Self {
        Self {
            execution_id,
            language_id,
            mode,
            phase: Phase::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_handle: None,
            result: None,
            terminal_since: None,
        }
    }

    fn enter_terminal(&mut self, phase: Phase) {
        self.phase = phase;
        self.cancel_handle = None;
        self.finished_at = Some(Utc::now());
        self.terminal_since = Some(Instant::now());
    }

    fn status(&self) -> ExecutionStatus {
        ExecutionStatus {
            execution_id: self.execution_id.clone(),
            language_id: self.language_id.clone(),
            phase: self.phase,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Point-in-time view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: String,
    pub language_id: String,
    pub phase: Phase,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotRunning,
    Unknown,
}

/// Outcome of a result lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLookup {
    Ready(ResultEnvelope),
    /// Known but without an envelope (still in flight, or cancelled while queued).
    NotReady(ExecutionStatus),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution id '{0}' is already in use")]
pub struct DuplicateExecution(pub String);

/// Thread-safe map from execution id to state.
///
/// Every mutation takes the write lock; lookups take the read lock. No lock
/// is ever held across an await on anything other than the lock itself.
#[derive(Debug)]
pub struct ExecutionRegistry {
    entries: RwLock<HashMap<String, ExecutionState>>,
    retention: Duration,
}

impl ExecutionRegistry {
    /// `retention` bounds how long terminal async entries are kept.
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Register a new execution in phase `queued`.
    pub async fn insert(
        &self,
        execution_id: &str,
        language_id: &str,
        mode: Mode,
    ) -> Result<(), DuplicateExecution> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(execution_id) {
            return Err(DuplicateExecution(execution_id.to_string()));
        }
        entries.insert(
            execution_id.to_string(),
            ExecutionState::new(execution_id.to_string(), language_id.to_string(), mode),
        );
        debug!(execution = %execution_id, ?mode, "Registered execution");
        Ok(())
    }

    /// Move a queued entry into a live phase and attach its cancel handle.
    ///
    /// Returns `false` when the entry is gone or was cancelled while queued;
    /// the caller must then not launch anything.
    pub async fn begin(&self, execution_id: &str, phase: Phase, handle: CancellationToken) -> bool {
        debug_assert!(phase.is_live());
        let mut entries = self.entries.write().await;
        match entries.get_mut(execution_id) {
            Some(state) if state.phase == Phase::Queued => {
                state.phase = phase;
                state.started_at = Some(Utc::now());
                state.cancel_handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Move a live entry to another live phase (compiling -> running).
    /// Entries that already left the live phases are untouched.
    pub async fn update_phase(&self, execution_id: &str, phase: Phase) -> bool {
        debug_assert!(phase.is_live());
        let mut entries = self.entries.write().await;
        match entries.get_mut(execution_id) {
            Some(state) if state.phase.is_live() => {
                state.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Record the envelope of a finished execution and return its final phase.
    ///
    /// An entry cancelled in the meantime stays `cancelled`.
    pub async fn finish(&self, execution_id: &str, envelope: ResultEnvelope) -> Option<Phase> {
        let mut entries = self.entries.write().await;
        let state = entries.get_mut(execution_id)?;
        let phase = if state.phase == Phase::Cancelled {
            Phase::Cancelled
        } else {
            Phase::for_envelope(&envelope)
        };
        state.enter_terminal(phase);
        state.result = Some(envelope);
        Some(phase)
    }

    pub async fn lookup(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.entries
            .read()
            .await
            .get(execution_id)
            .map(ExecutionState::status)
    }

    pub async fn result_of(&self, execution_id: &str) -> ResultLookup {
        let entries = self.entries.read().await;
        match entries.get(execution_id) {
            Some(state) => state
                .result
                .clone()
                .map_or_else(|| ResultLookup::NotReady(state.status()), ResultLookup::Ready),
            None => ResultLookup::Unknown,
        }
    }

    pub async fn remove(&self, execution_id: &str) -> bool {
        self.entries.write().await.remove(execution_id).is_some()
    }

    /// Remove an entry only if it never left the queue.
    pub async fn remove_queued(&self, execution_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        if entries
            .get(execution_id)
            .is_some_and(|state| state.phase == Phase::Queued)
        {
            entries.remove(execution_id);
            true
        } else {
            false
        }
    }

    /// Cancel an execution.
    ///
    /// Queued entries become `cancelled` and are dropped by whoever dequeues
    /// them. Live entries have their sandbox stopped through the cancel
    /// handle. Terminal entries are left alone.
    pub async fn cancel(&self, execution_id: &str) -> CancelOutcome {
        let mut entries = self.entries.write().await;
        let Some(state) = entries.get_mut(execution_id) else {
            return CancelOutcome::Unknown;
        };
        if state.phase.is_terminal() {
            return CancelOutcome::NotRunning;
        }
        if let Some(handle) = state.cancel_handle.take() {
            handle.cancel();
        }
        state.enter_terminal(Phase::Cancelled);
        info!(execution = %execution_id, "Execution cancelled");
        CancelOutcome::Cancelled
    }

    /// Cancel everything not yet terminal. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut cancelled = 0;
        for state in entries.values_mut().filter(|s| !s.phase.is_terminal()) {
            if let Some(handle) = state.cancel_handle.take() {
                handle.cancel();
            }
            state.enter_terminal(Phase::Cancelled);
            cancelled += 1;
        }
        cancelled
    }

    /// Drop terminal entries older than the retention period.
    ///
    /// Synchronous entries only linger here when their caller went away
    /// before the dispatcher could remove them.
    pub async fn cleanup_expired(&self) {
        let retention = self.retention;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, state| {
            !state
                .terminal_since
                .is_some_and(|since| since.elapsed() > retention)
        });
        let expired = before - entries.len();
        if expired > 0 {
            debug!(expired, "Expired retained results");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until aborted. The reaper drops
    /// expired async results every `interval`.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Reaper sweep");
                registry.cleanup_expired().await;
            }
        })
    }
}
