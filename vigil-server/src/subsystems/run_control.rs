//! Run state, progress reporting and cancellation for pipeline runs.
//!
//! A single [`RunController`] owns the state of the current (or last) run.
//! Workers only see a [`RunReporter`], which can advance the stage, append
//! log lines and observe the cancellation token. The log buffer is bounded;
//! cursors handed out by [`RunController::tail_logs`] are absolute line
//! numbers, so a reader that falls behind simply resumes at the oldest
//! retained line.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Fetching,
    Deduping,
    Enriching,
    Translating,
    Storing,
    Cleaning,
    Done,
    Cancelled,
    Aborted,
}

impl RunStage {
    pub fn percent(&self) -> u8 {
        match self {
            RunStage::Idle => 0,
            RunStage::Fetching => 10,
            RunStage::Deduping => 25,
            RunStage::Enriching => 45,
            RunStage::Translating => 70,
            RunStage::Storing => 85,
            RunStage::Cleaning => 95,
            RunStage::Done | RunStage::Cancelled | RunStage::Aborted => 100,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStage::Idle => "Idle",
            RunStage::Fetching => "Fetching messages",
            RunStage::Deduping => "Removing known messages",
            RunStage::Enriching => "Enriching",
            RunStage::Translating => "Translating",
            RunStage::Storing => "Storing",
            RunStage::Cleaning => "Cleaning old records",
            RunStage::Done => "Done",
            RunStage::Cancelled => "Cancelled",
            RunStage::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Cancelled | RunStage::Aborted)
    }
}

/// Counters reported by a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub new_items: usize,
    pub after_content_dedupe: usize,
    pub stored: usize,
    pub retention_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done(RunSummary),
    Cancelled,
    Aborted(String),
}

/// Snapshot returned by [`RunController::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub percent: u8,
    pub step: String,
    pub stage: RunStage,
    pub running: bool,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            percent: 0,
            step: RunStage::Idle.label().to_string(),
            stage: RunStage::Idle,
            running: false,
            reason: None,
            started_at: None,
            finished_at: None,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
    pub running: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunError {
    #[error("A pipeline run is already in progress")]
    AlreadyRunning,

    #[error("Run state unavailable")]
    StateUnavailable,
}

/// Returned by workers that stopped because the run was cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run cancelled")]
pub struct Cancelled;

// ============================================================================
// Log buffer
// ============================================================================

#[derive(Debug)]
struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Lines ever pushed; the cursor of the next line.
    total: u64,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
    }

    fn first_cursor(&self) -> u64 {
        self.total - self.lines.len() as u64
    }

    fn tail(&self, cursor: u64) -> (Vec<String>, u64) {
        let start = cursor.max(self.first_cursor());
        if start >= self.total {
            return (Vec::new(), self.total);
        }
        let skip = (start - self.first_cursor()) as usize;
        (self.lines.iter().skip(skip).cloned().collect(), self.total)
    }

    fn clear(&mut self) {
        self.lines.clear();
    }
}

#[derive(Debug)]
struct RunState {
    status: RunStatus,
    logs: LogBuffer,
    token: Option<CancellationToken>,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    // A panic while holding the lock leaves plain data behind; keep serving it.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panicked: {}", message)
}

fn stamp(line: &str) -> String {
    format!("[{}] {}", Utc::now().format("%H:%M:%S"), line)
}

// ============================================================================
// Reporter
// ============================================================================

/// Handle given to a running job.
#[derive(Debug, Clone)]
pub struct RunReporter {
    state: Arc<Mutex<RunState>>,
    token: CancellationToken,
}

impl RunReporter {
    /// Reporter not attached to any controller.
    pub fn detached(log_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState {
                status: RunStatus::default(),
                logs: LogBuffer::new(log_capacity),
                token: None,
            })),
            token: CancellationToken::new(),
        }
    }

    /// Moves to `stage`, updating percent and step label.
    pub fn enter(&self, stage: RunStage) {
        tracing::info!(stage = ?stage, percent = stage.percent(), "Pipeline stage");
        let mut state = lock(&self.state);
        state.status.stage = stage;
        state.status.percent = stage.percent();
        state.status.step = stage.label().to_string();
        state.logs.push(stamp(&format!("==> {}", stage.label())));
    }

    pub fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::info!(target: "vigil::pipeline", "{}", line);
        lock(&self.state).logs.push(stamp(line));
    }

    pub fn warn(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::warn!(target: "vigil::pipeline", "{}", line);
        lock(&self.state).logs.push(stamp(&format!("WARN {}", line)));
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn stage(&self) -> RunStage {
        lock(&self.state).status.stage
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.state).logs.tail(0).0
    }

    fn finish(&self, outcome: RunOutcome) {
        let mut state = lock(&self.state);
        let (stage, step, reason, summary) = match outcome {
            RunOutcome::Done(summary) => (RunStage::Done, "Done".to_string(), None, Some(summary)),
            RunOutcome::Cancelled => (RunStage::Cancelled, "Cancelled".to_string(), None, None),
            RunOutcome::Aborted(reason) => (
                RunStage::Aborted,
                format!("Aborted: {}", reason),
                Some(reason),
                None,
            ),
        };
        state.status.stage = stage;
        state.status.percent = stage.percent();
        state.status.step = step.clone();
        state.status.reason = reason;
        state.status.summary = summary;
        state.status.running = false;
        state.status.finished_at = Some(Utc::now());
        state.token = None;
        state.logs.push(stamp(&format!("==> {}", step)));
        drop(state);

        match stage {
            RunStage::Aborted => tracing::error!(step = %step, "Pipeline run finished"),
            _ => tracing::info!(step = %step, "Pipeline run finished"),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug)]
pub struct RunController {
    state: Arc<Mutex<RunState>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunController {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState {
                status: RunStatus::default(),
                logs: LogBuffer::new(log_capacity),
                token: None,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Spawns `job` unless a run is already active. Returns immediately.
    pub fn start<F, Fut>(&self, job: F) -> Result<(), RunError>
    where
        F: FnOnce(RunReporter) -> Fut,
        Fut: Future<Output = RunOutcome> + Send + 'static,
    {
        let token = CancellationToken::new();
        {
            let mut state = lock(&self.state);
            if state.status.running {
                return Err(RunError::AlreadyRunning);
            }
            state.logs.clear();
            state.status = RunStatus {
                running: true,
                step: "Starting".to_string(),
                started_at: Some(Utc::now()),
                ..RunStatus::default()
            };
            state.token = Some(token.clone());
            state.logs.push(stamp("Run started"));
        }

        let reporter = RunReporter {
            state: Arc::clone(&self.state),
            token,
        };
        let finisher = reporter.clone();
        let future = job(reporter);

        // The job runs in its own task so a panic surfaces as a JoinError
        // here instead of leaving the run marked as running.
        let handle = tokio::spawn(async move {
            let outcome = match tokio::spawn(future).await {
                Ok(outcome) => outcome,
                Err(e) => RunOutcome::Aborted(join_failure(e)),
            };
            finisher.finish(outcome);
        });

        let mut slot = self.handle.lock().map_err(|_| RunError::StateUnavailable)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Requests cancellation of the active run. Returns whether one was active.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        match (&state.token, state.status.running) {
            (Some(token), true) => {
                token.cancel();
                state.logs.push(stamp("Cancellation requested"));
                tracing::info!("Pipeline cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.state).status.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).status.running
    }

    /// Lines from `cursor` onwards plus the cursor to pass next time.
    pub fn tail_logs(&self, cursor: u64) -> LogTail {
        let state = lock(&self.state);
        let (lines, next_cursor) = state.logs.tail(cursor);
        LogTail {
            lines,
            next_cursor,
            running: state.status.running,
        }
    }

    /// Every log line of the current run, ending once the run has finished
    /// and the buffer is drained.
    pub fn stream_logs(&self) -> BoxStream<'static, String> {
        let state = Arc::clone(&self.state);
        let start = lock(&state).logs.first_cursor();

        stream::unfold(
            (state, start, VecDeque::<String>::new(), false),
            |(state, mut cursor, mut pending, mut finished)| async move {
                loop {
                    if let Some(line) = pending.pop_front() {
                        return Some((line, (state, cursor, pending, finished)));
                    }
                    if finished {
                        return None;
                    }
                    {
                        let guard = lock(&state);
                        let (lines, next) = guard.logs.tail(cursor);
                        cursor = next;
                        pending.extend(lines);
                        finished = !guard.status.running;
                    }
                    if pending.is_empty() && !finished {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            },
        )
        .boxed()
    }

    /// Waits for the spawned run, if any, to finish.
    pub async fn join(&self) {
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline task failed");
            }
        }
    }
}
