//! Concurrency controller.
//!
//! Owns every run of an engine: submits them onto the runtime, bounds how
//! many execute at once, waits for groups of runs and cancels them.
//!
//! Each run is one spawned task. Its status is published through a
//! `watch` channel so waiters never poll.

use crate::event_log::{EventLog, EventLogError};
use crate::execution::{EventKind, RunOutcome, RunStatus, WorkflowRun};
use crate::executor::{DagExecutor, panic_message};
use crate::validator::ValidatedWorkflow;
use braid_core::RunId;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Where a run stood when a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "status", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// The run reached this terminal status.
    Terminal(RunStatus),
    /// The run was still pending or running at the deadline.
    StillRunning,
    /// No run with this id exists.
    Unknown,
}

/// Errors from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// The controller is shutting down and accepts no new runs.
    ShuttingDown,
    /// No run with this id exists.
    RunNotFound { run_id: RunId },
    /// The run's event log could not be created.
    EventLog(EventLogError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "controller is shutting down"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::EventLog(e) => write!(f, "event log error: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<EventLogError> for ControllerError {
    fn from(e: EventLogError) -> Self {
        Self::EventLog(e)
    }
}

struct RunHandle {
    state: watch::Sender<WorkflowRun>,
    cancellation: CancellationToken,
}

impl RunHandle {
    fn snapshot(&self) -> WorkflowRun {
        self.state.borrow().clone()
    }
}

/// Runs workflows concurrently, at most `max_concurrent_runs` at a time.
pub struct ConcurrencyController {
    executor: Arc<DagExecutor>,
    log: Arc<EventLog>,
    permits: Arc<Semaphore>,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
    tasks: Mutex<JoinSet<()>>,
    closing: AtomicBool,
}

impl ConcurrencyController {
    #[must_use]
    pub fn new(executor: Arc<DagExecutor>, log: Arc<EventLog>, max_concurrent_runs: usize) -> Self {
        Self {
            executor,
            log,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            runs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Starts a run and returns its id without waiting for it.
    ///
    /// The run's event log exists when this returns, so subscribers can
    /// attach before the first event. The run stays `pending` until a slot
    /// is free.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` after [`shutdown`](Self::shutdown)
    /// - `EventLog` if the log cannot be created
    #[instrument(skip_all, fields(workflow_id = %workflow.workflow().id))]
    pub async fn submit(
        &self,
        workflow: ValidatedWorkflow,
        input: JsonValue,
    ) -> Result<RunId, ControllerError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ControllerError::ShuttingDown);
        }
        let run_id = RunId::new();
        self.log.create(run_id).await?;

        let run = WorkflowRun::new(run_id, workflow.workflow().id, input.clone());
        let (state, _) = watch::channel(run);
        let handle = Arc::new(RunHandle {
            state,
            cancellation: CancellationToken::new(),
        });
        self.runs.write().await.insert(run_id, handle.clone());

        let executor = self.executor.clone();
        let log = self.log.clone();
        let permits = self.permits.clone();
        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(err) = finished {
                warn!(error = %err, "run task panicked");
            }
        }
        tasks.spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                () = handle.cancellation.cancelled() => None,
            };
            let Some(_permit) = permit else {
                handle.state.send_modify(|run| {
                    run.cancel();
                });
                if let Err(err) = log.seal(run_id).await {
                    warn!(%run_id, error = %err, "failed to seal run cancelled while pending");
                }
                info!(%run_id, "run cancelled before start");
                return;
            };

            handle.state.send_modify(WorkflowRun::start);
            let outcome = AssertUnwindSafe(executor.execute(
                run_id,
                &workflow,
                input,
                handle.cancellation.clone(),
            ))
            .catch_unwind()
            .await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(panic) => abandon_run(&log, run_id, panic).await,
            };
            handle.state.send_modify(|run| {
                run.apply(&outcome);
            });
            debug!(%run_id, status = ?outcome.status, "run finished");
        });

        info!(%run_id, "run submitted");
        Ok(run_id)
    }

    /// Submits several runs. Each entry is submitted independently; one
    /// failure does not stop the others.
    pub async fn submit_many(
        &self,
        requests: impl IntoIterator<Item = (ValidatedWorkflow, JsonValue)>,
    ) -> Vec<Result<RunId, ControllerError>> {
        let mut results = Vec::new();
        for (workflow, input) in requests {
            results.push(self.submit(workflow, input).await);
        }
        results
    }

    /// Waits until every listed run is terminal or the timeout elapses.
    ///
    /// Returns one outcome per id, in input order. A zero timeout returns
    /// a snapshot without waiting; a timeout too large to represent waits
    /// without a deadline.
    pub async fn wait_all(&self, run_ids: &[RunId], timeout: Duration) -> Vec<(RunId, WaitOutcome)> {
        let deadline = Instant::now().checked_add(timeout);
        let handles: Vec<(RunId, Option<Arc<RunHandle>>)> = {
            let runs = self.runs.read().await;
            run_ids
                .iter()
                .map(|run_id| (*run_id, runs.get(run_id).cloned()))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        for (run_id, handle) in handles {
            let Some(handle) = handle else {
                outcomes.push((run_id, WaitOutcome::Unknown));
                continue;
            };
            let mut rx = handle.state.subscribe();
            let terminal = rx.wait_for(|run| run.status.is_terminal());
            let waited = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, terminal).await.ok(),
                None => Some(terminal.await),
            };
            let outcome = match waited {
                Some(Ok(run)) => WaitOutcome::Terminal(run.status),
                Some(Err(_)) | None => match handle.snapshot().status {
                    status if status.is_terminal() => WaitOutcome::Terminal(status),
                    _ => WaitOutcome::StillRunning,
                },
            };
            outcomes.push((run_id, outcome));
        }
        outcomes
    }

    /// Cancels one run.
    ///
    /// No `node_start` for the run is published after this returns.
    /// Returns false if the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown ids.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, ControllerError> {
        let handle = self
            .runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(ControllerError::RunNotFound { run_id })?;
        Ok(self.cancel_handle(run_id, &handle).await)
    }

    /// Cancels the listed runs, returning the ids actually cancelled.
    ///
    /// Unknown and already terminal runs are left alone.
    #[instrument(skip_all, fields(requested = run_ids.len()))]
    pub async fn cancel_all(&self, run_ids: &[RunId]) -> Vec<RunId> {
        let handles: Vec<(RunId, Arc<RunHandle>)> = {
            let runs = self.runs.read().await;
            run_ids
                .iter()
                .filter_map(|run_id| runs.get(run_id).map(|handle| (*run_id, handle.clone())))
                .collect()
        };

        let mut cancelled = Vec::new();
        for (run_id, handle) in handles {
            if self.cancel_handle(run_id, &handle).await {
                cancelled.push(run_id);
            }
        }
        info!(count = cancelled.len(), "cancelled runs");
        cancelled
    }

    async fn cancel_handle(&self, run_id: RunId, handle: &RunHandle) -> bool {
        if handle.snapshot().status.is_terminal() {
            return false;
        }
        // Serialized with node_start and terminal appends by the log's lock.
        // A closed log means the run already finished or was cancelled.
        match self.log.mark_cancelled(run_id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(%run_id, error = %err, "failed to mark run cancelled");
                return false;
            }
        }
        handle.cancellation.cancel();
        debug!(%run_id, "run cancelled");
        true
    }

    /// Returns the current status of a run.
    pub async fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.run(run_id).await.map(|run| run.status)
    }

    /// Returns a snapshot of a run.
    pub async fn run(&self, run_id: RunId) -> Option<WorkflowRun> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(|handle| handle.snapshot())
    }

    /// Returns snapshots of every run, oldest first.
    pub async fn runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .await
            .values()
            .map(|handle| handle.snapshot())
            .collect();
        runs.sort_by_key(|run| run.id);
        runs
    }

    /// Forgets a terminal run and drops its event log.
    ///
    /// Returns false if the run is unknown or still active.
    pub async fn remove(&self, run_id: RunId) -> bool {
        let mut runs = self.runs.write().await;
        let terminal = runs
            .get(&run_id)
            .is_some_and(|handle| handle.snapshot().status.is_terminal());
        if !terminal {
            return false;
        }
        runs.remove(&run_id);
        drop(runs);
        if let Err(err) = self.log.remove(run_id).await {
            warn!(%run_id, error = %err, "failed to remove run log");
        }
        true
    }

    /// Stops accepting runs, cancels active ones and waits for their tasks.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let run_ids: Vec<RunId> = self.runs.read().await.keys().copied().collect();
        self.cancel_all(&run_ids).await;
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(finished) = tasks.join_next().await {
            if let Err(err) = finished {
                warn!(error = %err, "run task panicked");
            }
        }
        info!("controller shut down");
    }
}

/// Ends a run whose executor panicked, so it never hangs as running.
async fn abandon_run(
    log: &EventLog,
    run_id: RunId,
    panic: Box<dyn Any + Send + 'static>,
) -> RunOutcome {
    let error = format!("run panicked: {}", panic_message(panic.as_ref()));
    warn!(%run_id, %error, "run task panicked");
    let terminal = EventKind::WorkflowError {
        error: error.clone(),
        execution_log: Vec::new(),
    };
    let status = match log.append(run_id, terminal).await {
        Ok(_) => RunStatus::Failed,
        Err(EventLogError::Cancelled { .. }) => RunStatus::Cancelled,
        Err(err) => {
            warn!(%run_id, error = %err, "failed to publish run failure");
            RunStatus::Failed
        }
    };
    if let Err(err) = log.seal(run_id).await {
        warn!(%run_id, error = %err, "failed to seal abandoned run");
    }
    RunOutcome {
        status,
        result: None,
        error: (status == RunStatus::Failed).then_some(error),
        execution_log: Vec::new(),
    }
}
