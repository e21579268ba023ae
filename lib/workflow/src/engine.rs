//! Engine facade.
//!
//! Wires the validator, event log, confirmation gate, executor, controller
//! and replay service together and is the boundary hosts talk to. Errors
//! leave through `braid_core::Result`.

use crate::config::EngineConfig;
use crate::confirmation::{ConfirmationError, ConfirmationGate, ConfirmationRequest, Decision};
use crate::controller::{ConcurrencyController, ControllerError, WaitOutcome};
use crate::definition::Workflow;
use crate::event_log::{EventLog, EventStream};
use crate::execution::{RunStatus, WorkflowRun};
use crate::executor::DagExecutor;
use crate::registry::CapabilityRegistry;
use crate::replay::{Cursor, ReplayError, ReplayPage, ReplayService};
use crate::store::{StoreError, WorkflowStore};
use crate::validator::{GraphValidator, ValidatedWorkflow, ValidationReport};
use braid_core::{ConfirmId, RunId, WorkflowId};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Errors surfaced by the engine.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The store has no workflow with this id.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The store failed to load the workflow.
    Store { details: String },
    /// The workflow failed validation; nothing was executed.
    Invalid(ValidationReport),
    /// The run could not be submitted or found.
    Controller(ControllerError),
    /// The decision was not applied.
    Confirmation(ConfirmationError),
    /// History could not be served.
    Replay(ReplayError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::Store { details } => write!(f, "failed to load workflow: {details}"),
            Self::Invalid(report) => write!(f, "workflow is invalid: {report}"),
            Self::Controller(e) => write!(f, "{e}"),
            Self::Confirmation(e) => write!(f, "{e}"),
            Self::Replay(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { workflow_id } => Self::WorkflowNotFound { workflow_id },
            StoreError::Backend { message } => Self::Store { details: message },
        }
    }
}

impl From<ValidationReport> for EngineError {
    fn from(report: ValidationReport) -> Self {
        Self::Invalid(report)
    }
}

impl From<ControllerError> for EngineError {
    fn from(e: ControllerError) -> Self {
        Self::Controller(e)
    }
}

impl From<ConfirmationError> for EngineError {
    fn from(e: ConfirmationError) -> Self {
        Self::Confirmation(e)
    }
}

impl From<ReplayError> for EngineError {
    fn from(e: ReplayError) -> Self {
        Self::Replay(e)
    }
}

/// The workflow execution core.
pub struct Engine {
    store: Arc<dyn WorkflowStore>,
    config: EngineConfig,
    gate: Arc<ConfirmationGate>,
    validator: GraphValidator,
    controller: ConcurrencyController,
    replay: ReplayService,
}

impl Engine {
    /// Builds an engine over a capability registry and a workflow store.
    #[must_use]
    pub fn new(registry: CapabilityRegistry, store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        let log = Arc::new(EventLog::new());
        let gate = Arc::new(ConfirmationGate::new(log.clone(), config.confirmation_timeout()));
        let executor = Arc::new(DagExecutor::new(
            registry.clone(),
            log.clone(),
            gate.clone(),
            &config,
        ));
        let controller = ConcurrencyController::new(executor, log.clone(), config.max_concurrent_runs);
        let replay = ReplayService::new(log, &config);
        Self {
            store,
            gate,
            validator: GraphValidator::new(registry),
            controller,
            replay,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates a workflow without running it.
    ///
    /// # Errors
    ///
    /// Returns every violation found.
    pub fn validate(&self, workflow: Workflow) -> Result<ValidatedWorkflow, ValidationReport> {
        self.validator.validate(workflow)
    }

    /// Loads a workflow from the store and validates it.
    ///
    /// # Errors
    ///
    /// - `WorkflowNotFound` / `Store` if the store cannot produce it
    /// - `Invalid` if validation fails
    pub async fn load(&self, workflow_id: WorkflowId) -> braid_core::Result<ValidatedWorkflow, EngineError> {
        let workflow = self.store.get(workflow_id).await.map_err(EngineError::from)?;
        let validated = self.validate(workflow).map_err(|report| {
            warn!(%workflow_id, violations = report.violations.len(), "workflow rejected");
            EngineError::from(report)
        })?;
        Ok(validated)
    }

    /// Loads, validates and starts a run of a stored workflow.
    ///
    /// # Errors
    ///
    /// Fails as [`load`](Self::load) does, or if the controller rejects
    /// the run.
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        workflow_id: WorkflowId,
        input: JsonValue,
    ) -> braid_core::Result<RunId, EngineError> {
        let workflow = self.load(workflow_id).await?;
        self.submit_validated(workflow, input).await
    }

    /// Starts a run of an already validated workflow.
    ///
    /// # Errors
    ///
    /// Returns `Controller` if the run cannot be submitted.
    pub async fn submit_validated(
        &self,
        workflow: ValidatedWorkflow,
        input: JsonValue,
    ) -> braid_core::Result<RunId, EngineError> {
        let run_id = self
            .controller
            .submit(workflow, input)
            .await
            .map_err(EngineError::from)?;
        Ok(run_id)
    }

    /// Submits several runs; each entry succeeds or fails on its own.
    pub async fn submit_many(
        &self,
        requests: impl IntoIterator<Item = (WorkflowId, JsonValue)>,
    ) -> Vec<braid_core::Result<RunId, EngineError>> {
        let mut results = Vec::new();
        for (workflow_id, input) in requests {
            results.push(self.submit(workflow_id, input).await);
        }
        info!(count = results.len(), "submitted batch");
        results
    }

    /// See [`ConcurrencyController::wait_all`].
    pub async fn wait_all(&self, run_ids: &[RunId], timeout: Duration) -> Vec<(RunId, WaitOutcome)> {
        self.controller.wait_all(run_ids, timeout).await
    }

    /// See [`ConcurrencyController::cancel_all`].
    pub async fn cancel_all(&self, run_ids: &[RunId]) -> Vec<RunId> {
        self.controller.cancel_all(run_ids).await
    }

    /// Answers a pending confirmation.
    ///
    /// # Errors
    ///
    /// Returns `Confirmation` for unknown ids and for requests that were
    /// already decided, timed out or cancelled.
    pub async fn confirm(
        &self,
        confirm_id: ConfirmId,
        decision: Decision,
    ) -> braid_core::Result<ConfirmationRequest, EngineError> {
        let request = self
            .gate
            .decide(confirm_id, decision)
            .await
            .map_err(EngineError::from)?;
        Ok(request)
    }

    /// Lists confirmations waiting for a decision.
    pub async fn pending_confirmations(&self) -> Vec<ConfirmationRequest> {
        self.gate.pending().await
    }

    /// Fetches a page of a run's events.
    ///
    /// # Errors
    ///
    /// Returns `Replay` for unknown runs, bad cursors or page sizes, and gaps.
    pub async fn replay(
        &self,
        run_id: RunId,
        cursor: Option<Cursor>,
        page_size: Option<usize>,
    ) -> braid_core::Result<ReplayPage, EngineError> {
        let page = self
            .replay
            .fetch(run_id, cursor, page_size)
            .await
            .map_err(EngineError::from)?;
        Ok(page)
    }

    /// Streams a run's events from `cursor`, ending after the log closes.
    ///
    /// # Errors
    ///
    /// Returns `Replay` for unknown runs and gaps.
    pub async fn follow(
        &self,
        run_id: RunId,
        cursor: Option<Cursor>,
    ) -> braid_core::Result<EventStream, EngineError> {
        let stream = self
            .replay
            .follow(run_id, cursor)
            .await
            .map_err(EngineError::from)?;
        Ok(stream)
    }

    pub async fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.controller.status(run_id).await
    }

    pub async fn run(&self, run_id: RunId) -> Option<WorkflowRun> {
        self.controller.run(run_id).await
    }

    pub async fn runs(&self) -> Vec<WorkflowRun> {
        self.controller.runs().await
    }

    /// Forgets a terminal run: its snapshot, log and resolved confirmations.
    pub async fn remove(&self, run_id: RunId) -> bool {
        let removed = self.controller.remove(run_id).await;
        if removed {
            self.gate.forget_run(run_id).await;
        }
        removed
    }

    /// Cancels every run and waits for them to stop.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;
    use crate::registry::{EchoAdapter, NodeContract};
    use crate::store::InMemoryWorkflowStore;
    use serde_json::json;

    async fn engine_with(workflow: Workflow) -> (Engine, WorkflowId) {
        let mut registry = CapabilityRegistry::with_builtins();
        registry.register("task", NodeContract::task(), Arc::new(EchoAdapter));
        let store = Arc::new(InMemoryWorkflowStore::new());
        let workflow_id = store.insert(workflow).await;
        (Engine::new(registry, store, EngineConfig::default()), workflow_id)
    }

    #[tokio::test]
    async fn submit_runs_stored_workflow() {
        let workflow = Workflow::new("echo")
            .with_node(Node::new("start", "start"))
            .with_node(Node::new("A", "task"))
            .with_edge(Edge::new("e1", "start", "A"));
        let (engine, workflow_id) = engine_with(workflow).await;

        let run_id = engine
            .submit(workflow_id, json!({"hello": "world"}))
            .await
            .expect("submitted");
        let outcomes = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
        assert_eq!(outcomes[0].1, WaitOutcome::Terminal(RunStatus::Succeeded));

        let page = engine.replay(run_id, None, None).await.expect("replay");
        assert_eq!(page.events.len(), 3);
        assert!(page.is_final());
        assert_eq!(
            engine.run(run_id).await.and_then(|run| run.result),
            Some(json!({"hello": "world"}))
        );
    }

    #[tokio::test]
    async fn invalid_workflow_is_not_started() {
        let workflow = Workflow::new("broken")
            .with_node(Node::new("A", "task"))
            .with_edge(Edge::new("e1", "A", "A"));
        let (engine, workflow_id) = engine_with(workflow).await;

        assert!(engine.submit(workflow_id, json!({})).await.is_err());
        assert!(engine.runs().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_workflow_and_run() {
        let (engine, _) = engine_with(Workflow::new("empty")).await;
        assert!(engine.submit(WorkflowId::new(), json!({})).await.is_err());
        assert!(engine.replay(RunId::new(), None, None).await.is_err());
        assert!(engine.confirm(ConfirmId::new(), Decision::Allow).await.is_err());
        assert_eq!(engine.status(RunId::new()).await, None);
    }

    #[test]
    fn engine_error_display() {
        let workflow_id = WorkflowId::new();
        let err = EngineError::from(StoreError::NotFound { workflow_id });
        assert_eq!(err.to_string(), format!("workflow not found: {workflow_id}"));
    }
}
