//! Workflow execution state machine and event protocol.
//!
//! The state machine tracks:
//! - Overall run status
//! - Per-node records (the execution log)
//! - The events a run publishes, in sequence order

use crate::confirmation::Decision;
use crate::node::{NodeId, NodeType};
use braid_core::{ConfirmId, RunId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is submitted but waiting for a slot.
    Pending,
    /// Run is actively executing.
    Running,
    /// Every reachable node completed or was skipped.
    Succeeded,
    /// At least one node failed.
    Failed,
    /// Run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// The state of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting for predecessors.
    Pending,
    /// Adapter call in flight (or awaiting confirmation).
    Running,
    /// Node completed successfully.
    Completed,
    /// Node failed.
    Failed,
    /// Node was skipped because no live edge reached it.
    Skipped,
}

impl NodeState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A record of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run.
    pub id: RunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: RunStatus,
    /// When the run was submitted.
    pub created_at: DateTime<Utc>,
    /// When the run started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Input the run was submitted with.
    pub input: JsonValue,
    /// Aggregate result, if succeeded.
    pub result: Option<JsonValue>,
    /// First node error, if failed.
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Creates a new workflow run in pending status.
    #[must_use]
    pub fn new(id: RunId, workflow_id: WorkflowId, input: JsonValue) -> Self {
        Self {
            id,
            workflow_id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input,
            result: None,
            error: None,
        }
    }

    /// Starts the run. No-op unless pending.
    pub fn start(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Moves the run to a terminal status.
    ///
    /// Returns false, changing nothing, if the run is already terminal.
    pub fn finish(&mut self, status: RunStatus, result: Option<JsonValue>, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.result = result;
        self.error = error;
        true
    }

    /// Applies a finished execution.
    pub fn apply(&mut self, outcome: &RunOutcome) -> bool {
        self.finish(outcome.status, outcome.result.clone(), outcome.error.clone())
    }

    /// Marks the run as cancelled.
    pub fn cancel(&mut self) -> bool {
        self.finish(RunStatus::Cancelled, None, None)
    }

    /// Returns the duration of the run, if it has started.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

/// Execution record for a single node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The node being executed. Scoped for loop body nodes.
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub state: NodeState,
    pub input: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// Starts a record in running state.
    #[must_use]
    pub fn start(node_id: NodeId, node_type: NodeType, input: JsonValue) -> Self {
        Self {
            node_id,
            node_type,
            state: NodeState::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Marks the node as completed.
    pub fn complete(&mut self, output: JsonValue) {
        self.state = NodeState::Completed;
        self.finished_at = Some(Utc::now());
        self.output = Some(output);
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = NodeState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// Result of driving one run to a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub execution_log: Vec<NodeRecord>,
}

/// What happened, without the log-assigned envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The adapter is about to be invoked.
    NodeStart { node_id: NodeId, node_type: NodeType },
    /// The node produced an output.
    NodeComplete {
        node_id: NodeId,
        node_type: NodeType,
        output: JsonValue,
    },
    /// The node failed.
    NodeError {
        node_id: NodeId,
        node_type: NodeType,
        error: String,
    },
    /// Run succeeded. Always the last event.
    WorkflowComplete {
        result: JsonValue,
        execution_log: Vec<NodeRecord>,
    },
    /// Run failed. Always the last event.
    WorkflowError {
        error: String,
        execution_log: Vec<NodeRecord>,
    },
    /// A gated node is waiting for a decision.
    WorkflowConfirmRequired {
        node_id: NodeId,
        node_type: NodeType,
        confirm_id: ConfirmId,
        default_decision: Decision,
    },
    /// A gated node's decision is final.
    WorkflowConfirmed {
        node_id: NodeId,
        node_type: NodeType,
        confirm_id: ConfirmId,
        decision: Decision,
    },
}

impl EventKind {
    /// Returns true for `workflow_complete` and `workflow_error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowComplete { .. } | Self::WorkflowError { .. })
    }

    /// Returns true for `node_start`.
    #[must_use]
    pub fn is_node_start(&self) -> bool {
        matches!(self, Self::NodeStart { .. })
    }

    /// Returns the node this event concerns, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeStart { node_id, .. }
            | Self::NodeComplete { node_id, .. }
            | Self::NodeError { node_id, .. }
            | Self::WorkflowConfirmRequired { node_id, .. }
            | Self::WorkflowConfirmed { node_id, .. } => Some(node_id),
            Self::WorkflowComplete { .. } | Self::WorkflowError { .. } => None,
        }
    }

    /// Returns the wire name of the event type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } => "node_start",
            Self::NodeComplete { .. } => "node_complete",
            Self::NodeError { .. } => "node_error",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowError { .. } => "workflow_error",
            Self::WorkflowConfirmRequired { .. } => "workflow_confirm_required",
            Self::WorkflowConfirmed { .. } => "workflow_confirmed",
        }
    }
}

/// An event as stored in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Position in the run's log, starting at 1.
    pub sequence: u64,
    pub run_id: RunId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Returns true for `workflow_complete` and `workflow_error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn run_lifecycle() {
        let mut run = WorkflowRun::new(RunId::new(), WorkflowId::new(), json!({"x": 1}));
        assert_eq!(run.status, RunStatus::Pending);

        run.start();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        assert!(run.finish(RunStatus::Succeeded, Some(json!({"y": 2})), None));
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.duration().is_some());
    }

    #[test]
    fn terminal_transition_is_idempotent() {
        let mut run = WorkflowRun::new(RunId::new(), WorkflowId::new(), json!(null));
        run.start();
        assert!(run.cancel());
        assert!(!run.finish(RunStatus::Failed, None, Some("late".into())));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
    }

    #[test]
    fn node_record_lifecycle() {
        let mut record = NodeRecord::start(NodeId::new("A"), NodeType::new("tool"), json!(1));
        assert_eq!(record.state, NodeState::Running);

        record.fail("boom");
        assert_eq!(record.state, NodeState::Failed);
        assert!(record.state.is_terminal());
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn event_serializes_flat() {
        let event = ExecutionEvent {
            sequence: 3,
            run_id: RunId::new(),
            kind: EventKind::NodeComplete {
                node_id: NodeId::new("A"),
                node_type: NodeType::new("httpRequest"),
                output: json!({"y": 2}),
            },
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "node_complete");
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["node_id"], "A");
        assert_eq!(value["output"], json!({"y": 2}));

        let parsed: ExecutionEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, event);
    }

    #[test]
    fn event_kind_names() {
        let kind = EventKind::WorkflowError {
            error: "x".into(),
            execution_log: Vec::new(),
        };
        assert_eq!(kind.name(), "workflow_error");
        assert!(kind.is_terminal());
        assert!(kind.node_id().is_none());
    }
}
