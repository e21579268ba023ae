//! Workflow execution core for braid.
//!
//! This crate validates workflow graphs and executes them, including:
//!
//! - **Graph Model**: Directed graphs using petgraph with typed nodes and edges
//! - **Validation**: Structural and per-node-type checks, all reported at once
//! - **Execution**: Concurrent DAG execution with conditional branches, loops
//!   and human confirmation of gated nodes
//! - **Events**: Per-run append-only event logs with live streaming and
//!   paginated replay
//! - **Runs**: Concurrent runs with batch waiting and cooperative cancellation

pub mod config;
pub mod confirmation;
pub mod context;
pub mod controller;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod node;
pub mod registry;
pub mod remaining_work;
pub mod replay;
pub mod store;
pub mod validator;

pub use config::EngineConfig;
pub use confirmation::{ConfirmationError, ConfirmationGate, ConfirmationRequest, Decision};
pub use context::{ExecutionContext, lookup_path};
pub use controller::{ConcurrencyController, ControllerError, WaitOutcome};
pub use definition::{Workflow, WorkflowMetadata, WorkflowSummary};
pub use edge::{Edge, EdgeId};
pub use engine::{Engine, EngineError};
pub use error::{GraphError, NodeExecutionError};
pub use event_log::{EventLog, EventLogError, EventStream, LogSlice};
pub use execution::{
    EventKind, ExecutionEvent, NodeRecord, NodeState, RunOutcome, RunStatus, WorkflowRun,
};
pub use executor::DagExecutor;
pub use graph::WorkflowGraph;
pub use node::{Node, NodeId, NodeType, Position};
pub use registry::{
    CapabilityRegistry, EchoAdapter, NodeAdapter, NodeContract, NodeInvocation, NodeKind,
    adapter_fn, standard_contract,
};
pub use remaining_work::RemainingWorkGraph;
pub use replay::{Cursor, ReplayError, ReplayPage, ReplayService};
pub use store::{InMemoryWorkflowStore, StoreError, WorkflowStore};
pub use validator::{
    GraphValidator, ValidatedWorkflow, ValidationReport, Violation, ViolationKind,
};
