//! Per-run execution context.
//!
//! Owned by one executor invocation. Holds node outputs, the per-node
//! records that make up the execution log, which edges are live or pruned,
//! and the run's cancellation token.

use crate::edge::EdgeId;
use crate::execution::{NodeRecord, NodeState};
use crate::node::NodeId;
use braid_core::RunId;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Resolves a path into a JSON value.
///
/// Paths starting with `/` are JSON pointers; anything else is a dotted
/// path where numeric segments index arrays. The empty path is the value
/// itself.
#[must_use]
pub fn lookup_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    if path.starts_with('/') {
        return value.pointer(path);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Mutable state of a single graph execution.
///
/// States and outputs are keyed by the node's id within its graph; records
/// carry the id as published in events, which is scoped inside loop bodies.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: RunId,
    input: JsonValue,
    outputs: HashMap<NodeId, JsonValue>,
    states: HashMap<NodeId, NodeState>,
    records: Vec<NodeRecord>,
    live_edges: HashSet<EdgeId>,
    pruned_edges: HashSet<EdgeId>,
    first_error: Option<(NodeId, String)>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Creates the context for a run.
    #[must_use]
    pub fn new(run_id: RunId, input: JsonValue, cancellation: CancellationToken) -> Self {
        Self {
            run_id,
            input,
            outputs: HashMap::new(),
            states: HashMap::new(),
            records: Vec::new(),
            live_edges: HashSet::new(),
            pruned_edges: HashSet::new(),
            first_error: None,
            cancellation,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The input entry nodes receive.
    #[must_use]
    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Records a finished node execution.
    ///
    /// The first failure becomes the run error.
    pub fn record(&mut self, node_id: &NodeId, record: NodeRecord) {
        self.states.insert(node_id.clone(), record.state);
        match record.state {
            NodeState::Completed => {
                let output = record.output.clone().unwrap_or(JsonValue::Null);
                self.outputs.insert(node_id.clone(), output);
            }
            NodeState::Failed if self.first_error.is_none() => {
                let error = record.error.clone().unwrap_or_default();
                self.first_error = Some((record.node_id.clone(), error));
            }
            _ => {}
        }
        self.records.push(record);
    }

    /// Completes a structural node. It leaves no record in the execution log.
    pub fn record_passthrough(&mut self, node_id: &NodeId, output: JsonValue) {
        self.states.insert(node_id.clone(), NodeState::Completed);
        self.outputs.insert(node_id.clone(), output);
    }

    /// Records that a node will never run. Skipped nodes leave no record.
    pub fn mark_skipped(&mut self, node_id: &NodeId) {
        self.states.insert(node_id.clone(), NodeState::Skipped);
    }

    /// Returns a node's state; nodes never reached are pending.
    #[must_use]
    pub fn state(&self, node_id: &NodeId) -> NodeState {
        self.states
            .get(node_id)
            .copied()
            .unwrap_or(NodeState::Pending)
    }

    /// Returns true once a node has finished or been skipped.
    #[must_use]
    pub fn is_visited(&self, node_id: &NodeId) -> bool {
        self.states.contains_key(node_id)
    }

    #[must_use]
    pub fn output(&self, node_id: &NodeId) -> Option<&JsonValue> {
        self.outputs.get(node_id)
    }

    /// Marks an edge as taken; its target may receive the source's output.
    pub fn take_edge(&mut self, edge_id: &EdgeId) {
        self.live_edges.insert(edge_id.clone());
    }

    /// Marks an edge as pruned; it never delivers anything.
    pub fn prune_edge(&mut self, edge_id: &EdgeId) {
        self.pruned_edges.insert(edge_id.clone());
    }

    #[must_use]
    pub fn is_live(&self, edge_id: &EdgeId) -> bool {
        self.live_edges.contains(edge_id)
    }

    #[must_use]
    pub fn is_pruned(&self, edge_id: &EdgeId) -> bool {
        self.pruned_edges.contains(edge_id)
    }

    /// Returns the first failed node (as published) and its error.
    #[must_use]
    pub fn first_error(&self) -> Option<(&NodeId, &str)> {
        self.first_error
            .as_ref()
            .map(|(node_id, error)| (node_id, error.as_str()))
    }

    /// Returns the execution log in completion order.
    #[must_use]
    pub fn execution_log(&self) -> &[NodeRecord] {
        &self.records
    }

    /// Appends records produced elsewhere, e.g. by loop iterations.
    pub fn extend_log(&mut self, records: impl IntoIterator<Item = NodeRecord>) {
        self.records.extend(records);
    }

    /// Consumes the context, returning the execution log.
    #[must_use]
    pub fn into_log(self) -> Vec<NodeRecord> {
        self.records
    }
}
