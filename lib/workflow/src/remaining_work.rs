//! Remaining work graph for workflow execution.
//!
//! Execution uses a "remaining work graph" algorithm:
//! - Start with the validated workflow graph
//! - Remove nodes once they are terminal (completed, failed or skipped)
//! - Nodes with 0 incoming edges that are not executing are ready
//! - When nothing is ready and nothing is executing the run is complete
//!
//! Whether a ready node actually runs or is skipped depends on which of its
//! incoming edges are live, which the [`ExecutionContext`](crate::context::ExecutionContext)
//! tracks.

use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// The remaining work graph tracks which nodes still need a verdict.
#[derive(Debug, Clone)]
pub struct RemainingWorkGraph {
    /// Node weights are NodeIds, edge weights are ().
    graph: DiGraph<NodeId, ()>,
    /// Map from NodeId to graph index for O(1) lookup.
    node_to_index: HashMap<NodeId, NodeIndex>,
    /// Nodes that are currently executing.
    executing: HashSet<NodeId>,
}

impl RemainingWorkGraph {
    /// Creates a new remaining work graph from a workflow graph.
    ///
    /// Initially all nodes are pending and included in the graph.
    #[must_use]
    pub fn from_workflow(workflow_graph: &WorkflowGraph) -> Self {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for node in workflow_graph.nodes() {
            let idx = graph.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }

        for edge in workflow_graph.edges() {
            if let (Some(&source), Some(&target)) =
                (node_to_index.get(&edge.source), node_to_index.get(&edge.target))
            {
                graph.add_edge(source, target, ());
            }
        }

        Self {
            graph,
            node_to_index,
            executing: HashSet::new(),
        }
    }

    /// Marks a node as currently executing.
    ///
    /// The node must still be in the remaining work graph.
    pub fn mark_executing(&mut self, node_id: &NodeId) {
        if self.node_to_index.contains_key(node_id) {
            self.executing.insert(node_id.clone());
        }
    }

    /// Marks a node as terminal and removes it from the graph.
    ///
    /// This unblocks downstream nodes that were waiting for this node.
    pub fn mark_finished(&mut self, node_id: &NodeId) {
        self.executing.remove(node_id);
        if let Some(idx) = self.node_to_index.remove(node_id) {
            self.graph.remove_node(idx);
            // Removal swaps the last index into the hole
            self.rebuild_index_map();
        }
    }

    /// Returns nodes that are ready to execute (have no pending predecessors).
    ///
    /// A node is ready when:
    /// - It has 0 incoming edges in the remaining work graph
    /// - It is not already executing
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).count() == 0)
            .filter_map(|idx| {
                let node_id = self.graph.node_weight(idx)?;
                if self.executing.contains(node_id) {
                    return None;
                }
                Some(node_id.clone())
            })
            .collect()
    }

    /// Returns true if nothing is left to run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.executing.is_empty() && self.ready_nodes().is_empty()
    }

    /// Returns the set of nodes currently executing.
    #[must_use]
    pub fn executing_nodes(&self) -> &HashSet<NodeId> {
        &self.executing
    }

    /// Returns the number of nodes remaining in the graph.
    ///
    /// This includes executing nodes.
    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the given node is still in the remaining work graph.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_to_index.contains_key(node_id)
    }

    /// Rebuilds the node-to-index map after graph modifications.
    fn rebuild_index_map(&mut self) {
        self.node_to_index.clear();
        for idx in self.graph.node_indices() {
            if let Some(node_id) = self.graph.node_weight(idx) {
                self.node_to_index.insert(node_id.clone(), idx);
            }
        }
    }
}
