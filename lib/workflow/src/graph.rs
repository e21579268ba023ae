//! Workflow graph implementation using petgraph.
//!
//! The authored [`Workflow`](crate::definition::Workflow) keeps nodes and edges
//! in flat vectors keyed by id. This graph is the traversal index built from
//! them: a `DiGraph` carrying the node and edge values plus an id lookup map.
//!
//! Every edge goes through [`WorkflowGraph::add_edge`], which refuses edges
//! that would close a cycle, so a `WorkflowGraph` is always acyclic.

use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{Node, NodeId};
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use std::collections::{HashMap, HashSet};

/// An acyclic workflow graph using petgraph's directed graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same id is already present.
    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.node_index_map.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { node_id: node.id });
        }
        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(())
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns true if the node is in the graph.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    /// Adds an edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Source or target node doesn't exist
    /// - The edge is a self-loop
    /// - The target can already reach the source, so the edge would close a cycle
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        let source_index = *self
            .node_index_map
            .get(&edge.source)
            .ok_or_else(|| GraphError::NodeNotFound {
                node_id: edge.source.clone(),
            })?;

        let target_index = *self
            .node_index_map
            .get(&edge.target)
            .ok_or_else(|| GraphError::NodeNotFound {
                node_id: edge.target.clone(),
            })?;

        if source_index == target_index {
            return Err(GraphError::SelfLoop {
                node_id: edge.source,
            });
        }

        if has_path_connecting(&self.graph, target_index, source_index, None) {
            return Err(GraphError::CycleDetected {
                source: edge.source,
                target: edge.target,
            });
        }

        self.graph.add_edge(source_index, target_index, edge);
        Ok(())
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns all edges in the graph.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns nodes that have no incoming edges.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns nodes that have no outgoing edges (sinks).
    pub fn terminal_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Outgoing).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns the successors (downstream nodes) of a given node.
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| {
                let target = self.graph.node_weight(edge.target())?;
                Some((target, edge.weight()))
            })
            .collect()
    }

    /// Returns the predecessors (upstream nodes) of a given node.
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter_map(|edge| {
                let source = self.graph.node_weight(edge.source())?;
                Some((source, edge.weight()))
            })
            .collect()
    }

    /// Returns the number of incoming edges of a node.
    #[must_use]
    pub fn in_degree(&self, node_id: &NodeId) -> usize {
        self.node_index_map.get(node_id).map_or(0, |&index| {
            self.graph.edges_directed(index, Direction::Incoming).count()
        })
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the set of nodes reachable from `roots` over the given edges,
/// roots included.
///
/// Works on raw edge lists, so it can be used before a graph has been
/// checked for cycles or dangling references.
#[must_use]
pub fn reachable_from<'a>(
    roots: impl IntoIterator<Item = &'a NodeId>,
    edges: impl IntoIterator<Item = &'a Edge>,
) -> HashSet<NodeId> {
    let mut graph: DiGraph<&NodeId, ()> = DiGraph::new();
    let mut indices: HashMap<&NodeId, NodeIndex> = HashMap::new();
    let mut index_of = |graph: &mut DiGraph<&'a NodeId, ()>, id: &'a NodeId| {
        *indices.entry(id).or_insert_with(|| graph.add_node(id))
    };

    let roots: Vec<NodeIndex> = roots
        .into_iter()
        .map(|id| index_of(&mut graph, id))
        .collect();
    for edge in edges {
        let source = index_of(&mut graph, &edge.source);
        let target = index_of(&mut graph, &edge.target);
        graph.add_edge(source, target, ());
    }

    let mut reachable = HashSet::new();
    for root in roots {
        if reachable.contains(graph[root]) {
            continue;
        }
        let mut bfs = Bfs::new(&graph, root);
        while let Some(index) = bfs.next(&graph) {
            reachable.insert(graph[index].clone());
        }
    }
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(ids: &[&str]) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for id in ids {
            graph.add_node(Node::new(*id, "task")).expect("add node");
        }
        graph
    }

    #[test]
    fn empty_graph() {
        let graph = WorkflowGraph::new();
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn add_edge_between_nodes() {
        let mut graph = graph_with(&["A", "B"]);
        graph.add_edge(Edge::new("e1", "A", "B")).expect("add edge");

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.successors(&NodeId::new("A")).len(), 1);
        assert_eq!(graph.predecessors(&NodeId::new("B")).len(), 1);
        assert_eq!(graph.in_degree(&NodeId::new("B")), 1);
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut graph = graph_with(&["A"]);
        let result = graph.add_node(Node::new("A", "task"));
        assert!(matches!(result, Err(GraphError::DuplicateNode { .. })));
    }

    #[test]
    fn missing_node_rejected() {
        let mut graph = graph_with(&["A"]);
        let result = graph.add_edge(Edge::new("e1", "A", "ghost"));
        match result {
            Err(GraphError::NodeNotFound { node_id }) => assert_eq!(node_id.as_str(), "ghost"),
            other => panic!("expected NodeNotFound, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_rejected() {
        let mut graph = graph_with(&["A"]);
        let result = graph.add_edge(Edge::new("e1", "A", "A"));
        assert!(matches!(result, Err(GraphError::SelfLoop { .. })));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn cycle_rejected() {
        let mut graph = graph_with(&["A", "B", "C"]);
        graph.add_edge(Edge::new("e1", "A", "B")).expect("A->B");
        graph.add_edge(Edge::new("e2", "B", "C")).expect("B->C");

        let result = graph.add_edge(Edge::new("e3", "C", "A"));
        assert!(matches!(result, Err(GraphError::CycleDetected { .. })));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = graph_with(&["A", "B", "C", "D"]);
        graph.add_edge(Edge::new("e1", "A", "B")).expect("A->B");
        graph.add_edge(Edge::new("e2", "A", "C")).expect("A->C");
        graph.add_edge(Edge::new("e3", "B", "D")).expect("B->D");
        graph.add_edge(Edge::new("e4", "C", "D")).expect("C->D");

        assert_eq!(graph.entry_nodes().len(), 1);
        assert_eq!(graph.terminal_nodes().len(), 1);
    }

    #[test]
    fn reachability_over_raw_edges() {
        let edges = vec![
            Edge::new("e1", "s", "A"),
            Edge::new("e2", "A", "B"),
            Edge::new("e3", "X", "Y"),
            Edge::new("e4", "Y", "X"),
        ];
        let roots = [NodeId::new("s")];
        let reachable = reachable_from(&roots, &edges);

        assert!(reachable.contains(&NodeId::new("s")));
        assert!(reachable.contains(&NodeId::new("B")));
        assert!(!reachable.contains(&NodeId::new("X")));
    }
}
