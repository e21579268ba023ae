//! Edge types for workflow graphs.
//!
//! Edges connect a source node to a target node. Each edge specifies:
//! - Its own id, unique within the workflow
//! - An optional source handle selecting one branch output of a branching node
//! - Optional label and condition annotations, which execution ignores

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an edge within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    /// Creates an edge id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EdgeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An edge connecting two nodes in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Unique identifier for this edge within the workflow.
    pub id: EdgeId,
    /// The node this edge leaves.
    pub source: NodeId,
    /// The node this edge enters.
    pub target: NodeId,
    /// Branch output of the source node this edge is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Display-only condition text. The executable condition lives in the
    /// source node's configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    /// Creates a new edge between two nodes.
    #[must_use]
    pub fn new(id: impl Into<EdgeId>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            label: None,
            condition: None,
        }
    }

    /// Attaches the edge to a branch output of its source node.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Sets the display label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns true if the edge connects a node to itself.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edge_with_handle() {
        let edge = Edge::new("e1", "cond", "yes").with_handle("true");
        assert_eq!(edge.source_handle.as_deref(), Some("true"));
        assert!(!edge.is_self_loop());
    }

    #[test]
    fn self_loop_detection() {
        assert!(Edge::new("e1", "A", "A").is_self_loop());
    }

    #[test]
    fn edge_uses_camel_case_fields() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "source": "cond",
            "target": "B",
            "sourceHandle": "false",
            "label": "otherwise"
        }))
        .expect("deserialize");

        assert_eq!(edge.source_handle.as_deref(), Some("false"));
        assert_eq!(edge.label.as_deref(), Some("otherwise"));

        let value = serde_json::to_value(&edge).expect("serialize");
        assert_eq!(value["sourceHandle"], "false");
        assert!(value.get("condition").is_none());
    }
}
