//! Workflow definition types.
//!
//! A workflow is a named, versioned graph that consists of:
//! - Metadata (name, description, version, timestamps)
//! - A flat list of nodes
//! - A flat list of edges between those nodes
//!
//! This is the raw, unvalidated form as authored. Execution only ever sees a
//! [`crate::validator::ValidatedWorkflow`].

use crate::edge::Edge;
use crate::node::{Node, NodeId};
use braid_core::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    /// Human-readable name for this workflow.
    pub name: String,
    /// Description of what this workflow does.
    #[serde(default)]
    pub description: Option<String>,
    /// Version of this workflow definition.
    #[serde(default = "default_version")]
    pub version: String,
    /// Tags for organization/filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When this workflow was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl WorkflowMetadata {
    /// Creates new metadata with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A complete workflow definition as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow.
    #[serde(default)]
    pub id: WorkflowId,
    /// Workflow metadata.
    pub metadata: WorkflowMetadata,
    /// Nodes, in authoring order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Edges, in authoring order.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Creates a new, empty workflow with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(WorkflowId::new(), name)
    }

    /// Creates an empty workflow with a specific ID.
    #[must_use]
    pub fn with_id(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            id,
            metadata: WorkflowMetadata::new(name),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Appends a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Finds a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Marks the workflow as updated (bumps updated_at timestamp).
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id,
            name: workflow.metadata.name.clone(),
            description: workflow.metadata.description.clone(),
            tags: workflow.metadata.tags.clone(),
            node_count: workflow.nodes.len(),
            updated_at: workflow.metadata.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_creation() {
        let workflow = Workflow::new("Test Workflow")
            .with_node(Node::new("s", "start"))
            .with_node(Node::new("e", "end"))
            .with_edge(Edge::new("e1", "s", "e"));

        assert_eq!(workflow.name(), "Test Workflow");
        assert_eq!(workflow.nodes.len(), 2);
        assert!(workflow.node(&NodeId::new("e")).is_some());
        assert!(workflow.node(&NodeId::new("missing")).is_none());
    }

    #[test]
    fn metadata_fields_are_optional() {
        let metadata: WorkflowMetadata = serde_json::from_value(json!({
            "name": "tagged",
            "description": "nightly sync",
            "tags": ["daily"]
        }))
        .expect("deserialize");

        assert_eq!(metadata.description.as_deref(), Some("nightly sync"));
        assert_eq!(metadata.version, "0.1.0");
        assert_eq!(metadata.tags, vec!["daily"]);
    }

    #[test]
    fn workflow_summary_from_workflow() {
        let workflow = Workflow::new("Summary Test").with_node(Node::new("s", "start"));
        let summary = WorkflowSummary::from(&workflow);

        assert_eq!(summary.id, workflow.id);
        assert_eq!(summary.name, "Summary Test");
        assert_eq!(summary.node_count, 1);
    }

    #[test]
    fn workflow_parses_minimal_document() {
        let workflow: Workflow = serde_json::from_value(json!({
            "metadata": { "name": "minimal" },
            "nodes": [
                { "id": "s", "type": "start" },
                { "id": "A", "type": "httpRequest", "config": { "url": "https://x" } }
            ],
            "edges": [ { "id": "e1", "source": "s", "target": "A" } ]
        }))
        .expect("deserialize");

        assert_eq!(workflow.metadata.version, "0.1.0");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.edges[0].target.as_str(), "A");
    }
}
