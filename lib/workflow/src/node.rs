//! Workflow node types.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An id, unique within its workflow
//! - A type naming an entry in the capability registry
//! - Type-specific configuration, interpreted by the registry's contract and adapter
//! - A presentation-only position

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Identifier of a node within a workflow.
///
/// Node ids are chosen by whoever authors the graph, so they are plain
/// strings rather than generated ULIDs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an id scoped under a parent, e.g. a loop body node.
    #[must_use]
    pub fn scoped(&self, scope: &str) -> Self {
        Self(format!("{scope}/{}", self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The type of a node, e.g. `httpRequest` or `conditional`.
///
/// The set of types is open: anything registered in the capability registry
/// is a valid type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeType(String);

impl NodeType {
    /// Creates a node type from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Canvas position of a node. Never consulted during execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// Registry type of this node.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type-specific parameters.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
    /// Presentation-only canvas position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Node {
    /// Creates a node with an empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<NodeType>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: Map::new(),
            position: None,
        }
    }

    /// Sets a configuration value.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Returns a configuration value, treating JSON `null` as absent.
    #[must_use]
    pub fn config_value(&self, key: &str) -> Option<&JsonValue> {
        self.config.get(key).filter(|value| !value.is_null())
    }

    /// Returns a configuration value as a string, if it is one.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_value(key).and_then(JsonValue::as_str)
    }
}
