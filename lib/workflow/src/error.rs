//! Error types shared across the workflow crate.
//!
//! - `GraphError`: structural graph operations (nodes, edges, cycles)
//! - `NodeExecutionError`: a single node's adapter call, captured per node
//!
//! Component-level errors (event log, confirmation gate, controller, replay,
//! engine) live next to the component that raises them.

use crate::node::{NodeId, NodeType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors from graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// A node with the same ID is already in the graph.
    DuplicateNode { node_id: NodeId },
    /// The edge connects a node to itself.
    SelfLoop { node_id: NodeId },
    /// Adding the edge would close a cycle.
    CycleDetected { source: NodeId, target: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::SelfLoop { node_id } => write!(f, "edge from {node_id} to itself"),
            Self::CycleDetected { source, target } => {
                write!(f, "edge {source} -> {target} would create a cycle")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from executing a single node.
///
/// These never abort the run on their own; the executor records them as the
/// node's `node_error` and skips everything that depends solely on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeExecutionError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// No adapter is registered for the node type.
    UnsupportedNodeType { node_type: NodeType },
    /// External service error.
    ExternalServiceError { service: String, message: String },
    /// The adapter did not finish in time.
    Timeout {
        #[serde(with = "duration_secs")]
        after: Duration,
    },
    /// A confirmation request was denied or expired.
    Denied,
    /// A loop body iteration failed.
    IterationFailed {
        index: usize,
        node_id: NodeId,
        message: String,
    },
}

impl NodeExecutionError {
    /// Shorthand for [`NodeExecutionError::ExecutionFailed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Shorthand for [`NodeExecutionError::InvalidInput`].
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::UnsupportedNodeType { node_type } => {
                write!(f, "unsupported node type: {node_type}")
            }
            Self::ExternalServiceError { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Timeout { after } => {
                write!(f, "execution timed out after {}s", after.as_secs_f64())
            }
            Self::Denied => write!(f, "denied"),
            Self::IterationFailed {
                index,
                node_id,
                message,
            } => write!(f, "iteration {index} failed at {node_id}: {message}"),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::NodeNotFound {
            node_id: NodeId::new("A"),
        };
        assert_eq!(err.to_string(), "node not found: A");
    }

    #[test]
    fn cycle_error_names_both_ends() {
        let err = GraphError::CycleDetected {
            source: NodeId::new("B"),
            target: NodeId::new("A"),
        };
        assert!(err.to_string().contains("B -> A"));
    }

    #[test]
    fn denied_displays_reason() {
        assert_eq!(NodeExecutionError::Denied.to_string(), "denied");
    }

    #[test]
    fn timeout_serializes_seconds() {
        let err = NodeExecutionError::Timeout {
            after: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["after"], 1.5);
    }
}
