//! Loading workflow files and building a registry for them.

use braid_workflow::{CapabilityRegistry, EchoAdapter, NodeContract, Workflow, standard_contract};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors from reading a workflow file.
#[derive(Debug)]
pub enum WorkflowFileError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl fmt::Display for WorkflowFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for WorkflowFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

/// Reads a workflow definition from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a workflow.
pub fn load_workflow(path: &Path) -> Result<Workflow, WorkflowFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| WorkflowFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| WorkflowFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds a registry covering every node type the workflow uses.
///
/// Structural types come from the builtins. Standard integration types get
/// their declarative contract; anything else is an unconstrained task. All
/// of them echo their input, since the runner has no real integrations.
#[must_use]
pub fn build_registry(workflow: &Workflow) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::with_builtins();
    for node_type in node_types(workflow) {
        if registry.contains(&node_type.as_str().into()) {
            continue;
        }
        let contract = standard_contract(&node_type).unwrap_or_else(NodeContract::task);
        registry.register(node_type.as_str(), contract, Arc::new(EchoAdapter));
    }
    registry
}

/// Node types used by the workflow, including inside loop bodies.
fn node_types(workflow: &Workflow) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    for node in &workflow.nodes {
        types.insert(node.node_type.to_string());
        if let Some(body) = node.config_value("body") {
            collect_body_types(body, &mut types);
        }
    }
    types
}

fn collect_body_types(body: &JsonValue, types: &mut BTreeSet<String>) {
    let Some(nodes) = body.get("nodes").and_then(JsonValue::as_array) else {
        return;
    };
    for node in nodes {
        if let Some(node_type) = node.get("type").and_then(JsonValue::as_str) {
            types.insert(node_type.to_string());
        }
        if let Some(inner) = node.get("config").and_then(|config| config.get("body")) {
            collect_body_types(inner, types);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_workflow::{NodeKind, NodeType};
    use serde_json::json;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn loads_workflow_file() {
        let file = write_temp(
            &json!({
                "metadata": {"name": "demo"},
                "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "fetch", "type": "httpRequest", "config": {"url": "https://example.com"}}
                ],
                "edges": [{"id": "e1", "source": "start", "target": "fetch"}]
            })
            .to_string(),
        );

        let workflow = load_workflow(file.path()).expect("load");
        assert_eq!(workflow.name(), "demo");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.edges.len(), 1);
    }

    #[test]
    fn reports_unreadable_and_malformed_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_workflow(&missing),
            Err(WorkflowFileError::Read { .. })
        ));

        let file = write_temp("{ not json");
        let err = load_workflow(file.path()).expect_err("malformed");
        assert!(matches!(err, WorkflowFileError::Parse { .. }));
        assert!(err.to_string().starts_with("failed to parse"));
    }

    #[test]
    fn registry_covers_loop_bodies() {
        let workflow: Workflow = serde_json::from_value(json!({
            "metadata": {"name": "nested"},
            "nodes": [
                {"id": "each", "type": "loop", "config": {"body": {
                    "nodes": [{"id": "call", "type": "tool", "config": {"toolName": "x"}},
                              {"id": "custom", "type": "summarize"}],
                    "edges": []
                }}}
            ]
        }))
        .expect("workflow");

        let registry = build_registry(&workflow);
        let tool = registry.contract(&NodeType::new("tool")).expect("tool");
        assert!(tool.requires_confirmation);
        let custom = registry.contract(&NodeType::new("summarize")).expect("custom");
        assert_eq!(custom.kind, NodeKind::Task);
        let looped = registry.contract(&NodeType::new("loop")).expect("loop");
        assert_eq!(looped.kind, NodeKind::Loop);
    }
}
