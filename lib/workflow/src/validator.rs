//! Graph validation.
//!
//! The validator turns an authored [`Workflow`] into a [`ValidatedWorkflow`],
//! or reports every problem it finds at once. Executors only accept the
//! validated form, so a partially valid graph can never start.
//!
//! Structural checks (duplicate ids, dangling edges, self-loops) cover the
//! whole workflow. Cycle and per-type contract checks cover only the part
//! reachable from the entry nodes: anything else never executes.

use crate::definition::{Workflow, WorkflowMetadata};
use crate::edge::{Edge, EdgeId};
use crate::error::GraphError;
use crate::graph::{WorkflowGraph, reachable_from};
use crate::node::{Node, NodeId};
use crate::registry::{CapabilityRegistry, NodeContract, NodeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Category of a validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DuplicateNodeId,
    DuplicateEdgeId,
    DanglingEdge,
    SelfLoop,
    Cycle,
    NoEntryNode,
    UnknownNodeType,
    MissingRequiredField,
    InvalidEnumValue,
    ConditionalFieldMissing,
    MissingConfigOrInput,
    AmbiguousSource,
    InvalidSelector,
    InvalidLoopBody,
}

impl ViolationKind {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateNodeId => "duplicate_node_id",
            Self::DuplicateEdgeId => "duplicate_edge_id",
            Self::DanglingEdge => "dangling_edge",
            Self::SelfLoop => "self_loop",
            Self::Cycle => "cycle",
            Self::NoEntryNode => "no_entry_node",
            Self::UnknownNodeType => "unknown_node_type",
            Self::MissingRequiredField => "missing_required_field",
            Self::InvalidEnumValue => "invalid_enum_value",
            Self::ConditionalFieldMissing => "conditional_field_missing",
            Self::MissingConfigOrInput => "missing_config_or_input",
            Self::AmbiguousSource => "ambiguous_source",
            Self::InvalidSelector => "invalid_selector",
            Self::InvalidLoopBody => "invalid_loop_body",
        }
    }
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<EdgeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl Violation {
    fn node(kind: ViolationKind, node_id: &NodeId, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id.clone()),
            edge_id: None,
            field: None,
            message: message.into(),
        }
    }

    fn field(kind: ViolationKind, node_id: &NodeId, field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            ..Self::node(kind, node_id, message)
        }
    }

    fn edge(kind: ViolationKind, edge: &Edge, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(edge.source.clone()),
            edge_id: Some(edge.id.clone()),
            field: None,
            message: message.into(),
        }
    }

    fn scoped(mut self, scope: &NodeId) -> Self {
        self.node_id = Some(match self.node_id {
            Some(node_id) => node_id.scoped(scope.as_str()),
            None => scope.clone(),
        });
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind.code())?;
        if let Some(node_id) = &self.node_id {
            write!(f, " node {node_id}")?;
        }
        if let Some(edge_id) = &self.edge_id {
            write!(f, " edge {edge_id}")?;
        }
        if let Some(field) = &self.field {
            write!(f, " field {field}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Every violation found in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Returns true if any violation has the given kind.
    #[must_use]
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// Returns the violations of one kind.
    pub fn of_kind(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow has {} violation(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

/// Sub-workflow run by a loop node, as found in `config.body`.
#[derive(Debug, Clone, Deserialize)]
struct LoopBody {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug)]
struct ValidatedInner {
    workflow: Workflow,
    graph: WorkflowGraph,
    entries: Vec<NodeId>,
    contracts: HashMap<NodeId, NodeContract>,
    loop_bodies: HashMap<NodeId, ValidatedWorkflow>,
}

/// A frozen workflow snapshot that passed validation.
///
/// Only [`GraphValidator::validate`] creates these. Cloning shares the
/// snapshot.
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    inner: Arc<ValidatedInner>,
}

impl ValidatedWorkflow {
    /// The workflow as authored.
    #[must_use]
    pub fn workflow(&self) -> &Workflow {
        &self.inner.workflow
    }

    /// The executable graph: reachable nodes and the edges between them.
    #[must_use]
    pub fn graph(&self) -> &WorkflowGraph {
        &self.inner.graph
    }

    /// Nodes that receive the run input.
    #[must_use]
    pub fn entry_nodes(&self) -> &[NodeId] {
        &self.inner.entries
    }

    #[must_use]
    pub fn is_entry(&self, node_id: &NodeId) -> bool {
        self.inner.entries.contains(node_id)
    }

    /// The contract a node was validated against.
    #[must_use]
    pub fn contract(&self, node_id: &NodeId) -> Option<&NodeContract> {
        self.inner.contracts.get(node_id)
    }

    /// The validated body of a loop node.
    #[must_use]
    pub fn loop_body(&self, node_id: &NodeId) -> Option<&ValidatedWorkflow> {
        self.inner.loop_bodies.get(node_id)
    }
}

/// Validates workflows against a capability registry.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    registry: Arc<CapabilityRegistry>,
}

impl GraphValidator {
    #[must_use]
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Validates a workflow.
    ///
    /// # Errors
    ///
    /// Returns a report listing every violation if there is at least one.
    pub fn validate(&self, workflow: Workflow) -> Result<ValidatedWorkflow, ValidationReport> {
        let mut violations = Vec::new();
        let validated = self.validate_into(workflow, &mut violations);
        debug!(violations = violations.len(), "validated workflow");
        if violations.is_empty() {
            Ok(validated)
        } else {
            Err(ValidationReport { violations })
        }
    }

    fn validate_into(&self, workflow: Workflow, violations: &mut Vec<Violation>) -> ValidatedWorkflow {
        // Structural checks over the whole workflow.
        let mut nodes: HashMap<&NodeId, &Node> = HashMap::new();
        for node in &workflow.nodes {
            match nodes.entry(&node.id) {
                Entry::Occupied(_) => violations.push(Violation::node(
                    ViolationKind::DuplicateNodeId,
                    &node.id,
                    "node id is used more than once",
                )),
                Entry::Vacant(slot) => {
                    slot.insert(node);
                }
            }
        }

        let mut edge_ids = HashSet::new();
        let mut candidates = Vec::new();
        for edge in &workflow.edges {
            if !edge_ids.insert(&edge.id) {
                violations.push(Violation::edge(
                    ViolationKind::DuplicateEdgeId,
                    edge,
                    "edge id is used more than once",
                ));
                continue;
            }
            let missing: Vec<&NodeId> = [&edge.source, &edge.target]
                .into_iter()
                .filter(|id| !nodes.contains_key(id))
                .collect();
            if !missing.is_empty() {
                let names: Vec<&str> = missing.iter().map(|id| id.as_str()).collect();
                violations.push(Violation::edge(
                    ViolationKind::DanglingEdge,
                    edge,
                    format!("edge references unknown node(s): {}", names.join(", ")),
                ));
                continue;
            }
            if edge.is_self_loop() {
                violations.push(Violation::edge(
                    ViolationKind::SelfLoop,
                    edge,
                    "edge connects a node to itself",
                ));
                continue;
            }
            candidates.push(edge);
        }

        // Entry nodes: explicit start nodes, else nodes nothing points at.
        let first_nodes: Vec<&Node> = workflow
            .nodes
            .iter()
            .filter(|node| nodes.get(&node.id).is_some_and(|first| std::ptr::eq(*first, *node)))
            .collect();
        let mut entries: Vec<NodeId> = first_nodes
            .iter()
            .filter(|node| self.kind_of(node) == Some(NodeKind::Start))
            .map(|node| node.id.clone())
            .collect();
        if entries.is_empty() {
            let targets: HashSet<&NodeId> = candidates.iter().map(|edge| &edge.target).collect();
            entries = first_nodes
                .iter()
                .filter(|node| !targets.contains(&node.id))
                .map(|node| node.id.clone())
                .collect();
        }
        if entries.is_empty() && !first_nodes.is_empty() {
            violations.push(Violation {
                kind: ViolationKind::NoEntryNode,
                node_id: None,
                edge_id: None,
                field: None,
                message: "workflow has no start node and every node has an incoming edge"
                    .to_string(),
            });
        }

        let reachable = reachable_from(&entries, candidates.iter().copied());

        // Executable graph over the reachable part. add_edge rejects cycles.
        let mut graph = WorkflowGraph::new();
        for node in first_nodes.iter().filter(|node| reachable.contains(&node.id)) {
            // Ids are unique here, so this cannot fail.
            let _ = graph.add_node((*node).clone());
        }
        for edge in candidates.iter().filter(|edge| reachable.contains(&edge.source)) {
            match graph.add_edge((*edge).clone()) {
                Ok(()) => {}
                Err(GraphError::CycleDetected { source, target }) => {
                    violations.push(Violation::edge(
                        ViolationKind::Cycle,
                        edge,
                        format!("edge {source} -> {target} closes a cycle"),
                    ));
                }
                Err(err) => violations.push(Violation::edge(
                    ViolationKind::DanglingEdge,
                    edge,
                    err.to_string(),
                )),
            }
        }

        // Per-type contracts over the reachable part.
        let mut contracts = HashMap::new();
        let mut loop_bodies = HashMap::new();
        for node in graph.nodes() {
            let Some(contract) = self.registry.contract(&node.node_type) else {
                violations.push(Violation::node(
                    ViolationKind::UnknownNodeType,
                    &node.id,
                    format!("unknown node type: {}", node.node_type),
                ));
                continue;
            };
            check_contract(node, contract, &graph, violations);

            if contract.kind == NodeKind::Loop
                && let Some(body) = self.validate_loop_body(&workflow, node, violations)
            {
                loop_bodies.insert(node.id.clone(), body);
            }
            contracts.insert(node.id.clone(), contract.clone());
        }

        ValidatedWorkflow {
            inner: Arc::new(ValidatedInner {
                workflow,
                graph,
                entries,
                contracts,
                loop_bodies,
            }),
        }
    }

    fn kind_of(&self, node: &Node) -> Option<NodeKind> {
        self.registry.contract(&node.node_type).map(|c| c.kind)
    }

    fn validate_loop_body(
        &self,
        parent: &Workflow,
        node: &Node,
        violations: &mut Vec<Violation>,
    ) -> Option<ValidatedWorkflow> {
        let raw = node.config_value("body")?;
        let body: LoopBody = match serde_json::from_value(raw.clone()) {
            Ok(body) => body,
            Err(err) => {
                violations.push(Violation::field(
                    ViolationKind::InvalidLoopBody,
                    &node.id,
                    "body",
                    format!("body must be an object with nodes and edges: {err}"),
                ));
                return None;
            }
        };
        if body.nodes.is_empty() {
            violations.push(Violation::field(
                ViolationKind::InvalidLoopBody,
                &node.id,
                "body",
                "loop body has no nodes",
            ));
            return None;
        }

        let sub = Workflow {
            id: parent.id,
            metadata: WorkflowMetadata::new(format!("{}/{}", parent.name(), node.id)),
            nodes: body.nodes,
            edges: body.edges,
        };
        let mut nested = Vec::new();
        let validated = self.validate_into(sub, &mut nested);
        violations.extend(nested.into_iter().map(|v| v.scoped(&node.id)));
        Some(validated)
    }
}

fn is_present(node: &Node, field: &str) -> bool {
    match node.config_value(field) {
        None => false,
        Some(JsonValue::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn check_contract(
    node: &Node,
    contract: &NodeContract,
    graph: &WorkflowGraph,
    violations: &mut Vec<Violation>,
) {
    for field in &contract.required {
        if !is_present(node, field) {
            violations.push(Violation::field(
                ViolationKind::MissingRequiredField,
                &node.id,
                field,
                format!("{} requires {field}", node.node_type),
            ));
        }
    }

    for (field, allowed) in &contract.enums {
        let Some(value) = node.config_value(field) else {
            continue;
        };
        let valid = value.as_str().is_some_and(|s| allowed.iter().any(|a| a == s));
        if !valid {
            violations.push(Violation::field(
                ViolationKind::InvalidEnumValue,
                &node.id,
                field,
                format!("{field} must be one of: {}", allowed.join(", ")),
            ));
        }
    }

    for rule in &contract.conditional {
        if node.config_str(&rule.when_field) != Some(rule.equals.as_str()) {
            continue;
        }
        for field in &rule.require {
            if !is_present(node, field) {
                violations.push(Violation::field(
                    ViolationKind::ConditionalFieldMissing,
                    &node.id,
                    field,
                    format!("{field} is required when {} is {}", rule.when_field, rule.equals),
                ));
            }
        }
    }

    let in_degree = graph.in_degree(&node.id);
    for field in &contract.config_or_input {
        if in_degree == 0 && !is_present(node, field) {
            violations.push(Violation::field(
                ViolationKind::MissingConfigOrInput,
                &node.id,
                field,
                format!("{field} must be configured or supplied by an incoming edge"),
            ));
        }
    }

    if let Some(selector) = &contract.single_input
        && in_degree > 1
    {
        match node.config_str(selector) {
            None => violations.push(Violation::field(
                ViolationKind::AmbiguousSource,
                &node.id,
                selector,
                format!("{in_degree} incoming edges; {selector} must name the upstream node"),
            )),
            Some(source) => {
                let is_predecessor = graph
                    .predecessors(&node.id)
                    .iter()
                    .any(|(pred, _)| pred.id.as_str() == source);
                if !is_predecessor {
                    violations.push(Violation::field(
                        ViolationKind::InvalidSelector,
                        &node.id,
                        selector,
                        format!("{source} is not a direct upstream node"),
                    ));
                }
            }
        }
    }
}
