//! Capability registry: node type to contract and adapter.
//!
//! The registry is the only place that knows what a node type means. The
//! validator evaluates a type's [`NodeContract`] generically and the executor
//! dispatches on the contract's [`NodeKind`] and flags, then hands task nodes
//! to the registered [`NodeAdapter`].

use crate::context::lookup_path;
use crate::error::NodeExecutionError;
use crate::node::{NodeId, NodeType};
use async_trait::async_trait;
use braid_core::RunId;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How the executor treats nodes of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Invokes the adapter once.
    Task,
    /// Entry point. Passes the run input through without events.
    Start,
    /// Exit point. Its input becomes the run result.
    End,
    /// Invokes the adapter, then follows only the edges whose source handle
    /// matches the selected branch.
    Conditional,
    /// Runs the sub-workflow in `config.body` once per item.
    Loop,
}

impl NodeKind {
    /// Returns true for kinds that never invoke an adapter or emit events.
    #[must_use]
    pub fn is_structural(self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

/// A field that becomes required when another field has a given value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalRequirement {
    pub when_field: String,
    pub equals: String,
    pub require: Vec<String>,
}

/// Declarative validation and dispatch contract of a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContract {
    pub kind: NodeKind,
    /// Config keys that must be present and non-null.
    pub required: Vec<String>,
    /// Config keys whose value, when present, must be one of the listed strings.
    pub enums: Vec<(String, Vec<String>)>,
    pub conditional: Vec<ConditionalRequirement>,
    /// Config keys that may be omitted when the node has an incoming edge.
    pub config_or_input: Vec<String>,
    /// Selector config key for types that accept exactly one upstream value.
    pub single_input: Option<String>,
    /// Whether each execution must be confirmed first.
    pub requires_confirmation: bool,
}

impl NodeContract {
    /// Creates an unconstrained contract of the given kind.
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            required: Vec::new(),
            enums: Vec::new(),
            conditional: Vec::new(),
            config_or_input: Vec::new(),
            single_input: None,
            requires_confirmation: false,
        }
    }

    /// Creates an unconstrained task contract.
    #[must_use]
    pub fn task() -> Self {
        Self::new(NodeKind::Task)
    }

    /// Requires a config key.
    #[must_use]
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Restricts a config key to a set of string values.
    #[must_use]
    pub fn one_of<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enums
            .push((field.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Requires `require` when `when_field` equals `equals`.
    #[must_use]
    pub fn require_when<I, S>(
        mut self,
        when_field: impl Into<String>,
        equals: impl Into<String>,
        require: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditional.push(ConditionalRequirement {
            when_field: when_field.into(),
            equals: equals.into(),
            require: require.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Requires a config key unless the node has an incoming edge.
    #[must_use]
    pub fn config_or_input(mut self, field: impl Into<String>) -> Self {
        self.config_or_input.push(field.into());
        self
    }

    /// Marks the type as single-input, naming the selector config key used
    /// when several edges enter the node.
    #[must_use]
    pub fn single_input(mut self, selector_field: impl Into<String>) -> Self {
        self.single_input = Some(selector_field.into());
        self
    }

    /// Marks every execution of this type as gated on confirmation.
    #[must_use]
    pub fn requires_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

/// Everything an adapter gets for a single node execution.
#[derive(Debug, Clone)]
pub struct NodeInvocation {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub config: Map<String, JsonValue>,
    /// Effective input assembled from the node's live incoming edges.
    pub input: JsonValue,
    /// Cancelled when the run is cancelled.
    pub cancellation: CancellationToken,
}

/// Trait for node execution.
///
/// Implementations carry the business logic of a node type (HTTP call, model
/// call, database query). The executor owns everything else.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    /// Executes a node, returning its output as JSON.
    async fn execute(&self, invocation: NodeInvocation) -> Result<JsonValue, NodeExecutionError>;
}

struct FnAdapter<F>(F);

#[async_trait]
impl<F, Fut> NodeAdapter for FnAdapter<F>
where
    F: Fn(NodeInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, NodeExecutionError>> + Send + 'static,
{
    async fn execute(&self, invocation: NodeInvocation) -> Result<JsonValue, NodeExecutionError> {
        (self.0)(invocation).await
    }
}

/// Wraps an async closure as an adapter.
pub fn adapter_fn<F, Fut>(f: F) -> Arc<dyn NodeAdapter>
where
    F: Fn(NodeInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, NodeExecutionError>> + Send + 'static,
{
    Arc::new(FnAdapter(f))
}

/// Adapter that returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAdapter;

#[async_trait]
impl NodeAdapter for EchoAdapter {
    async fn execute(&self, invocation: NodeInvocation) -> Result<JsonValue, NodeExecutionError> {
        Ok(invocation.input)
    }
}

/// Reference adapter for `conditional` nodes.
///
/// Reads `config.field` (a JSON pointer or dotted path) from the input, or
/// the whole input when absent. With `config.equals` the result is whether
/// the value equals it; otherwise its truthiness.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalAdapter;

#[async_trait]
impl NodeAdapter for ConditionalAdapter {
    async fn execute(&self, invocation: NodeInvocation) -> Result<JsonValue, NodeExecutionError> {
        let value = match invocation.config.get("field").and_then(JsonValue::as_str) {
            Some(path) => lookup_path(&invocation.input, path).unwrap_or(&JsonValue::Null),
            None => &invocation.input,
        };
        let matched = match invocation.config.get("equals") {
            Some(expected) => value == expected,
            None => is_truthy(value),
        };
        Ok(JsonValue::Bool(matched))
    }
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
#[must_use]
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// A registered node type.
#[derive(Clone)]
pub struct Capability {
    pub contract: NodeContract,
    pub adapter: Option<Arc<dyn NodeAdapter>>,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("contract", &self.contract)
            .field("has_adapter", &self.adapter.is_some())
            .finish()
    }
}

/// Node type to contract and adapter.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<NodeType, Capability>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the structural types `start`, `end`,
    /// `conditional` and `loop`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_contract("start", NodeContract::new(NodeKind::Start));
        registry.register_contract("end", NodeContract::new(NodeKind::End));
        registry.register(
            "conditional",
            NodeContract::new(NodeKind::Conditional),
            Arc::new(ConditionalAdapter),
        );
        registry.register_contract("loop", NodeContract::new(NodeKind::Loop).require("body"));
        registry
    }

    /// Registers a node type with an adapter, replacing any previous entry.
    pub fn register(
        &mut self,
        node_type: impl Into<NodeType>,
        contract: NodeContract,
        adapter: Arc<dyn NodeAdapter>,
    ) -> &mut Self {
        self.entries.insert(
            node_type.into(),
            Capability {
                contract,
                adapter: Some(adapter),
            },
        );
        self
    }

    /// Registers a node type without an adapter.
    pub fn register_contract(
        &mut self,
        node_type: impl Into<NodeType>,
        contract: NodeContract,
    ) -> &mut Self {
        self.entries.insert(
            node_type.into(),
            Capability {
                contract,
                adapter: None,
            },
        );
        self
    }

    /// Returns true if the type is registered.
    #[must_use]
    pub fn contains(&self, node_type: &NodeType) -> bool {
        self.entries.contains_key(node_type)
    }

    /// Returns the contract of a type.
    #[must_use]
    pub fn contract(&self, node_type: &NodeType) -> Option<&NodeContract> {
        self.entries.get(node_type).map(|entry| &entry.contract)
    }

    /// Returns the adapter of a type.
    #[must_use]
    pub fn adapter(&self, node_type: &NodeType) -> Option<Arc<dyn NodeAdapter>> {
        self.entries
            .get(node_type)
            .and_then(|entry| entry.adapter.clone())
    }

    /// Returns all registered type names.
    pub fn node_types(&self) -> impl Iterator<Item = &NodeType> {
        self.entries.keys()
    }
}

/// Declarative contracts for the common integration types.
///
/// Hosts pair these with their own adapters.
#[must_use]
pub fn standard_contract(node_type: &str) -> Option<NodeContract> {
    let contract = match node_type {
        "httpRequest" => NodeContract::task()
            .require("url")
            .one_of("method", ["GET", "POST", "PUT", "PATCH", "DELETE"])
            .require_when("authType", "bearer", ["token"]),
        "textModel" => NodeContract::task()
            .config_or_input("prompt")
            .single_input("inputFrom"),
        "tool" => NodeContract::task().require("toolName").requires_confirmation(),
        "database" => NodeContract::task()
            .require("query")
            .one_of("operation", ["select", "insert", "update", "delete"])
            .requires_confirmation(),
        _ => return None,
    };
    Some(contract)
}
