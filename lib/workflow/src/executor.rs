//! DAG executor.
//!
//! Drives one validated workflow to a terminal outcome:
//! 1. Determine ready nodes (all predecessors finished)
//! 2. Skip nodes with no live incoming edge, pass structural nodes through
//! 3. Run the rest concurrently, gating the ones that need confirmation
//! 4. Publish completion/failure and take or prune outgoing edges
//! 5. Publish the terminal event once nothing is left to run
//!
//! Loop nodes run their body once per item through the same machinery;
//! body events use node ids scoped as `loop[i]/child`.

use crate::config::EngineConfig;
use crate::confirmation::{ConfirmationGate, Decision};
use crate::context::{ExecutionContext, lookup_path};
use crate::edge::Edge;
use crate::error::NodeExecutionError;
use crate::event_log::{EventLog, EventLogError};
use crate::execution::{EventKind, NodeRecord, NodeState, RunOutcome, RunStatus};
use crate::graph::WorkflowGraph;
use crate::node::{Node, NodeId};
use crate::registry::{CapabilityRegistry, NodeContract, NodeInvocation, NodeKind};
use crate::remaining_work::RemainingWorkGraph;
use crate::validator::ValidatedWorkflow;
use braid_core::RunId;
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value as JsonValue, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What became of a node handed to the scheduler.
enum NodeOutcome {
    /// Cancellation arrived before `node_start` was published.
    NotStarted,
    /// The node ran. `nested` holds records of loop iterations.
    Finished {
        record: NodeRecord,
        nested: Vec<NodeRecord>,
    },
    /// Cancellation stopped a loop after its `node_start`. It publishes no
    /// result.
    Interrupted { nested: Vec<NodeRecord> },
}

struct NodeFinished {
    node_id: NodeId,
    outcome: NodeOutcome,
}

/// Result of driving one graph (the run itself or one loop iteration).
struct GraphResult {
    output: JsonValue,
    failure: Option<(NodeId, String)>,
    records: Vec<NodeRecord>,
    cancelled: bool,
}

/// Which outgoing edges a completed node takes.
enum Branch {
    All,
    /// Edges carrying this handle, plus edges with no handle.
    Handle(Option<String>),
}

/// Executes validated workflows.
pub struct DagExecutor {
    registry: Arc<CapabilityRegistry>,
    log: Arc<EventLog>,
    gate: Arc<ConfirmationGate>,
    node_timeout: Option<Duration>,
    default_loop_concurrency: usize,
}

impl DagExecutor {
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        log: Arc<EventLog>,
        gate: Arc<ConfirmationGate>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            log,
            gate,
            node_timeout: config.node_timeout(),
            default_loop_concurrency: config.default_loop_concurrency.max(1),
        }
    }

    /// Runs a workflow to completion, publishing events to the run's log.
    ///
    /// The log must already exist. Exactly one terminal event is published,
    /// unless the run is cancelled, in which case the log is sealed instead.
    #[instrument(skip_all, fields(%run_id, workflow_id = %workflow.workflow().id))]
    pub async fn execute(
        &self,
        run_id: RunId,
        workflow: &ValidatedWorkflow,
        input: JsonValue,
        cancellation: CancellationToken,
    ) -> RunOutcome {
        info!("run started");
        let result = self
            .drive(run_id, None, workflow, input, cancellation.clone())
            .await;

        if result.cancelled || cancellation.is_cancelled() {
            return self.cancelled(run_id, result.records).await;
        }

        let (status, terminal, value, error) = match result.failure {
            Some((node_id, message)) => {
                let error = format!("node {node_id} failed: {message}");
                let terminal = EventKind::WorkflowError {
                    error: error.clone(),
                    execution_log: result.records.clone(),
                };
                (RunStatus::Failed, terminal, None, Some(error))
            }
            None => {
                let terminal = EventKind::WorkflowComplete {
                    result: result.output.clone(),
                    execution_log: result.records.clone(),
                };
                (RunStatus::Succeeded, terminal, Some(result.output), None)
            }
        };
        // A cancel that lands after the last node still wins.
        match self.log.append(run_id, terminal).await {
            Ok(_) => {}
            Err(EventLogError::Cancelled { .. }) => {
                return self.cancelled(run_id, result.records).await;
            }
            Err(err) => warn!(error = %err, "terminal event dropped"),
        }
        info!(?status, error = error.as_deref(), records = result.records.len(), "run finished");
        RunOutcome {
            status,
            result: value,
            error,
            execution_log: result.records,
        }
    }

    /// Seals a cancelled run's log in place of a terminal event.
    async fn cancelled(&self, run_id: RunId, records: Vec<NodeRecord>) -> RunOutcome {
        if let Err(err) = self.log.seal(run_id).await {
            warn!(error = %err, "failed to seal cancelled run");
        }
        info!(records = records.len(), "run cancelled");
        RunOutcome {
            status: RunStatus::Cancelled,
            result: None,
            error: None,
            execution_log: records,
        }
    }

    /// The execution loop for one graph.
    ///
    /// Boxed because loop nodes recurse into it.
    fn drive<'a>(
        &'a self,
        run_id: RunId,
        scope: Option<String>,
        workflow: &'a ValidatedWorkflow,
        input: JsonValue,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, GraphResult> {
        async move {
            let mut ctx = ExecutionContext::new(run_id, input, cancellation);
            let mut work = RemainingWorkGraph::from_workflow(workflow.graph());
            let mut in_flight: FuturesUnordered<BoxFuture<'a, NodeFinished>> =
                FuturesUnordered::new();

            loop {
                if !ctx.is_cancelled() {
                    self.schedule_ready_nodes(
                        scope.as_deref(),
                        workflow,
                        &mut ctx,
                        &mut work,
                        &mut in_flight,
                    );
                }
                let Some(finished) = in_flight.next().await else {
                    break;
                };
                self.handle_result(run_id, workflow, &mut ctx, &mut work, finished)
                    .await;
            }

            if !work.is_complete() && !ctx.is_cancelled() {
                let graph = workflow.graph();
                let unvisited: Vec<&str> = graph
                    .nodes()
                    .filter(|node| !ctx.is_visited(&node.id))
                    .map(|node| node.id.as_str())
                    .collect();
                let pruned = graph.edges().filter(|edge| ctx.is_pruned(&edge.id)).count();
                warn!(remaining = work.remaining_count(), ?unvisited, pruned, "graph stalled");
            }

            let output = aggregate_output(workflow, &ctx);
            let failure = ctx
                .first_error()
                .map(|(node_id, error)| (node_id.clone(), error.to_string()));
            let cancelled = ctx.is_cancelled();
            GraphResult {
                output,
                failure,
                records: ctx.into_log(),
                cancelled,
            }
        }
        .boxed()
    }

    /// Hands every ready node to the scheduler.
    ///
    /// Skipped and structural nodes finish synchronously and may make
    /// further nodes ready, so this repeats until nothing new is ready.
    fn schedule_ready_nodes<'a>(
        &'a self,
        scope: Option<&str>,
        workflow: &'a ValidatedWorkflow,
        ctx: &mut ExecutionContext,
        work: &mut RemainingWorkGraph,
        in_flight: &mut FuturesUnordered<BoxFuture<'a, NodeFinished>>,
    ) {
        let graph = workflow.graph();
        loop {
            let ready = work.ready_nodes();
            if ready.is_empty() {
                return;
            }
            for node_id in ready {
                let Some(node) = graph.get_node(&node_id) else {
                    work.mark_finished(&node_id);
                    continue;
                };
                let contract = workflow.contract(&node_id);
                let kind = contract.map_or(NodeKind::Task, |c| c.kind);

                let Some(input) = effective_input(workflow, ctx, node, contract) else {
                    debug!(node = %node_id, "skipping node without live input");
                    ctx.mark_skipped(&node_id);
                    prune_outgoing(graph, ctx, &node_id);
                    work.mark_finished(&node_id);
                    continue;
                };

                if kind.is_structural() {
                    ctx.record_passthrough(&node_id, input);
                    take_outgoing(graph, ctx, &node_id, &Branch::All);
                    work.mark_finished(&node_id);
                    continue;
                }

                work.mark_executing(&node_id);
                let event_id = match scope {
                    Some(scope) => node_id.scoped(scope),
                    None => node_id.clone(),
                };
                in_flight.push(
                    self.run_node(
                        ctx.run_id(),
                        event_id,
                        node,
                        contract,
                        workflow.loop_body(&node_id),
                        input,
                        ctx.cancellation().clone(),
                    )
                    .boxed(),
                );
            }
        }
    }

    /// Publishes a node's result and updates edge liveness.
    async fn handle_result(
        &self,
        run_id: RunId,
        workflow: &ValidatedWorkflow,
        ctx: &mut ExecutionContext,
        work: &mut RemainingWorkGraph,
        finished: NodeFinished,
    ) {
        let NodeFinished { node_id, outcome } = finished;
        let graph = workflow.graph();
        match outcome {
            NodeOutcome::NotStarted => {
                debug!(node = %node_id, "node not started");
                ctx.mark_skipped(&node_id);
                prune_outgoing(graph, ctx, &node_id);
            }
            NodeOutcome::Interrupted { nested } => {
                debug!(node = %node_id, "node interrupted by cancellation");
                ctx.extend_log(nested);
                ctx.mark_skipped(&node_id);
                prune_outgoing(graph, ctx, &node_id);
            }
            NodeOutcome::Finished { record, nested } => {
                ctx.extend_log(nested);
                if record.state == NodeState::Completed {
                    let output = record.output.clone().unwrap_or(JsonValue::Null);
                    let branch = match workflow.contract(&node_id).map(|c| c.kind) {
                        Some(NodeKind::Conditional) => Branch::Handle(branch_handle(&output)),
                        _ => Branch::All,
                    };
                    debug!(node = %record.node_id, "node completed");
                    self.emit(
                        run_id,
                        EventKind::NodeComplete {
                            node_id: record.node_id.clone(),
                            node_type: record.node_type.clone(),
                            output,
                        },
                    )
                    .await;
                    take_outgoing(graph, ctx, &node_id, &branch);
                } else {
                    let error = record.error.clone().unwrap_or_default();
                    warn!(node = %record.node_id, %error, "node failed");
                    self.emit(
                        run_id,
                        EventKind::NodeError {
                            node_id: record.node_id.clone(),
                            node_type: record.node_type.clone(),
                            error,
                        },
                    )
                    .await;
                    prune_outgoing(graph, ctx, &node_id);
                }
                ctx.record(&node_id, record);
            }
        }
        work.mark_finished(&node_id);
    }

    /// Runs a single node: confirmation, `node_start`, then the adapter.
    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        run_id: RunId,
        event_id: NodeId,
        node: &Node,
        contract: Option<&NodeContract>,
        body: Option<&ValidatedWorkflow>,
        input: JsonValue,
        cancellation: CancellationToken,
    ) -> NodeFinished {
        let not_started = || NodeFinished {
            node_id: node.id.clone(),
            outcome: NodeOutcome::NotStarted,
        };

        let mut decision = Decision::Allow;
        if contract.is_some_and(|c| c.requires_confirmation) {
            match self
                .gate
                .confirm(run_id, &event_id, &node.node_type, &cancellation)
                .await
            {
                Ok(decided) => decision = decided,
                Err(err) => {
                    warn!(node = %event_id, error = %err, "confirmation not requested");
                    return not_started();
                }
            }
        }
        if cancellation.is_cancelled() {
            return not_started();
        }

        let started = self
            .log
            .append(
                run_id,
                EventKind::NodeStart {
                    node_id: event_id.clone(),
                    node_type: node.node_type.clone(),
                },
            )
            .await;
        if let Err(err) = started {
            debug!(node = %event_id, error = %err, "node start rejected");
            return not_started();
        }
        debug!(node = %event_id, node_type = %node.node_type, "node started");

        let mut record = NodeRecord::start(event_id.clone(), node.node_type.clone(), input.clone());
        let (result, nested) = match (decision, contract.map(|c| c.kind), body) {
            (Decision::Deny, _, _) => (Err(NodeExecutionError::Denied), Vec::new()),
            (Decision::Allow, Some(NodeKind::Loop), Some(body)) => {
                match self
                    .run_loop(run_id, &event_id, node, body, &input, &cancellation)
                    .await
                {
                    (Some(result), nested) => (result, nested),
                    (None, nested) => {
                        return NodeFinished {
                            node_id: node.id.clone(),
                            outcome: NodeOutcome::Interrupted { nested },
                        };
                    }
                }
            }
            (Decision::Allow, Some(NodeKind::Loop), None) => (
                Err(NodeExecutionError::failed("loop node has no body")),
                Vec::new(),
            ),
            (Decision::Allow, _, _) => (
                self.invoke(run_id, &event_id, node, input, &cancellation)
                    .await,
                Vec::new(),
            ),
        };
        match result {
            Ok(output) => record.complete(output),
            Err(err) => record.fail(err.to_string()),
        }

        NodeFinished {
            node_id: node.id.clone(),
            outcome: NodeOutcome::Finished { record, nested },
        }
    }

    /// Calls the node type's adapter, bounded by the node timeout.
    ///
    /// A panicking adapter fails its node like any other error.
    async fn invoke(
        &self,
        run_id: RunId,
        event_id: &NodeId,
        node: &Node,
        input: JsonValue,
        cancellation: &CancellationToken,
    ) -> Result<JsonValue, NodeExecutionError> {
        let Some(adapter) = self.registry.adapter(&node.node_type) else {
            return Err(NodeExecutionError::UnsupportedNodeType {
                node_type: node.node_type.clone(),
            });
        };
        let invocation = NodeInvocation {
            run_id,
            node_id: event_id.clone(),
            node_type: node.node_type.clone(),
            config: node.config.clone(),
            input,
            cancellation: cancellation.child_token(),
        };
        let call = AssertUnwindSafe(adapter.execute(invocation))
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|panic| {
                    warn!(node = %event_id, "adapter panicked");
                    Err(NodeExecutionError::failed(format!(
                        "adapter panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                })
            });
        match self.node_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .unwrap_or_else(|_| Err(NodeExecutionError::Timeout { after })),
            None => call.await,
        }
    }

    /// Runs a loop body once per item of the loop input.
    ///
    /// Config: `itemsPath` selects the array (default: the input itself),
    /// `concurrency` bounds iterations in flight, `continueOnError` records
    /// failed iterations as `{"error": ...}` instead of failing the loop.
    /// Output order follows item order. Returns no result if the run was
    /// cancelled before every iteration finished.
    async fn run_loop(
        &self,
        run_id: RunId,
        event_id: &NodeId,
        node: &Node,
        body: &ValidatedWorkflow,
        input: &JsonValue,
        cancellation: &CancellationToken,
    ) -> (Option<Result<JsonValue, NodeExecutionError>>, Vec<NodeRecord>) {
        let items = match node.config_str("itemsPath") {
            Some(path) => lookup_path(input, path),
            None => Some(input),
        };
        let Some(JsonValue::Array(items)) = items else {
            return (
                Some(Err(NodeExecutionError::invalid_input(
                    "loop input is not an array",
                ))),
                Vec::new(),
            );
        };
        let concurrency = node
            .config_value("concurrency")
            .and_then(JsonValue::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.default_loop_concurrency);
        let continue_on_error = node
            .config_value("continueOnError")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        debug!(node = %event_id, items = items.len(), concurrency, "loop started");

        // Cancelled to stop sibling iterations after an aborting failure.
        let iterations_token = cancellation.child_token();
        let mut iterations = stream::iter(items.iter().cloned().enumerate())
            .map(|(index, item)| {
                let scope = format!("{event_id}[{index}]");
                let token = iterations_token.clone();
                async move {
                    let result = self.drive(run_id, Some(scope), body, item, token).await;
                    (index, result)
                }
            })
            .buffered(concurrency);

        let mut outputs = Vec::with_capacity(items.len());
        let mut records = Vec::new();
        let mut failure = None;
        let mut interrupted = false;
        while let Some((index, result)) = iterations.next().await {
            records.extend(result.records);
            if failure.is_some() || interrupted {
                continue;
            }
            // Only the run's own cancellation reaches here; aborts set
            // `failure` before cancelling the iterations.
            if result.cancelled {
                interrupted = true;
                continue;
            }
            match result.failure {
                None => outputs.push(result.output),
                Some((_, message)) if continue_on_error => {
                    outputs.push(json!({ "error": message }));
                }
                Some((node_id, message)) => {
                    failure = Some(NodeExecutionError::IterationFailed {
                        index,
                        node_id,
                        message,
                    });
                    iterations_token.cancel();
                }
            }
        }

        if interrupted {
            return (None, records);
        }
        match failure {
            Some(err) => (Some(Err(err)), records),
            None => (Some(Ok(JsonValue::Array(outputs))), records),
        }
    }

    /// Appends an event. A log that is already closed is logged, not fatal.
    async fn emit(&self, run_id: RunId, kind: EventKind) {
        let name = kind.name();
        if let Err(err) = self.log.append(run_id, kind).await {
            warn!(%run_id, event = name, error = %err, "event dropped");
        }
    }
}

/// Builds a node's input from its live incoming edges.
///
/// Entry nodes get the run input. `None` means no edge is live and the node
/// must be skipped. A single-input node with a selector receives only the
/// selected source's output.
fn effective_input(
    workflow: &ValidatedWorkflow,
    ctx: &ExecutionContext,
    node: &Node,
    contract: Option<&NodeContract>,
) -> Option<JsonValue> {
    if workflow.is_entry(&node.id) {
        return Some(ctx.input().clone());
    }
    let graph = workflow.graph();
    let live: Vec<&Edge> = graph
        .predecessors(&node.id)
        .into_iter()
        .map(|(_, edge)| edge)
        .filter(|edge| ctx.is_live(&edge.id))
        .collect();
    if live.is_empty() {
        return None;
    }

    let selected = contract
        .and_then(|c| c.single_input.as_deref())
        .and_then(|field| node.config_str(field));
    if let Some(source) = selected
        && graph.in_degree(&node.id) > 1
    {
        return live
            .iter()
            .find(|edge| edge.source.as_str() == source)
            .map(|edge| output_of(ctx, &edge.source));
    }

    if let [edge] = live.as_slice() {
        return Some(output_of(ctx, &edge.source));
    }
    let mut inputs = Map::new();
    for edge in live {
        inputs.insert(edge.source.to_string(), output_of(ctx, &edge.source));
    }
    Some(JsonValue::Object(inputs))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send + 'static)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn output_of(ctx: &ExecutionContext, node_id: &NodeId) -> JsonValue {
    ctx.output(node_id).cloned().unwrap_or(JsonValue::Null)
}

/// The handle a conditional's output selects.
///
/// Booleans select `"true"`/`"false"`, strings select themselves, objects
/// select their `branch` field.
fn branch_handle(output: &JsonValue) -> Option<String> {
    match output {
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Object(map) => match map.get("branch") {
            Some(JsonValue::Bool(b)) => Some(b.to_string()),
            Some(JsonValue::String(s)) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn take_outgoing(graph: &WorkflowGraph, ctx: &mut ExecutionContext, node_id: &NodeId, branch: &Branch) {
    for (_, edge) in graph.successors(node_id) {
        let taken = match (branch, &edge.source_handle) {
            (Branch::All, _) | (Branch::Handle(_), None) => true,
            (Branch::Handle(selected), Some(handle)) => selected.as_deref() == Some(handle.as_str()),
        };
        if taken {
            ctx.take_edge(&edge.id);
        } else {
            ctx.prune_edge(&edge.id);
        }
    }
}

fn prune_outgoing(graph: &WorkflowGraph, ctx: &mut ExecutionContext, node_id: &NodeId) {
    for (_, edge) in graph.successors(node_id) {
        ctx.prune_edge(&edge.id);
    }
}

/// The value a graph produces.
///
/// The input of a completed `end` node wins; otherwise the output of the
/// only completed sink, or an object of all completed sinks by node id.
fn aggregate_output(workflow: &ValidatedWorkflow, ctx: &ExecutionContext) -> JsonValue {
    let graph = workflow.graph();
    let completed = |node: &&Node| ctx.state(&node.id) == NodeState::Completed;
    let end = graph.nodes().filter(completed).find(|node| {
        workflow
            .contract(&node.id)
            .is_some_and(|c| c.kind == NodeKind::End)
    });
    if let Some(end) = end {
        return output_of(ctx, &end.id);
    }

    let sinks: Vec<&Node> = graph.terminal_nodes().into_iter().filter(completed).collect();
    match sinks.as_slice() {
        [] => JsonValue::Null,
        [sink] => output_of(ctx, &sink.id),
        sinks => JsonValue::Object(
            sinks
                .iter()
                .map(|sink| (sink.id.to_string(), output_of(ctx, &sink.id)))
                .collect(),
        ),
    }
}
