//! End-to-end scenarios through the engine.

use braid_workflow::{
    CapabilityRegistry, Cursor, Decision, Edge, Engine, EngineConfig, EventKind, ExecutionEvent,
    InMemoryWorkflowStore, Node, NodeContract, NodeExecutionError, RunStatus, ViolationKind,
    WaitOutcome, Workflow, adapter_fn, standard_contract,
};
use braid_core::{RunId, WorkflowId};
use futures::StreamExt;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::with_builtins();
    registry.register(
        "httpRequest",
        standard_contract("httpRequest").expect("standard type"),
        adapter_fn(|invocation| async move {
            let x = invocation.input["x"]
                .as_i64()
                .ok_or_else(|| NodeExecutionError::invalid_input("x must be a number"))?;
            Ok(json!({ "y": x * 2 }))
        }),
    );
    registry.register(
        "tool",
        standard_contract("tool").expect("standard type"),
        adapter_fn(|invocation| async move { Ok(json!({ "ran": invocation.node_id.to_string() })) }),
    );
    registry.register(
        "wait",
        standard_contract("textModel").expect("standard type"),
        adapter_fn(|invocation| async move {
            let ms = invocation.config.get("ms").and_then(JsonValue::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(invocation.input)
        }),
    );
    registry.register(
        "explode",
        NodeContract::task(),
        adapter_fn(|invocation| async move {
            if invocation.input.is_object() {
                panic!("integration crashed");
            }
            Ok(invocation.input)
        }),
    );
    registry
}

async fn engine_with(config: EngineConfig, workflows: Vec<Workflow>) -> (Engine, Vec<WorkflowId>) {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let mut ids = Vec::new();
    for workflow in workflows {
        ids.push(store.insert(workflow).await);
    }
    (Engine::new(registry(), store, config), ids)
}

fn http(id: &str) -> Node {
    Node::new(id, "httpRequest")
        .with_config("url", json!("https://example.com/double"))
        .with_config("method", json!("GET"))
}

fn wait(id: &str, ms: u64) -> Node {
    Node::new(id, "wait")
        .with_config("prompt", json!("hold"))
        .with_config("ms", json!(ms))
}

async fn events(engine: &Engine, run_id: RunId) -> Vec<ExecutionEvent> {
    engine
        .follow(run_id, None)
        .await
        .expect("follow")
        .collect()
        .await
}

#[tokio::test]
async fn linear_http_workflow() {
    let workflow = Workflow::new("double")
        .with_node(Node::new("start", "start"))
        .with_node(http("A"))
        .with_node(Node::new("end", "end"))
        .with_edge(Edge::new("e1", "start", "A"))
        .with_edge(Edge::new("e2", "A", "end"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let run_id = engine.submit(ids[0], json!({"x": 1})).await.expect("submit");
    let events = events(&engine, run_id).await;

    let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
    assert_eq!(kinds.len(), 3);
    assert!(matches!(kinds[0], EventKind::NodeStart { node_id, .. } if node_id.as_str() == "A"));
    assert!(matches!(
        kinds[1],
        EventKind::NodeComplete { node_id, output, .. }
            if node_id.as_str() == "A" && *output == json!({"y": 2})
    ));
    assert!(matches!(
        kinds[2],
        EventKind::WorkflowComplete { result, .. } if *result == json!({"y": 2})
    ));
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    let outcome = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
    assert_eq!(outcome[0].1, WaitOutcome::Terminal(RunStatus::Succeeded));
}

#[tokio::test]
async fn false_condition_prunes_true_branch() {
    let workflow = Workflow::new("branch")
        .with_node(Node::new("start", "start"))
        .with_node(Node::new("check", "conditional").with_config("field", json!("enabled")))
        .with_node(http("onlyWhenTrue"))
        .with_node(http("onlyWhenFalse"))
        .with_edge(Edge::new("e1", "start", "check"))
        .with_edge(Edge::new("e2", "check", "onlyWhenTrue").with_handle("true"))
        .with_edge(Edge::new("e3", "check", "onlyWhenFalse").with_handle("false"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    // The false branch gets the conditional's output, so it fails on input;
    // what matters is which branch ran.
    let run_id = engine
        .submit(ids[0], json!({"enabled": false, "x": 1}))
        .await
        .expect("submit");
    let events = events(&engine, run_id).await;

    let touched: Vec<&str> = events
        .iter()
        .filter_map(|e| e.kind.node_id())
        .map(|id| id.as_str())
        .collect();
    assert!(touched.contains(&"onlyWhenFalse"));
    assert!(!touched.contains(&"onlyWhenTrue"));

    let log = match &events.last().expect("terminal").kind {
        EventKind::WorkflowComplete { execution_log, .. }
        | EventKind::WorkflowError { execution_log, .. } => execution_log.clone(),
        other => panic!("unexpected terminal event {other:?}"),
    };
    assert!(log.iter().all(|r| r.node_id.as_str() != "onlyWhenTrue"));
}

#[tokio::test(start_paused = true)]
async fn wait_all_snapshot_then_final_statuses() {
    let workflow = Workflow::new("slow")
        .with_node(wait("first", 50))
        .with_node(wait("second", 50))
        .with_edge(Edge::new("e1", "first", "second"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let runs: Vec<RunId> = engine
        .submit_many((0..3).map(|i| (ids[0], json!({ "i": i }))))
        .await
        .into_iter()
        .map(|r| r.expect("submit"))
        .collect();

    let snapshot = engine.wait_all(&runs, Duration::ZERO).await;
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|(_, o)| *o == WaitOutcome::StillRunning));

    let done = engine.wait_all(&runs, Duration::from_secs(60)).await;
    assert!(
        done.iter()
            .all(|(_, o)| *o == WaitOutcome::Terminal(RunStatus::Succeeded))
    );

    let again = engine.wait_all(&runs, Duration::ZERO).await;
    assert_eq!(again, done);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_stops_runs() {
    let workflow = Workflow::new("chain")
        .with_node(wait("a", 100))
        .with_node(wait("b", 100))
        .with_node(wait("c", 100))
        .with_edge(Edge::new("e1", "a", "b"))
        .with_edge(Edge::new("e2", "b", "c"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let runs: Vec<RunId> = engine
        .submit_many((0..2).map(|_| (ids[0], json!({}))))
        .await
        .into_iter()
        .map(|r| r.expect("submit"))
        .collect();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let cancelled = engine.cancel_all(&runs).await;
    assert_eq!(cancelled, runs);

    let outcomes = engine.wait_all(&runs, Duration::from_secs(60)).await;
    for (run_id, outcome) in outcomes {
        assert_eq!(outcome, WaitOutcome::Terminal(RunStatus::Cancelled));
        let events = events(&engine, run_id).await;
        let started: Vec<&str> = events
            .iter()
            .filter(|e| e.kind.is_node_start())
            .filter_map(|e| e.kind.node_id())
            .map(|id| id.as_str())
            .collect();
        assert_eq!(started, vec!["a", "b"]);
        assert!(!events.iter().any(ExecutionEvent::is_terminal));
    }
}

fn gated() -> Workflow {
    Workflow::new("gated")
        .with_node(Node::new("start", "start"))
        .with_node(Node::new("deploy", "tool").with_config("toolName", json!("deploy")))
        .with_edge(Edge::new("e1", "start", "deploy"))
}

#[tokio::test(start_paused = true)]
async fn unanswered_confirmation_is_denied() {
    let config = EngineConfig {
        confirmation_timeout_secs: 30,
        ..EngineConfig::default()
    };
    let (engine, ids) = engine_with(config, vec![gated()]).await;

    let run_id = engine.submit(ids[0], json!({})).await.expect("submit");
    let events = events(&engine, run_id).await;

    let decision = events.iter().find_map(|e| match &e.kind {
        EventKind::WorkflowConfirmed { decision, .. } => Some(*decision),
        _ => None,
    });
    assert_eq!(decision, Some(Decision::Deny));
    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(EventKind::WorkflowError { .. })
    ));
    let outcome = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
    assert_eq!(outcome[0].1, WaitOutcome::Terminal(RunStatus::Failed));
}

#[tokio::test]
async fn confirmation_accepts_one_decision() {
    let (engine, ids) = engine_with(EngineConfig::default(), vec![gated()]).await;
    let run_id = engine.submit(ids[0], json!({})).await.expect("submit");

    let mut stream = engine.follow(run_id, None).await.expect("follow");
    let confirm_id = loop {
        let event = stream.next().await.expect("event before terminal");
        if let EventKind::WorkflowConfirmRequired { confirm_id, .. } = event.kind {
            break confirm_id;
        }
    };

    let request = engine
        .confirm(confirm_id, Decision::Allow)
        .await
        .expect("first decision");
    assert_eq!(request.decision, Some(Decision::Allow));
    assert!(engine.confirm(confirm_id, Decision::Deny).await.is_err());

    let rest: Vec<ExecutionEvent> = stream.collect().await;
    assert!(matches!(
        rest.last().map(|e| &e.kind),
        Some(EventKind::WorkflowComplete { .. })
    ));
    let outcome = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
    assert_eq!(outcome[0].1, WaitOutcome::Terminal(RunStatus::Succeeded));
}

#[tokio::test]
async fn replay_pages_match_live_stream() {
    let workflow = Workflow::new("fan")
        .with_node(Node::new("start", "start"))
        .with_node(http("A"))
        .with_node(http("B"))
        .with_node(http("C"))
        .with_edge(Edge::new("e1", "start", "A"))
        .with_edge(Edge::new("e2", "start", "B"))
        .with_edge(Edge::new("e3", "start", "C"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let run_id = engine.submit(ids[0], json!({"x": 5})).await.expect("submit");
    let live = events(&engine, run_id).await;

    let mut replayed = Vec::new();
    let mut cursor: Option<Cursor> = None;
    loop {
        let page = engine.replay(run_id, cursor, Some(2)).await.expect("page");
        replayed.extend(page.events.iter().cloned());
        cursor = Some(page.next_cursor);
        if page.is_final() {
            break;
        }
    }
    assert_eq!(replayed, live);
    assert_eq!(live.len(), 7);
    assert!(engine.replay(run_id, None, Some(0)).await.is_err());
}

#[tokio::test]
async fn node_start_waits_for_predecessors() {
    let workflow = Workflow::new("diamond")
        .with_node(Node::new("start", "start"))
        .with_node(wait("left", 5))
        .with_node(wait("right", 1))
        .with_node(wait("join", 0))
        .with_edge(Edge::new("e1", "start", "left"))
        .with_edge(Edge::new("e2", "start", "right"))
        .with_edge(Edge::new("e3", "left", "join"))
        .with_edge(Edge::new("e4", "right", "join"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let run_id = engine.submit(ids[0], json!({})).await.expect("submit");
    let events = events(&engine, run_id).await;
    let position = |name: &str, node: &str| {
        events
            .iter()
            .position(|e| e.kind.name() == name && e.kind.node_id().is_some_and(|id| id.as_str() == node))
            .expect("event present")
    };

    let join_start = position("node_start", "join");
    assert!(position("node_complete", "left") < join_start);
    assert!(position("node_complete", "right") < join_start);
    assert!(events.last().is_some_and(ExecutionEvent::is_terminal));
}

#[tokio::test]
async fn cyclic_workflows_are_rejected() {
    let (engine, _) = engine_with(EngineConfig::default(), Vec::new()).await;

    let self_loop = Workflow::new("self")
        .with_node(Node::new("start", "start"))
        .with_node(http("A"))
        .with_edge(Edge::new("e1", "start", "A"))
        .with_edge(Edge::new("e2", "A", "A"));
    let report = engine.validate(self_loop).expect_err("self loop");
    assert!(report.has(ViolationKind::SelfLoop));

    let cycle = Workflow::new("cycle")
        .with_node(Node::new("start", "start"))
        .with_node(http("A"))
        .with_node(http("B"))
        .with_edge(Edge::new("e1", "start", "A"))
        .with_edge(Edge::new("e2", "A", "B"))
        .with_edge(Edge::new("e3", "B", "A"));
    let report = engine.validate(cycle).expect_err("cycle");
    assert!(report.has(ViolationKind::Cycle));
}

#[tokio::test]
async fn panicking_adapter_fails_the_run() {
    let workflow = Workflow::new("explode")
        .with_node(Node::new("start", "start"))
        .with_node(Node::new("A", "explode"))
        .with_edge(Edge::new("e1", "start", "A"));
    let (engine, ids) = engine_with(EngineConfig::default(), vec![workflow]).await;

    let run_id = engine.submit(ids[0], json!({})).await.expect("submit");
    let outcome = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
    assert_eq!(outcome[0].1, WaitOutcome::Terminal(RunStatus::Failed));

    let events = events(&engine, run_id).await;
    let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
    assert_eq!(kinds.len(), 3);
    assert!(matches!(kinds[0], EventKind::NodeStart { node_id, .. } if node_id.as_str() == "A"));
    assert!(matches!(
        kinds[1],
        EventKind::NodeError { node_id, error, .. }
            if node_id.as_str() == "A" && error.contains("adapter panicked: integration crashed")
    ));
    assert!(matches!(kinds[2], EventKind::WorkflowError { .. }));
}
