//! End-to-end behaviour of a single invocation.
//!
//! Covers the success path, validation before side effects, the retry
//! bound, terminal failure with rollback, and re-invocation of finished
//! runs.

mod common;

use actiongraph::prelude::*;
use actiongraph::ExecutionError;
use common::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_acyclic_plan_succeeds() {
    init_tracing();
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new());
    let executor = executor(store.clone(), handler.clone(), fast_config());

    // diamond: a -> (b, c) -> d, plus an independent e
    let plan = Plan::new("diamond")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]))
        .with_action(action("c", &["a"]))
        .with_action(action("d", &["b", "c"]))
        .with_action(action("e", &[]));

    let run_id = Uuid::new_v4();
    let report = executor.invoke(run_id, &plan).await.unwrap();

    assert!(report.is_success());
    assert!(report.is_finished());
    assert!(report.rollback_failures.is_empty());
    for id in ["a", "b", "c", "d", "e"] {
        let record = record(&report, id);
        assert_eq!(record.status, ActionStatus::Complete, "{}", id);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.output, Some(json!({"created": id})));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
        assert_eq!(record.claim, None);
        assert_eq!(handler.executes(id), 1);
    }
    assert!(handler.rollbacks().is_empty());
    assert_eq!(stored(&store, run_id).await.run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_empty_plan_succeeds() {
    let store = Arc::new(InMemoryStateStore::new());
    let executor = executor(store, Arc::new(Scripted::new()), fast_config());

    let report = executor
        .invoke(Uuid::new_v4(), &Plan::new("nothing"))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.actions.is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_side_effect() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new());
    let executor = executor(store.clone(), handler.clone(), fast_config());

    let plan = Plan::new("loop")
        .with_action(action("root", &[]))
        .with_action(action("a", &["root", "c"]))
        .with_action(action("b", &["a"]))
        .with_action(action("c", &["b"]));

    let err = executor.invoke(Uuid::new_v4(), &plan).await.unwrap_err();

    match err {
        ExecutionError::Validation(GraphError::CycleDetected { cycle }) => {
            let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b", "c", "a"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert!(handler.calls().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_and_type_are_rejected() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new());
    let executor = executor(store.clone(), handler.clone(), fast_config());

    let dangling = Plan::new("dangling").with_action(action("a", &["missing"]));
    let err = executor.invoke(Uuid::new_v4(), &dangling).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::Validation(GraphError::UnknownDependency { .. })
    ));

    let untyped = Plan::new("untyped")
        .with_action(action("a", &[]))
        .with_action(ActionDefinition::new("b", "Cloud::Unregistered"));
    let err = executor.invoke(Uuid::new_v4(), &untyped).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::UnknownActionType { ref action_type, .. } if action_type == "Cloud::Unregistered"
    ));

    assert!(handler.calls().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_transient_twice_then_success() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new().script(
        "b",
        vec![
            HandlerOutcome::Transient("throttled".into()),
            HandlerOutcome::Transient("throttled".into()),
        ],
    ));
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("retry")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(record(&report, "a").attempts, 1);
    assert_eq!(record(&report, "b").attempts, 3);
    assert_eq!(record(&report, "b").status, ActionStatus::Complete);
    assert_eq!(handler.executes("b"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_always_transient_stops_at_attempt_budget() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(
        Scripted::new().script("flaky", vec![HandlerOutcome::Transient("503".into()); 100]),
    );
    // standard one second backoff; paused time skips through it
    let config = fast_config().with_retry(RetryPolicy::with_max_attempts(5));
    let executor = executor(store, handler.clone(), config);

    let plan = Plan::new("bound").with_action(action("flaky", &[]));
    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(handler.executes("flaky"), 5);
    let flaky = record(&report, "flaky");
    assert_eq!(flaky.status, ActionStatus::Failed);
    assert_eq!(flaky.attempts, 5);
    assert!(flaky.last_error.as_deref().unwrap().contains("attempts exhausted"));
    // nothing completed, so nothing to compensate
    assert_eq!(report.status, RunStatus::RolledBack);
    assert!(handler.rollbacks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retried_like_transient() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new().delay("slow", Duration::from_secs(60)));
    let config = fast_config().with_action_timeout(Duration::from_secs(5));
    let executor = executor(store, handler.clone(), config);

    let plan = Plan::new("slow").with_action(action("slow", &[]));
    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(handler.executes("slow"), 3);
    let slow = record(&report, "slow");
    assert_eq!(slow.status, ActionStatus::Failed);
    assert!(slow.last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_terminal_failure_rolls_back_completed_actions() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(
        Scripted::new().script("b", vec![HandlerOutcome::Fail("quota exceeded".into())]),
    );
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("fail")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    assert!(!report.is_success());
    assert_eq!(handler.rollbacks(), vec!["a".to_string()]);
    assert_eq!(handler.executes("b"), 1);

    assert_eq!(record(&report, "a").status, ActionStatus::RolledBack);
    let b = record(&report, "b");
    assert_eq!(b.status, ActionStatus::Failed);
    assert_eq!(b.last_error.as_deref(), Some("quota exceeded"));
    assert!(report.rollback_failures.is_empty());
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_order_and_survives_failures() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(
        Scripted::new()
            .script("d", vec![HandlerOutcome::Fail("boom".into())])
            .fail_rollback("c"),
    );
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("chain")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]))
        .with_action(action("c", &["b"]))
        .with_action(action("d", &["c"]))
        .with_action(action("e", &["d"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(handler.rollbacks(), vec!["c", "b", "a"]);
    assert_eq!(report.status, RunStatus::RolledBack);

    assert_eq!(report.rollback_failures.len(), 1);
    assert_eq!(report.rollback_failures[0].action_id, ActionId::new("c"));
    assert_eq!(report.rollback_failures[0].reason, "c refused to delete");

    assert_eq!(record(&report, "a").status, ActionStatus::RolledBack);
    assert_eq!(record(&report, "b").status, ActionStatus::RolledBack);
    assert_eq!(record(&report, "c").status, ActionStatus::Failed);
    assert_eq!(record(&report, "d").status, ActionStatus::Failed);
    assert_eq!(record(&report, "e").status, ActionStatus::Skipped);
    assert_eq!(handler.executes("e"), 0);
}

#[tokio::test]
async fn test_failure_lets_in_flight_siblings_finish() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(
        Scripted::new()
            .script("fast", vec![HandlerOutcome::Fail("denied".into())])
            .delay("fast", Duration::from_millis(20))
            .delay("slow", Duration::from_millis(200)),
    );
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("siblings")
        .with_action(action("fast", &[]))
        .with_action(action("slow", &[]))
        .with_action(action("after", &["slow"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    // slow was already running, so it completes and is then compensated
    assert_eq!(handler.rollbacks(), vec!["slow".to_string()]);
    assert_eq!(record(&report, "slow").status, ActionStatus::RolledBack);
    assert_eq!(record(&report, "after").status, ActionStatus::Skipped);
    assert_eq!(report.status, RunStatus::RolledBack);
}

#[tokio::test]
async fn test_panicking_handler_fails_the_run() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new().panic_on("b"));
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("panic")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    let b = record(&report, "b");
    assert_eq!(b.status, ActionStatus::Failed);
    assert!(b.last_error.as_deref().unwrap().starts_with("handler panicked"));
    assert_eq!(handler.rollbacks(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_reinvoking_a_finished_run_is_a_no_op() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(
        Scripted::new().script("b", vec![HandlerOutcome::Fail("nope".into())]),
    );
    let executor = executor(store.clone(), handler.clone(), fast_config());

    let plan = Plan::new("twice")
        .with_action(action("a", &[]))
        .with_action(action("b", &["a"]));
    let run_id = Uuid::new_v4();

    let first = executor.invoke(run_id, &plan).await.unwrap();
    assert_eq!(first.status, RunStatus::RolledBack);
    let calls = handler.calls();
    let snapshot = stored(&store, run_id).await;

    let second = executor.invoke(run_id, &plan).await.unwrap();

    assert_eq!(second, first);
    assert_eq!(handler.calls(), calls);
    assert_eq!(stored(&store, run_id).await, snapshot);
}

#[tokio::test]
async fn test_builtin_handlers() {
    let store = Arc::new(InMemoryStateStore::new());
    let executor = Executor::new(store, HandlerRegistry::with_builtins());

    let plan = Plan::from_json(
        r#"{
            "name": "builtins",
            "actions": [
                {"id": "vars", "type": "System::SetVariables",
                 "params": {"Variables": {"region": "eu-west-1"}}},
                {"id": "gate", "type": "System::NoOp", "depends_on": ["vars"]},
                {"id": "echo", "type": "System::SetVariables", "depends_on": ["vars"],
                 "params": {"Variables": {"target": "${region}"}}}
            ]
        }"#,
    )
    .unwrap();

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        report.action("vars").unwrap().output,
        Some(json!({"region": "eu-west-1"}))
    );
    // variables are recorded, never substituted into later actions
    assert_eq!(
        report.action("echo").unwrap().output,
        Some(json!({"target": "${region}"}))
    );
    assert_eq!(report.action("gate").unwrap().output, Some(serde_json::Value::Null));
}

#[tokio::test]
async fn test_before_and_wildcard_edges_order_execution() {
    let store = Arc::new(InMemoryStateStore::new());
    let handler = Arc::new(Scripted::new());
    let executor = executor(store, handler.clone(), fast_config());

    let plan = Plan::new("edges")
        .with_action(action("upload-site", &[]))
        .with_action(action("upload-assets", &[]))
        .with_action(action("invalidate", &["upload-*"]))
        .with_action(action("bucket", &[]).before(["upload-*"]));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();
    assert!(report.is_success());

    let calls = handler.calls();
    let position = |call: Call| calls.iter().position(|c| *c == call).unwrap();
    for upload in ["upload-site", "upload-assets"] {
        assert!(position(Call::Finished("bucket".into())) < position(Call::Execute(upload.into())));
        assert!(position(Call::Finished(upload.into())) < position(Call::Execute("invalidate".into())));
    }
}
