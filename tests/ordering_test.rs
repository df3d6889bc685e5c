//! Dependency ordering under concurrency.
//!
//! Random DAGs, generated by proptest, run on a multi-threaded runtime with
//! random handler delays.
//! The handler log is one global order of calls: every action must begin
//! executing only after each of its dependencies finished, and the stored
//! timestamps must agree.

mod common;

use actiongraph::prelude::*;
use common::*;
use proptest::bool::weighted;
use proptest::collection::vec;
use proptest::prelude::*;
use std::time::Duration;

const SIZE: usize = 24;

/// Builds a plan where `n{i}` depends on `n{j}` for every `j < i` with
/// `edges[i * SIZE + j]` set. Edges only point backwards, so the graph is
/// acyclic.
fn random_plan(edges: &[bool], delays: &[u64]) -> (Plan, Scripted) {
    let mut plan = Plan::new("random");
    let mut handler = Scripted::new();

    for i in 0..SIZE {
        let id = format!("n{:02}", i);
        let deps: Vec<String> = (0..i)
            .filter(|j| edges[i * SIZE + j])
            .map(|j| format!("n{:02}", j))
            .collect();
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        plan = plan.with_action(action(&id, &deps));
        handler = handler.delay(&id, Duration::from_millis(delays[i]));
    }

    (plan, handler)
}

async fn assert_dependency_order(plan: Plan, handler: Scripted) {
    let handler = Arc::new(handler);
    let store = Arc::new(InMemoryStateStore::new());
    let config = fast_config().with_max_concurrency(4);
    let executor = executor(store.clone(), handler.clone(), config);

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let calls = handler.calls();
    let position = |call: &Call| calls.iter().position(|c| c == call);

    for definition in &plan.actions {
        let id = definition.id.as_str();
        let started = position(&Call::Execute(id.to_string()))
            .unwrap_or_else(|| panic!("{} never ran", id));
        assert_eq!(handler.executes(id), 1, "{}", id);

        let record = record(&report, id);
        for dep in &definition.depends_on {
            let finished = position(&Call::Finished(dep.clone()))
                .unwrap_or_else(|| panic!("{} never finished", dep));
            assert!(finished < started, "{} started before {} finished", id, dep);

            let dep_record = report.action(dep).unwrap();
            assert!(dep_record.finished_at.unwrap() <= record.started_at.unwrap());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_dependents_never_start_before_dependencies_complete(
        edges in vec(weighted(0.2), SIZE * SIZE),
        delays in vec(0u64..8, SIZE),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (plan, handler) = random_plan(&edges, &delays);
        runtime.block_on(assert_dependency_order(plan, handler));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound_is_respected() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ActionHandler for Gauge {
        async fn execute(&self, _params: &serde_json::Value) -> HandlerOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            HandlerOutcome::Success(serde_json::Value::Null)
        }

        async fn rollback(
            &self,
            _params: &serde_json::Value,
            _prior: Option<&serde_json::Value>,
        ) -> RollbackOutcome {
            RollbackOutcome::Success
        }
    }

    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut plan = Plan::new("wide");
    for i in 0..20 {
        plan = plan.with_action(ActionDefinition::new(format!("w{:02}", i), "Gauge"));
    }

    let registry = HandlerRegistry::new().with_handler("Gauge", gauge.clone());
    let executor = Executor::new(Arc::new(InMemoryStateStore::new()), registry)
        .with_config(fast_config().with_max_concurrency(3));

    let report = executor.invoke(Uuid::new_v4(), &plan).await.unwrap();

    assert!(report.is_success());
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
}
