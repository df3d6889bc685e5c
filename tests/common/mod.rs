//! Shared fixtures for the integration tests.
//!
//! `Scripted` is a handler whose behaviour is set per action id, and which
//! records every call it receives in one global order. Each action carries
//! its own id in `params["id"]` so the handler can tell them apart.

#![allow(dead_code)]

use actiongraph::prelude::*;
use actiongraph::{ActionRecord, RunState};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const SCRIPTED: &str = "Test::Scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute(String),
    /// Execute returned success.
    Finished(String),
    Rollback(String),
}

#[derive(Default)]
pub struct Scripted {
    calls: Mutex<Vec<Call>>,
    outcomes: Mutex<HashMap<String, VecDeque<HandlerOutcome>>>,
    failing_rollbacks: HashSet<String>,
    panics: HashSet<String>,
    delays: HashMap<String, Duration>,
    rollback_delays: HashMap<String, Duration>,
    cancel_after: Option<(String, CancellationToken)>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for `id`; once they run out, execute succeeds.
    pub fn script(self, id: &str, outcomes: Vec<HandlerOutcome>) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(id.to_string(), outcomes.into());
        self
    }

    pub fn fail_rollback(mut self, id: &str) -> Self {
        self.failing_rollbacks.insert(id.to_string());
        self
    }

    pub fn panic_on(mut self, id: &str) -> Self {
        self.panics.insert(id.to_string());
        self
    }

    pub fn delay(mut self, id: &str, delay: Duration) -> Self {
        self.delays.insert(id.to_string(), delay);
        self
    }

    pub fn rollback_delay(mut self, id: &str, delay: Duration) -> Self {
        self.rollback_delays.insert(id.to_string(), delay);
        self
    }

    /// Cancels `token` once `id` has executed successfully.
    pub fn cancel_after(mut self, id: &str, token: CancellationToken) -> Self {
        self.cancel_after = Some((id.to_string(), token));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn executes(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == Call::Execute(id.to_string()))
            .count()
    }

    pub fn total_executes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Execute(_)))
            .count()
    }

    /// Ids whose rollback was called, in call order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Rollback(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn id_of(params: &Value) -> String {
    params["id"].as_str().unwrap_or_default().to_string()
}

#[async_trait]
impl ActionHandler for Scripted {
    async fn execute(&self, params: &Value) -> HandlerOutcome {
        let id = id_of(params);
        self.record(Call::Execute(id.clone()));

        if let Some(delay) = self.delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }
        if self.panics.contains(&id) {
            panic!("scripted panic in {}", id);
        }

        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(|queue| queue.pop_front());
        let outcome = scripted.unwrap_or_else(|| HandlerOutcome::Success(json!({"created": id})));

        if matches!(outcome, HandlerOutcome::Success(_)) {
            self.record(Call::Finished(id.clone()));
            if let Some((after, token)) = &self.cancel_after {
                if *after == id {
                    token.cancel();
                }
            }
        }
        outcome
    }

    async fn rollback(&self, params: &Value, prior_output: Option<&Value>) -> RollbackOutcome {
        let id = id_of(params);
        self.record(Call::Rollback(id.clone()));
        assert_eq!(prior_output, Some(&json!({"created": id})));

        if let Some(delay) = self.rollback_delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing_rollbacks.contains(&id) {
            RollbackOutcome::Fail(format!("{} refused to delete", id))
        } else {
            RollbackOutcome::Success
        }
    }
}

/// A scripted action depending on `deps`.
pub fn action(id: &str, deps: &[&str]) -> ActionDefinition {
    ActionDefinition::new(id, SCRIPTED)
        .with_params(json!({"id": id}))
        .depends_on(deps.iter().copied())
}

/// Millisecond backoff so retries do not slow the suite down.
pub fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_retry(
            RetryPolicy::with_max_attempts(3)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_poll_interval(Duration::from_millis(10))
}

pub fn executor(
    store: Arc<InMemoryStateStore>,
    handler: Arc<Scripted>,
    config: EngineConfig,
) -> Executor<InMemoryStateStore> {
    let registry = HandlerRegistry::with_builtins().with_handler(SCRIPTED, handler);
    Executor::new(store, registry).with_config(config)
}

pub fn record<'a>(report: &'a RunReport, id: &str) -> &'a ActionRecord {
    report
        .action(id)
        .unwrap_or_else(|| panic!("no record for {}", id))
}

pub async fn stored(store: &InMemoryStateStore, run_id: Uuid) -> RunState {
    store.get(run_id).await.unwrap().expect("run should exist")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
