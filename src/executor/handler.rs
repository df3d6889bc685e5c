//! Action handlers and the registry that maps action types to them.
//!
//! # Idempotency contract
//!
//! An action whose invocation was interrupted mid-attempt is re-executed by
//! a later invocation. The engine cannot tell whether the interrupted
//! `execute` already applied its side effect, so **`execute` must be
//! idempotent**: running it again for an action that already took effect
//! must succeed without applying the effect twice. Handlers that can query
//! the provider should also implement [`ActionHandler::check_status`] so a
//! reclaimed action can be settled without re-running it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The side effect was applied. The output is kept for rollback.
    Success(Value),
    /// The action will not succeed by retrying.
    Fail(String),
    /// Temporary failure; eligible for retry within the attempt budget.
    Transient(String),
}

/// Result of one `rollback` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Success,
    Fail(String),
}

/// What a handler knows about an action left `running` by an interrupted
/// invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusCheck {
    /// The side effect is in place; record the action complete.
    Complete(Value),
    /// The action failed for good.
    Failed(String),
    /// Cannot tell; re-execute the action.
    Unknown,
}

/// Capability that performs and compensates one type of action.
///
/// See the module documentation for the idempotency contract.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Applies the action's side effect.
    async fn execute(&self, params: &Value) -> HandlerOutcome;

    /// Compensates a completed action. `prior_output` is what `execute`
    /// returned.
    async fn rollback(&self, params: &Value, prior_output: Option<&Value>) -> RollbackOutcome;

    /// Asks the provider whether an interrupted action took effect.
    ///
    /// # Default Implementation
    ///
    /// Returns [`StatusCheck::Unknown`], so reclaimed actions are re-executed.
    async fn check_status(&self, params: &Value) -> StatusCheck {
        let _ = params;
        StatusCheck::Unknown
    }
}

#[async_trait]
impl<H: ActionHandler + ?Sized> ActionHandler for Arc<H> {
    async fn execute(&self, params: &Value) -> HandlerOutcome {
        (**self).execute(params).await
    }

    async fn rollback(&self, params: &Value, prior_output: Option<&Value>) -> RollbackOutcome {
        (**self).rollback(params, prior_output).await
    }

    async fn check_status(&self, params: &Value) -> StatusCheck {
        (**self).check_status(params).await
    }
}

#[async_trait]
impl ActionHandler for Box<dyn ActionHandler> {
    async fn execute(&self, params: &Value) -> HandlerOutcome {
        (**self).execute(params).await
    }

    async fn rollback(&self, params: &Value, prior_output: Option<&Value>) -> RollbackOutcome {
        (**self).rollback(params, prior_output).await
    }

    async fn check_status(&self, params: &Value) -> StatusCheck {
        (**self).check_status(params).await
    }
}

/// Type name of the built-in no-op handler.
pub const NO_OP: &str = "System::NoOp";

/// Type name of the built-in variable-setting handler.
pub const SET_VARIABLES: &str = "System::SetVariables";

/// Does nothing, successfully. Useful as a join point in a plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

#[async_trait]
impl ActionHandler for NoOpHandler {
    async fn execute(&self, _params: &Value) -> HandlerOutcome {
        HandlerOutcome::Success(Value::Null)
    }

    async fn rollback(&self, _params: &Value, _prior_output: Option<&Value>) -> RollbackOutcome {
        RollbackOutcome::Success
    }

    async fn check_status(&self, _params: &Value) -> StatusCheck {
        StatusCheck::Complete(Value::Null)
    }
}

/// Publishes its `Variables` parameter map as the action output.
///
/// The map is only recorded on the action's record. It is not substituted
/// into the parameters of later actions; each handler sees exactly the
/// params written in the plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetVariablesHandler;

impl SetVariablesHandler {
    fn variables(params: &Value) -> Result<Value, String> {
        match params.get("Variables") {
            Some(Value::Object(map)) => Ok(Value::Object(map.clone())),
            Some(_) => Err("Variables must be a map".to_string()),
            None => Err("missing required parameter: Variables".to_string()),
        }
    }
}

#[async_trait]
impl ActionHandler for SetVariablesHandler {
    async fn execute(&self, params: &Value) -> HandlerOutcome {
        match Self::variables(params) {
            Ok(vars) => HandlerOutcome::Success(vars),
            Err(reason) => HandlerOutcome::Fail(reason),
        }
    }

    async fn rollback(&self, _params: &Value, _prior_output: Option<&Value>) -> RollbackOutcome {
        RollbackOutcome::Success
    }

    async fn check_status(&self, params: &Value) -> StatusCheck {
        match Self::variables(params) {
            Ok(vars) => StatusCheck::Complete(vars),
            Err(reason) => StatusCheck::Failed(reason),
        }
    }
}

/// Handlers keyed by action type name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with [`NO_OP`] and [`SET_VARIABLES`] registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NO_OP, NoOpHandler);
        registry.register(SET_VARIABLES, SetVariablesHandler);
        registry
    }

    /// Registers `handler` for `action_type`, replacing any previous one.
    pub fn register<H>(&mut self, action_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: ActionHandler + 'static,
    {
        self.handlers.insert(action_type.into(), Arc::new(handler));
        self
    }

    /// Builder-style [`HandlerRegistry::register`].
    pub fn with_handler<H>(mut self, action_type: impl Into<String>, handler: H) -> Self
    where
        H: ActionHandler + 'static,
    {
        self.register(action_type, handler);
        self
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered type names, sorted.
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}
