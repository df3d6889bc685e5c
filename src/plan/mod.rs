//! Plan documents.
//!
//! A plan is the declarative input to an invocation: a named list of
//! actions, each with a type, opaque parameters and its ordering
//! constraints. Ordering can be declared from either side:
//!
//! - `depends_on`: actions that must complete before this one
//! - `before`: actions that must wait for this one
//!
//! Either list may contain `*` wildcards, matched against every other
//! action id in the plan.
//!
//! ```
//! use actiongraph::Plan;
//!
//! let plan = Plan::from_yaml(r#"
//! name: deploy
//! actions:
//!   - id: bucket
//!     type: System::NoOp
//!   - id: upload-site
//!     type: System::NoOp
//!     depends_on: [bucket]
//!   - id: upload-assets
//!     type: System::NoOp
//!     depends_on: [bucket]
//!   - id: invalidate-cache
//!     type: System::NoOp
//!     depends_on: ["upload-*"]
//! "#).unwrap();
//!
//! let graph = plan.graph().unwrap();
//! assert_eq!(graph.dependencies_of(&"invalidate-cache".into()).unwrap().len(), 2);
//! ```

use crate::core::{fingerprint, CoreError};
use crate::graph::{ActionId, DependencyGraph, GraphError, GraphResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One action as declared in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: ActionId,
    /// Selects the handler from the registry.
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
}

impl ActionDefinition {
    pub fn new(id: impl Into<ActionId>, action_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            params: Value::Null,
            depends_on: Vec::new(),
            before: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// A named set of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }

    pub fn from_json(document: &str) -> Result<Self, CoreError> {
        serde_json::from_str(document).map_err(CoreError::Deserialization)
    }

    pub fn from_yaml(document: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(document).map_err(CoreError::Yaml)
    }

    pub fn action(&self, id: &ActionId) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Distinct action types, sorted.
    pub fn action_types(&self) -> BTreeSet<&str> {
        self.actions.iter().map(|a| a.action_type.as_str()).collect()
    }

    /// Stable fingerprint of the plan's canonical JSON encoding.
    ///
    /// Stored with the run; a resumed invocation whose plan hashes
    /// differently is rejected.
    pub fn fingerprint(&self) -> Result<u64, CoreError> {
        let bytes = serde_json::to_vec(self).map_err(CoreError::Serialization)?;
        Ok(fingerprint(&bytes))
    }

    /// Expands references and builds the validated dependency graph.
    ///
    /// # Errors
    ///
    /// Any [`GraphError`]; a reference (literal or wildcard) that matches no
    /// action is reported as [`GraphError::UnknownDependency`].
    pub fn graph(&self) -> GraphResult<DependencyGraph> {
        let ids: Vec<ActionId> = self.actions.iter().map(|a| a.id.clone()).collect();
        let mut edges = Vec::new();

        for action in &self.actions {
            for reference in &action.depends_on {
                for dependency in resolve(&ids, &action.id, reference)? {
                    edges.push((action.id.clone(), dependency));
                }
            }
            for reference in &action.before {
                for dependent in resolve(&ids, &action.id, reference)? {
                    edges.push((dependent, action.id.clone()));
                }
            }
        }

        DependencyGraph::build(ids, edges)
    }
}

/// Resolves one reference from `owner` to the action ids it names.
fn resolve(ids: &[ActionId], owner: &ActionId, reference: &str) -> GraphResult<Vec<ActionId>> {
    if !reference.contains('*') {
        // literal self references are kept so the graph reports the cycle
        if ids.iter().any(|id| id.as_str() == reference) {
            return Ok(vec![ActionId::new(reference)]);
        }
        return Err(GraphError::unknown_dependency(owner.clone(), reference));
    }

    let pattern = wildcard_regex(reference)?;
    let matched: Vec<ActionId> = ids
        .iter()
        .filter(|id| *id != owner && pattern.is_match(id.as_str()))
        .cloned()
        .collect();

    if matched.is_empty() {
        return Err(GraphError::unknown_dependency(owner.clone(), reference));
    }
    Ok(matched)
}

fn wildcard_regex(reference: &str) -> GraphResult<Regex> {
    let body = reference
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| GraphError::invalid_plan(format!("bad pattern '{}': {}", reference, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(graph: &[ActionId]) -> Vec<&str> {
        graph.iter().map(ActionId::as_str).collect()
    }

    #[test]
    fn test_from_json() {
        let plan = Plan::from_json(
            r#"{
                "name": "stack",
                "actions": [
                    {"id": "vars", "type": "System::SetVariables", "params": {"Variables": {"env": "prod"}}},
                    {"id": "deploy", "type": "Deploy", "depends_on": ["vars"]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].params["Variables"]["env"], "prod");
        assert_eq!(plan.actions[1].params, Value::Null);
        assert_eq!(
            plan.action_types().into_iter().collect::<Vec<_>>(),
            vec!["Deploy", "System::SetVariables"]
        );
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(matches!(
            Plan::from_json("{\"name\": 3}"),
            Err(CoreError::Deserialization(_))
        ));
        assert!(matches!(
            Plan::from_yaml("name: [unterminated"),
            Err(CoreError::Yaml(_))
        ));
    }

    #[test]
    fn test_before_edges() {
        let plan = Plan::new("p")
            .with_action(ActionDefinition::new("migrate", "Db").before(["serve"]))
            .with_action(ActionDefinition::new("serve", "App"));

        let graph = plan.graph().unwrap();
        assert_eq!(
            ids(graph.dependencies_of(&"serve".into()).unwrap()),
            vec!["migrate"]
        );
    }

    #[test]
    fn test_wildcard_excludes_self() {
        let plan = Plan::new("p")
            .with_action(ActionDefinition::new("upload-a", "Upload"))
            .with_action(ActionDefinition::new("upload-b", "Upload"))
            .with_action(ActionDefinition::new("upload-all", "Upload").depends_on(["upload-*"]));

        let graph = plan.graph().unwrap();
        let mut deps = ids(graph.dependencies_of(&"upload-all".into()).unwrap());
        deps.sort();
        assert_eq!(deps, vec!["upload-a", "upload-b"]);
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let plan = Plan::new("p")
            .with_action(ActionDefinition::new("a.b", "T"))
            .with_action(ActionDefinition::new("axb", "T"))
            .with_action(ActionDefinition::new("last", "T").depends_on(["a.*"]));

        let graph = plan.graph().unwrap();
        assert_eq!(ids(graph.dependencies_of(&"last".into()).unwrap()), vec!["a.b"]);
    }

    #[test]
    fn test_unmatched_references_rejected() {
        let plan = Plan::new("p")
            .with_action(ActionDefinition::new("a", "T").depends_on(["nothing-*"]));
        assert!(matches!(
            plan.graph(),
            Err(GraphError::UnknownDependency { .. })
        ));

        let plan = Plan::new("p").with_action(ActionDefinition::new("a", "T").before(["ghost"]));
        assert_eq!(
            plan.graph().unwrap_err(),
            GraphError::unknown_dependency(ActionId::new("a"), "ghost")
        );
    }

    #[test]
    fn test_cycle_through_before_edges() {
        let plan = Plan::new("p")
            .with_action(ActionDefinition::new("a", "T").before(["b"]))
            .with_action(ActionDefinition::new("b", "T").before(["a"]));
        assert!(matches!(plan.graph(), Err(GraphError::CycleDetected { .. })));
    }

    #[test]
    fn test_fingerprint_changes_with_params() {
        let base = Plan::new("p").with_action(ActionDefinition::new("a", "T"));
        let changed = Plan::new("p")
            .with_action(ActionDefinition::new("a", "T").with_params(json!({"size": 2})));

        assert_eq!(base.fingerprint().unwrap(), base.clone().fingerprint().unwrap());
        assert_ne!(base.fingerprint().unwrap(), changed.fingerprint().unwrap());
    }
}
