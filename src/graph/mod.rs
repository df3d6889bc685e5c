//! Dependency graph of actions.
//!
//! This module hides the graph representation and exposes only what the
//! engine needs:
//!
//! - Validation at build time (unknown dependencies, duplicate ids, cycles)
//! - Deterministic readiness given a map of action statuses
//! - Topological and reverse-topological orders for dispatch and rollback
//! - DOT rendering for diagnostics
//!
//! # Algorithm References
//!
//! - Cycle detection: three-colour depth-first search
//! - Ordering: Kahn's algorithm (Tenenbaum et al., Exercise 8.3.7)

mod action_id;
mod dependency_graph;
mod error;

pub use action_id::ActionId;
pub use dependency_graph::{ActionNode, DependencyGraph};
pub use error::{GraphError, GraphResult};
