//! DependencyGraph - validated DAG of actions.
//!
//! The graph is pure topology: it knows which action waits for which, but
//! holds no execution state. Readiness is computed from a status map that
//! the caller reads from the state store, so the same graph can be rebuilt
//! from the plan on every invocation and fed whatever the store says.
//!
//! # Representation
//!
//! Bidirectional adjacency lists, as in the Exercise 8.3.6 scheduling DAG:
//! - `dependencies`: actions that must complete first (incoming edges)
//! - `dependents`: actions waiting on this one (outgoing edges)

use super::error::{GraphError, GraphResult};
use super::ActionId;
use crate::core::ActionStatus;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// A node in the graph.
#[derive(Debug, Clone)]
pub struct ActionNode {
    id: ActionId,
    dependencies: Vec<ActionId>,
    dependents: Vec<ActionId>,
}

impl ActionNode {
    fn new(id: ActionId) -> Self {
        Self {
            id,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    pub fn id(&self) -> &ActionId {
        &self.id
    }

    pub fn dependencies(&self) -> &[ActionId] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[ActionId] {
        &self.dependents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A validated, acyclic dependency graph.
///
/// Only [`DependencyGraph::build`] produces one, so every instance has
/// known dependency targets and no cycles.
///
/// # Example
///
/// ```
/// use actiongraph::{ActionId, ActionStatus, DependencyGraph};
/// use std::collections::BTreeMap;
///
/// let graph = DependencyGraph::build(
///     vec![ActionId::new("a"), ActionId::new("b")],
///     vec![(ActionId::new("b"), ActionId::new("a"))],
/// )
/// .unwrap();
///
/// let mut statuses = BTreeMap::new();
/// statuses.insert(ActionId::new("a"), ActionStatus::Pending);
/// statuses.insert(ActionId::new("b"), ActionStatus::Pending);
/// assert_eq!(graph.ready_actions(&statuses), vec![ActionId::new("a")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<ActionId, ActionNode>,
    /// Insertion order for deterministic iteration
    insertion_order: Vec<ActionId>,
}

impl DependencyGraph {
    /// Builds and validates a graph.
    ///
    /// Each edge is `(action, dependency)`: `dependency` must complete before
    /// `action` may run. Duplicate edges are ignored. An empty action set is
    /// a valid, trivially complete graph.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateAction`] if two actions share an id
    /// - [`GraphError::UnknownDependency`] if an edge names an id not in `actions`
    /// - [`GraphError::CycleDetected`] if the edges form a cycle (self-loops included)
    pub fn build<A, E>(actions: A, edges: E) -> GraphResult<Self>
    where
        A: IntoIterator<Item = ActionId>,
        E: IntoIterator<Item = (ActionId, ActionId)>,
    {
        let mut graph = Self::default();

        for id in actions {
            graph.add_action(id)?;
        }
        for (action, dependency) in edges {
            graph.add_dependency(action, dependency)?;
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::cycle(cycle));
        }

        Ok(graph)
    }

    fn add_action(&mut self, id: ActionId) -> GraphResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::duplicate_action(id));
        }

        self.insertion_order.push(id.clone());
        self.nodes.insert(id.clone(), ActionNode::new(id));
        Ok(())
    }

    fn add_dependency(&mut self, action: ActionId, dependency: ActionId) -> GraphResult<()> {
        if !self.nodes.contains_key(&action) {
            return Err(GraphError::action_not_found(action));
        }
        if !self.nodes.contains_key(&dependency) {
            return Err(GraphError::unknown_dependency(action, dependency.as_str()));
        }

        if let Some(node) = self.nodes.get_mut(&action) {
            if node.dependencies.contains(&dependency) {
                return Ok(());
            }
            node.dependencies.push(dependency.clone());
        }
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.dependents.push(action);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &ActionId) -> Option<&ActionNode> {
        self.nodes.get(id)
    }

    /// Action ids in the order they were added.
    pub fn action_ids(&self) -> impl Iterator<Item = &ActionId> {
        self.insertion_order.iter()
    }

    pub fn dependencies_of(&self, id: &ActionId) -> Option<&[ActionId]> {
        self.nodes.get(id).map(|n| n.dependencies.as_slice())
    }

    pub fn dependents_of(&self, id: &ActionId) -> Option<&[ActionId]> {
        self.nodes.get(id).map(|n| n.dependents.as_slice())
    }

    /// Actions whose own status is `Pending` and whose dependencies are all
    /// `Complete`, sorted by id ascending.
    ///
    /// An action with no entry in `statuses` is never ready, and a dependency
    /// with no entry counts as not complete.
    pub fn ready_actions(&self, statuses: &BTreeMap<ActionId, ActionStatus>) -> Vec<ActionId> {
        let mut ready: Vec<ActionId> = self
            .nodes
            .values()
            .filter(|node| statuses.get(&node.id) == Some(&ActionStatus::Pending))
            .filter(|node| self.dependencies_complete(&node.id, statuses))
            .map(|node| node.id.clone())
            .collect();

        ready.sort();
        ready
    }

    /// Returns true if every dependency of `id` is `Complete` in `statuses`.
    pub fn dependencies_complete(
        &self,
        id: &ActionId,
        statuses: &BTreeMap<ActionId, ActionStatus>,
    ) -> bool {
        self.nodes.get(id).is_some_and(|node| {
            node.dependencies
                .iter()
                .all(|dep| statuses.get(dep) == Some(&ActionStatus::Complete))
        })
    }

    /// Finds a cycle using white/gray/black DFS.
    ///
    /// Traversal follows dependency -> dependent edges from roots in id
    /// order, so the reported cycle is deterministic. The first participant
    /// is repeated at the end of the returned path.
    fn find_cycle(&self) -> Option<Vec<ActionId>> {
        let mut color: HashMap<&ActionId, Color> =
            self.nodes.keys().map(|id| (id, Color::White)).collect();
        let mut stack: Vec<&ActionId> = Vec::new();

        let mut ids: Vec<&ActionId> = self.nodes.keys().collect();
        ids.sort();

        for id in ids {
            if color.get(id) == Some(&Color::White) {
                if let Some(cycle) = self.visit(id, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a ActionId,
        color: &mut HashMap<&'a ActionId, Color>,
        stack: &mut Vec<&'a ActionId>,
    ) -> Option<Vec<ActionId>> {
        color.insert(id, Color::Gray);
        stack.push(id);

        if let Some(node) = self.nodes.get(id) {
            let mut next: Vec<&ActionId> = node.dependents.iter().collect();
            next.sort();

            for successor in next {
                match color.get(successor).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        // back edge: the cycle is the stack from `successor` up
                        let start = stack.iter().position(|s| *s == successor).unwrap_or(0);
                        let mut cycle: Vec<ActionId> =
                            stack[start..].iter().map(|s| (*s).clone()).collect();
                        cycle.push(successor.clone());
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = self.visit(successor, color, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        color.insert(id, Color::Black);
        None
    }

    /// Kahn's algorithm; among actions available at the same time the
    /// smallest id goes first.
    pub fn topological_order(&self) -> Vec<ActionId> {
        let mut remaining: HashMap<&ActionId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.dependencies.len()))
            .collect();

        let mut queue: BinaryHeap<Reverse<&ActionId>> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = queue.pop() {
            order.push(id.clone());
            if let Some(node) = self.nodes.get(id) {
                for dependent in &node.dependents {
                    if let Some(degree) = remaining.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(Reverse(dependent));
                        }
                    }
                }
            }
        }

        order
    }

    /// Reverse topological order: every action comes before all of its
    /// dependencies. Among actions available at the same time the one with
    /// the greatest `key` goes first, then the greatest id.
    ///
    /// The rollback sweep passes each action's completion time as the key,
    /// so independent branches unwind latest-finished first.
    pub fn reverse_topological_order_by<K, F>(&self, key: F) -> Vec<ActionId>
    where
        K: Ord,
        F: Fn(&ActionId) -> K,
    {
        let mut remaining: HashMap<&ActionId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.dependents.len()))
            .collect();

        let mut queue: BinaryHeap<(K, &ActionId)> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| (key(id), *id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, id)) = queue.pop() {
            order.push(id.clone());
            if let Some(node) = self.nodes.get(id) {
                for dependency in &node.dependencies {
                    if let Some(degree) = remaining.get_mut(dependency) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push((key(dependency), dependency));
                        }
                    }
                }
            }
        }

        order
    }

    /// Renders the graph as Graphviz DOT, edges pointing from a dependency
    /// to its dependent.
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraph<&str, &str> = DiGraph::new();
        let mut index = HashMap::new();

        for id in &self.insertion_order {
            index.insert(id, graph.add_node(id.as_str()));
        }
        for id in &self.insertion_order {
            if let Some(node) = self.nodes.get(id) {
                for dependency in &node.dependencies {
                    if let (Some(&from), Some(&to)) = (index.get(dependency), index.get(id)) {
                        graph.add_edge(from, to, "");
                    }
                }
            }
        }

        format!("{}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}
