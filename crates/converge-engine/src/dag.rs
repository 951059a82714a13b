//! Directed acyclic graph used for resource dependencies.
//!
//! An edge `from -> to` reads "`from` requires `to`": `to` must complete
//! before `from` may be dispatched. Under that convention:
//!
//! - **leaves** (no outgoing edges) require nothing and are dispatched first
//! - **roots** (no incoming edges) are required by nothing and finish last
//!
//! The same structure serves template-level graphs keyed by resource name
//! and convergence graphs keyed by [`GraphKey`](crate::graph::GraphKey).
//!
//! **Note:** This module is internal to `converge-engine` to preserve freedom
//! to change internals.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph for dependency management.
///
/// All query results are ordered by node insertion order, so the graph is
/// deterministic given a deterministic construction sequence.
#[derive(Debug, Clone)]
pub(crate) struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    /// Insertion position of each node, used for deterministic ordering.
    position: HashMap<NodeIndex, usize>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            position: HashMap::new(),
        }
    }

    /// Returns the number of nodes in the DAG.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the DAG.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns true if the DAG has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Adds a node to the DAG.
    ///
    /// If the node already exists, this is a no-op returning its index.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.position.insert(idx, self.position.len());
        idx
    }

    /// Records that `requirer` requires `required`, adding both nodes as needed.
    ///
    /// Duplicate edges are ignored.
    pub fn add_requirement(&mut self, requirer: T, required: T) {
        let from = self.add_node(requirer);
        let to = self.add_node(required);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    /// Returns true if the node exists in the DAG.
    #[must_use]
    pub fn contains(&self, node: &T) -> bool {
        self.index_map.contains_key(node)
    }

    /// Returns all nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<T> {
        self.sorted_values(self.graph.node_indices())
    }

    /// Returns all `(requirer, required)` edges, ordered by requirer then required
    /// insertion position.
    #[must_use]
    pub fn edges(&self) -> Vec<(T, T)> {
        let mut edges: Vec<(usize, usize, NodeIndex, NodeIndex)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.position_of(e.source()),
                    self.position_of(e.target()),
                    e.source(),
                    e.target(),
                )
            })
            .collect();
        edges.sort_unstable_by_key(|&(from, to, _, _)| (from, to));
        edges
            .into_iter()
            .filter_map(|(_, _, from, to)| {
                let requirer = self.graph.node_weight(from)?.clone();
                let required = self.graph.node_weight(to)?.clone();
                Some((requirer, required))
            })
            .collect()
    }

    /// Returns the nodes that `node` requires (its outgoing neighbours).
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not in the graph.
    pub fn requirements(&self, node: &T) -> Result<Vec<T>> {
        let idx = self.index_of(node)?;
        Ok(self.sorted_values(self.graph.neighbors_directed(idx, Direction::Outgoing)))
    }

    /// Returns the nodes that require `node` (its incoming neighbours).
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not in the graph.
    pub fn required_by(&self, node: &T) -> Result<Vec<T>> {
        let idx = self.index_of(node)?;
        Ok(self.sorted_values(self.graph.neighbors_directed(idx, Direction::Incoming)))
    }

    /// Returns all nodes that require nothing (no outgoing edges).
    #[must_use]
    pub fn leaves(&self) -> Vec<T> {
        self.sorted_values(self.graph.node_indices().filter(|&idx| {
            self.graph
                .neighbors_directed(idx, Direction::Outgoing)
                .next()
                .is_none()
        }))
    }

    /// Returns all nodes that nothing requires (no incoming edges).
    #[must_use]
    pub fn roots(&self) -> Vec<T> {
        self.sorted_values(self.graph.node_indices().filter(|&idx| {
            self.graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_none()
        }))
    }

    /// Returns nodes in dispatch order: every node appears after all of its
    /// requirements.
    ///
    /// Uses Kahn's algorithm over reversed edges with insertion-order
    /// tie-breaking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the graph contains a cycle.
    pub fn dispatch_order(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        // Out-degree = number of unmet requirements.
        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let count = self
                    .graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .count();
                (idx, count)
            })
            .collect();

        let mut ready: Vec<NodeIndex> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&idx, _)| idx)
            .collect();
        ready.sort_unstable_by_key(|&idx| self.position_of(idx));
        let mut queue: VecDeque<NodeIndex> = ready.into();

        let mut result = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            let node = self
                .graph
                .node_weight(idx)
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: format!("index {}", idx.index()),
                })?
                .clone();
            result.push(node);

            let mut requirers: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .collect();
            requirers.sort_unstable_by_key(|&n| self.position_of(n));
            requirers.dedup();

            for requirer in requirers {
                if let Some(count) = pending.get_mut(&requirer) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        queue.push_back(requirer);
                    }
                }
            }
        }

        if result.len() != node_count {
            let mut stuck: Vec<NodeIndex> = pending
                .iter()
                .filter(|&(_, &count)| count > 0)
                .map(|(&idx, _)| idx)
                .collect();
            stuck.sort_unstable_by_key(|&idx| self.position_of(idx));
            return Err(Error::CycleDetected {
                cycle: stuck
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx))
                    .map(ToString::to_string)
                    .collect(),
            });
        }

        Ok(result)
    }

    fn index_of(&self, node: &T) -> Result<NodeIndex> {
        self.index_map
            .get(node)
            .copied()
            .ok_or_else(|| Error::DagNodeNotFound {
                node: node.to_string(),
            })
    }

    fn position_of(&self, idx: NodeIndex) -> usize {
        self.position.get(&idx).copied().unwrap_or(usize::MAX)
    }

    fn sorted_values(&self, indices: impl Iterator<Item = NodeIndex>) -> Vec<T> {
        let mut indices: Vec<NodeIndex> = indices.collect();
        indices.sort_unstable_by_key(|&idx| self.position_of(idx));
        indices.dedup();
        indices
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for &(from, to) in edges {
            dag.add_requirement(from.to_string(), to.to_string());
        }
        dag
    }

    #[test]
    fn empty_dag_has_no_nodes() {
        let dag: Dag<String> = Dag::new();
        assert!(dag.is_empty());
        assert!(dag.dispatch_order().unwrap().is_empty());
        assert!(dag.leaves().is_empty());
    }

    #[test]
    fn isolated_node_is_both_leaf_and_root() {
        let mut dag: Dag<String> = Dag::new();
        dag.add_node("a".into());
        assert_eq!(dag.leaves(), vec!["a".to_string()]);
        assert_eq!(dag.roots(), vec!["a".to_string()]);
    }

    #[test]
    fn leaves_require_nothing() {
        // a and b require c; c requires d and e
        let dag = dag(&[("a", "c"), ("b", "c"), ("c", "d"), ("c", "e")]);
        assert_eq!(dag.leaves(), vec!["d".to_string(), "e".to_string()]);
        assert_eq!(dag.roots(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dispatch_order_puts_requirements_first() {
        let dag = dag(&[("a", "c"), ("b", "c"), ("c", "d"), ("c", "e")]);
        let order = dag.dispatch_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("d") < pos("c"));
        assert!(pos("e") < pos("c"));
        assert!(pos("c") < pos("a"));
        assert!(pos("c") < pos("b"));
    }

    #[test]
    fn dag_detects_cycle() {
        let dag = dag(&[("a", "b"), ("b", "a")]);
        let result = dag.dispatch_order();
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn requirements_and_required_by_are_ordered() {
        let dag = dag(&[("a", "c"), ("b", "c"), ("a", "d")]);
        assert_eq!(
            dag.requirements(&"a".to_string()).unwrap(),
            vec!["c".to_string(), "d".to_string()]
        );
        assert_eq!(
            dag.required_by(&"c".to_string()).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn unknown_node_lookup_fails() {
        let dag = dag(&[("a", "b")]);
        assert!(matches!(
            dag.requirements(&"zzz".to_string()),
            Err(Error::DagNodeNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let dag = dag(&[("a", "b"), ("a", "b")]);
        assert_eq!(dag.edge_count(), 1);
    }

    #[test]
    fn edges_are_deterministic() {
        let one = dag(&[("a", "c"), ("b", "c"), ("c", "d")]);
        let two = dag(&[("a", "c"), ("b", "c"), ("c", "d")]);
        assert_eq!(one.edges(), two.edges());
        assert_eq!(one.edges().len(), 3);
    }
}
