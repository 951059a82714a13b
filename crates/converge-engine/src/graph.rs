//! Convergence dependency graphs.
//!
//! A [`GraphKey`] is the unit of dispatch: a resource row paired with the
//! direction of work. `is_update = true` means "bring this resource to the
//! desired state"; `is_update = false` means "clean up this row's previous
//! incarnation".
//!
//! [`Dependencies`] stores "requirer requires required" edges between keys and
//! round-trips through the persisted form
//! `{"edges": [[[id, is_update], [id, is_update] | null], ...]}`, where a
//! `null` second element marks a node with no requirements.

use std::fmt;

use serde::{Deserialize, Serialize};

use converge_core::ResourceId;

use crate::dag::Dag;
use crate::error::{Error, Result};

/// A node in the convergence graph: `(resource id, is_update)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "(ResourceId, bool)", from = "(ResourceId, bool)")]
pub struct GraphKey {
    /// The resource row this node acts on.
    pub resource_id: ResourceId,
    /// True for update (create/update/action) work, false for cleanup.
    pub is_update: bool,
}

impl GraphKey {
    /// Creates an update node for the given resource.
    #[must_use]
    pub const fn update(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            is_update: true,
        }
    }

    /// Creates a cleanup node for the given resource.
    #[must_use]
    pub const fn cleanup(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            is_update: false,
        }
    }

    /// Returns the same resource with the given direction.
    #[must_use]
    pub const fn with_direction(self, is_update: bool) -> Self {
        Self {
            resource_id: self.resource_id,
            is_update,
        }
    }
}

impl fmt::Display for GraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_update { "update" } else { "cleanup" };
        write!(f, "{}/{kind}", self.resource_id)
    }
}

impl From<GraphKey> for (ResourceId, bool) {
    fn from(key: GraphKey) -> Self {
        (key.resource_id, key.is_update)
    }
}

impl From<(ResourceId, bool)> for GraphKey {
    fn from((resource_id, is_update): (ResourceId, bool)) -> Self {
        Self {
            resource_id,
            is_update,
        }
    }
}

/// Persisted form of a convergence graph, stored on the stack row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDeps {
    /// `(requirer, required)` pairs; `None` marks a node with no requirements.
    pub edges: Vec<(GraphKey, Option<GraphKey>)>,
}

impl PersistedDeps {
    /// Returns true when the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Serializes to the canonical JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the canonical JSON representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptGraph`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::CorruptGraph {
            message: format!("unparseable current_deps: {e}"),
        })
    }
}

/// The dependency graph of one traversal.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    dag: Dag<GraphKey>,
}

impl Dependencies {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no requirements (no-op if present).
    pub fn add_node(&mut self, key: GraphKey) {
        self.dag.add_node(key);
    }

    /// Records that `requirer` must wait for `required`.
    pub fn add_requirement(&mut self, requirer: GraphKey, required: GraphKey) {
        self.dag.add_requirement(requirer, required);
    }

    /// Returns true when the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dag.is_empty()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    /// Returns true if the key is a node of this graph.
    #[must_use]
    pub fn contains(&self, key: &GraphKey) -> bool {
        self.dag.contains(key)
    }

    /// All nodes in construction order.
    #[must_use]
    pub fn nodes(&self) -> Vec<GraphKey> {
        self.dag.nodes()
    }

    /// All `(requirer, required)` edges, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(GraphKey, GraphKey)> {
        let mut edges = self.dag.edges();
        edges.sort_unstable();
        edges
    }

    /// Nodes that require nothing; the first to be dispatched.
    ///
    /// Cleanup nodes come before update nodes, otherwise construction order.
    #[must_use]
    pub fn leaves(&self) -> Vec<GraphKey> {
        let mut leaves = self.dag.leaves();
        leaves.sort_by_key(|key| key.is_update);
        leaves
    }

    /// Nodes required by nothing; the stack completes when all of them have.
    #[must_use]
    pub fn roots(&self) -> Vec<GraphKey> {
        self.dag.roots()
    }

    /// The predecessors of `key`: everything it must wait for.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not in the graph.
    pub fn requires(&self, key: &GraphKey) -> Result<Vec<GraphKey>> {
        self.dag.requirements(key)
    }

    /// The successors of `key`: everything waiting for it.
    ///
    /// Cleanup nodes come before update nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not in the graph.
    pub fn required_by(&self, key: &GraphKey) -> Result<Vec<GraphKey>> {
        let mut successors = self.dag.required_by(key)?;
        successors.sort_by_key(|key| key.is_update);
        Ok(successors)
    }

    /// Verifies the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] naming the stuck nodes.
    pub fn validate(&self) -> Result<()> {
        self.dag.dispatch_order().map(|_| ())
    }

    /// Converts to the persisted edge list (canonically sorted).
    #[must_use]
    pub fn to_persisted(&self) -> PersistedDeps {
        let mut edges: Vec<(GraphKey, Option<GraphKey>)> = Vec::new();
        for node in self.dag.nodes() {
            let requirements = self.dag.requirements(&node).unwrap_or_default();
            if requirements.is_empty() {
                edges.push((node, None));
            } else {
                edges.extend(requirements.into_iter().map(|req| (node, Some(req))));
            }
        }
        edges.sort_unstable();
        PersistedDeps { edges }
    }

    /// Rebuilds a graph from its persisted edge list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptGraph`] if the edges describe a cycle.
    pub fn from_persisted(persisted: &PersistedDeps) -> Result<Self> {
        let mut deps = Self::new();
        for &(requirer, required) in &persisted.edges {
            match required {
                Some(required) => deps.add_requirement(requirer, required),
                None => deps.add_node(requirer),
            }
        }
        deps.validate().map_err(|e| Error::CorruptGraph {
            message: e.to_string(),
        })?;
        Ok(deps)
    }
}
