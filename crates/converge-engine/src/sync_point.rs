//! Sync points: per-node join barriers.
//!
//! Every node of a traversal, plus the stack itself, has a sync point keyed by
//! `(entity, traversal, is_update)`. Each completed predecessor merges its
//! output into the point's `input_data` under its own [`GraphKey`]; once every
//! predecessor has reported, the node is ready to dispatch.
//!
//! Merges are compare-and-swap writes on `atomic_key`. A predecessor that
//! loses the race re-reads and retries through
//! [`retry_on_conflict`](converge_core::retry::retry_on_conflict), so no
//! contribution is lost and concurrent merges never overwrite each other.
//!
//! Redelivery of a predecessor that is already recorded is a no-op and never
//! reports the node as newly satisfied, so a node is dispatched at most once
//! per traversal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::retry::{Attempt, RetryPolicy, retry_on_conflict};
use converge_core::{ResourceId, StackId, TraversalId};

use crate::error::{Error, Result};
use crate::graph::GraphKey;
use crate::metrics::EngineMetrics;
use crate::store::Store;

/// The entity a sync point gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    /// A resource node.
    Resource(ResourceId),
    /// The stack's own completion barrier.
    Stack(StackId),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "resource:{id}"),
            Self::Stack(id) => write!(f, "stack:{id}"),
        }
    }
}

/// Identity of a sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncPointKey {
    /// What the sync point gates.
    pub entity: EntityId,
    /// The traversal it belongs to.
    pub traversal_id: TraversalId,
    /// Direction of the gated node; `true` for the stack barrier.
    pub is_update: bool,
}

impl SyncPointKey {
    /// Key of the sync point gating a graph node.
    #[must_use]
    pub const fn for_node(key: GraphKey, traversal_id: TraversalId) -> Self {
        Self {
            entity: EntityId::Resource(key.resource_id),
            traversal_id,
            is_update: key.is_update,
        }
    }

    /// Key of the stack's completion barrier.
    #[must_use]
    pub const fn for_stack(stack_id: StackId, traversal_id: TraversalId) -> Self {
        Self {
            entity: EntityId::Stack(stack_id),
            traversal_id,
            is_update: true,
        }
    }
}

impl fmt::Display for SyncPointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_update { "update" } else { "cleanup" };
        write!(f, "{}@{}/{kind}", self.entity, self.traversal_id)
    }
}

/// Predecessor outputs accumulated at a sync point, keyed by sender.
///
/// Serialized as a list of `[sender, data]` pairs, because JSON object keys
/// cannot hold a [`GraphKey`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "Vec<(GraphKey, Value)>",
    into = "Vec<(GraphKey, Value)>"
)]
pub struct InputData(BTreeMap<GraphKey, Value>);

impl InputData {
    /// Creates empty input data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sender`'s contribution, keeping any earlier one.
    ///
    /// Returns false if `sender` had already contributed.
    pub fn merge(&mut self, sender: GraphKey, data: Value) -> bool {
        if self.0.contains_key(&sender) {
            return false;
        }
        self.0.insert(sender, data);
        true
    }

    /// Returns true if `sender` has contributed.
    #[must_use]
    pub fn contains(&self, sender: &GraphKey) -> bool {
        self.0.contains_key(sender)
    }

    /// The contribution of `sender`.
    #[must_use]
    pub fn get(&self, sender: &GraphKey) -> Option<&Value> {
        self.0.get(sender)
    }

    /// Number of contributions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing has been contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Senders that have contributed.
    pub fn senders(&self) -> impl Iterator<Item = &GraphKey> {
        self.0.keys()
    }

    /// Contributions in sender order.
    pub fn iter(&self) -> impl Iterator<Item = (&GraphKey, &Value)> {
        self.0.iter()
    }

    /// Returns true once every predecessor has contributed.
    #[must_use]
    pub fn satisfies(&self, predecessors: &BTreeSet<GraphKey>) -> bool {
        predecessors.iter().all(|p| self.0.contains_key(p))
    }
}

impl From<Vec<(GraphKey, Value)>> for InputData {
    fn from(pairs: Vec<(GraphKey, Value)>) -> Self {
        Self(pairs.into_iter().collect())
    }
}

impl From<InputData> for Vec<(GraphKey, Value)> {
    fn from(data: InputData) -> Self {
        data.0.into_iter().collect()
    }
}

impl FromIterator<(GraphKey, Value)> for InputData {
    fn from_iter<I: IntoIterator<Item = (GraphKey, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A persisted sync point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Identity.
    pub key: SyncPointKey,
    /// Owning stack.
    pub stack_id: StackId,
    /// Optimistic concurrency counter; bumped on every merge.
    pub atomic_key: u64,
    /// Contributions received so far.
    pub input_data: InputData,
}

impl SyncPoint {
    /// Creates an unsaved sync point.
    #[must_use]
    pub const fn new(key: SyncPointKey, stack_id: StackId, input_data: InputData) -> Self {
        Self {
            key,
            stack_id,
            atomic_key: 0,
            input_data,
        }
    }
}

/// Outcome of a single merge attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The contribution was written.
    Applied {
        /// The sync point's new atomic key.
        atomic_key: u64,
        /// Whether every predecessor has now contributed.
        satisfied: bool,
        /// Whether this write is the one that completed the set.
        newly_satisfied: bool,
        /// The merged input data.
        input_data: InputData,
    },
    /// The sender had already contributed; nothing was written.
    Duplicate {
        /// Whether every predecessor has contributed.
        satisfied: bool,
    },
    /// Another writer changed the sync point since it was read.
    Conflict,
}

/// Sync point operations over a [`Store`].
#[derive(Clone)]
pub struct SyncPoints {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    metrics: EngineMetrics,
}

impl fmt::Debug for SyncPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoints")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SyncPoints {
    /// Creates the service with the given retry budget for contended merges.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            metrics: EngineMetrics::new(),
        }
    }

    /// Persists a fresh sync point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncPointExists`] if the key is already taken, or a
    /// storage error.
    pub async fn create(
        &self,
        stack_id: StackId,
        key: SyncPointKey,
        input_data: InputData,
    ) -> Result<SyncPoint> {
        let point = SyncPoint::new(key, stack_id, input_data);
        if !self.store.create_sync_point(&point).await? {
            return Err(Error::SyncPointExists {
                key: key.to_string(),
            });
        }
        Ok(point)
    }

    /// Gets a sync point by key.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_by_key(&self, key: &SyncPointKey) -> Result<Option<SyncPoint>> {
        self.store.get_sync_point(key).await
    }

    /// Merges one predecessor's contribution if the stored `atomic_key` still
    /// equals `atomic_key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncPointNotFound`] if the sync point does not exist,
    /// or a storage error.
    pub async fn update_input_data(
        &self,
        key: &SyncPointKey,
        atomic_key: u64,
        sender: GraphKey,
        data: Value,
        predecessors: &BTreeSet<GraphKey>,
    ) -> Result<MergeOutcome> {
        let Some(point) = self.store.get_sync_point(key).await? else {
            return Err(Error::SyncPointNotFound {
                key: key.to_string(),
            });
        };
        if point.atomic_key != atomic_key {
            return Ok(MergeOutcome::Conflict);
        }

        let was_satisfied = point.input_data.satisfies(predecessors);
        let mut input_data = point.input_data;
        if !input_data.merge(sender, data) {
            return Ok(MergeOutcome::Duplicate {
                satisfied: was_satisfied,
            });
        }

        if !self
            .store
            .update_input_data(key, atomic_key, &input_data)
            .await?
        {
            return Ok(MergeOutcome::Conflict);
        }

        let satisfied = input_data.satisfies(predecessors);
        Ok(MergeOutcome::Applied {
            atomic_key: atomic_key + 1,
            satisfied,
            newly_satisfied: satisfied && !was_satisfied,
            input_data,
        })
    }

    /// Merges `sender`'s output into the sync point, retrying lost races.
    ///
    /// Returns the full input data when this call is the one that satisfied
    /// the sync point, and `None` otherwise (still waiting, or redelivery).
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncPointNotFound`] if the sync point does not exist,
    /// [`Error::SyncPointUpdateFailed`] when the retry budget is spent, or a
    /// storage error.
    pub async fn sync(
        &self,
        key: &SyncPointKey,
        predecessors: &BTreeSet<GraphKey>,
        sender: GraphKey,
        data: &Value,
    ) -> Result<Option<InputData>> {
        let policy = self.policy.scaled_for(predecessors.len());
        let result = retry_on_conflict(&policy, || async move {
            let Some(point) = self.store.get_sync_point(key).await? else {
                return Err(Error::SyncPointNotFound {
                    key: key.to_string(),
                });
            };
            let outcome = self
                .update_input_data(key, point.atomic_key, sender, data.clone(), predecessors)
                .await?;
            Ok(match outcome {
                MergeOutcome::Applied {
                    newly_satisfied: true,
                    input_data,
                    ..
                } => Attempt::Done(Some(input_data)),
                MergeOutcome::Applied { .. } | MergeOutcome::Duplicate { .. } => {
                    Attempt::Done(None)
                }
                MergeOutcome::Conflict => {
                    self.metrics.record_sync_conflict();
                    Attempt::Conflict
                }
            })
        })
        .await;

        match result {
            Err(Error::Core(converge_core::Error::RetriesExhausted { attempts })) => {
                Err(Error::SyncPointUpdateFailed {
                    key: key.to_string(),
                    attempts,
                })
            }
            other => other,
        }
    }

    /// Deletes every sync point of `stack_id` for `traversal_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delete_all_by_stack_and_traversal(
        &self,
        stack_id: &StackId,
        traversal_id: &TraversalId,
    ) -> Result<usize> {
        self.store
            .delete_all_by_stack_and_traversal(stack_id, traversal_id)
            .await
    }
}
