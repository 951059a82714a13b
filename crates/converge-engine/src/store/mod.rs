//! Pluggable persistence for convergence state.
//!
//! The engine consumes storage only through these traits. Each concern has
//! its own trait so a deployment can back them differently; [`Store`] bundles
//! them for convenience.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Stack rows are guarded by their current traversal,
//!   resource rows and sync points by a monotonic `atomic_key`
//! - **No held locks during writes**: Every write is individually atomic, so
//!   workers can report back after the stack lock was released
//! - **Testability**: [`memory::InMemoryStore`] implements every trait

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use converge_core::{EngineId, ResourceId, StackId, TemplateId, TraversalId};

use crate::error::Result;
use crate::resource::Resource;
use crate::stack::Stack;
use crate::sync_point::{InputData, SyncPoint, SyncPointKey};
use crate::template::Template;

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Write applied.
    Success,
    /// Row not found.
    NotFound,
    /// The stack's current traversal didn't match the expected one.
    TraversalMismatch {
        /// The traversal actually stored.
        actual: Option<TraversalId>,
    },
    /// The row's atomic key didn't match (concurrent modification).
    VersionConflict {
        /// The atomic key actually stored.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the write applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the row was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Outcome of stealing a stale stack lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealResult {
    /// The row still named the stale owner and now names us.
    Stolen,
    /// No row existed any more; the lock was released concurrently.
    Released,
    /// A different engine took the lock first.
    HeldBy(EngineId),
}

/// Outcome of releasing a stack lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    /// Our row was deleted.
    Released,
    /// There was no row owned by us.
    NotHeld,
}

/// Persistence for stack rows.
#[async_trait]
pub trait StackStore: Send + Sync {
    /// Gets a stack by ID.
    async fn get_stack(&self, stack_id: &StackId) -> Result<Option<Stack>>;

    /// Inserts a new stack row.
    ///
    /// Fails if a row with the same ID exists.
    async fn create_stack(&self, stack: &Stack) -> Result<()>;

    /// Replaces the stack row if its stored `current_traversal` equals
    /// `expected_traversal`.
    async fn update_stack(
        &self,
        stack: &Stack,
        expected_traversal: Option<TraversalId>,
    ) -> Result<CasResult>;

    /// Deletes the stack row together with its resource and sync point rows.
    ///
    /// Returns false if no row existed.
    async fn delete_stack(&self, stack_id: &StackId) -> Result<bool>;
}

/// Persistence for resource rows.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Gets a resource row by ID, including soft-deleted rows.
    async fn get_resource(&self, resource_id: ResourceId) -> Result<Option<Resource>>;

    /// Every row of the stack that is not soft-deleted, keyed by ID.
    async fn get_all_active_by_stack(
        &self,
        stack_id: &StackId,
    ) -> Result<BTreeMap<ResourceId, Resource>>;

    /// Inserts a row, assigning a fresh ID, and returns the stored row.
    async fn create_resource(&self, resource: Resource) -> Result<Resource>;

    /// Replaces the row if its stored `atomic_key` equals `expected_atomic_key`,
    /// storing it with the key incremented.
    async fn update_resource(
        &self,
        resource: &Resource,
        expected_atomic_key: u64,
    ) -> Result<CasResult>;

    /// Removes soft-deleted rows of the stack. Returns how many were removed.
    async fn purge_deleted(&self, stack_id: &StackId) -> Result<usize>;
}

/// Persistence for raw templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Stores a template version (idempotent by ID).
    async fn store_template(&self, template: &Template) -> Result<()>;

    /// Loads a template version.
    async fn load_template(&self, template_id: &TemplateId) -> Result<Option<Template>>;

    /// Deletes a template version. Returns false if it did not exist.
    async fn delete_template(&self, template_id: &TemplateId) -> Result<bool>;
}

/// Persistence for sync points.
#[async_trait]
pub trait SyncPointStore: Send + Sync {
    /// Inserts a sync point. Returns false if the key already exists.
    async fn create_sync_point(&self, sync_point: &SyncPoint) -> Result<bool>;

    /// Gets a sync point by key.
    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPoint>>;

    /// Replaces `input_data` if the stored `atomic_key` still equals
    /// `atomic_key`, incrementing it. Returns false on mismatch or absence.
    async fn update_input_data(
        &self,
        key: &SyncPointKey,
        atomic_key: u64,
        input_data: &InputData,
    ) -> Result<bool>;

    /// Deletes every sync point of the stack for the traversal.
    async fn delete_all_by_stack_and_traversal(
        &self,
        stack_id: &StackId,
        traversal_id: &TraversalId,
    ) -> Result<usize>;
}

/// Persistence for stack locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Inserts a lock row owned by `engine_id`.
    ///
    /// Returns `None` on success or the current holder on conflict.
    async fn create_lock(&self, stack_id: &StackId, engine_id: &EngineId)
    -> Result<Option<EngineId>>;

    /// The current holder, if any.
    async fn get_engine_id(&self, stack_id: &StackId) -> Result<Option<EngineId>>;

    /// Rewrites the owner from `old_engine_id` to `new_engine_id` if the row
    /// still names `old_engine_id`.
    async fn steal_lock(
        &self,
        stack_id: &StackId,
        old_engine_id: &EngineId,
        new_engine_id: &EngineId,
    ) -> Result<StealResult>;

    /// Deletes the row if it is owned by `engine_id`.
    async fn release_lock(&self, stack_id: &StackId, engine_id: &EngineId)
    -> Result<ReleaseResult>;
}

/// Trust/credential cleanup for deleted stacks.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Deletes the credentials the stack was using.
    async fn delete_stack_credentials(&self, stack_id: &StackId) -> Result<()>;
}

/// Every persistence concern the engine needs.
pub trait Store:
    StackStore + ResourceStore + TemplateStore + SyncPointStore + LockStore + CredentialStore
{
}

impl<T> Store for T where
    T: StackStore + ResourceStore + TemplateStore + SyncPointStore + LockStore + CredentialStore
{
}
