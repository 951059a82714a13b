//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! every persistence trait, suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use converge_core::{EngineId, ResourceId, StackId, TemplateId, TraversalId};

use super::{
    CasResult, CredentialStore, LockStore, ReleaseResult, ResourceStore, StackStore, StealResult,
    SyncPointStore, TemplateStore,
};
use crate::error::{Error, Result};
use crate::resource::Resource;
use crate::stack::Stack;
use crate::sync_point::{InputData, SyncPoint, SyncPointKey};
use crate::template::Template;

/// In-memory store for testing.
///
/// Each table is a `RwLock<HashMap>`; every trait method holds at most one
/// table lock, so the compare-and-swap writes are atomic per row.
#[derive(Debug)]
pub struct InMemoryStore {
    stacks: RwLock<HashMap<StackId, Stack>>,
    resources: RwLock<HashMap<ResourceId, Resource>>,
    templates: RwLock<HashMap<TemplateId, Template>>,
    sync_points: RwLock<HashMap<SyncPointKey, SyncPoint>>,
    locks: RwLock<HashMap<StackId, EngineId>>,
    next_resource_id: AtomicU64,
    fail_credential_deletion: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
            sync_points: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            next_resource_id: AtomicU64::new(1),
            fail_credential_deletion: AtomicBool::new(false),
        }
    }

    /// Makes subsequent credential deletions fail (or succeed again).
    pub fn fail_credential_deletion(&self, fail: bool) {
        self.fail_credential_deletion.store(fail, Ordering::SeqCst);
    }

    /// Every resource row of the stack, including soft-deleted rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn all_resources(&self, stack_id: &StackId) -> Result<Vec<Resource>> {
        let mut rows: Vec<Resource> = {
            let resources = self.resources.read().map_err(poison_err)?;
            resources
                .values()
                .filter(|r| r.stack_id == *stack_id)
                .cloned()
                .collect()
        };
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    /// Number of stored sync points of the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn sync_point_count(&self, stack_id: &StackId) -> Result<usize> {
        let count = {
            let points = self.sync_points.read().map_err(poison_err)?;
            points.values().filter(|p| p.stack_id == *stack_id).count()
        };
        Ok(count)
    }

    /// Number of stored templates.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn template_count(&self) -> Result<usize> {
        let count = self.templates.read().map_err(poison_err)?.len();
        Ok(count)
    }
}

#[async_trait]
impl StackStore for InMemoryStore {
    async fn get_stack(&self, stack_id: &StackId) -> Result<Option<Stack>> {
        let result = {
            let stacks = self.stacks.read().map_err(poison_err)?;
            stacks.get(stack_id).cloned()
        };
        Ok(result)
    }

    async fn create_stack(&self, stack: &Stack) -> Result<()> {
        let mut stacks = self.stacks.write().map_err(poison_err)?;
        if stacks.contains_key(&stack.id) {
            drop(stacks);
            return Err(Error::storage(format!("stack {} already exists", stack.id)));
        }
        stacks.insert(stack.id, stack.clone());
        drop(stacks);
        Ok(())
    }

    async fn update_stack(
        &self,
        stack: &Stack,
        expected_traversal: Option<TraversalId>,
    ) -> Result<CasResult> {
        let mut stacks = self.stacks.write().map_err(poison_err)?;
        let Some(stored) = stacks.get_mut(&stack.id) else {
            drop(stacks);
            return Ok(CasResult::NotFound);
        };
        if stored.current_traversal != expected_traversal {
            let actual = stored.current_traversal;
            drop(stacks);
            return Ok(CasResult::TraversalMismatch { actual });
        }
        *stored = stack.clone();
        drop(stacks);
        Ok(CasResult::Success)
    }

    async fn delete_stack(&self, stack_id: &StackId) -> Result<bool> {
        let existed = {
            let mut stacks = self.stacks.write().map_err(poison_err)?;
            stacks.remove(stack_id).is_some()
        };
        {
            let mut resources = self.resources.write().map_err(poison_err)?;
            resources.retain(|_, r| r.stack_id != *stack_id);
        }
        {
            let mut points = self.sync_points.write().map_err(poison_err)?;
            points.retain(|_, p| p.stack_id != *stack_id);
        }
        Ok(existed)
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_resource(&self, resource_id: ResourceId) -> Result<Option<Resource>> {
        let result = {
            let resources = self.resources.read().map_err(poison_err)?;
            resources.get(&resource_id).cloned()
        };
        Ok(result)
    }

    async fn get_all_active_by_stack(
        &self,
        stack_id: &StackId,
    ) -> Result<BTreeMap<ResourceId, Resource>> {
        let result = {
            let resources = self.resources.read().map_err(poison_err)?;
            resources
                .values()
                .filter(|r| r.stack_id == *stack_id && r.is_active())
                .map(|r| (r.id, r.clone()))
                .collect()
        };
        Ok(result)
    }

    async fn create_resource(&self, mut resource: Resource) -> Result<Resource> {
        resource.id = ResourceId::new(self.next_resource_id.fetch_add(1, Ordering::SeqCst));
        resource.atomic_key = 0;
        {
            let mut resources = self.resources.write().map_err(poison_err)?;
            resources.insert(resource.id, resource.clone());
        }
        Ok(resource)
    }

    async fn update_resource(
        &self,
        resource: &Resource,
        expected_atomic_key: u64,
    ) -> Result<CasResult> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let Some(stored) = resources.get_mut(&resource.id) else {
            drop(resources);
            return Ok(CasResult::NotFound);
        };
        if stored.atomic_key != expected_atomic_key {
            let actual = stored.atomic_key;
            drop(resources);
            return Ok(CasResult::VersionConflict { actual });
        }
        *stored = resource.clone();
        stored.atomic_key = expected_atomic_key + 1;
        drop(resources);
        Ok(CasResult::Success)
    }

    async fn purge_deleted(&self, stack_id: &StackId) -> Result<usize> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let before = resources.len();
        resources.retain(|_, r| r.stack_id != *stack_id || r.is_active());
        let purged = before - resources.len();
        drop(resources);
        Ok(purged)
    }
}

#[async_trait]
impl TemplateStore for InMemoryStore {
    async fn store_template(&self, template: &Template) -> Result<()> {
        {
            let mut templates = self.templates.write().map_err(poison_err)?;
            templates.insert(template.id, template.clone());
        }
        Ok(())
    }

    async fn load_template(&self, template_id: &TemplateId) -> Result<Option<Template>> {
        let result = {
            let templates = self.templates.read().map_err(poison_err)?;
            templates.get(template_id).cloned()
        };
        Ok(result)
    }

    async fn delete_template(&self, template_id: &TemplateId) -> Result<bool> {
        let removed = {
            let mut templates = self.templates.write().map_err(poison_err)?;
            templates.remove(template_id).is_some()
        };
        Ok(removed)
    }
}

#[async_trait]
impl SyncPointStore for InMemoryStore {
    async fn create_sync_point(&self, sync_point: &SyncPoint) -> Result<bool> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        if points.contains_key(&sync_point.key) {
            drop(points);
            return Ok(false);
        }
        points.insert(sync_point.key, sync_point.clone());
        drop(points);
        Ok(true)
    }

    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPoint>> {
        let result = {
            let points = self.sync_points.read().map_err(poison_err)?;
            points.get(key).cloned()
        };
        Ok(result)
    }

    async fn update_input_data(
        &self,
        key: &SyncPointKey,
        atomic_key: u64,
        input_data: &InputData,
    ) -> Result<bool> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        let Some(point) = points.get_mut(key) else {
            drop(points);
            return Ok(false);
        };
        if point.atomic_key != atomic_key {
            drop(points);
            return Ok(false);
        }
        point.input_data = input_data.clone();
        point.atomic_key = atomic_key + 1;
        drop(points);
        Ok(true)
    }

    async fn delete_all_by_stack_and_traversal(
        &self,
        stack_id: &StackId,
        traversal_id: &TraversalId,
    ) -> Result<usize> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        let before = points.len();
        points.retain(|key, p| p.stack_id != *stack_id || key.traversal_id != *traversal_id);
        let deleted = before - points.len();
        drop(points);
        Ok(deleted)
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn create_lock(
        &self,
        stack_id: &StackId,
        engine_id: &EngineId,
    ) -> Result<Option<EngineId>> {
        let mut locks = self.locks.write().map_err(poison_err)?;
        if let Some(holder) = locks.get(stack_id) {
            let holder = *holder;
            drop(locks);
            return Ok(Some(holder));
        }
        locks.insert(*stack_id, *engine_id);
        drop(locks);
        Ok(None)
    }

    async fn get_engine_id(&self, stack_id: &StackId) -> Result<Option<EngineId>> {
        let result = {
            let locks = self.locks.read().map_err(poison_err)?;
            locks.get(stack_id).copied()
        };
        Ok(result)
    }

    async fn steal_lock(
        &self,
        stack_id: &StackId,
        old_engine_id: &EngineId,
        new_engine_id: &EngineId,
    ) -> Result<StealResult> {
        let mut locks = self.locks.write().map_err(poison_err)?;
        let result = match locks.get_mut(stack_id) {
            None => StealResult::Released,
            Some(holder) if holder == old_engine_id => {
                *holder = *new_engine_id;
                StealResult::Stolen
            }
            Some(holder) => StealResult::HeldBy(*holder),
        };
        drop(locks);
        Ok(result)
    }

    async fn release_lock(
        &self,
        stack_id: &StackId,
        engine_id: &EngineId,
    ) -> Result<ReleaseResult> {
        let mut locks = self.locks.write().map_err(poison_err)?;
        let result = if locks.get(stack_id) == Some(engine_id) {
            locks.remove(stack_id);
            ReleaseResult::Released
        } else {
            ReleaseResult::NotHeld
        };
        drop(locks);
        Ok(result)
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn delete_stack_credentials(&self, stack_id: &StackId) -> Result<()> {
        if self.fail_credential_deletion.load(Ordering::SeqCst) {
            return Err(Error::storage(format!(
                "failed to delete credentials of stack {stack_id}"
            )));
        }
        Ok(())
    }
}
