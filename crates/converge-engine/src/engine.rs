//! The convergence engine.
//!
//! [`ConvergenceEngine`] turns a stack operation into a traversal and drives
//! it to completion:
//!
//! 1. An entry point (`create_stack`, `update_stack`, ...) takes the stack
//!    lock and calls [`ConvergenceEngine::converge_stack`].
//! 2. `converge_stack` resolves template resources to rows, computes the
//!    graph, persists it together with a fresh traversal id, creates one sync
//!    point per node (plus the stack barrier) and dispatches the leaves.
//! 3. Workers report back through [`ConvergenceEngine::node_complete`], which
//!    merges the node's output into each dependant's sync point and dispatches
//!    the dependants whose predecessors are now all done.
//! 4. When every root has reported, the stack barrier is satisfied and the
//!    stack is marked complete.
//!
//! ## Supersession
//!
//! A new traversal replaces `current_traversal` on the stack row with a
//! compare-and-swap. Every callback carries the traversal id it belongs to;
//! callbacks for any other traversal are dropped without touching state, so
//! an update issued mid-flight quietly takes over.
//!
//! ## Locking
//!
//! The stack lock is held from the start of an entry point until the first
//! wave of work is dispatched. Completions arriving after that need no lock:
//! every write they make is a compare-and-swap.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use converge_core::retry::{Attempt, retry_on_conflict};
use converge_core::{EngineId, ResourceId, StackId, TemplateId, TraversalId};

use crate::config::EngineConfig;
use crate::dispatch::{CheckResourceRequest, WorkerClient};
use crate::error::{Error, Result};
use crate::graph::{Dependencies, GraphKey};
use crate::graph_builder::{compute_dependencies, resolve_current_resources};
use crate::liveness::EngineLiveness;
use crate::metrics::{EngineMetrics, TimingGuard};
use crate::plugin::ResourceRegistry;
use crate::resource::Resource;
use crate::stack::{Stack, StackAction, StackOptions, StackStatus};
use crate::stack_lock::StackLock;
use crate::store::{CasResult, Store};
use crate::sync_point::{InputData, SyncPointKey, SyncPoints};
use crate::template::Template;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Longest `replaces` chain followed when mapping a replacement back to its
/// graph node.
const MAX_REPLACEMENT_DEPTH: usize = 64;

/// Drives stack traversals.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct ConvergenceEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) workers: Arc<dyn WorkerClient>,
    pub(crate) liveness: Arc<dyn EngineLiveness>,
    pub(crate) sync_points: SyncPoints,
    pub(crate) metrics: EngineMetrics,
}

impl std::fmt::Debug for ConvergenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceEngine")
            .field("engine_id", &self.config.engine_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ConvergenceEngine {
    /// Creates an engine over the given collaborators.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        registry: Arc<ResourceRegistry>,
        workers: Arc<dyn WorkerClient>,
        liveness: Arc<dyn EngineLiveness>,
    ) -> Self {
        let sync_points = SyncPoints::new(Arc::clone(&store), config.sync_retry);
        Self {
            config,
            store,
            registry,
            workers,
            liveness,
            sync_points,
            metrics: EngineMetrics::new(),
        }
    }

    /// Identity of this engine.
    #[must_use]
    pub const fn engine_id(&self) -> EngineId {
        self.config.engine_id
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The resource plugins this engine accepts.
    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Sync point operations over the backing store.
    #[must_use]
    pub const fn sync_points(&self) -> &SyncPoints {
        &self.sync_points
    }

    /// A handle on the lock of `stack_id`, acting as this engine.
    #[must_use]
    pub fn stack_lock(&self, stack_id: StackId) -> StackLock {
        StackLock::new(
            Arc::clone(&self.store),
            Arc::clone(&self.liveness),
            stack_id,
            self.config.engine_id,
        )
        .with_liveness_timeout(self.config.liveness_timeout)
    }

    /// Loads a stack row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`] if it does not exist.
    pub async fn load_stack(&self, stack_id: &StackId) -> Result<Stack> {
        self.store
            .get_stack(stack_id)
            .await?
            .ok_or(Error::StackNotFound {
                stack_id: *stack_id,
            })
    }

    pub(crate) async fn load_template(&self, template_id: &TemplateId) -> Result<Template> {
        self.store
            .load_template(template_id)
            .await?
            .ok_or(Error::TemplateNotFound {
                template_id: *template_id,
            })
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Creates a stack and starts converging it to `template`.
    ///
    /// With `options.adopt_stack_data` set, the traversal adopts existing
    /// physical resources instead of creating them.
    ///
    /// # Errors
    ///
    /// Returns a template error if `template` is invalid or uses unknown
    /// resource types, or a storage or dispatch error.
    #[tracing::instrument(skip(self, template, options), fields(stack_id = tracing::field::Empty))]
    pub async fn create_stack(
        &self,
        name: &str,
        template: Template,
        options: StackOptions,
    ) -> Result<Stack> {
        self.registry.validate(&template)?;
        template.dependencies()?;

        let action = if options.adopt_stack_data.is_some() {
            StackAction::Adopt
        } else {
            StackAction::Create
        };
        let mut stack = Stack::new(name, template.id, options);
        if action == StackAction::Adopt {
            stack.set_state(action, StackStatus::InProgress, "Stack ADOPT started");
        }
        tracing::Span::current().record("stack_id", tracing::field::display(&stack.id));
        self.store.create_stack(&stack).await?;

        let stack_id = stack.id;
        let lock = self.stack_lock(stack_id);
        lock.thread_lock(true, || self.converge_stack(stack_id, template, action))
            .await?;
        lock.release_if_held().await?;

        self.load_stack(&stack_id).await
    }

    /// Starts converging an existing stack to `template`.
    ///
    /// A traversal already in flight is superseded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the stack is suspended or
    /// being deleted, [`Error::ActionInProgress`] if another engine holds the
    /// lock, or a template, storage or dispatch error.
    #[tracing::instrument(skip(self, template), fields(stack_id = %stack_id))]
    pub async fn update_stack(&self, stack_id: StackId, template: Template) -> Result<TraversalId> {
        let stack = self.load_stack(&stack_id).await?;
        let blocked = match stack.action() {
            StackAction::Suspend if stack.status() != StackStatus::Failed => {
                Some("stack is suspended")
            }
            StackAction::Delete => Some("stack is being deleted"),
            _ => None,
        };
        if let Some(reason) = blocked {
            return Err(Error::InvalidStateTransition {
                from: stack.state_label(),
                to: "UPDATE_IN_PROGRESS".to_string(),
                reason: reason.to_string(),
            });
        }

        self.run_locked(stack_id, template, StackAction::Update).await
    }

    /// Starts deleting a stack and every resource in it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionInProgress`] if another engine holds the lock,
    /// or a storage or dispatch error.
    #[tracing::instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn delete_stack(&self, stack_id: StackId) -> Result<TraversalId> {
        self.load_stack(&stack_id).await?;
        self.run_locked(stack_id, Template::empty(), StackAction::Delete)
            .await
    }

    /// Runs a whole-stack action against the current template.
    ///
    /// Only suspend, resume, snapshot, restore and check are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for any other action, or for
    /// resume when the stack is not suspended.
    #[tracing::instrument(skip(self), fields(stack_id = %stack_id, action = %action))]
    pub async fn stack_action(&self, stack_id: StackId, action: StackAction) -> Result<TraversalId> {
        let stack = self.load_stack(&stack_id).await?;
        let rejection = match action {
            StackAction::Suspend
            | StackAction::Snapshot
            | StackAction::Restore
            | StackAction::Check => None,
            StackAction::Resume => {
                let suspended = stack.action() == StackAction::Suspend
                    && stack.status() == StackStatus::Complete;
                (!suspended).then_some("stack is not suspended")
            }
            _ => Some("not a stack action"),
        };
        if let Some(reason) = rejection {
            return Err(Error::InvalidStateTransition {
                from: stack.state_label(),
                to: format!("{action}_{}", StackStatus::InProgress),
                reason: reason.to_string(),
            });
        }

        let template = self.load_template(&stack.raw_template_id).await?;
        self.run_locked(stack_id, template, action).await
    }

    /// Runs a background check of an idle stack.
    ///
    /// Skips, returning false, when the lock is held or a traversal is in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns a storage or dispatch error.
    #[tracing::instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn periodic_check(&self, stack_id: StackId) -> Result<bool> {
        let lock = self.stack_lock(stack_id);
        let checked = lock
            .try_thread_lock(|holder| async move {
                if let Some(holder) = holder {
                    tracing::debug!(holder = %holder, "stack lock held; skipping periodic check");
                    return Ok(None);
                }
                let stack = self.load_stack(&stack_id).await?;
                if stack.status() == StackStatus::InProgress {
                    tracing::debug!(state = %stack.state_label(), "traversal in progress; skipping periodic check");
                    return Ok(Some(false));
                }
                let template = self.load_template(&stack.raw_template_id).await?;
                self.converge_stack(stack_id, template, StackAction::Check)
                    .await?;
                Ok(Some(true))
            })
            .await?;

        match checked {
            None => Ok(false),
            Some(ran) => {
                lock.release_if_held().await?;
                Ok(ran)
            }
        }
    }

    async fn run_locked(
        &self,
        stack_id: StackId,
        template: Template,
        action: StackAction,
    ) -> Result<TraversalId> {
        let lock = self.stack_lock(stack_id);
        let traversal_id = lock
            .thread_lock(true, || self.converge_stack(stack_id, template, action))
            .await?;
        lock.release_if_held().await?;
        Ok(traversal_id)
    }

    // ------------------------------------------------------------------
    // Traversal driver
    // ------------------------------------------------------------------

    /// Starts a traversal converging `stack_id` to `template`.
    ///
    /// The caller must hold the stack lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`], a template error (before anything is
    /// written), [`Error::ConcurrentTransition`] if the stack row changed
    /// underneath us, or a storage or dispatch error.
    #[tracing::instrument(
        skip(self, template),
        fields(stack_id = %stack_id, action = %action, traversal_id = tracing::field::Empty)
    )]
    pub async fn converge_stack(
        &self,
        stack_id: StackId,
        template: Template,
        action: StackAction,
    ) -> Result<TraversalId> {
        let metrics = self.metrics;
        let _guard = TimingGuard::new(move |duration| {
            metrics.observe_traversal_setup(action.as_str(), duration);
        });

        let mut stack = self.load_stack(&stack_id).await?;
        self.registry.validate(&template)?;
        template.dependencies()?;

        let old_raw = stack.raw_template_id;
        let old_prev = stack.prev_raw_template_id;
        let new_prev = if template.id == old_raw {
            old_prev
        } else if action == StackAction::Rollback {
            None
        } else {
            Some(old_raw)
        };

        // Rows as they were before this traversal; new rows get update nodes
        // only.
        let existing = self.store.get_all_active_by_stack(&stack_id).await?;
        let resolved = resolve_current_resources(&template, &existing, new_prev);
        let mut current = resolved.current;
        for name in resolved.missing {
            let Some(definition) = template.resource(&name) else {
                return Err(Error::invalid_template(format!(
                    "resource '{name}' is not defined"
                )));
            };
            let row = self
                .store
                .create_resource(Resource::new(
                    stack_id,
                    name.clone(),
                    definition.type_name.clone(),
                    Some(template.id),
                ))
                .await?;
            current.insert(name, row.id);
        }

        let deps = compute_dependencies(&template, &current, &existing)?;
        self.store.store_template(&template).await?;

        let previous_traversal = stack.current_traversal;
        let traversal_id = TraversalId::generate();
        tracing::Span::current().record("traversal_id", tracing::field::display(&traversal_id));

        stack.current_traversal = Some(traversal_id);
        stack.current_deps = deps.to_persisted();
        stack.raw_template_id = template.id;
        stack.prev_raw_template_id = new_prev;
        stack.updated_at = Utc::now();
        stack.set_state(
            action,
            StackStatus::InProgress,
            format!("Stack {action} started"),
        );

        match self.store.update_stack(&stack, previous_traversal).await? {
            CasResult::Success => {}
            other => {
                tracing::warn!(outcome = ?other, "stack row changed while starting traversal");
                if template.id != old_raw && Some(template.id) != old_prev {
                    self.store.delete_template(&template.id).await?;
                }
                return Err(Error::ConcurrentTransition { stack_id });
            }
        }
        self.metrics.record_traversal(action.as_str());
        tracing::info!(
            nodes = deps.len(),
            previous_traversal = ?previous_traversal,
            "traversal started"
        );

        // A replaced row chosen again for its name takes its identity back;
        // the replacement is cleaned up like any other leftover row.
        for id in current.values() {
            if existing.get(id).is_some_and(|row| row.replaced_by.is_some()) {
                self.reclaim_replaced(*id).await?;
            }
        }

        let mut unreferenced: BTreeSet<TemplateId> = [Some(old_raw), old_prev]
            .into_iter()
            .flatten()
            .collect();
        unreferenced.remove(&stack.raw_template_id);
        if let Some(prev) = stack.prev_raw_template_id {
            unreferenced.remove(&prev);
        }
        for template_id in unreferenced {
            self.store.delete_template(&template_id).await?;
        }

        if let Some(previous) = previous_traversal {
            let removed = self
                .sync_points
                .delete_all_by_stack_and_traversal(&stack_id, &previous)
                .await?;
            tracing::debug!(traversal_id = %previous, removed, "removed superseded sync points");
        }

        for node in deps.nodes() {
            self.sync_points
                .create(
                    stack_id,
                    SyncPointKey::for_node(node, traversal_id),
                    InputData::new(),
                )
                .await?;
        }
        self.sync_points
            .create(
                stack_id,
                SyncPointKey::for_stack(stack_id, traversal_id),
                InputData::new(),
            )
            .await?;

        if deps.is_empty() {
            self.mark_complete(stack_id, traversal_id).await?;
            return Ok(traversal_id);
        }

        let mut leaves = deps.leaves();
        // Cleanup first, so replaced and removed rows go before new work piles up.
        leaves.sort_by_key(|key| (key.is_update, key.resource_id));
        for leaf in leaves {
            self.dispatch(&stack, leaf, traversal_id, InputData::new())
                .await?;
        }
        Ok(traversal_id)
    }

    /// Records that `key` finished in `traversal_id` and moves the traversal
    /// forward.
    ///
    /// Callbacks for a superseded or finished traversal are ignored. Redelivered callbacks
    /// are harmless: a sync point records each sender once and only the merge
    /// that completes it dispatches the dependant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`], [`Error::CorruptGraph`] if `key` is
    /// not part of the traversal, or a sync point, storage or dispatch error.
    #[tracing::instrument(
        skip(self, data),
        fields(stack_id = %stack_id, traversal_id = %traversal_id, node = %key)
    )]
    pub async fn node_complete(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
        key: GraphKey,
        data: Value,
    ) -> Result<()> {
        let stack = self.load_stack(&stack_id).await?;
        if !stack.is_running(traversal_id) {
            tracing::debug!(current = ?stack.current_traversal, "traversal superseded or finished; ignoring completion");
            self.metrics.record_stale_callback();
            return Ok(());
        }

        match self.advance(&stack, traversal_id, key, &data).await {
            // The traversal can be superseded between the check above and
            // the merge, taking its sync points with it.
            Err(Error::SyncPointNotFound { key: point }) => {
                let current = self.store.get_stack(&stack_id).await?;
                if current.is_some_and(|s| s.is_running(traversal_id)) {
                    return Err(Error::SyncPointNotFound { key: point });
                }
                tracing::debug!(sync_point = %point, "traversal superseded while syncing; ignoring completion");
                self.metrics.record_stale_callback();
                Ok(())
            }
            other => other,
        }
    }

    /// Merges `key`'s output into the sync points of its dependants and
    /// dispatches every dependant it satisfies.
    async fn advance(
        &self,
        stack: &Stack,
        traversal_id: TraversalId,
        key: GraphKey,
        data: &Value,
    ) -> Result<()> {
        let stack_id = stack.id;
        let deps = Dependencies::from_persisted(&stack.current_deps)?;
        let sender = self.graph_node_for(&deps, key).await?;
        let dependants = deps.required_by(&sender)?;

        if dependants.is_empty() {
            let roots: BTreeSet<GraphKey> = deps.roots().into_iter().collect();
            let barrier = SyncPointKey::for_stack(stack_id, traversal_id);
            if self
                .sync_points
                .sync(&barrier, &roots, sender, data)
                .await?
                .is_some()
            {
                self.mark_complete(stack_id, traversal_id).await?;
            }
            return Ok(());
        }

        for dependant in dependants {
            let predecessors: BTreeSet<GraphKey> = deps.requires(&dependant)?.into_iter().collect();
            let point = SyncPointKey::for_node(dependant, traversal_id);
            match self
                .sync_points
                .sync(&point, &predecessors, sender, data)
                .await?
            {
                Some(input_data) => {
                    self.dispatch(stack, dependant, traversal_id, input_data)
                        .await?;
                }
                None => tracing::trace!(dependant = %dependant, "waiting on other predecessors"),
            }
        }
        Ok(())
    }

    /// Maps a completed node to the graph node it stands for.
    ///
    /// A replacement row is not in the graph; it completes on behalf of the
    /// row it replaces.
    async fn graph_node_for(&self, deps: &Dependencies, key: GraphKey) -> Result<GraphKey> {
        let mut candidate = key;
        for _ in 0..MAX_REPLACEMENT_DEPTH {
            if deps.contains(&candidate) {
                return Ok(candidate);
            }
            let Some(row) = self.store.get_resource(candidate.resource_id).await? else {
                break;
            };
            let Some(replaced) = row.replaces else {
                break;
            };
            candidate = GraphKey {
                resource_id: replaced,
                is_update: key.is_update,
            };
        }
        Err(Error::CorruptGraph {
            message: format!("node {key} is not part of the traversal graph"),
        })
    }

    /// Fails the traversal because a resource failed.
    ///
    /// Returns false if the traversal was already superseded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`] or a storage error.
    #[tracing::instrument(skip(self, message), fields(stack_id = %stack_id, traversal_id = %traversal_id))]
    pub async fn node_failed(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
        resource_id: ResourceId,
        message: &str,
    ) -> Result<bool> {
        let stack = self.load_stack(&stack_id).await?;
        if !stack.is_running(traversal_id) {
            self.metrics.record_stale_callback();
            return Ok(false);
        }
        let name = self
            .store
            .get_resource(resource_id)
            .await?
            .map_or_else(|| resource_id.to_string(), |row| row.name);
        tracing::warn!(resource = %name, error = message, "resource failed");
        self.state_set(
            stack_id,
            traversal_id,
            stack.action(),
            StackStatus::Failed,
            format!("Resource {name} failed: {message}"),
        )
        .await
    }

    /// Creates a replacement for the resource in `request` and dispatches its
    /// update node.
    ///
    /// The replacement takes the original's place in the graph: its
    /// completion is reported as the original's. If a replacement already
    /// exists it is returned and nothing is dispatched. Returns `None` if the
    /// traversal was superseded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`], or a storage or dispatch error.
    #[tracing::instrument(
        skip(self, request),
        fields(stack_id = %request.stack_id, resource_id = %request.resource_id)
    )]
    pub async fn make_replacement(
        &self,
        request: &CheckResourceRequest,
    ) -> Result<Option<ResourceId>> {
        let stack = self.load_stack(&request.stack_id).await?;
        if !stack.is_running(request.traversal_id) {
            self.metrics.record_stale_callback();
            return Ok(None);
        }
        let old_id = request.resource_id;
        let old = self
            .store
            .get_resource(old_id)
            .await?
            .ok_or(Error::ResourceNotFound { resource_id: old_id })?;
        if let Some(existing) = old.replaced_by {
            tracing::debug!(replacement = %existing, "resource already replaced");
            return Ok(Some(existing));
        }

        let mut replacement = Resource::new(
            stack.id,
            old.name.clone(),
            old.type_name.clone(),
            Some(stack.raw_template_id),
        );
        replacement.replaces = Some(old_id);
        replacement.requires.clone_from(&old.requires);
        let replacement = self.store.create_resource(replacement).await?;
        let new_id = replacement.id;

        let store = &self.store;
        let winner = retry_on_conflict(&self.config.sync_retry, || async move {
            let Some(mut row) = store.get_resource(old_id).await? else {
                return Err(Error::ResourceNotFound { resource_id: old_id });
            };
            if let Some(other) = row.replaced_by {
                return Ok(Attempt::Done(other));
            }
            row.replaced_by = Some(new_id);
            Ok(match store.update_resource(&row, row.atomic_key).await? {
                CasResult::Success => Attempt::Done(new_id),
                CasResult::NotFound => {
                    return Err(Error::ResourceNotFound { resource_id: old_id });
                }
                CasResult::VersionConflict { .. } | CasResult::TraversalMismatch { .. } => {
                    Attempt::Conflict
                }
            })
        })
        .await?;

        if winner != new_id {
            tracing::info!(replacement = %winner, "lost replacement race; discarding duplicate");
            let mut orphan = replacement;
            orphan.mark_deleted();
            self.store.update_resource(&orphan, orphan.atomic_key).await?;
            return Ok(Some(winner));
        }

        tracing::info!(replacement = %new_id, "replacing resource");
        self.dispatch(
            &stack,
            GraphKey::update(new_id),
            request.traversal_id,
            request.input_data.clone(),
        )
        .await?;
        Ok(Some(new_id))
    }

    async fn reclaim_replaced(&self, resource_id: ResourceId) -> Result<()> {
        let store = &self.store;
        retry_on_conflict(&self.config.sync_retry, || async move {
            let Some(mut row) = store.get_resource(resource_id).await? else {
                return Ok(Attempt::Done(()));
            };
            let Some(replacement) = row.replaced_by.take() else {
                return Ok(Attempt::Done(()));
            };
            Ok(match store.update_resource(&row, row.atomic_key).await? {
                CasResult::Success => {
                    tracing::info!(resource_id = %resource_id, replacement = %replacement, "reclaimed replaced resource");
                    Attempt::Done(())
                }
                CasResult::NotFound => Attempt::Done(()),
                CasResult::VersionConflict { .. } | CasResult::TraversalMismatch { .. } => {
                    Attempt::Conflict
                }
            })
        })
        .await
    }

    /// Fails the current traversal if the stack's timeout has elapsed.
    ///
    /// Returns true if the stack was marked failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`] or a storage error.
    pub async fn fail_if_timed_out(&self, stack_id: StackId, now: DateTime<Utc>) -> Result<bool> {
        let stack = self.load_stack(&stack_id).await?;
        let Some(traversal_id) = stack.current_traversal else {
            return Ok(false);
        };
        if !stack.has_timed_out(now) {
            return Ok(false);
        }
        tracing::warn!(stack_id = %stack_id, traversal_id = %traversal_id, "stack timed out");
        self.state_set(
            stack_id,
            traversal_id,
            stack.action(),
            StackStatus::Failed,
            "Timed out",
        )
        .await
    }

    async fn dispatch(
        &self,
        stack: &Stack,
        key: GraphKey,
        traversal_id: TraversalId,
        input_data: InputData,
    ) -> Result<()> {
        tracing::debug!(node = %key, traversal_id = %traversal_id, "dispatching node");
        self.metrics.record_node_dispatched(key.is_update);
        self.workers
            .check_resource(CheckResourceRequest {
                stack_id: stack.id,
                resource_id: key.resource_id,
                traversal_id,
                input_data,
                is_update: key.is_update,
                adopt_stack_data: stack.adopt_stack_data.clone(),
                is_nested: stack.is_nested(),
            })
            .await
    }
}
