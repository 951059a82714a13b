//! Stack state transitions and end-of-traversal housekeeping.

use tracing::Instrument;

use converge_core::observability::convergence_span;
use converge_core::{StackId, TraversalId};

use crate::engine::{BoxFuture, ConvergenceEngine};
use crate::error::Result;
use crate::stack::{Stack, StackAction, StackStatus};
use crate::template::Template;

impl ConvergenceEngine {
    /// Moves a stack to `(action, status)` on behalf of `traversal_id`.
    ///
    /// Returns true if the state was persisted. Nothing is written when the
    /// traversal has been superseded, when another writer changed the row
    /// first, or for an `IN_PROGRESS` state of an action that does not
    /// persist it (suspend, resume, snapshot).
    ///
    /// Reaching `FAILED` clears the stack's traversal. A terminal state then
    /// either starts a rollback (a failed create, update, adopt or restore
    /// with rollback enabled) or purges what the traversal left behind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackNotFound`](crate::error::Error::StackNotFound), or
    /// an error from the rollback or purge.
    pub fn state_set(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
        action: StackAction,
        status: StackStatus,
        reason: impl Into<String>,
    ) -> BoxFuture<'_, Result<bool>> {
        let reason = reason.into();
        let span = convergence_span(
            "state_set",
            &stack_id.to_string(),
            &traversal_id.to_string(),
        );
        Box::pin(
            async move {
                if status == StackStatus::InProgress && !action.persists_in_progress() {
                    tracing::debug!(action = %action, "in-progress state not persisted");
                    return Ok(false);
                }

                let mut stack = self.load_stack(&stack_id).await?;
                if stack.current_traversal != Some(traversal_id) {
                    tracing::debug!(current = ?stack.current_traversal, "traversal superseded; state not set");
                    self.metrics.record_stale_callback();
                    return Ok(false);
                }

                stack.set_state(action, status, reason);
                if status == StackStatus::Failed {
                    stack.current_traversal = None;
                }
                stack.updated_at = chrono::Utc::now();
                if !self
                    .store
                    .update_stack(&stack, Some(traversal_id))
                    .await?
                    .is_success()
                {
                    tracing::debug!("stack row changed concurrently; state not set");
                    return Ok(false);
                }
                tracing::info!(
                    state = %stack.state_label(),
                    reason = stack.status_reason(),
                    "stack state changed"
                );

                if status.is_terminal() {
                    self.metrics
                        .record_stack_terminal(action.as_str(), status.as_str());
                    let rollback = status == StackStatus::Failed
                        && action.rolls_back_on_failure()
                        && !stack.disable_rollback
                        && !self.config.disable_rollback;
                    if rollback {
                        self.sync_points
                            .delete_all_by_stack_and_traversal(&stack_id, &traversal_id)
                            .await?;
                        self.rollback(&stack).await?;
                    } else {
                        self.purge_db(stack, traversal_id).await?;
                    }
                }
                Ok(true)
            }
            .instrument(span),
        )
    }

    /// Marks the traversal complete and, once that is recorded, releases the
    /// stack lock if this engine still holds it.
    ///
    /// Returns false if the traversal was superseded.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn mark_complete(&self, stack_id: StackId, traversal_id: TraversalId) -> Result<bool> {
        let stack = self.load_stack(&stack_id).await?;
        if stack.current_traversal != Some(traversal_id) {
            self.metrics.record_stale_callback();
            return Ok(false);
        }
        let action = stack.action();
        let persisted = self
            .state_set(
                stack_id,
                traversal_id,
                action,
                StackStatus::Complete,
                format!("Stack {action} completed successfully"),
            )
            .await?;
        // A lost write means the stack moved on; a lock we hold now belongs to
        // whatever started that.
        if persisted {
            self.stack_lock(stack_id).release_if_held().await?;
        }
        Ok(persisted)
    }

    /// Converges the stack back to its previous template.
    ///
    /// A failed create has no previous template and rolls back to an empty
    /// one, deleting whatever was created.
    async fn rollback(&self, stack: &Stack) -> Result<()> {
        let template = match stack.prev_raw_template_id {
            Some(template_id) => self.load_template(&template_id).await?,
            None => Template::empty(),
        };
        tracing::info!(
            stack_id = %stack.id,
            template_id = %template.id,
            "rolling back stack"
        );
        self.converge_stack(stack.id, template, StackAction::Rollback)
            .await?;
        Ok(())
    }

    /// Cleans up after a traversal reaches a terminal state.
    ///
    /// Soft-deleted rows are purged, a previous template no longer needed for
    /// rollback is dropped, and the traversal's sync points are removed. After
    /// `DELETE_COMPLETE` the stack itself goes, credentials first; if those
    /// cannot be deleted the stack is left in `DELETE_FAILED` instead.
    async fn purge_db(&self, mut stack: Stack, traversal_id: TraversalId) -> Result<()> {
        let purged = self.store.purge_deleted(&stack.id).await?;
        tracing::debug!(stack_id = %stack.id, purged, "purged deleted resources");

        if stack.status() != StackStatus::Failed {
            if let Some(prev) = stack.prev_raw_template_id.take() {
                if !self
                    .store
                    .update_stack(&stack, stack.current_traversal)
                    .await?
                    .is_success()
                {
                    tracing::debug!(stack_id = %stack.id, "stack changed during purge; stopping");
                    return Ok(());
                }
                if prev != stack.raw_template_id {
                    self.store.delete_template(&prev).await?;
                }
            }
        }

        self.sync_points
            .delete_all_by_stack_and_traversal(&stack.id, &traversal_id)
            .await?;

        if stack.action() != StackAction::Delete || stack.status() != StackStatus::Complete {
            return Ok(());
        }

        if !stack.is_nested() {
            if let Err(e) = self.store.delete_stack_credentials(&stack.id).await {
                tracing::warn!(stack_id = %stack.id, error = %e, "failed to delete stack credentials");
                self.state_set(
                    stack.id,
                    traversal_id,
                    StackAction::Delete,
                    StackStatus::Failed,
                    format!("Error deleting credentials: {e}"),
                )
                .await?;
                return Ok(());
            }
        }

        self.store.delete_template(&stack.raw_template_id).await?;
        self.store.delete_stack(&stack.id).await?;
        tracing::info!(stack_id = %stack.id, "stack deleted");
        Ok(())
    }
}
