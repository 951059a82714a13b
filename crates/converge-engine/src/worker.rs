//! Node execution.
//!
//! A [`NodeWorker`] runs one [`CheckResourceRequest`] at a time: it decides
//! what the node means for the current stack action, calls the resource
//! plugin, records the result on the resource row and reports back to the
//! engine. Requests may be delivered more than once; a node that already
//! reached its target state is reported complete without calling the plugin
//! again.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::ResourceId;
use converge_core::retry::{Attempt, retry_on_conflict};

use crate::dispatch::CheckResourceRequest;
use crate::engine::ConvergenceEngine;
use crate::error::{Error, Result};
use crate::graph::{Dependencies, GraphKey};
use crate::plugin::{OperationOutcome, ResourceContext, ResourceOperation};
use crate::resource::{Resource, ResourceAction, ResourceStatus};
use crate::stack::{Stack, StackAction};
use crate::store::CasResult;
use crate::template::Template;

/// What a node reports to its dependants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// The row that did the work; a replacement reports its own id.
    pub resource_id: ResourceId,
    /// Logical resource name.
    pub name: String,
    /// Attributes published by the plugin.
    #[serde(default)]
    pub attributes: Value,
}

impl NodeOutput {
    fn for_resource(resource: &Resource) -> Self {
        Self {
            resource_id: resource.id,
            name: resource.name.clone(),
            attributes: resource.attributes.clone(),
        }
    }
}

enum NodeResult {
    Done(NodeOutput),
    Replaced,
    Superseded,
}

/// Executes dispatched nodes against the engine's plugins and store.
#[derive(Debug, Clone)]
pub struct NodeWorker {
    engine: Arc<ConvergenceEngine>,
}

impl NodeWorker {
    /// Creates a worker reporting to `engine`.
    #[must_use]
    pub const fn new(engine: Arc<ConvergenceEngine>) -> Self {
        Self { engine }
    }

    /// Runs one node.
    ///
    /// Requests for a superseded or finished traversal, or for a stack that
    /// no longer exists, are dropped. A plugin failure marks the row `FAILED` and fails
    /// the traversal; it is not returned as an error.
    ///
    /// # Errors
    ///
    /// Returns a storage, sync point or dispatch error.
    #[tracing::instrument(
        skip(self, request),
        fields(
            stack_id = %request.stack_id,
            traversal_id = %request.traversal_id,
            node = %request.graph_key(),
        )
    )]
    pub async fn check_resource(&self, request: CheckResourceRequest) -> Result<()> {
        let store = self.engine.store();
        let Some(stack) = store.get_stack(&request.stack_id).await? else {
            tracing::debug!("stack no longer exists; dropping request");
            return Ok(());
        };
        if !stack.is_running(request.traversal_id) {
            tracing::debug!("traversal superseded or finished; dropping request");
            return Ok(());
        }
        if self
            .engine
            .fail_if_timed_out(stack.id, Utc::now())
            .await?
        {
            return Ok(());
        }

        let resource = store
            .get_resource(request.resource_id)
            .await?
            .ok_or(Error::ResourceNotFound {
                resource_id: request.resource_id,
            })?;
        let template = self.engine.load_template(&stack.raw_template_id).await?;

        let result = if request.is_update {
            self.converge_resource(&stack, &template, &resource, &request)
                .await
        } else {
            self.cleanup_resource(&stack, &template, &resource, &request)
                .await
        };

        match result {
            Ok(NodeResult::Done(output)) => {
                self.engine
                    .node_complete(
                        stack.id,
                        request.traversal_id,
                        request.graph_key(),
                        serde_json::to_value(output)?,
                    )
                    .await
            }
            Ok(NodeResult::Replaced) => Ok(()),
            Ok(NodeResult::Superseded) => {
                tracing::debug!("traversal superseded while the node ran; result dropped");
                Ok(())
            }
            Err(Error::ResourceFailed { message, .. }) => {
                let failed = self
                    .update_row(resource.id, |row| {
                        row.status = ResourceStatus::Failed;
                        row.status_reason.clone_from(&message);
                    })
                    .await;
                if let Err(e) = failed {
                    tracing::warn!(error = %e, "failed to record resource failure");
                }
                self.engine
                    .node_failed(stack.id, request.traversal_id, resource.id, &message)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn converge_resource(
        &self,
        stack: &Stack,
        template: &Template,
        resource: &Resource,
        request: &CheckResourceRequest,
    ) -> Result<NodeResult> {
        // A redelivered request for a row that was already replaced; the
        // replacement reports for it.
        if resource.replaced_by.is_some() {
            return Ok(NodeResult::Replaced);
        }

        let operation = ResourceOperation::for_update_node(stack.action(), resource);
        let converged = resource.current_template_id == Some(template.id)
            && resource.status == ResourceStatus::Complete
            && matches!(
                resource.action,
                ResourceAction::Create | ResourceAction::Update | ResourceAction::Adopt
            )
            && matches!(
                stack.action(),
                StackAction::Create
                    | StackAction::Update
                    | StackAction::Rollback
                    | StackAction::Adopt
            );

        let outcome = match operation {
            None => OperationOutcome::unchanged(resource),
            Some(_) if converged => {
                tracing::debug!(resource = %resource.name, "resource already converged");
                OperationOutcome::unchanged(resource)
            }
            Some(operation) => {
                let plugin = self
                    .engine
                    .registry()
                    .get(&resource.type_name)
                    .map_err(|e| failure(resource, &e))?;
                let capabilities = plugin.capabilities();
                let skip = match operation {
                    ResourceOperation::Snapshot | ResourceOperation::Restore => {
                        !capabilities.supports_snapshot
                    }
                    ResourceOperation::Check => !capabilities.supports_live_state,
                    _ => false,
                };
                if skip {
                    OperationOutcome::unchanged(resource)
                } else {
                    let ctx = ResourceContext {
                        stack_id: stack.id,
                        resource,
                        definition: template.resource(&resource.name),
                        input_data: &request.input_data,
                        adopt_data: request.adopt_stack_data.as_ref(),
                    };
                    tracing::info!(resource = %resource.name, operation = %operation, "running resource operation");
                    let outcome = plugin
                        .handle(operation, ctx)
                        .await
                        .map_err(|e| failure(resource, &e))?;
                    if outcome == OperationOutcome::Replace && operation != ResourceOperation::Update {
                        return Err(Error::ResourceFailed {
                            resource_name: resource.name.clone(),
                            message: format!("replacement requested during {operation}"),
                        });
                    }
                    outcome
                }
            }
        };

        let (physical_id, attributes) = match outcome {
            OperationOutcome::Replace => {
                self.engine.make_replacement(request).await?;
                return Ok(NodeResult::Replaced);
            }
            OperationOutcome::Complete {
                physical_id,
                attributes,
            } => (physical_id, attributes),
        };

        let current = self.engine.store().get_stack(&stack.id).await?;
        if !current.is_some_and(|s| s.is_running(request.traversal_id)) {
            return Ok(NodeResult::Superseded);
        }

        let requires: BTreeSet<ResourceId> = request
            .input_data
            .iter()
            .filter(|(sender, _)| sender.is_update)
            .map(|(sender, data)| {
                serde_json::from_value::<NodeOutput>(data.clone())
                    .map_or(sender.resource_id, |output| output.resource_id)
            })
            .collect();
        let template_id = template.id;
        let action = operation.map(ResourceOperation::resource_action);

        let row = self
            .update_row(resource.id, |row| {
                row.requires.clone_from(&requires);
                row.current_template_id = Some(template_id);
                if let Some(action) = action {
                    row.action = action;
                }
                row.status = ResourceStatus::Complete;
                row.status_reason = format!("{} completed", row.action);
                row.physical_id.clone_from(&physical_id);
                row.attributes.clone_from(&attributes);
            })
            .await?;
        Ok(NodeResult::Done(NodeOutput::for_resource(&row)))
    }

    async fn cleanup_resource(
        &self,
        stack: &Stack,
        template: &Template,
        resource: &Resource,
        request: &CheckResourceRequest,
    ) -> Result<NodeResult> {
        let stack_wide_action = matches!(
            stack.action(),
            StackAction::Suspend
                | StackAction::Resume
                | StackAction::Snapshot
                | StackAction::Restore
                | StackAction::Check
        );
        if stack_wide_action || !resource.is_active() {
            return Ok(NodeResult::Done(NodeOutput::for_resource(resource)));
        }
        // Only the row chosen for its name has an update node; any other row
        // of that name is a leftover even when it sits on the current template.
        let chosen = Dependencies::from_persisted(&stack.current_deps)?
            .contains(&GraphKey::update(resource.id));
        if chosen && resource.current_template_id == Some(stack.raw_template_id) {
            return Ok(NodeResult::Done(NodeOutput::for_resource(resource)));
        }

        if resource.physical_id.is_some() || resource.action != ResourceAction::Init {
            let plugin = self
                .engine
                .registry()
                .get(&resource.type_name)
                .map_err(|e| failure(resource, &e))?;
            let ctx = ResourceContext {
                stack_id: stack.id,
                resource,
                definition: template.resource(&resource.name),
                input_data: &request.input_data,
                adopt_data: None,
            };
            tracing::info!(resource = %resource.name, "deleting resource");
            plugin
                .handle(ResourceOperation::Delete, ctx)
                .await
                .map_err(|e| failure(resource, &e))?;
        }

        let deleted = self.update_row(resource.id, Resource::mark_deleted).await?;

        if let Some(replacement) = resource.replaced_by {
            let id = resource.id;
            self.unlink(replacement, |row| {
                if row.replaces == Some(id) {
                    row.replaces = None;
                }
            })
            .await?;
        }
        if let Some(original) = resource.replaces {
            let id = resource.id;
            self.unlink(original, |row| {
                if row.replaced_by == Some(id) {
                    row.replaced_by = None;
                }
            })
            .await?;
        }

        Ok(NodeResult::Done(NodeOutput {
            resource_id: deleted.id,
            name: deleted.name,
            attributes: Value::Null,
        }))
    }

    async fn unlink<F>(&self, resource_id: ResourceId, apply: F) -> Result<()>
    where
        F: Fn(&mut Resource) + Sync,
    {
        match self.update_row(resource_id, apply).await {
            Ok(_) | Err(Error::ResourceNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Applies `apply` to the stored row with a compare-and-swap, re-reading
    /// and re-applying on conflict.
    async fn update_row<F>(&self, resource_id: ResourceId, apply: F) -> Result<Resource>
    where
        F: Fn(&mut Resource) + Sync,
    {
        let store = self.engine.store();
        let apply = &apply;
        retry_on_conflict(&self.engine.config().sync_retry, || async move {
            let Some(mut row) = store.get_resource(resource_id).await? else {
                return Err(Error::ResourceNotFound { resource_id });
            };
            let expected = row.atomic_key;
            apply(&mut row);
            Ok(match store.update_resource(&row, expected).await? {
                CasResult::Success => {
                    row.atomic_key = expected + 1;
                    Attempt::Done(row)
                }
                CasResult::NotFound => return Err(Error::ResourceNotFound { resource_id }),
                CasResult::VersionConflict { .. } | CasResult::TraversalMismatch { .. } => {
                    Attempt::Conflict
                }
            })
        })
        .await
    }
}

fn failure(resource: &Resource, error: &Error) -> Error {
    let message = match error {
        Error::ResourceFailed { message, .. } => message.clone(),
        other => other.to_string(),
    };
    Error::ResourceFailed {
        resource_name: resource.name.clone(),
        message,
    }
}
