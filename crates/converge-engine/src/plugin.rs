//! Resource plugins and their registry.
//!
//! A [`ResourceRegistry`] is built at startup and shared by reference with the
//! engine (which rejects templates naming unknown types) and the node worker
//! (which executes operations). There is no process-wide plugin table.
//!
//! Plugins receive a [`ResourceOperation`] and match on it; optional
//! behaviour is advertised through flat [`Capabilities`] flags.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::StackId;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceAction, ResourceStatus};
use crate::stack::StackAction;
use crate::sync_point::InputData;
use crate::template::{ResourceDefinition, Template};

/// An operation a plugin performs on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOperation {
    /// Create the physical resource.
    Create,
    /// Apply new properties; may answer [`OperationOutcome::Replace`].
    Update,
    /// Delete the physical resource.
    Delete,
    /// Verify the physical resource still matches its recorded state.
    Check,
    /// Suspend the physical resource.
    Suspend,
    /// Resume a suspended resource.
    Resume,
    /// Snapshot the physical resource.
    Snapshot,
    /// Restore the physical resource from a snapshot.
    Restore,
    /// Take ownership of an existing physical resource.
    Adopt,
}

impl ResourceOperation {
    /// The operation an update node performs for a stack action, given the
    /// resource row it acts on.
    ///
    /// Returns `None` when there is nothing to do.
    #[must_use]
    pub fn for_update_node(action: StackAction, resource: &Resource) -> Option<Self> {
        let created = match resource.action {
            ResourceAction::Init => false,
            ResourceAction::Create => resource.status == ResourceStatus::Complete,
            _ => true,
        };
        match action {
            StackAction::Create | StackAction::Update | StackAction::Rollback => {
                Some(if created { Self::Update } else { Self::Create })
            }
            StackAction::Adopt => Some(if created { Self::Update } else { Self::Adopt }),
            StackAction::Delete => None,
            StackAction::Suspend => Some(Self::Suspend),
            StackAction::Resume => Some(Self::Resume),
            StackAction::Snapshot => Some(Self::Snapshot),
            StackAction::Restore => Some(Self::Restore),
            StackAction::Check => Some(Self::Check),
        }
    }

    /// The resource action recorded once this operation completes.
    #[must_use]
    pub const fn resource_action(self) -> ResourceAction {
        match self {
            Self::Create => ResourceAction::Create,
            Self::Update => ResourceAction::Update,
            Self::Delete => ResourceAction::Delete,
            Self::Check => ResourceAction::Check,
            Self::Suspend => ResourceAction::Suspend,
            Self::Resume => ResourceAction::Resume,
            Self::Snapshot => ResourceAction::Snapshot,
            Self::Restore => ResourceAction::Restore,
            Self::Adopt => ResourceAction::Adopt,
        }
    }
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.resource_action(), f)
    }
}

/// Optional behaviour a plugin supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Snapshot and restore are meaningful.
    pub supports_snapshot: bool,
    /// Check can introspect the live physical resource.
    pub supports_live_state: bool,
}

/// Everything a plugin sees about the resource it operates on.
#[derive(Debug, Clone, Copy)]
pub struct ResourceContext<'a> {
    /// Owning stack.
    pub stack_id: StackId,
    /// The stored row.
    pub resource: &'a Resource,
    /// The desired definition; `None` for rows no longer in the template.
    pub definition: Option<&'a ResourceDefinition>,
    /// Outputs of the resources this one depends on.
    pub input_data: &'a InputData,
    /// Adoption input, for [`ResourceOperation::Adopt`].
    pub adopt_data: Option<&'a Value>,
}

/// Result of a successful plugin operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The operation finished.
    Complete {
        /// Identifier assigned by the external service.
        physical_id: Option<String>,
        /// Outputs for dependants.
        attributes: Value,
    },
    /// The change cannot be applied in place; a new resource must replace
    /// this one.
    Replace,
}

impl OperationOutcome {
    /// A completion that leaves the physical id and attributes untouched.
    #[must_use]
    pub fn unchanged(resource: &Resource) -> Self {
        Self::Complete {
            physical_id: resource.physical_id.clone(),
            attributes: resource.attributes.clone(),
        }
    }
}

/// Implementation of one resource type.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Optional behaviour this plugin supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Performs `operation` and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the operation failed; the message
    /// becomes part of the stack's status reason.
    async fn handle(
        &self,
        operation: ResourceOperation,
        ctx: ResourceContext<'_>,
    ) -> Result<OperationOutcome>;
}

/// Resource plugins by type name.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    plugins: BTreeMap<String, Arc<dyn ResourcePlugin>>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("types", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` for `type_name`, replacing any earlier plugin.
    #[must_use]
    pub fn with_plugin(mut self, type_name: impl Into<String>, plugin: Arc<dyn ResourcePlugin>) -> Self {
        self.register(type_name, plugin);
        self
    }

    /// Registers `plugin` for `type_name`, replacing any earlier plugin.
    pub fn register(&mut self, type_name: impl Into<String>, plugin: Arc<dyn ResourcePlugin>) {
        self.plugins.insert(type_name.into(), plugin);
    }

    /// Returns true if a plugin is registered for `type_name`.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.plugins.contains_key(type_name)
    }

    /// The plugin for `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResourceType`] if none is registered.
    pub fn get(&self, type_name: &str) -> Result<Arc<dyn ResourcePlugin>> {
        self.plugins
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::UnknownResourceType {
                type_name: type_name.to_string(),
            })
    }

    /// Verifies every type the template uses is registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownResourceType`] for the first unknown type.
    pub fn validate(&self, template: &Template) -> Result<()> {
        for type_name in template.resource_types() {
            if !self.contains(type_name) {
                return Err(Error::UnknownResourceType {
                    type_name: type_name.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ResourcePlugin for Noop {
        async fn handle(
            &self,
            _operation: ResourceOperation,
            ctx: ResourceContext<'_>,
        ) -> Result<OperationOutcome> {
            Ok(OperationOutcome::unchanged(ctx.resource))
        }
    }

    #[test]
    fn registry_rejects_unknown_types() {
        let registry = ResourceRegistry::new().with_plugin("net", Arc::new(Noop));
        let template = Template::empty()
            .with_resource("a", ResourceDefinition::new("net"))
            .with_resource("b", ResourceDefinition::new("volume"));

        match registry.validate(&template) {
            Err(Error::UnknownResourceType { type_name }) => assert_eq!(type_name, "volume"),
            other => panic!("expected UnknownResourceType, got {other:?}"),
        }
        assert!(registry.get("net").is_ok());
        assert!(registry.get("volume").is_err());
    }

    #[test]
    fn update_node_operation_depends_on_row_state() {
        let stack_id = StackId::generate();
        let mut resource = Resource::new(stack_id, "a", "net", None);
        assert_eq!(
            ResourceOperation::for_update_node(StackAction::Update, &resource),
            Some(ResourceOperation::Create)
        );

        resource.action = ResourceAction::Create;
        resource.status = ResourceStatus::Failed;
        assert_eq!(
            ResourceOperation::for_update_node(StackAction::Update, &resource),
            Some(ResourceOperation::Create)
        );

        resource.status = ResourceStatus::Complete;
        resource.physical_id = Some("phys-1".into());
        assert_eq!(
            ResourceOperation::for_update_node(StackAction::Update, &resource),
            Some(ResourceOperation::Update)
        );
        assert_eq!(
            ResourceOperation::for_update_node(StackAction::Snapshot, &resource),
            Some(ResourceOperation::Snapshot)
        );
        assert_eq!(
            ResourceOperation::for_update_node(StackAction::Delete, &resource),
            None
        );
    }

    #[test]
    fn default_capabilities_are_off() {
        assert_eq!(Noop.capabilities(), Capabilities::default());
    }
}
