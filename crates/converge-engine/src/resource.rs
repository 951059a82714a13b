//! Persisted resource rows.
//!
//! Logical identity is `(stack_id, name)`; graph identity is the numeric
//! [`ResourceId`]. A replacement produces a second row for the same name,
//! linked to its predecessor through `replaces`/`replaced_by`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::{ResourceId, StackId, TemplateId};

/// The last operation applied to a resource row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceAction {
    /// Row stored, nothing applied yet.
    Init,
    /// Physical resource created.
    Create,
    /// Physical resource updated in place.
    Update,
    /// Physical resource deleted.
    Delete,
    /// Health checked.
    Check,
    /// Suspended.
    Suspend,
    /// Resumed.
    Resume,
    /// Snapshotted.
    Snapshot,
    /// Restored from a snapshot.
    Restore,
    /// Adopted from existing infrastructure.
    Adopt,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Check => "CHECK",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
            Self::Snapshot => "SNAPSHOT",
            Self::Restore => "RESTORE",
            Self::Adopt => "ADOPT",
        };
        f.write_str(name)
    }
}

/// Progress of a resource's last action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Operation running.
    InProgress,
    /// Operation finished.
    Complete,
    /// Operation failed.
    Failed,
}

/// A persisted resource row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Graph identity.
    pub id: ResourceId,
    /// Owning stack.
    pub stack_id: StackId,
    /// Logical name within the stack.
    pub name: String,
    /// Plugin type name.
    pub type_name: String,
    /// Which template version this row's properties reflect.
    pub current_template_id: Option<TemplateId>,
    /// Resources this one depended on when it was last converged.
    ///
    /// Rewritten by the worker once it resolves this node for the template in
    /// force; it does not reflect a newer template before that.
    pub requires: BTreeSet<ResourceId>,
    /// The row this one replaces.
    pub replaces: Option<ResourceId>,
    /// The row that replaced this one.
    pub replaced_by: Option<ResourceId>,
    /// Last action applied.
    pub action: ResourceAction,
    /// Status of `action`.
    pub status: ResourceStatus,
    /// Explanation of `status`.
    pub status_reason: String,
    /// Identifier assigned by the external service.
    pub physical_id: Option<String>,
    /// Outputs forwarded to dependants as sync point input data.
    pub attributes: Value,
    /// Optimistic concurrency counter; bumped on every write.
    pub atomic_key: u64,
}

impl Resource {
    /// Creates an unsaved row in `INIT_COMPLETE`; the store assigns `id`.
    #[must_use]
    pub fn new(
        stack_id: StackId,
        name: impl Into<String>,
        type_name: impl Into<String>,
        current_template_id: Option<TemplateId>,
    ) -> Self {
        Self {
            id: ResourceId::new(0),
            stack_id,
            name: name.into(),
            type_name: type_name.into(),
            current_template_id,
            requires: BTreeSet::new(),
            replaces: None,
            replaced_by: None,
            action: ResourceAction::Init,
            status: ResourceStatus::Complete,
            status_reason: String::new(),
            physical_id: None,
            attributes: Value::Null,
            atomic_key: 0,
        }
    }

    /// True until the row is soft-deleted (`DELETE_COMPLETE`).
    #[must_use]
    pub fn is_active(&self) -> bool {
        !(self.action == ResourceAction::Delete && self.status == ResourceStatus::Complete)
    }

    /// Marks the row soft-deleted; `purge_deleted` removes it later.
    pub fn mark_deleted(&mut self) {
        self.action = ResourceAction::Delete;
        self.status = ResourceStatus::Complete;
        self.status_reason = "deleted".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_resource_is_active() {
        let resource = Resource::new(StackId::generate(), "server", "compute.server", None);
        assert!(resource.is_active());
        assert_eq!(resource.action, ResourceAction::Init);
    }

    #[test]
    fn deleted_resource_is_inactive() {
        let mut resource = Resource::new(StackId::generate(), "server", "compute.server", None);
        resource.mark_deleted();
        assert!(!resource.is_active());
    }
}
