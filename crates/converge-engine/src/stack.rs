//! Stack rows and the stack-level state machine.
//!
//! A stack's `(action, status)` pair is derived state: it changes only through
//! [`ConvergenceEngine::state_set`](crate::engine::ConvergenceEngine::state_set),
//! never by assigning the fields directly.
//!
//! ```text
//!  converge_stack(action)          all roots complete
//!  ─────────────────► ACTION_IN_PROGRESS ─────────────────► ACTION_COMPLETE
//!                             │
//!                             │ node failed / timed out
//!                             ▼
//!                       ACTION_FAILED ──(CREATE/UPDATE/ADOPT/RESTORE, rollback enabled)──► ROLLBACK_IN_PROGRESS
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::{StackId, TemplateId, TraversalId};

use crate::graph::PersistedDeps;

/// The operation a stack is undergoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackAction {
    /// First application of a template.
    Create,
    /// Application of a new template version.
    Update,
    /// Removal of every resource.
    Delete,
    /// Re-application of the previous template after a failure.
    Rollback,
    /// Adoption of pre-existing physical resources.
    Adopt,
    /// Suspension of every resource.
    Suspend,
    /// Resumption of every resource.
    Resume,
    /// Snapshot of every resource.
    Snapshot,
    /// Restore from a snapshot.
    Restore,
    /// Health check of every resource.
    Check,
}

impl StackAction {
    /// Whether `IN_PROGRESS` transitions of this action are written to storage.
    ///
    /// Suspend, resume and snapshot only persist their terminal transitions.
    #[must_use]
    pub const fn persists_in_progress(self) -> bool {
        !matches!(self, Self::Suspend | Self::Resume | Self::Snapshot)
    }

    /// Whether a failure of this action triggers a rollback (unless disabled).
    #[must_use]
    pub const fn rolls_back_on_failure(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Adopt | Self::Restore
        )
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Rollback => "ROLLBACK",
            Self::Adopt => "ADOPT",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
            Self::Snapshot => "SNAPSHOT",
            Self::Restore => "RESTORE",
            Self::Check => "CHECK",
        }
    }
}

impl fmt::Display for StackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the current action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    /// Work is being scheduled or executed.
    InProgress,
    /// Every node of the traversal completed.
    Complete,
    /// The traversal failed or timed out.
    Failed,
}

impl StackStatus {
    /// True for `COMPLETE` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options supplied when a stack is first created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackOptions {
    /// Owning stack, for nested stacks.
    pub owner_id: Option<StackId>,
    /// Skip rollback when a create/update fails.
    pub disable_rollback: bool,
    /// Wall-clock budget for each traversal.
    pub timeout: Option<Duration>,
    /// Data describing physical resources to adopt.
    pub adopt_stack_data: Option<Value>,
}

/// A persisted stack row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack identity.
    pub id: StackId,
    /// Human-readable name.
    pub name: String,
    /// Parent stack for nested stacks.
    pub owner_id: Option<StackId>,
    /// The desired template.
    pub raw_template_id: TemplateId,
    /// The template to roll back to, if any.
    pub prev_raw_template_id: Option<TemplateId>,
    /// The latest convergence run; `None` once a traversal failed or before the first.
    pub current_traversal: Option<TraversalId>,
    /// The dependency graph of `current_traversal`.
    pub current_deps: PersistedDeps,
    action: StackAction,
    status: StackStatus,
    status_reason: String,
    /// Whether this stack is driven by the convergence engine.
    pub convergence: bool,
    /// Skip rollback on failure.
    pub disable_rollback: bool,
    /// Wall-clock budget for each traversal.
    pub timeout: Option<Duration>,
    /// Adoption input, forwarded to workers.
    pub adopt_stack_data: Option<Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the latest traversal.
    pub updated_at: DateTime<Utc>,
}

impl Stack {
    /// Creates a new stack row in `CREATE_IN_PROGRESS`.
    #[must_use]
    pub fn new(name: impl Into<String>, raw_template_id: TemplateId, options: StackOptions) -> Self {
        let now = Utc::now();
        Self {
            id: StackId::generate(),
            name: name.into(),
            owner_id: options.owner_id,
            raw_template_id,
            prev_raw_template_id: None,
            current_traversal: None,
            current_deps: PersistedDeps::default(),
            action: StackAction::Create,
            status: StackStatus::InProgress,
            status_reason: "Stack CREATE started".to_string(),
            convergence: true,
            disable_rollback: options.disable_rollback,
            timeout: options.timeout,
            adopt_stack_data: options.adopt_stack_data,
            created_at: now,
            updated_at: now,
        }
    }

    /// The current action.
    #[must_use]
    pub const fn action(&self) -> StackAction {
        self.action
    }

    /// The current status.
    #[must_use]
    pub const fn status(&self) -> StackStatus {
        self.status
    }

    /// Human-readable explanation of the current status.
    #[must_use]
    pub fn status_reason(&self) -> &str {
        &self.status_reason
    }

    /// `ACTION_STATUS`, e.g. `UPDATE_IN_PROGRESS`.
    #[must_use]
    pub fn state_label(&self) -> String {
        format!("{}_{}", self.action, self.status)
    }

    /// Whether `traversal_id` is the stack's traversal and has not yet
    /// reached a terminal state.
    #[must_use]
    pub fn is_running(&self, traversal_id: TraversalId) -> bool {
        self.current_traversal == Some(traversal_id) && self.status == StackStatus::InProgress
    }

    /// True for nested stacks, whose credentials belong to the parent.
    #[must_use]
    pub const fn is_nested(&self) -> bool {
        self.owner_id.is_some()
    }

    /// Whether the traversal started at `updated_at` has exceeded its budget.
    #[must_use]
    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        if self.status != StackStatus::InProgress {
            return false;
        }
        chrono::Duration::from_std(timeout)
            .map(|budget| now - self.updated_at >= budget)
            .unwrap_or(false)
    }

    pub(crate) fn set_state(&mut self, action: StackAction, status: StackStatus, reason: impl Into<String>) {
        self.action = action;
        self.status = status;
        self.status_reason = reason.into();
    }
}
