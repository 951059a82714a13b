//! Error types for the convergence engine.

use converge_core::{EngineId, ResourceId, StackId, TemplateId};

/// The result type used throughout converge-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in convergence operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another engine (or this one) is already acting on the stack.
    ///
    /// Recoverable: the caller may retry later or wait for `action` to finish.
    #[error("stack {stack_name} already has an action ({action}) in progress (held by engine {engine_id})")]
    ActionInProgress {
        /// Name of the locked stack.
        stack_name: String,
        /// The stack's current action, for diagnostics.
        action: String,
        /// The engine currently holding the lock.
        engine_id: EngineId,
    },

    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// The nodes involved in the cycle.
        cycle: Vec<String>,
    },

    /// A template is structurally invalid (unknown reference, bad definition).
    #[error("invalid template: {message}")]
    InvalidTemplate {
        /// Description of the problem.
        message: String,
    },

    /// A template names a resource type that no plugin is registered for.
    #[error("unknown resource type: {type_name}")]
    UnknownResourceType {
        /// The unregistered type name.
        type_name: String,
    },

    /// Persisted graph data could not be interpreted.
    #[error("corrupt dependency graph: {message}")]
    CorruptGraph {
        /// Description of the corruption.
        message: String,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// A stack was not found.
    #[error("stack not found: {stack_id}")]
    StackNotFound {
        /// The stack that was not found.
        stack_id: StackId,
    },

    /// A resource row was not found.
    #[error("resource not found: {resource_id}")]
    ResourceNotFound {
        /// The resource that was not found.
        resource_id: ResourceId,
    },

    /// A raw template was not found.
    #[error("template not found: {template_id}")]
    TemplateNotFound {
        /// The template that was not found.
        template_id: TemplateId,
    },

    /// A sync point already exists for this key; traversals never reuse one.
    #[error("sync point already exists: {key}")]
    SyncPointExists {
        /// The duplicated sync point key.
        key: String,
    },

    /// A sync point expected by a callback does not exist.
    #[error("sync point not found: {key}")]
    SyncPointNotFound {
        /// The missing sync point key.
        key: String,
    },

    /// Merging into a sync point kept losing the compare-and-swap race.
    #[error("sync point {key} update failed after {attempts} attempts")]
    SyncPointUpdateFailed {
        /// The contended sync point key.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A traversal-altering write to the stack row lost its compare-and-swap.
    #[error("concurrent transition on stack {stack_id}")]
    ConcurrentTransition {
        /// The contended stack.
        stack_id: StackId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A resource plugin reported a failure.
    #[error("resource {resource_name} failed: {message}")]
    ResourceFailed {
        /// Logical name of the failed resource.
        resource_name: String,
        /// The plugin's failure message.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from converge-core.
    #[error("core error: {0}")]
    Core(#[from] converge_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an invalid template error.
    #[must_use]
    pub fn invalid_template(message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            message: message.into(),
        }
    }

    /// Returns true for lock contention, which callers treat as "try later".
    #[must_use]
    pub const fn is_action_in_progress(&self) -> bool {
        matches!(self, Self::ActionInProgress { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn action_in_progress_names_holder_and_action() {
        let engine_id = EngineId::generate();
        let err = Error::ActionInProgress {
            stack_name: "web".into(),
            action: "UPDATE".into(),
            engine_id,
        };
        let msg = err.to_string();
        assert!(msg.contains("web"));
        assert!(msg.contains("UPDATE"));
        assert!(msg.contains(&engine_id.to_string()));
        assert!(err.is_action_in_progress());
    }

    #[test]
    fn cycle_error_display() {
        let err = Error::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "DELETE_COMPLETE".into(),
            to: "UPDATE_IN_PROGRESS".into(),
            reason: "stack is deleted".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("DELETE_COMPLETE"));
        assert!(msg.contains("stack is deleted"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "row not found");
        let err = Error::storage_with_source("failed to load stack", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn serde_errors_convert() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
