//! Worker dispatch boundary.
//!
//! The engine never executes resource work itself. It hands each runnable
//! node to a [`WorkerClient`] as a [`CheckResourceRequest`] and forgets about
//! it; the worker reports back through
//! [`ConvergenceEngine::node_complete`](crate::engine::ConvergenceEngine::node_complete)
//! or [`ConvergenceEngine::node_failed`](crate::engine::ConvergenceEngine::node_failed).
//!
//! ## Design Principles
//!
//! - **Fire and forget**: `check_resource` returns once the request is queued
//! - **Self-contained payloads**: a request carries everything a worker on
//!   another machine needs, including the traversal id it belongs to
//! - **At-least-once**: workers may see a request more than once; completion
//!   callbacks are idempotent

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::{ResourceId, StackId, TraversalId};

use crate::error::Result;
use crate::graph::GraphKey;
use crate::sync_point::InputData;

/// One node of one traversal, ready for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResourceRequest {
    /// Owning stack.
    pub stack_id: StackId,
    /// The resource row to act on.
    pub resource_id: ResourceId,
    /// The traversal this request belongs to.
    pub traversal_id: TraversalId,
    /// Outputs of the node's predecessors.
    pub input_data: InputData,
    /// Update (true) or cleanup (false).
    pub is_update: bool,
    /// Adoption input, when the stack is being adopted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adopt_stack_data: Option<Value>,
    /// Whether the stack is nested inside another stack.
    pub is_nested: bool,
}

impl CheckResourceRequest {
    /// The graph node this request executes.
    #[must_use]
    pub const fn graph_key(&self) -> GraphKey {
        GraphKey {
            resource_id: self.resource_id,
            is_update: self.is_update,
        }
    }

    /// Key identifying this request for deduplication by queue backends.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.traversal_id, self.graph_key())
    }
}

/// Submits node work to workers.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Queues one node for execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be queued.
    async fn check_resource(&self, request: CheckResourceRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_camel_case() {
        let request = CheckResourceRequest {
            stack_id: StackId::generate(),
            resource_id: ResourceId::new(4),
            traversal_id: TraversalId::generate(),
            input_data: InputData::new(),
            is_update: false,
            adopt_stack_data: None,
            is_nested: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["resourceId"], 4);
        assert_eq!(json["isUpdate"], false);
        assert!(json.get("adoptStackData").is_none());
        assert!(request.idempotency_key().ends_with("4/cleanup"));
    }
}
