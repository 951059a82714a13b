//! # converge-engine
//!
//! Convergence engine for declarative resource stacks.
//!
//! Given a template (the desired resources and how they reference each
//! other) and the resources a stack already has, the engine computes a
//! dependency graph and walks it by dispatching one unit of work per graph
//! node to workers. Independent nodes run in parallel; a node runs once every
//! node it depends on has reported back.
//!
//! ## Core Concepts
//!
//! - **Traversal**: One walk of a stack's graph, identified by a
//!   [`TraversalId`](converge_core::TraversalId). Starting a new traversal
//!   supersedes the one in flight.
//! - **Graph node**: A [`GraphKey`](graph::GraphKey), `(resource id, is_update)`.
//!   Update nodes create or modify resources in dependency order; cleanup
//!   nodes delete obsolete ones in reverse order.
//! - **Sync point**: A persisted join barrier per node that collects the
//!   outputs of its predecessors ([`sync_point`]).
//! - **Stack lock**: Distributed mutual exclusion over starting traversals,
//!   with takeover from engines that died ([`stack_lock`]).
//!
//! ## Guarantees
//!
//! - **Deterministic**: The same template and rows always give the same graph
//! - **At most once per traversal**: A node is dispatched once per traversal,
//!   however often its predecessors' completions are redelivered
//! - **Lock-free completion**: Completion callbacks use compare-and-swap
//!   writes only and never wait for the stack lock
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use converge_engine::prelude::*;
//! use converge_engine::dispatch::memory::InMemoryWorkerClient;
//! use converge_engine::liveness::memory::InMemoryLiveness;
//! use converge_engine::store::memory::InMemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let engine = ConvergenceEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(ResourceRegistry::new()),
//!     Arc::new(InMemoryWorkerClient::new()),
//!     Arc::new(InMemoryLiveness::new()),
//! );
//!
//! // An empty stack converges without dispatching anything.
//! let stack = engine
//!     .create_stack("empty", Template::empty(), StackOptions::default())
//!     .await?;
//! assert_eq!(stack.state_label(), "CREATE_COMPLETE");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;
mod stack_state;

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod graph_builder;
pub mod liveness;
pub mod metrics;
pub mod plugin;
pub mod resource;
pub mod stack;
pub mod stack_lock;
pub mod store;
pub mod sync_point;
pub mod template;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{CheckResourceRequest, WorkerClient};
    pub use crate::engine::ConvergenceEngine;
    pub use crate::error::{Error, Result};
    pub use crate::graph::{Dependencies, GraphKey};
    pub use crate::liveness::EngineLiveness;
    pub use crate::metrics::EngineMetrics;
    pub use crate::plugin::{
        Capabilities, OperationOutcome, ResourceContext, ResourceOperation, ResourcePlugin,
        ResourceRegistry,
    };
    pub use crate::resource::{Resource, ResourceAction, ResourceStatus};
    pub use crate::stack::{Stack, StackAction, StackOptions, StackStatus};
    pub use crate::stack_lock::StackLock;
    pub use crate::store::{CasResult, Store};
    pub use crate::sync_point::{InputData, SyncPoint, SyncPointKey, SyncPoints};
    pub use crate::template::{ResourceDefinition, Template};
    pub use crate::worker::{NodeOutput, NodeWorker};
}
