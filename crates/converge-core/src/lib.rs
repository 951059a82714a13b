//! # converge-core
//!
//! Core primitives shared by the converge orchestration engine.
//!
//! This crate provides the foundational types used across all converge components:
//!
//! - **Identifiers**: Strongly-typed IDs for stacks, traversals, engines, templates
//!   and resources
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialisation and span constructors
//! - **Retry**: A bounded, jittered retry combinator for compare-and-swap writes
//!
//! ## Crate Boundary
//!
//! `converge-core` holds only primitives. The convergence algorithms live in
//! `converge-engine`, which consumes these types.
//!
//! ## Example
//!
//! ```rust
//! use converge_core::prelude::*;
//!
//! let stack = StackId::generate();
//! let traversal = TraversalId::generate();
//! assert_ne!(stack.to_string(), traversal.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod retry;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use converge_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EngineId, ResourceId, StackId, TemplateId, TraversalId};
    pub use crate::observability::{LogFormat, init_logging};
    pub use crate::retry::{Attempt, RetryPolicy, retry_on_conflict};
}

pub use error::{Error, Result};
pub use id::{EngineId, ResourceId, StackId, TemplateId, TraversalId};
