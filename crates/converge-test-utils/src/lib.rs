//! Shared test utilities for converge integration tests.
//!
//! This crate provides:
//! - [`SimulatedCluster`]: An engine with in-memory collaborators and a
//!   seeded, simulated worker fleet
//! - [`TestPlugin`]: A resource plugin with call recording and failure
//!   injection
//! - Template fixtures for common graph shapes
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use converge_test_utils::{SimulatedCluster, five_resource_template};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = SimulatedCluster::new();
//!     let stack = cluster.create_stack("web", five_resource_template()).await.unwrap();
//!     cluster.run_until_idle().await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod plugin;
pub mod simulation;

pub use assertions::*;
pub use fixtures::*;
pub use plugin::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("converge_engine=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
