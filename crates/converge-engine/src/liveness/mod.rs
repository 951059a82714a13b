//! Engine liveness probing.
//!
//! A stack lock names the engine that holds it. Before stealing a lock, the
//! would-be owner asks the [`EngineLiveness`] registry whether the holder is
//! still running. Implementations typically send a "listening" RPC to the
//! holder's queue; [`memory::InMemoryLiveness`] serves tests.

pub mod memory;

use async_trait::async_trait;

use converge_core::EngineId;

use crate::error::Result;

/// Answers whether an engine process is still running.
#[async_trait]
pub trait EngineLiveness: Send + Sync {
    /// Probes `engine_id`.
    ///
    /// Returns `Ok(false)` for an engine known to be gone. Transport failures
    /// may be reported as errors; callers treat them as "not alive".
    async fn is_alive(&self, engine_id: &EngineId) -> Result<bool>;
}
