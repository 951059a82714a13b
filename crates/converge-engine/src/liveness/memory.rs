//! In-memory liveness registry for testing.
//!
//! Engines are dead until registered. An engine can also be marked
//! unresponsive, in which case probes never answer and callers hit their
//! timeout.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use converge_core::EngineId;

use super::EngineLiveness;
use crate::error::{Error, Result};

/// In-memory liveness registry.
#[derive(Debug, Default)]
pub struct InMemoryLiveness {
    alive: RwLock<HashSet<EngineId>>,
    unresponsive: RwLock<HashSet<EngineId>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("liveness registry lock poisoned")
}

impl InMemoryLiveness {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an engine as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register(&self, engine_id: EngineId) -> Result<()> {
        self.alive.write().map_err(poison_err)?.insert(engine_id);
        Ok(())
    }

    /// Marks an engine as gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn kill(&self, engine_id: &EngineId) -> Result<()> {
        self.alive.write().map_err(poison_err)?.remove(engine_id);
        Ok(())
    }

    /// Makes probes of `engine_id` hang forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn hang(&self, engine_id: EngineId) -> Result<()> {
        self.unresponsive.write().map_err(poison_err)?.insert(engine_id);
        Ok(())
    }
}

#[async_trait]
impl EngineLiveness for InMemoryLiveness {
    async fn is_alive(&self, engine_id: &EngineId) -> Result<bool> {
        let hangs = self.unresponsive.read().map_err(poison_err)?.contains(engine_id);
        if hangs {
            std::future::pending::<()>().await;
        }
        let alive = self.alive.read().map_err(poison_err)?.contains(engine_id);
        Ok(alive)
    }
}
