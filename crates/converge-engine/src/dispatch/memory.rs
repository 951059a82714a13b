//! In-memory worker client for testing.
//!
//! Requests are queued in order and handed out by [`InMemoryWorkerClient::take`]
//! or [`InMemoryWorkerClient::drain`]; tests decide when and in which order
//! the simulated workers run them.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{CheckResourceRequest, WorkerClient};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<CheckResourceRequest>,
    history: Vec<CheckResourceRequest>,
}

/// In-memory worker client.
#[derive(Debug, Default)]
pub struct InMemoryWorkerClient {
    state: RwLock<QueueState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("worker queue lock poisoned")
}

impl InMemoryWorkerClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest pending request.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<CheckResourceRequest>> {
        let request = self.state.write().map_err(poison_err)?.pending.pop_front();
        Ok(request)
    }

    /// Takes every pending request.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<CheckResourceRequest>> {
        let requests = self
            .state
            .write()
            .map_err(poison_err)?
            .pending
            .drain(..)
            .collect();
        Ok(requests)
    }

    /// Number of requests waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_len(&self) -> Result<usize> {
        let len = self.state.read().map_err(poison_err)?.pending.len();
        Ok(len)
    }

    /// Every request ever submitted, in submission order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn history(&self) -> Result<Vec<CheckResourceRequest>> {
        let history = self.state.read().map_err(poison_err)?.history.clone();
        Ok(history)
    }
}

#[async_trait]
impl WorkerClient for InMemoryWorkerClient {
    async fn check_resource(&self, request: CheckResourceRequest) -> Result<()> {
        tracing::debug!(
            resource_id = %request.resource_id,
            is_update = request.is_update,
            "queued check_resource"
        );
        let mut state = self.state.write().map_err(poison_err)?;
        state.history.push(request.clone());
        state.pending.push_back(request);
        drop(state);
        Ok(())
    }
}
