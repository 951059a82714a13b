//! Distributed per-stack mutual exclusion.
//!
//! A lock row maps a stack to the engine that owns it. The row is created on
//! acquire, deleted on release, and only ever rewritten by a steal, which is a
//! compare-and-swap expecting the stale owner.
//!
//! A holder is stale when the liveness registry cannot confirm it is running.
//! Probe failures and timeouts count as "not alive": a double execution is
//! recoverable because traversals are idempotent, a deadlocked stack is not.
//!
//! The lock serializes who may *start* a traversal-altering operation. Row
//! writes made while a traversal runs are individually atomic and do not
//! need it, so the lock can be released once dispatch is underway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use converge_core::observability::lock_span;
use converge_core::{EngineId, StackId};

use crate::error::{Error, Result};
use crate::liveness::EngineLiveness;
use crate::metrics::EngineMetrics;
use crate::store::{ReleaseResult, StealResult, Store};

/// Default bound on a liveness probe.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// The lock on one stack, as seen by one engine.
#[derive(Clone)]
pub struct StackLock {
    store: Arc<dyn Store>,
    liveness: Arc<dyn EngineLiveness>,
    stack_id: StackId,
    engine_id: EngineId,
    liveness_timeout: Duration,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for StackLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLock")
            .field("stack_id", &self.stack_id)
            .field("engine_id", &self.engine_id)
            .finish_non_exhaustive()
    }
}

impl StackLock {
    /// Creates a handle on the lock of `stack_id` for `engine_id`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        liveness: Arc<dyn EngineLiveness>,
        stack_id: StackId,
        engine_id: EngineId,
    ) -> Self {
        Self {
            store,
            liveness,
            stack_id,
            engine_id,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            metrics: EngineMetrics::new(),
        }
    }

    /// Sets the bound on liveness probes.
    #[must_use]
    pub const fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// The stack this lock guards.
    #[must_use]
    pub const fn stack_id(&self) -> StackId {
        self.stack_id
    }

    /// The engine acting through this handle.
    #[must_use]
    pub const fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    /// The current holder, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_engine_id(&self) -> Result<Option<EngineId>> {
        self.store.get_engine_id(&self.stack_id).await
    }

    /// Tries to take the lock without inspecting the holder.
    ///
    /// Returns `None` if we now hold the lock, or the holder on conflict.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn try_acquire(&self) -> Result<Option<EngineId>> {
        self.store
            .create_lock(&self.stack_id, &self.engine_id)
            .instrument(self.span("try_acquire"))
            .await
    }

    /// Takes the lock, stealing it from a holder that is not alive.
    ///
    /// With `retry`, a lock released between the conflict and the steal is
    /// re-acquired once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionInProgress`] if the lock is held by this engine
    /// or by a live engine, or was taken by a third engine during the steal.
    pub async fn acquire(&self, retry: bool) -> Result<()> {
        self.acquire_inner(retry).instrument(self.span("acquire")).await
    }

    async fn acquire_inner(&self, mut retry: bool) -> Result<()> {
        loop {
            let Some(holder) = self.store.create_lock(&self.stack_id, &self.engine_id).await?
            else {
                tracing::debug!("stack lock acquired");
                return Ok(());
            };

            if holder == self.engine_id || self.engine_alive(&holder).await {
                tracing::debug!(holder = %holder, "stack lock held by live engine");
                self.metrics.record_lock_contention("busy");
                return Err(self.action_in_progress(holder).await);
            }

            match self
                .store
                .steal_lock(&self.stack_id, &holder, &self.engine_id)
                .await?
            {
                StealResult::Stolen => {
                    tracing::info!(stale_holder = %holder, "stole stack lock from dead engine");
                    self.metrics.record_lock_contention("stolen");
                    return Ok(());
                }
                StealResult::Released if retry => {
                    tracing::info!(stale_holder = %holder, "stack lock released during steal; retrying");
                    retry = false;
                }
                StealResult::Released => {
                    self.metrics.record_lock_contention("busy");
                    return Err(self.action_in_progress(holder).await);
                }
                StealResult::HeldBy(other) => {
                    tracing::info!(holder = %other, "stack lock taken by another engine during steal");
                    self.metrics.record_lock_contention("busy");
                    return Err(self.action_in_progress(other).await);
                }
            }
        }
    }

    /// Deletes the lock row if we own it.
    ///
    /// Releasing a lock that is not held is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn release(&self) -> Result<()> {
        let result = self
            .store
            .release_lock(&self.stack_id, &self.engine_id)
            .instrument(self.span("release"))
            .await?;
        match result {
            ReleaseResult::Released => tracing::debug!(
                stack_id = %self.stack_id,
                engine_id = %self.engine_id,
                "stack lock released"
            ),
            ReleaseResult::NotHeld => tracing::warn!(
                stack_id = %self.stack_id,
                engine_id = %self.engine_id,
                "lock was already released"
            ),
        }
        Ok(())
    }

    /// Releases the lock if this engine still holds it.
    ///
    /// Returns false, without logging, when the lock is held elsewhere or not
    /// at all.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn release_if_held(&self) -> Result<bool> {
        if self.get_engine_id().await? != Some(self.engine_id) {
            return Ok(false);
        }
        self.release().await?;
        Ok(true)
    }

    /// Whether `engine_id` answers a liveness probe within the timeout.
    ///
    /// Errors and timeouts count as not alive.
    pub async fn engine_alive(&self, engine_id: &EngineId) -> bool {
        match tokio::time::timeout(self.liveness_timeout, self.liveness.is_alive(engine_id)).await
        {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                tracing::debug!(engine_id = %engine_id, error = %e, "liveness probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(engine_id = %engine_id, "liveness probe timed out");
                false
            }
        }
    }

    /// Acquires the lock and runs `f`, releasing the lock only if `f` fails.
    ///
    /// On success the lock stays held; the caller releases it once the work
    /// it scheduled no longer needs exclusivity.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error, or the error from `f`.
    pub async fn thread_lock<T, F, Fut>(&self, retry: bool, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(retry).await?;
        match f().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(release_err) = self.release().await {
                    tracing::warn!(error = %release_err, "failed to release stack lock after error");
                }
                Err(e)
            }
        }
    }

    /// Tries to take the lock and runs `f` with the outcome.
    ///
    /// `f` receives `None` if we hold the lock, or the current holder; it
    /// decides whether to skip. If `f` fails and we had taken the lock, it is
    /// released.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the attempt, or the error from `f`.
    pub async fn try_thread_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Option<EngineId>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let holder = self.try_acquire().await?;
        match f(holder).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if holder.is_none() {
                    if let Err(release_err) = self.release().await {
                        tracing::warn!(error = %release_err, "failed to release stack lock after error");
                    }
                }
                Err(e)
            }
        }
    }

    async fn action_in_progress(&self, holder: EngineId) -> Error {
        let (stack_name, action) = match self.store.get_stack(&self.stack_id).await {
            Ok(Some(stack)) => (stack.name.clone(), stack.action().to_string()),
            _ => (self.stack_id.to_string(), "UNKNOWN".to_string()),
        };
        Error::ActionInProgress {
            stack_name,
            action,
            engine_id: holder,
        }
    }

    fn span(&self, operation: &str) -> tracing::Span {
        lock_span(
            operation,
            &self.stack_id.to_string(),
            &self.engine_id.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::memory::InMemoryLiveness;
    use crate::store::memory::InMemoryStore;

    fn lock_pair() -> (StackLock, StackLock, Arc<InMemoryLiveness>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let liveness = Arc::new(InMemoryLiveness::new());
        let stack_id = StackId::generate();
        let a = StackLock::new(
            Arc::clone(&store),
            liveness.clone(),
            stack_id,
            EngineId::generate(),
        );
        let b = StackLock::new(store, liveness.clone(), stack_id, EngineId::generate());
        (a, b, liveness)
    }

    #[tokio::test]
    async fn try_acquire_reports_holder() {
        let (a, b, _) = lock_pair();
        assert_eq!(a.try_acquire().await.unwrap(), None);
        assert_eq!(b.try_acquire().await.unwrap(), Some(a.engine_id()));
    }

    #[tokio::test]
    async fn reacquire_by_owner_is_action_in_progress() {
        let (a, _, _) = lock_pair();
        a.acquire(true).await.unwrap();
        let err = a.acquire(true).await.unwrap_err();
        assert!(err.is_action_in_progress());
    }

    #[tokio::test]
    async fn dead_holder_is_stolen() {
        let (a, b, _) = lock_pair();
        a.acquire(true).await.unwrap();
        b.acquire(true).await.unwrap();
        assert_eq!(b.get_engine_id().await.unwrap(), Some(b.engine_id()));
    }

    #[tokio::test]
    async fn live_holder_is_respected() {
        let (a, b, liveness) = lock_pair();
        liveness.register(a.engine_id()).unwrap();
        a.acquire(true).await.unwrap();

        match b.acquire(true).await {
            Err(Error::ActionInProgress { engine_id, .. }) => assert_eq!(engine_id, a.engine_id()),
            other => panic!("expected ActionInProgress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresponsive_holder_counts_as_dead() {
        let (a, b, liveness) = lock_pair();
        liveness.hang(a.engine_id()).unwrap();
        a.acquire(true).await.unwrap();

        let b = b.with_liveness_timeout(Duration::from_millis(20));
        b.acquire(true).await.unwrap();
        assert_eq!(b.get_engine_id().await.unwrap(), Some(b.engine_id()));
    }

    #[tokio::test]
    async fn release_is_owner_only_and_idempotent() {
        let (a, b, _) = lock_pair();
        a.acquire(true).await.unwrap();
        b.release().await.unwrap();
        assert_eq!(a.get_engine_id().await.unwrap(), Some(a.engine_id()));

        a.release().await.unwrap();
        a.release().await.unwrap();
        assert_eq!(a.get_engine_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_if_held_ignores_foreign_lock() {
        let (a, b, _) = lock_pair();
        a.acquire(true).await.unwrap();
        assert!(!b.release_if_held().await.unwrap());
        assert!(a.release_if_held().await.unwrap());
        assert!(!a.release_if_held().await.unwrap());
    }

    #[tokio::test]
    async fn thread_lock_releases_only_on_error() {
        let (a, _, _) = lock_pair();
        let value = a.thread_lock(true, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(a.get_engine_id().await.unwrap(), Some(a.engine_id()));
        a.release().await.unwrap();

        let result: Result<()> = a
            .thread_lock(true, || async { Err(Error::storage("boom")) })
            .await;
        assert!(result.is_err());
        assert_eq!(a.get_engine_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn try_thread_lock_leaves_foreign_lock_alone() {
        let (a, b, _) = lock_pair();
        a.acquire(true).await.unwrap();
        let holder_id = a.engine_id();

        let result: Result<()> = b
            .try_thread_lock(|holder| async move {
                assert_eq!(holder, Some(holder_id));
                Err(Error::storage("boom"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(b.get_engine_id().await.unwrap(), Some(holder_id));
    }
}
