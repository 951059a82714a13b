//! Deterministic simulation of an engine with its workers.
//!
//! A [`SimulatedCluster`] wires a [`ConvergenceEngine`] to in-memory
//! collaborators and plays the role of the worker fleet: dispatched requests
//! queue up and are delivered one at a time, in an order drawn from a seeded
//! RNG. The same seed always gives the same interleaving, so a failing seed
//! can be replayed.
//!
//! # Key Features
//!
//! - **Seeded delivery order**: Requests are picked at random from everything
//!   pending, modelling workers that finish in any order
//! - **Redelivery injection**: A request can be delivered twice, modelling
//!   at-least-once queues
//! - **Clock control**: A simulated clock for timeout checks
//!
//! # Example
//!
//! ```rust,ignore
//! use converge_test_utils::{SimulatedCluster, five_resource_template};
//!
//! let cluster = SimulatedCluster::with_seed(7);
//! let stack = cluster.create_stack("web", five_resource_template()).await?;
//! cluster.run_until_idle().await?;
//! assert_eq!(cluster.stack(stack.id).await.state_label(), "CREATE_COMPLETE");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use converge_core::{EngineId, StackId};
use converge_engine::config::EngineConfig;
use converge_engine::dispatch::CheckResourceRequest;
use converge_engine::dispatch::memory::InMemoryWorkerClient;
use converge_engine::engine::ConvergenceEngine;
use converge_engine::error::Result;
use converge_engine::liveness::memory::InMemoryLiveness;
use converge_engine::plugin::ResourceRegistry;
use converge_engine::resource::Resource;
use converge_engine::stack::{Stack, StackOptions};
use converge_engine::store::StackStore;
use converge_engine::store::memory::InMemoryStore;
use converge_engine::template::Template;
use converge_engine::worker::NodeWorker;

use crate::fixtures::{TEST_RESOURCE_TYPE, test_engine_config};
use crate::plugin::TestPlugin;

/// Upper bound on deliveries in [`SimulatedCluster::run_until_idle`].
const MAX_STEPS: usize = 10_000;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that a delivered request is delivered a second time.
    pub redelivery_rate: f64,
    /// Deliver in submission order instead of at random.
    pub fifo: bool,
}

impl FaultConfig {
    /// No faults, random order.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every request delivered twice.
    #[must_use]
    pub fn always_redeliver() -> Self {
        Self {
            redelivery_rate: 1.0,
            ..Self::default()
        }
    }
}

/// Simulated clock for deterministic time control.
#[derive(Debug)]
pub struct SimulatedClock {
    base: DateTime<Utc>,
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a clock starting at `base`.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// The current simulated time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = i64::try_from(self.elapsed_ms.load(Ordering::Relaxed)).unwrap();
        self.base + chrono::Duration::milliseconds(elapsed)
    }

    /// Advances the clock.
    pub fn advance(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap();
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

/// An engine, its in-memory collaborators and a simulated worker fleet.
pub struct SimulatedCluster {
    seed: u64,
    rng: Mutex<StdRng>,
    faults: FaultConfig,
    clock: SimulatedClock,
    store: Arc<InMemoryStore>,
    workers: Arc<InMemoryWorkerClient>,
    liveness: Arc<InMemoryLiveness>,
    plugin: Arc<TestPlugin>,
    registry: Arc<ResourceRegistry>,
    engine: Arc<ConvergenceEngine>,
    worker: NodeWorker,
    pending: Mutex<Vec<CheckResourceRequest>>,
    delivered: Mutex<Vec<CheckResourceRequest>>,
}

impl std::fmt::Debug for SimulatedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCluster")
            .field("seed", &self.seed)
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    /// A cluster with seed 0 and no faults.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// A cluster with the given delivery seed and no faults.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_config(seed, test_engine_config(), FaultConfig::no_faults())
    }

    /// A cluster with explicit engine configuration and faults.
    pub fn with_config(seed: u64, config: EngineConfig, faults: FaultConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let workers = Arc::new(InMemoryWorkerClient::new());
        let liveness = Arc::new(InMemoryLiveness::new());
        let plugin = Arc::new(TestPlugin::new());
        let registry =
            Arc::new(ResourceRegistry::new().with_plugin(TEST_RESOURCE_TYPE, plugin.clone()));

        liveness.register(config.engine_id).unwrap();
        let engine = Arc::new(ConvergenceEngine::new(
            config,
            store.clone(),
            Arc::clone(&registry),
            workers.clone(),
            liveness.clone(),
        ));

        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            faults,
            clock: SimulatedClock::default(),
            store,
            workers,
            liveness,
            plugin,
            registry,
            worker: NodeWorker::new(Arc::clone(&engine)),
            engine,
            pending: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// The delivery seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The engine under test.
    pub fn engine(&self) -> &Arc<ConvergenceEngine> {
        &self.engine
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    /// The liveness registry.
    pub fn liveness(&self) -> &Arc<InMemoryLiveness> {
        &self.liveness
    }

    /// The plugin behind [`TEST_RESOURCE_TYPE`].
    pub fn plugin(&self) -> &Arc<TestPlugin> {
        &self.plugin
    }

    /// The simulated clock.
    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    /// A second engine sharing every collaborator, registered as alive.
    pub fn peer_engine(&self) -> Arc<ConvergenceEngine> {
        let config = EngineConfig {
            engine_id: EngineId::generate(),
            ..self.engine.config().clone()
        };
        self.liveness.register(config.engine_id).unwrap();
        Arc::new(ConvergenceEngine::new(
            config,
            self.store.clone(),
            Arc::clone(&self.registry),
            self.workers.clone(),
            self.liveness.clone(),
        ))
    }

    /// Creates a stack through the engine.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub async fn create_stack(&self, name: &str, template: Template) -> Result<Stack> {
        self.engine
            .create_stack(name, template, StackOptions::default())
            .await
    }

    fn collect(&self) -> Vec<CheckResourceRequest> {
        let mut pending = self.pending.lock().unwrap();
        pending.extend(self.workers.drain().unwrap());
        std::mem::take(&mut *pending)
    }

    /// Number of requests waiting for delivery.
    pub fn pending_len(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        pending.extend(self.workers.drain().unwrap());
        pending.len()
    }

    /// Removes and returns everything waiting for delivery, in submission
    /// order.
    pub fn take_pending(&self) -> Vec<CheckResourceRequest> {
        self.collect()
    }

    /// Delivers one request to the simulated worker.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn deliver(&self, request: CheckResourceRequest) -> Result<()> {
        self.delivered.lock().unwrap().push(request.clone());
        self.worker.check_resource(request).await
    }

    /// Delivers one pending request, chosen by the seeded RNG.
    ///
    /// Returns false if nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn step(&self) -> Result<bool> {
        let request = {
            let mut pending = self.collect();
            if pending.is_empty() {
                return Ok(false);
            }
            let index = if self.faults.fifo {
                0
            } else {
                self.rng.lock().unwrap().random_range(0..pending.len())
            };
            let request = pending.remove(index);
            self.pending.lock().unwrap().extend(pending);
            request
        };

        let redeliver = self.should_fail(self.faults.redelivery_rate);
        self.deliver(request.clone()).await?;
        if redeliver {
            tracing::debug!(node = %request.graph_key(), "redelivering request");
            self.deliver(request).await?;
        }
        Ok(true)
    }

    /// Delivers requests until none are pending; returns how many were
    /// delivered (not counting redeliveries).
    ///
    /// # Errors
    ///
    /// Returns the first worker error.
    ///
    /// # Panics
    ///
    /// Panics if the traversal does not settle within a bounded number of
    /// steps.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut steps = 0;
        while self.step().await? {
            steps += 1;
            assert!(
                steps < MAX_STEPS,
                "simulation did not settle (seed {})",
                self.seed
            );
        }
        Ok(steps)
    }

    /// Every request delivered so far, including redeliveries.
    pub fn delivered(&self) -> Vec<CheckResourceRequest> {
        self.delivered.lock().unwrap().clone()
    }

    /// Forgets recorded deliveries.
    pub fn clear_delivered(&self) {
        self.delivered.lock().unwrap().clear();
    }

    /// Loads a stack row, panicking if it does not exist.
    pub async fn stack(&self, stack_id: StackId) -> Stack {
        self.engine.load_stack(&stack_id).await.unwrap()
    }

    /// Loads a stack row if it exists.
    pub async fn find_stack(&self, stack_id: StackId) -> Option<Stack> {
        self.store.get_stack(&stack_id).await.unwrap()
    }

    /// Active resource rows of a stack, by id.
    pub fn active_resources(&self, stack_id: StackId) -> Vec<Resource> {
        self.store
            .all_resources(&stack_id)
            .unwrap()
            .into_iter()
            .filter(Resource::is_active)
            .collect()
    }

    /// The active row named `name`, panicking unless there is exactly one.
    pub fn resource(&self, stack_id: StackId, name: &str) -> Resource {
        let mut rows: Vec<Resource> = self
            .active_resources(stack_id)
            .into_iter()
            .filter(|r| r.name == name)
            .collect();
        assert_eq!(rows.len(), 1, "expected one active row named {name}");
        rows.remove(0)
    }

    /// Runs the engine's timeout check at simulated time.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub async fn check_timeout(&self, stack_id: StackId) -> Result<bool> {
        self.engine
            .fail_if_timed_out(stack_id, self.clock.now())
            .await
    }

    fn should_fail(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().unwrap().random::<f64>() < probability
    }
}
