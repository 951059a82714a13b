//! Convergence metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `converge_traversals_total` | Counter | `action` | Traversals started |
//! | `converge_traversal_setup_seconds` | Histogram | `action` | Time to persist and dispatch a traversal |
//! | `converge_nodes_dispatched_total` | Counter | `kind` | Nodes handed to workers |
//! | `converge_stale_callbacks_total` | Counter | - | Callbacks dropped for a superseded traversal |
//! | `converge_sync_conflicts_total` | Counter | - | Lost sync point compare-and-swaps |
//! | `converge_lock_contention_total` | Counter | `outcome` | Stack lock conflicts by outcome |
//! | `converge_stack_terminal_total` | Counter | `action`, `status` | Stacks reaching a terminal state |
//!
//! ## Usage
//!
//! ```rust
//! use converge_engine::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_traversal("UPDATE");
//! metrics.record_node_dispatched(true);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Traversals started.
    pub const TRAVERSALS_TOTAL: &str = "converge_traversals_total";
    /// Histogram: Time from `converge_stack` entry to dispatch of the leaves.
    pub const TRAVERSAL_SETUP_SECONDS: &str = "converge_traversal_setup_seconds";
    /// Counter: Nodes dispatched to workers.
    pub const NODES_DISPATCHED_TOTAL: &str = "converge_nodes_dispatched_total";
    /// Counter: Callbacks dropped because their traversal was superseded.
    pub const STALE_CALLBACKS_TOTAL: &str = "converge_stale_callbacks_total";
    /// Counter: Sync point compare-and-swap conflicts.
    pub const SYNC_CONFLICTS_TOTAL: &str = "converge_sync_conflicts_total";
    /// Counter: Stack lock contention.
    pub const LOCK_CONTENTION_TOTAL: &str = "converge_lock_contention_total";
    /// Counter: Terminal stack states.
    pub const STACK_TERMINAL_TOTAL: &str = "converge_stack_terminal_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Stack action (CREATE, UPDATE, ...).
    pub const ACTION: &str = "action";
    /// Stack status (COMPLETE, FAILED).
    pub const STATUS: &str = "status";
    /// Node direction (update, cleanup).
    pub const KIND: &str = "kind";
    /// Contention outcome (busy, stolen).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording convergence metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records the start of a traversal.
    pub fn record_traversal(&self, action: &str) {
        counter!(names::TRAVERSALS_TOTAL, labels::ACTION => action.to_string()).increment(1);
    }

    /// Records how long setting up a traversal took.
    pub fn observe_traversal_setup(&self, action: &str, duration: Duration) {
        histogram!(names::TRAVERSAL_SETUP_SECONDS, labels::ACTION => action.to_string())
            .record(duration.as_secs_f64());
    }

    /// Records a node handed to a worker.
    pub fn record_node_dispatched(&self, is_update: bool) {
        let kind = if is_update { "update" } else { "cleanup" };
        counter!(names::NODES_DISPATCHED_TOTAL, labels::KIND => kind).increment(1);
    }

    /// Records a callback for a superseded traversal.
    pub fn record_stale_callback(&self) {
        counter!(names::STALE_CALLBACKS_TOTAL).increment(1);
    }

    /// Records a lost sync point compare-and-swap.
    pub fn record_sync_conflict(&self) {
        counter!(names::SYNC_CONFLICTS_TOTAL).increment(1);
    }

    /// Records stack lock contention (`busy` or `stolen`).
    pub fn record_lock_contention(&self, outcome: &'static str) {
        counter!(names::LOCK_CONTENTION_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a stack reaching a terminal state.
    pub fn record_stack_terminal(&self, action: &str, status: &str) {
        counter!(
            names::STACK_TERMINAL_TOTAL,
            labels::ACTION => action.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_metrics_record_without_recorder() {
        let metrics = EngineMetrics::new();
        metrics.record_traversal("CREATE");
        metrics.record_node_dispatched(false);
        metrics.record_stale_callback();
        metrics.record_sync_conflict();
        metrics.record_lock_contention("busy");
        metrics.record_stack_terminal("CREATE", "COMPLETE");
        metrics.observe_traversal_setup("CREATE", Duration::from_millis(3));
    }

    #[test]
    fn timing_guard_reports_elapsed() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }
}
