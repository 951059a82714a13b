//! Observability infrastructure for converge.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by every
//! converge component.

use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected 'json' or 'pretty')"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `converge_engine=debug`)
///
/// # Example
///
/// ```rust
/// use converge_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for convergence operations on one stack traversal.
///
/// # Example
///
/// ```rust
/// use converge_core::observability::convergence_span;
///
/// let span = convergence_span("converge_stack", "01J0STACK", "01J0TRAVERSAL");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn convergence_span(operation: &str, stack_id: &str, traversal_id: &str) -> Span {
    tracing::info_span!(
        "convergence",
        op = operation,
        stack_id = stack_id,
        traversal_id = traversal_id,
    )
}

/// Creates a span for stack lock operations.
#[must_use]
pub fn lock_span(operation: &str, stack_id: &str, engine_id: &str) -> Span {
    tracing::debug_span!(
        "stack_lock",
        op = operation,
        stack_id = stack_id,
        engine_id = engine_id,
    )
}
