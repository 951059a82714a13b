//! Engine configuration.
//!
//! Every field has a default; `from_env()` overrides them from `CONVERGE_*`
//! environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use converge_core::observability::LogFormat;
use converge_core::retry::RetryPolicy;
use converge_core::EngineId;

use crate::error::Result;
use crate::stack_lock::DEFAULT_LIVENESS_TIMEOUT;

/// Configuration of one engine process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identity of this engine; recorded as the owner of the locks it takes.
    pub engine_id: EngineId,
    /// Bound on liveness probes of other engines.
    pub liveness_timeout: Duration,
    /// Retry budget for contended sync point and resource row writes.
    pub sync_retry: RetryPolicy,
    /// Skip rollback on failure for every stack served by this engine.
    pub disable_rollback: bool,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: EngineId::generate(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            sync_retry: RetryPolicy::default(),
            disable_rollback: false,
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CONVERGE_ENGINE_ID` | `engine_id` |
    /// | `CONVERGE_LIVENESS_TIMEOUT_MS` | `liveness_timeout` |
    /// | `CONVERGE_SYNC_MAX_ATTEMPTS` | `sync_retry.max_attempts` |
    /// | `CONVERGE_SYNC_BASE_DELAY_MS` | `sync_retry.base_delay` |
    /// | `CONVERGE_SYNC_MAX_DELAY_MS` | `sync_retry.max_delay` |
    /// | `CONVERGE_DISABLE_ROLLBACK` | `disable_rollback` |
    /// | `CONVERGE_LOG_FORMAT` | `log_format` (`json`/`pretty`) |
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(id) = env.string("CONVERGE_ENGINE_ID") {
            config.engine_id = id.parse()?;
        }
        if let Some(ms) = env.u64("CONVERGE_LIVENESS_TIMEOUT_MS")? {
            config.liveness_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env.u64("CONVERGE_SYNC_MAX_ATTEMPTS")? {
            config.sync_retry.max_attempts = u32::try_from(attempts).map_err(|_| {
                invalid("CONVERGE_SYNC_MAX_ATTEMPTS must fit in 32 bits".to_string())
            })?;
            if config.sync_retry.max_attempts == 0 {
                return Err(invalid(
                    "CONVERGE_SYNC_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
        }
        if let Some(ms) = env.u64("CONVERGE_SYNC_BASE_DELAY_MS")? {
            config.sync_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("CONVERGE_SYNC_MAX_DELAY_MS")? {
            config.sync_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(disable) = env.bool("CONVERGE_DISABLE_ROLLBACK")? {
            config.disable_rollback = disable;
        }
        if let Some(format) = env.string("CONVERGE_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        if config.sync_retry.base_delay > config.sync_retry.max_delay {
            return Err(invalid(
                "CONVERGE_SYNC_BASE_DELAY_MS must not exceed CONVERGE_SYNC_MAX_DELAY_MS"
                    .to_string(),
            ));
        }

        Ok(config)
    }
}

fn invalid(message: String) -> crate::error::Error {
    converge_core::Error::InvalidInput(message).into()
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| invalid(format!("{name} must be a u64: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(invalid(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
