//! Engine configuration: concurrency bounds and step defaults.

use crate::error::{EngineError, Result};
use crate::playbook::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine-wide bound on concurrently executing leaf steps, across all
    /// runs sharing the engine.
    pub max_concurrent_steps: usize,
    /// Default throttle for parallel groups that declare none. Derived
    /// from host capacity.
    pub default_throttle: usize,
    /// Hard ceiling no group throttle may exceed, declared or defaulted.
    pub throttle_ceiling: usize,
    /// Retry policy for leaf steps that declare none.
    pub default_retry: RetryPolicy,
    /// Broadcast capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let host_capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_concurrent_steps: 16,
            default_throttle: host_capacity,
            throttle_ceiling: 64,
            default_retry: RetryPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("PLAYBOOK_MAX_CONCURRENT_STEPS") {
            config.max_concurrent_steps = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid max_concurrent_steps: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("PLAYBOOK_DEFAULT_THROTTLE") {
            config.default_throttle = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid default_throttle: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("PLAYBOOK_THROTTLE_CEILING") {
            config.throttle_ceiling = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid throttle_ceiling: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("PLAYBOOK_RETRY_MAX_ATTEMPTS") {
            config.default_retry.max_attempts = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid retry_max_attempts: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("PLAYBOOK_BACKOFF_BASE_MS") {
            config.default_retry.base_delay_ms = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid backoff_base_ms: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("PLAYBOOK_BACKOFF_MAX_MS") {
            config.default_retry.max_delay_ms = value.parse().map_err(|e| {
                EngineError::configuration(format!("invalid backoff_max_ms: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_steps == 0 {
            return Err(EngineError::configuration(
                "max_concurrent_steps must be at least 1",
            ));
        }
        if self.throttle_ceiling == 0 {
            return Err(EngineError::configuration(
                "throttle_ceiling must be at least 1",
            ));
        }
        Ok(())
    }

    /// Effective throttle for a parallel group: the declared value if any,
    /// otherwise the default, always clamped to `[1, throttle_ceiling]`.
    pub fn effective_throttle(&self, declared: Option<usize>) -> usize {
        declared
            .unwrap_or(self.default_throttle)
            .clamp(1, self.throttle_ceiling.max(1))
    }

    /// Small, deterministic values for tests: no jitter, millisecond
    /// backoff, tight concurrency.
    pub fn for_testing() -> Self {
        Self {
            max_concurrent_steps: 8,
            default_throttle: 4,
            throttle_ceiling: 8,
            default_retry: RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 5,
                max_delay_ms: 20,
                backoff_multiplier: 2.0,
                jitter: false,
                timeout_ms: None,
            },
            event_capacity: 64,
        }
    }
}
