//! # Lifecycle Engine Configuration
//!
//! Typed configuration for the scheduler, retry policy, operation manager, step
//! timeouts, event bus and telemetry.
//!
//! ## Sources
//!
//! Layered by [`ConfigManager`], later sources win:
//!
//! 1. `<dir>/lifecycle.yaml`
//! 2. `<dir>/lifecycle.<environment>.yaml` (optional)
//! 3. `LIFECYCLE__<SECTION>__<KEY>` environment variables
//!
//! Every section has defaults, so a file only needs the keys it changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use runtime_lifecycle::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().scheduler.workers;
//! let lease = manager.config().scheduler.lease();
//! # let _ = (workers, lease);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring lifecycle.yaml
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub scheduler: SchedulerConfig,
    pub backoff: BackoffConfig,
    pub manager: ManagerConfig,
    pub timeouts: TimeoutsConfig,
    pub events: EventsConfig,
    pub telemetry: TelemetryConfig,
}

/// Worker pool and claiming behaviour
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Sleep between empty claim rounds
    pub poll_interval_ms: u64,
    pub claim_batch_size: usize,
    /// Lease length; must exceed the slowest single step invocation
    pub lease_seconds: u64,
    pub worker_id_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1000,
            claim_batch_size: 10,
            lease_seconds: 300,
            worker_id_prefix: "lifecycle".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// Retry policy for recoverable step errors
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    /// Retry budget measured from the first retry of an episode
    pub max_retry_time_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 10,
            max_delay_seconds: 600,
            multiplier: 2.0,
            max_retry_time_seconds: 3600,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_seconds)
    }

    pub fn max_retry_time(&self) -> Duration {
        Duration::from_secs(self.max_retry_time_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Re-read and re-apply attempts on a version conflict
    pub conflict_retries: u32,
    /// Delay returned when a state change could not be persisted
    pub persist_failure_delay_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
            persist_failure_delay_seconds: 60,
        }
    }
}

impl ManagerConfig {
    pub fn persist_failure_delay(&self) -> Duration {
        Duration::from_secs(self.persist_failure_delay_seconds)
    }
}

/// Step time limits and polling intervals
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub provisioning_seconds: u64,
    pub update_seconds: u64,
    pub kyma_uninstall_seconds: u64,
    pub status_poll_interval_seconds: u64,
    /// Delay after a successful uninstall trigger before the next step
    pub kyma_uninstall_delay_seconds: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            provisioning_seconds: 2 * 60 * 60,
            update_seconds: 2 * 60 * 60,
            kyma_uninstall_seconds: 10 * 60,
            status_poll_interval_seconds: 60,
            kyma_uninstall_delay_seconds: 0,
        }
    }
}

impl TimeoutsConfig {
    pub fn provisioning(&self) -> Duration {
        Duration::from_secs(self.provisioning_seconds)
    }

    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update_seconds)
    }

    pub fn kyma_uninstall(&self) -> Duration {
        Duration::from_secs(self.kyma_uninstall_seconds)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_seconds)
    }

    pub fn kyma_uninstall_delay(&self) -> Duration {
        Duration::from_secs(self.kyma_uninstall_delay_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Broadcast buffer; slow subscribers lag beyond this
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// Prefix of exported gauge names, e.g. `lifecycle.provisioning_result`
    pub metric_prefix: String,
    pub json_logs: bool,
    /// Overrides the environment default when `RUST_LOG` is unset
    pub log_level: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "runtime-lifecycle".to_string(),
            metric_prefix: "lifecycle".to_string(),
            json_logs: false,
            log_level: None,
        }
    }
}

impl LifecycleConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scheduler.workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.workers",
                "0",
                "at least one worker is required",
            ));
        }
        if self.scheduler.claim_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.claim_batch_size",
                "0",
                "must claim at least one operation per round",
            ));
        }
        if self.scheduler.lease_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.lease_seconds",
                "0",
                "leases must be longer than zero",
            ));
        }
        if self.scheduler.worker_id_prefix.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "worker_id_prefix",
                "scheduler",
            ));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                self.backoff.multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }
        if self.backoff.base_delay_seconds > self.backoff.max_delay_seconds {
            return Err(ConfigurationError::validation_error(format!(
                "backoff.base_delay_seconds ({}) exceeds backoff.max_delay_seconds ({})",
                self.backoff.base_delay_seconds, self.backoff.max_delay_seconds
            )));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                "0",
                "broadcast channels need a positive capacity",
            ));
        }
        if self.telemetry.metric_prefix.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "metric_prefix",
                "telemetry",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager.persist_failure_delay(), Duration::from_secs(60));
        assert_eq!(config.timeouts.status_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.timeouts.kyma_uninstall_delay(), Duration::ZERO);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = LifecycleConfig::default();
        config.scheduler.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let mut config = LifecycleConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = LifecycleConfig::default();
        config.backoff.base_delay_seconds = config.backoff.max_delay_seconds + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationError { .. })
        ));
    }
}
