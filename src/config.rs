//! # Configuration
//!
//! Layered configuration for the progress relay: compiled defaults, an optional
//! TOML file, then `RELAY__SECTION__KEY` environment overrides.

use crate::constants::{
    MAX_BUFFERED_EVENTS_PER_CLIENT, MAX_EVENTS, MAX_RETRY_ATTEMPTS, RETRY_BASE_DELAY_MS,
    RETRY_MAX_DELAY_MS, TASK_RETENTION_SECS, TASK_TIMEOUT_SECS,
};
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub event_log: EventLogConfig,
    pub retry: RetryConfig,
    pub tasks: TaskConfig,
    pub transport: TransportConfig,
}

/// Durable event log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// sqlx SQLite URL, e.g. `sqlite://events.sqlite` or `sqlite::memory:`
    pub database_url: String,
    /// Global retention cap; oldest events are evicted beyond it
    pub max_events: usize,
    pub max_connections: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://events.sqlite".to_string(),
            max_events: MAX_EVENTS,
            max_connections: 1,
        }
    }
}

impl EventLogConfig {
    /// In-memory log, used by tests and ephemeral deployments
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }
}

/// Recovery buffer and retry driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_buffered_per_client: usize,
    /// Upper bound on how long the retry driver sleeps between checks
    pub poll_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay_ms: RETRY_BASE_DELAY_MS,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            max_buffered_per_client: MAX_BUFFERED_EVENTS_PER_CLIENT,
            poll_interval_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub timeout_secs: u64,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: TASK_TIMEOUT_SECS,
            retention_secs: TASK_RETENTION_SECS,
            sweep_interval_secs: 30,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of the per-connection outbound channel
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading relay configuration file");
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: RelayConfig = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus the legacy flat environment variables
    pub fn from_env() -> RelayResult<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("EVENTS_DATABASE") {
            config.event_log.database_url = db_url;
        }

        if let Ok(max_events) = std::env::var("RELAY_MAX_EVENTS") {
            config.event_log.max_events = max_events.parse().map_err(|e| {
                RelayError::ConfigurationError(format!("Invalid max_events: {e}"))
            })?;
        }

        if let Ok(max_attempts) = std::env::var("RELAY_MAX_RETRY_ATTEMPTS") {
            config.retry.max_attempts = max_attempts.parse().map_err(|e| {
                RelayError::ConfigurationError(format!("Invalid max_attempts: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.event_log.max_events == 0 {
            return Err(RelayError::ConfigurationError(
                "event_log.max_events must be greater than zero".to_string(),
            ));
        }
        if self.event_log.max_connections == 0 {
            return Err(RelayError::ConfigurationError(
                "event_log.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RelayError::ConfigurationError(
                "retry.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(RelayError::ConfigurationError(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.retry.poll_interval_ms == 0 || self.tasks.sweep_interval_secs == 0 {
            return Err(RelayError::ConfigurationError(
                "retry.poll_interval_ms and tasks.sweep_interval_secs must be greater than zero"
                    .to_string(),
            ));
        }
        if self.retry.max_buffered_per_client == 0 || self.transport.channel_capacity == 0 {
            return Err(RelayError::ConfigurationError(
                "buffer and channel capacities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
