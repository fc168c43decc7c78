//! Configuration types for facades, shutdown and profiling.
//!
//! Every field carries a serde default, so an absent file and an empty
//! environment still yield a usable configuration. Sources are layered with
//! the `config` crate: an optional file first, then environment variables
//! prefixed `MQ__` with `__` between nested keys
//! (`MQ__CONSUMER__RECEIVE_TIMEOUT_MS=2000`).

use crate::destination::CacheKeyPolicy;
use crate::error::{ConfigurationError, ValidationError};
use crate::transport::{AcknowledgeMode, BrokerUrl};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "MQ";

/// Default broker URL: an in-process broker that keeps nothing on disk
pub const DEFAULT_BROKER_URL: &str = "vm://localhost?broker.persistent=false";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// Broker the facades connect to
    pub broker_url: String,

    pub producer: ProducerConfig,

    pub consumer: ConsumerConfig,

    pub destinations: DestinationConfig,

    pub shutdown: ShutdownConfig,

    pub profiling: ProfilingConfig,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            destinations: DestinationConfig::default(),
            shutdown: ShutdownConfig::default(),
            profiling: ProfilingConfig::default(),
        }
    }
}

impl MqConfig {
    /// Load configuration from an optional file, then `MQ__*` environment
    /// variables, and validate the result.
    ///
    /// The file format is chosen from its extension (`toml`, `yaml`, `json`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: MqConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.broker_url.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "broker_url".to_string(),
            });
        }

        BrokerUrl::parse(&self.broker_url).map_err(|e| ConfigurationError::Invalid {
            message: e.to_string(),
        })?;

        if self.shutdown.poll_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "shutdown.poll_interval_ms must be greater than zero".to_string(),
            });
        }

        check_millis("consumer.receive_timeout_ms", self.consumer.receive_timeout_ms)?;
        if let Some(ttl) = self.producer.time_to_live_ms {
            check_millis("producer.time_to_live_ms", ttl)?;
        }

        Ok(())
    }
}

/// Millisecond settings must fit a signed 64-bit duration.
fn check_millis(field: &str, ms: u64) -> Result<(), ConfigurationError> {
    if i64::try_from(ms).is_ok() {
        return Ok(());
    }
    let error = ValidationError::OutOfRange {
        field: field.to_string(),
        message: format!("{} exceeds {} milliseconds", ms, i64::MAX),
    };
    Err(ConfigurationError::Invalid {
        message: error.to_string(),
    })
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Producer facade defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Send messages persistently
    pub persistent: bool,

    /// Message time-to-live for newly created producers; unset or zero means
    /// messages never expire
    pub time_to_live_ms: Option<u64>,

    /// Send to a temporary destination instead of the named one
    pub use_temporary: bool,

    pub use_transactions: bool,
}

impl ProducerConfig {
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live_ms
            .filter(|ms| *ms > 0)
            .map(millis)
    }
}

/// Consumer facade defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long a receive waits for a message
    pub receive_timeout_ms: u64,

    pub acknowledge_mode: AcknowledgeMode,

    pub use_transactions: bool,

    pub use_temporary: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 5000,
            acknowledge_mode: AcknowledgeMode::Client,
            use_transactions: false,
            use_temporary: false,
        }
    }
}

impl ConsumerConfig {
    pub fn receive_timeout(&self) -> Duration {
        millis(self.receive_timeout_ms)
    }
}

/// Destination cache settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub cache_key_policy: CacheKeyPolicy,
}

/// Shutdown coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How often the coordinator checks whether workers have finished
    pub poll_interval_ms: u64,

    /// Give up waiting for workers after this long; unset waits forever
    pub grace_period_ms: Option<u64>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            grace_period_ms: None,
        }
    }
}

impl ShutdownConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Option<std::time::Duration> {
        self.grace_period_ms.map(std::time::Duration::from_millis)
    }
}

/// Profiler settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub enabled: bool,
}
