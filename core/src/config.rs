//! Race configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::task::Phase;

/// What happens when a single request fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the failure as a sample and keep going
    #[default]
    Continue,
    /// Interrupt the race on the first failed request; the race ends failed
    Abort,
}

/// Race configuration
///
/// Defines how the coordinator drives a race: timeouts towards workers,
/// error propagation and channel sizing. The workload itself is a
/// [`TaskGraph`](crate::task::TaskGraph) handed in separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Race name, reported to telemetry sinks
    pub name: String,

    /// Request failure policy
    pub error_policy: ErrorPolicy,

    /// Bound on worker acknowledgments and heartbeat silence
    pub worker_timeout: Duration,

    /// How often workers report liveness
    pub heartbeat_interval: Duration,

    /// How long in-flight requests may take to drain after an interrupt
    pub interrupt_grace: Duration,

    /// Phases that must produce samples for the race to succeed
    pub required_phases: Vec<Phase>,

    /// Channel sizing
    pub channels: ChannelConfig,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            name: "race".to_string(),
            error_policy: ErrorPolicy::Continue,
            worker_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            interrupt_grace: Duration::from_secs(10),
            required_phases: vec![Phase::Measurement],
            channels: ChannelConfig::default(),
        }
    }
}

impl RaceConfig {
    /// Create a new config with the given race name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the error policy
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Set the worker timeout
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the interrupt grace period
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    /// Set the required phases
    pub fn with_required_phases(mut self, phases: Vec<Phase>) -> Self {
        self.required_phases = phases;
        self
    }

    /// Set the channel configuration
    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "worker timeout must be positive".into(),
            ));
        }

        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.worker_timeout {
            return Err(ConfigError::InvalidTimeout(format!(
                "heartbeat interval {:?} must be positive and shorter than the worker timeout {:?}",
                self.heartbeat_interval, self.worker_timeout
            )));
        }

        let channels = &self.channels;
        if channels.sample_buffer == 0 || channels.sample_batch == 0 || channels.link_buffer == 0 {
            return Err(ConfigError::InvalidChannel(
                "channel buffers and batch size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid timeout or interval
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    /// Invalid channel sizing
    #[error("Invalid channel configuration: {0}")]
    InvalidChannel(String),

    /// Invalid task definition
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Invalid task graph composition
    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaceConfig::default();
        assert_eq!(config.name, "race");
        assert_eq!(config.error_policy, ErrorPolicy::Continue);
        assert_eq!(config.required_phases, vec![Phase::Measurement]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = RaceConfig::new("nightly")
            .with_error_policy(ErrorPolicy::Abort)
            .with_worker_timeout(Duration::from_secs(5))
            .with_heartbeat_interval(Duration::from_millis(500));

        assert_eq!(config.name, "nightly");
        assert_eq!(config.error_policy, ErrorPolicy::Abort);
        assert_eq!(config.worker_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let config = RaceConfig::default().with_worker_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_heartbeat_too_slow() {
        let config = RaceConfig::default()
            .with_worker_timeout(Duration::from_secs(1))
            .with_heartbeat_interval(Duration::from_secs(2));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_config_validation_zero_buffer() {
        let config =
            RaceConfig::default().with_channels(ChannelConfig::default().with_sample_buffer(0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: RaceConfig =
            serde_json::from_str(r#"{"name": "smoke", "error_policy": "abort"}"#).unwrap();

        assert_eq!(config.name, "smoke");
        assert_eq!(config.error_policy, ErrorPolicy::Abort);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }
}
