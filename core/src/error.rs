//! Error types for racebench-core

use std::fmt;

use thiserror::Error;

/// Category of a [`BenchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchErrorKind {
    /// Invalid or missing configuration
    Config,
    /// A component was asked to stop while work was pending
    Shutdown,
    /// Worker-side failure
    Worker,
    /// Link to a worker could not be established or broke
    Transport,
    /// Unexpected message for the current state
    Protocol,
    /// Metrics were queried in an invalid state
    Metrics,
    /// The race could not produce a result
    Race,
}

impl fmt::Display for BenchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "configuration error",
            Self::Shutdown => "shutdown",
            Self::Worker => "worker error",
            Self::Transport => "transport error",
            Self::Protocol => "protocol error",
            Self::Metrics => "metrics error",
            Self::Race => "race failed",
        };
        f.write_str(name)
    }
}

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BenchError {
    /// Error category
    pub kind: BenchErrorKind,
    /// Human readable description
    pub message: String,
}

impl BenchError {
    /// Create a new error
    pub fn new(kind: BenchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A required builder field was not set
    pub fn missing_config(field: &str) -> Self {
        Self::new(
            BenchErrorKind::Config,
            format!("missing required field: {field}"),
        )
    }

    /// Invalid configuration
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Config, message)
    }

    /// Shutdown while work was pending
    pub fn shutdown() -> Self {
        Self::new(BenchErrorKind::Shutdown, "component is shutting down")
    }

    /// Worker failure
    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Worker, message)
    }

    /// Link failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Transport, message)
    }

    /// Protocol violation
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Protocol, message)
    }

    /// Metrics queried in an invalid state
    pub fn metrics(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Metrics, message)
    }

    /// Terminal race failure
    pub fn race_failed(message: impl Into<String>) -> Self {
        Self::new(BenchErrorKind::Race, message)
    }

    /// Whether this is a terminal race failure
    pub fn is_race_failure(&self) -> bool {
        self.kind == BenchErrorKind::Race
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("malformed message: {err}"))
    }
}

impl From<crate::config::ConfigError> for BenchError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Result type alias
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_message() {
        let err = BenchError::missing_config("registry");
        assert_eq!(err.kind, BenchErrorKind::Config);
        assert!(err.message.contains("registry"));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required field: registry"
        );
    }

    #[test]
    fn test_race_failure_flag() {
        assert!(BenchError::race_failed("no samples").is_race_failure());
        assert!(!BenchError::worker("boom").is_race_failure());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: BenchError = io.into();
        assert_eq!(err.kind, BenchErrorKind::Transport);
    }
}
