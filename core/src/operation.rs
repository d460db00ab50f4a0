//! Operation and connection contracts
//!
//! What a single operation does against the target is opaque to the engine.
//! Callers implement [`Operation`] per operation variant and register the
//! implementations by name; tasks refer to them through that name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::sample::{FailureKind, LaneId};

// ============================================================================
// Operation
// ============================================================================

/// What an operation reports back on success
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationResponse {
    /// Work units processed; `None` counts as 1
    pub weight: Option<u64>,
}

impl OperationResponse {
    /// Response without a weight
    pub fn new() -> Self {
        Self::default()
    }

    /// Response carrying a weight
    pub fn with_weight(weight: u64) -> Self {
        Self {
            weight: Some(weight),
        }
    }
}

/// Errors an operation may report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Operation-defined semantic error (unexpected response shape, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network or transport error
    #[error("connection failed: {0}")]
    Connection(String),
}

impl OperationError {
    /// Failure category recorded on the sample
    pub fn kind(&self) -> FailureKind {
        match self {
            OperationError::Validation(_) => FailureKind::Validation,
            OperationError::Connection(_) => FailureKind::Connection,
        }
    }

    /// Reason recorded on the sample
    pub fn reason(&self) -> &str {
        match self {
            OperationError::Validation(reason) | OperationError::Connection(reason) => reason,
        }
    }
}

/// One operation variant executed against a connection of type `C`
///
/// Latency is measured by the engine, never by the operation. Retries, if
/// any, are the operation's own business.
#[async_trait]
pub trait Operation<C>: Send + Sync {
    /// Run the operation once
    async fn execute(&self, connection: &mut C) -> Result<OperationResponse, OperationError>;
}

// ============================================================================
// Connections
// ============================================================================

/// Failure to open a lane's connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot open connection: {0}")]
pub struct ConnectionError(pub String);

/// Creates one connection per lane
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    /// Open the connection a lane uses for all of its requests
    async fn connect(&self, lane: LaneId) -> Result<C, ConnectionError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Operation implementations by reference name
pub struct OperationRegistry<C> {
    operations: BTreeMap<String, Arc<dyn Operation<C>>>,
}

impl<C> OperationRegistry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            operations: BTreeMap::new(),
        }
    }

    /// Register an operation under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, operation: Arc<dyn Operation<C>>) {
        self.operations.insert(name.into(), operation);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, name: impl Into<String>, operation: Arc<dyn Operation<C>>) -> Self {
        self.register(name, operation);
        self
    }

    /// Look up an operation
    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation<C>>> {
        self.operations.get(name).cloned()
    }

    /// Check if an operation is registered
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl<C> Default for OperationRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for OperationRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Operation<()> for Noop {
        async fn execute(&self, _connection: &mut ()) -> Result<OperationResponse, OperationError> {
            Ok(OperationResponse::with_weight(5))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = OperationRegistry::<()>::new()
            .with("search", Arc::new(Noop))
            .with("bulk", Arc::new(Noop));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("bulk"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["bulk".to_string(), "search".to_string()]);
    }

    #[tokio::test]
    async fn test_registered_operation_executes() {
        let registry = OperationRegistry::<()>::new().with("search", Arc::new(Noop));
        let op = registry.get("search").unwrap();
        let response = op.execute(&mut ()).await.unwrap();
        assert_eq!(response.weight, Some(5));
    }

    #[test]
    fn test_operation_error_classification() {
        let err = OperationError::Validation("missing hits".into());
        assert_eq!(err.kind(), FailureKind::Validation);
        assert_eq!(err.reason(), "missing hits");
        assert_eq!(err.to_string(), "validation failed: missing hits");

        let err = OperationError::Connection("refused".into());
        assert_eq!(err.kind(), FailureKind::Connection);
    }

    #[test]
    fn test_registry_debug() {
        let registry = OperationRegistry::<()>::new().with("search", Arc::new(Noop));
        let debug = format!("{:?}", registry);
        assert!(debug.contains("OperationRegistry"));
        assert!(debug.contains("search"));
    }
}
