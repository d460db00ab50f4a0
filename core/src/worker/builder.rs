//! Builder pattern for Worker construction

use crate::channel::ChannelConfig;
use crate::clock::RaceClock;
use crate::error::{BenchError, BenchResult};
use crate::operation::{ConnectionFactory, OperationRegistry};

use super::executor::Worker;

use std::sync::Arc;

/// Builder for creating Worker instances
///
/// Provides ergonomic construction with validation.
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new("loadgen-1")
///     .registry(registry)
///     .connections(connections)
///     .channels(ChannelConfig::default().with_sample_batch(64))
///     .build()?;
/// ```
pub struct WorkerBuilder<C> {
    name: String,
    registry: Option<Arc<OperationRegistry<C>>>,
    connections: Option<Arc<dyn ConnectionFactory<C>>>,
    channels: Option<ChannelConfig>,
    clock: Option<RaceClock>,
}

impl<C: Send + 'static> WorkerBuilder<C> {
    /// Create a new builder with the given worker name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: None,
            connections: None,
            channels: None,
            clock: None,
        }
    }

    /// Set the operation registry
    pub fn registry(mut self, registry: Arc<OperationRegistry<C>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the connection factory
    pub fn connections(mut self, connections: Arc<dyn ConnectionFactory<C>>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Set the channel configuration
    pub fn channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Use an explicit race clock
    pub fn clock(mut self, clock: RaceClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the Worker
    ///
    /// # Errors
    /// Returns an error if any required field is missing or the channel
    /// sizing is invalid.
    pub fn build(self) -> BenchResult<Worker<C>> {
        if self.name.is_empty() {
            return Err(BenchError::missing_config("name"));
        }
        let registry = self.registry.ok_or(BenchError::missing_config("registry"))?;
        let connections = self
            .connections
            .ok_or(BenchError::missing_config("connections"))?;
        let channels = self.channels.unwrap_or_default();
        if channels.sample_buffer == 0 || channels.sample_batch == 0 {
            return Err(BenchError::config(
                "sample buffer and batch size must be at least 1",
            ));
        }

        let worker = Worker::new(self.name, registry, connections, channels);
        Ok(match self.clock {
            Some(clock) => worker.with_clock(clock),
            None => worker,
        })
    }
}
