//! Builder pattern for Coordinator construction

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::RaceConfig;
use crate::error::{BenchError, BenchResult};
use crate::task::TaskGraph;
use crate::telemetry::{TelemetrySink, TracingTelemetry};
use crate::transport::spawn_local;
use crate::worker::Worker;

use super::executor::{Coordinator, WorkerSource};

/// Builder for creating a Coordinator with proper configuration
///
/// # Example
///
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .graph(graph)
///     .config(RaceConfig::new("nightly"))
///     .local_worker(worker)
///     .remote_worker("10.0.0.7:7421".parse()?)
///     .build()?;
///
/// let report = coordinator.run().await?;
/// ```
pub struct CoordinatorBuilder {
    graph: Option<TaskGraph>,
    config: RaceConfig,
    telemetry: Arc<dyn TelemetrySink>,
    sources: Vec<WorkerSource>,
}

impl CoordinatorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            graph: None,
            config: RaceConfig::default(),
            telemetry: Arc::new(TracingTelemetry),
            sources: Vec::new(),
        }
    }

    /// Set the task graph
    pub fn graph(mut self, graph: impl Into<TaskGraph>) -> Self {
        self.graph = Some(graph.into());
        self
    }

    /// Set the full race configuration
    pub fn config(mut self, config: RaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the telemetry sink notified at phase boundaries
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Add an in-process worker
    ///
    /// The worker shares the coordinator's race clock.
    pub fn local_worker<C: Send + 'static>(mut self, worker: Worker<C>) -> Self {
        let name = worker.name().to_string();
        self.sources.push(WorkerSource::Local {
            name,
            launch: Box::new(move |id, clock, events, buffer| {
                spawn_local(id, worker.with_clock(clock), events, buffer)
            }),
        });
        self
    }

    /// Add a worker served over TCP
    pub fn remote_worker(mut self, addr: SocketAddr) -> Self {
        self.sources.push(WorkerSource::Remote(addr));
        self
    }

    /// Build the coordinator
    ///
    /// # Errors
    ///
    /// Returns an error if the graph or workers are missing, or if graph or
    /// configuration validation fails.
    pub fn build(self) -> BenchResult<Coordinator> {
        let graph = self.graph.ok_or_else(|| BenchError::missing_config("graph"))?;
        if self.sources.is_empty() {
            return Err(BenchError::missing_config("workers"));
        }

        graph
            .validate()
            .map_err(|e| BenchError::config(e.to_string()))?;
        self.config
            .validate()
            .map_err(|e| BenchError::config(e.to_string()))?;

        Ok(Coordinator::new(self.config, graph, self.telemetry, self.sources))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("graph", &self.graph)
            .field("config", &self.config)
            .field("workers", &self.sources.len())
            .finish()
    }
}
