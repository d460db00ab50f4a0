//! racebench-core: Engine for paced, distributed macrobenchmark races
//!
//! A race runs a declarative [`TaskGraph`] on one or more workers and turns the
//! resulting stream of [`Sample`]s into per-phase statistics. This crate
//! provides:
//!
//! - The task model (phases, throughput targets, completion conditions)
//! - Open-loop pacing and lane scheduling on a shared race clock
//! - Workers that execute their share of the lanes and stream samples back
//! - A coordinator that partitions lanes, synchronizes workers at step
//!   barriers and survives the loss of individual workers
//! - In-process and TCP transports between coordinator and workers
//! - Incremental aggregation into latency/throughput reports
//!
//! # Example
//!
//! ```ignore
//! use racebench_core::{CoordinatorBuilder, Completion, Task, WorkerBuilder};
//!
//! let worker = WorkerBuilder::new("loadgen-1")
//!     .registry(registry)
//!     .connections(connections)
//!     .build()?;
//!
//! let report = CoordinatorBuilder::new()
//!     .graph(Task::new("search", "query").with_rate(100.0).with_concurrency(8))
//!     .local_worker(worker)
//!     .build()?
//!     .run_with_signal_handling()
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod protocol;
pub mod sample;
pub mod scheduler;
pub mod task;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use channel::ChannelConfig;
pub use clock::RaceClock;
pub use config::{ConfigError, ErrorPolicy, RaceConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder, RaceHandle, RaceState};
pub use error::*;
pub use metrics::{AggregateStats, LatencyPercentiles, MetricsSnapshot, PhaseSummary, RaceReport};
pub use operation::{
    ConnectionError, ConnectionFactory, Operation, OperationError, OperationRegistry,
    OperationResponse,
};
pub use sample::{FailureKind, LaneId, Outcome, Sample};
pub use task::{Completion, Phase, RampUp, Task, TaskGraph, Throughput};
pub use telemetry::{PhaseEvent, TelemetrySink, TracingTelemetry};
pub use worker::{Worker, WorkerBuilder, WorkerStats};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::time::Duration;

    // =========================================================================
    // Workload files
    // =========================================================================

    #[test]
    fn test_graph_from_json() {
        let json = r#"{
            "sequential": [
                {"task": {"name": "warm", "operation": "get", "phase": "warmup",
                          "completion": {"iterations": 100}}},
                {"parallel": [
                    {"task": {"name": "reads", "operation": "get", "concurrency": 8,
                              "throughput": {"target": 400.0},
                              "completion": {"duration": {"secs": 60, "nanos": 0}}}},
                    {"task": {"name": "writes", "operation": "put",
                              "completion": "until_interrupted"}}
                ]}
            ]
        }"#;

        let graph: TaskGraph = serde_json::from_str(json).unwrap();
        assert!(graph.validate().is_ok());

        let names: Vec<&str> = graph.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["warm", "reads", "writes"]);
        assert_eq!(graph.steps(Phase::Warmup).len(), 1);
        assert_eq!(graph.steps(Phase::Measurement).len(), 1);

        let reads = graph.tasks()[1];
        assert_eq!(reads.throughput, Throughput::Target(400.0));
        assert_eq!(reads.completion, Completion::Duration(Duration::from_secs(60)));
    }

    #[test]
    fn test_partial_config_from_json() {
        let config: RaceConfig =
            serde_json::from_str(r#"{"name": "nightly", "error_policy": "abort"}"#).unwrap();

        assert_eq!(config.name, "nightly");
        assert_eq!(config.error_policy, ErrorPolicy::Abort);
        assert_eq!(config.worker_timeout, Duration::from_secs(30));
        assert_eq!(config.required_phases, vec![Phase::Measurement]);
        assert!(config.validate().is_ok());
    }

    // =========================================================================
    // Wire shapes
    // =========================================================================

    #[test]
    fn test_failed_sample_json_format() {
        let sample = Sample {
            task: "reads".into(),
            phase: Phase::Measurement,
            lane: LaneId::new(1, 4),
            sequence: 7,
            scheduled: Duration::from_millis(10),
            started: Duration::from_millis(12),
            latency: Duration::from_millis(3),
            outcome: Outcome::Failure {
                kind: FailureKind::Connection,
                reason: "reset by peer".into(),
            },
            weight: 1,
        };
        let json = serde_json::to_string(&sample).unwrap();

        assert!(json.contains("\"phase\":\"measurement\""));
        assert!(json.contains("\"status\":\"failure\""));
        assert!(json.contains("\"reason\":\"reset by peer\""));
        assert_eq!(serde_json::from_str::<Sample>(&json).unwrap(), sample);
    }

    #[test]
    fn test_race_state_json_format() {
        let failed = RaceState::Failed {
            reason: "no workers reachable".into(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"state\":\"failed\""));

        assert_eq!(
            serde_json::to_string(&RaceState::Measurement).unwrap(),
            "{\"state\":\"measurement\"}"
        );
    }
}
