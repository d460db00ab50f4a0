//! Worker module for executing assigned lanes
//!
//! The Worker owns the lanes the coordinator assigned to it on one process and
//! runs the loop: **wait for proceed -> run step -> stream samples -> ready**.
//!
//! Each lane runs as an independent tokio task. Samples flow through a bounded
//! queue into the worker loop, which batches them upstream; a slow coordinator
//! blocks lanes instead of growing memory. A step is acknowledged only after
//! all of its samples have been sent, so the coordinator never closes a phase
//! with samples still in flight.
//!
//! # Example
//!
//! ```ignore
//! use racebench_core::worker::{Worker, WorkerBuilder, WorkerStats};
//!
//! let worker = WorkerBuilder::new("loadgen-1")
//!     .registry(registry)
//!     .connections(connections)
//!     .build()?;
//!
//! let stats = worker.run(downlink_rx, uplink_tx).await?;
//! println!("Completed: {}", stats.completed);
//! ```

mod builder;
mod executor;
mod stats;

pub use builder::WorkerBuilder;
pub use executor::Worker;
pub use stats::WorkerStats;

#[cfg(test)]
mod tests;
