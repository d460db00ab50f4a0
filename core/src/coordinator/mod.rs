//! Coordinator for race lifecycle management
//!
//! The Coordinator drives a complete race:
//! - Connecting to local and remote workers and collecting their hellos
//! - Partitioning the task graph's lanes across workers
//! - Releasing each step only after every worker finished the previous one
//! - Propagating interrupts and aborts to all workers
//! - Aggregating samples into the final [`RaceReport`](crate::metrics::RaceReport)
//!
//! # Example
//!
//! ```ignore
//! use racebench_core::coordinator::CoordinatorBuilder;
//!
//! let handle = CoordinatorBuilder::new()
//!     .graph(graph)
//!     .local_worker(worker)
//!     .build()?
//!     .start();
//!
//! println!("{:?}", handle.snapshot().await);
//! let report = handle.wait_with_signal_handling().await?;
//! ```

mod barrier;
mod builder;
mod executor;
mod handle;
mod partition;
mod state;

pub use barrier::{BarrierTracker, BarrierViolation};
pub use builder::CoordinatorBuilder;
pub use executor::Coordinator;
pub use handle::RaceHandle;
pub use partition::Partitioner;
pub use state::{RaceLedger, RaceState};
