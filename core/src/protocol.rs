//! Coordinator/worker message protocol
//!
//! Workers and the coordinator share no memory; everything crosses the
//! boundary as one of these messages, in-process over channels or remotely
//! as length-prefixed JSON frames.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ErrorPolicy;
use crate::sample::Sample;
use crate::scheduler::{PhasePlan, PlanNode, StepReport};
use crate::task::Phase;
use crate::worker::WorkerStats;

/// A synchronization point every worker acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Barrier {
    /// The worker accepted its assignment and is ready to run
    Provisioned,
    /// The worker finished a step
    Step {
        /// Phase of the step
        phase: Phase,
        /// Step index within the phase
        step: usize,
    },
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Barrier::Provisioned => f.write_str("provisioned"),
            Barrier::Step { phase, step } => write!(f, "{phase} step {step}"),
        }
    }
}

/// Work handed to one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Worker id chosen by the coordinator
    pub worker: usize,
    /// Race name
    pub race: String,
    /// Wall-clock time of the race clock origin
    pub epoch: DateTime<Utc>,
    /// Request failure policy
    pub error_policy: ErrorPolicy,
    /// How often to send heartbeats
    pub heartbeat_interval: Duration,
    /// Phase plans in execution order
    pub phases: Vec<PhasePlan>,
}

impl Assignment {
    /// Plan of one step
    pub fn step(&self, phase: Phase, step: usize) -> Option<&PlanNode> {
        self.phases
            .iter()
            .find(|plan| plan.phase == phase)
            .and_then(|plan| plan.steps.get(step))
    }

    /// Lanes across all phases
    pub fn lane_count(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|plan| plan.steps.iter())
            .map(|step| step.lane_count())
            .sum()
    }
}

/// Coordinator to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Provision the worker
    Assign(Assignment),
    /// Start a step
    Proceed {
        /// Phase of the step
        phase: Phase,
        /// Step index within the phase
        step: usize,
    },
    /// Stop every lane after its in-flight request
    Interrupt,
    /// Finish up and report final stats
    Shutdown,
}

/// Worker to coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on every link
    Hello {
        /// Worker name
        name: String,
        /// Operation references the worker can execute
        operations: Vec<String>,
    },
    /// The worker reached a barrier
    Ready {
        /// Barrier reached
        barrier: Barrier,
        /// Outcome of the step, empty for [`Barrier::Provisioned`]
        #[serde(default)]
        summary: StepReport,
    },
    /// A batch of samples
    Samples {
        /// Samples in production order per lane
        samples: Vec<Sample>,
    },
    /// Liveness signal
    Heartbeat,
    /// A failed request stopped the race under the abort policy
    Aborted {
        /// Failure reason of the request
        reason: String,
    },
    /// Last message on every link
    Finished {
        /// Final statistics
        stats: WorkerStats,
    },
}

impl WorkerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "hello",
            WorkerMessage::Ready { .. } => "ready",
            WorkerMessage::Samples { .. } => "samples",
            WorkerMessage::Heartbeat => "heartbeat",
            WorkerMessage::Aborted { .. } => "aborted",
            WorkerMessage::Finished { .. } => "finished",
        }
    }
}
