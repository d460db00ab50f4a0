//! Samples: one record per operation invocation

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::Phase;

/// Identifies one lane within a race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneId {
    /// Worker owning the lane
    pub worker: usize,
    /// Race-wide lane number
    pub lane: usize,
}

impl LaneId {
    /// Create a lane id
    pub fn new(worker: usize, lane: usize) -> Self {
        Self { worker, lane }
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}/l{}", self.worker, self.lane)
    }
}

/// Why a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The target answered, but not in the expected way
    Validation,
    /// Network or transport error
    Connection,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Validation => f.write_str("validation"),
            FailureKind::Connection => f.write_str("connection"),
        }
    }
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation returned normally
    Success,
    /// The operation reported an error
    Failure {
        /// Failure category
        kind: FailureKind,
        /// Operation supplied reason
        reason: String,
    },
}

impl Outcome {
    /// Check if the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Immutable record of one operation invocation
///
/// All times are offsets on the race clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Task name
    pub task: String,
    /// Phase the request ran in
    pub phase: Phase,
    /// Lane that issued the request
    pub lane: LaneId,
    /// Request index within the lane
    pub sequence: u64,
    /// Ideal start time computed by the pacer
    pub scheduled: Duration,
    /// Actual start time
    pub started: Duration,
    /// Time until the operation returned
    pub latency: Duration,
    /// Success or failure
    pub outcome: Outcome,
    /// Work units processed (documents, bytes, ...)
    pub weight: u64,
}

impl Sample {
    /// Completion time of the request
    pub fn completed(&self) -> Duration {
        self.started + self.latency
    }

    /// How late the request started relative to its ideal schedule
    pub fn schedule_lag(&self) -> Duration {
        self.started.saturating_sub(self.scheduled)
    }

    /// Time from the ideal schedule to completion
    pub fn response_time(&self) -> Duration {
        self.completed().saturating_sub(self.scheduled)
    }

    /// Check if the request succeeded
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
