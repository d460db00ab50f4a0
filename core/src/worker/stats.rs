//! Worker statistics tracking

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sample::Sample;
use crate::scheduler::StepReport;

/// Statistics tracked by each worker
///
/// Times are race clock offsets, so stats from different workers compare
/// directly.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Successful samples forwarded
    pub completed: u64,

    /// Failed samples forwarded
    pub errors: u64,

    /// Weight of successful samples
    pub success_weight: u64,

    /// Sample batches sent upstream
    pub batches: u64,

    /// Steps executed
    pub steps: usize,

    /// Lanes that ended early
    pub failed_lanes: usize,

    /// When the first step started
    pub started_at: Option<Duration>,

    /// When the last step finished
    pub ended_at: Option<Duration>,
}

impl WorkerStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Get total number of samples (completed + errors)
    pub fn total_samples(&self) -> u64 {
        self.completed + self.errors
    }

    /// Get success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_samples() == 0 {
            0.0
        } else {
            self.completed as f64 / self.total_samples() as f64
        }
    }

    /// Get error rate (0.0 - 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.total_samples() == 0 {
            0.0
        } else {
            1.0 - self.success_rate()
        }
    }

    /// Time between the first step start and the last step end
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }

    /// Record a forwarded sample
    pub fn record_sample(&mut self, sample: &Sample) {
        if sample.is_success() {
            self.completed += 1;
            self.success_weight += sample.weight;
        } else {
            self.errors += 1;
        }
    }

    /// Record the start of a step
    pub fn step_started(&mut self, at: Duration) {
        self.steps += 1;
        self.started_at.get_or_insert(at);
    }

    /// Record the end of a step
    pub fn step_finished(&mut self, report: &StepReport, at: Duration) {
        self.failed_lanes += report.failures.len();
        self.ended_at = Some(at);
    }

    /// Merge stats from another worker
    pub fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.errors += other.errors;
        self.success_weight += other.success_weight;
        self.batches += other.batches;
        self.steps = self.steps.max(other.steps);
        self.failed_lanes += other.failed_lanes;
        self.started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.ended_at = self.ended_at.max(other.ended_at);
    }
}
