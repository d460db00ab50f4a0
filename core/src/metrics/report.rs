//! Final race report

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::LaneFailure;
use crate::task::Phase;
use crate::worker::WorkerStats;

use super::aggregator::PhaseSummary;

/// A (phase, task) whose work did not fully run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incomplete {
    /// Phase
    pub phase: Phase,
    /// Task name
    pub task: String,
    /// Why the task is incomplete
    pub reason: String,
}

/// A worker the coordinator lost contact with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostWorker {
    /// Worker id
    pub worker: usize,
    /// Name the worker announced, or its address
    pub name: String,
    /// Why it was dropped
    pub reason: String,
}

/// Start and end of a phase on the race clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBoundary {
    /// Phase
    pub phase: Phase,
    /// When the first step was released
    pub started: Duration,
    /// When the last worker acknowledged the last step
    pub ended: Duration,
}

/// Per-worker totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Worker id
    pub worker: usize,
    /// Announced name
    pub name: String,
    /// Lanes assigned across all phases
    pub lanes: usize,
    /// Final statistics, absent if the worker was lost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<WorkerStats>,
}

/// Everything a finished race produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceReport {
    /// Race name
    pub race: String,
    /// Wall-clock time of the race clock origin
    pub epoch: DateTime<Utc>,
    /// Wall-clock time the race finished
    pub finished: DateTime<Utc>,
    /// At least one worker was lost
    pub degraded: bool,
    /// The race was interrupted by the user
    pub cancelled: bool,
    /// Phase boundaries in execution order
    pub boundaries: Vec<PhaseBoundary>,
    /// Summaries of phases that produced samples
    pub phases: Vec<PhaseSummary>,
    /// Tasks whose work did not fully run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete: Vec<Incomplete>,
    /// Workers that were dropped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lost_workers: Vec<LostWorker>,
    /// Lanes that ended early
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_lanes: Vec<LaneFailure>,
    /// Per-worker totals
    pub workers: Vec<WorkerSummary>,
}

impl RaceReport {
    /// Summary of one phase
    pub fn phase(&self, phase: Phase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|summary| summary.phase == phase)
    }

    /// Boundary of one phase
    pub fn boundary(&self, phase: Phase) -> Option<&PhaseBoundary> {
        self.boundaries.iter().find(|boundary| boundary.phase == phase)
    }

    /// Check if every task ran to completion on every worker
    pub fn is_complete(&self) -> bool {
        !self.degraded && self.incomplete.is_empty() && self.failed_lanes.is_empty()
    }

    /// Samples across all phases
    pub fn total_samples(&self) -> u64 {
        self.phases.iter().map(|summary| summary.samples).sum()
    }
}
