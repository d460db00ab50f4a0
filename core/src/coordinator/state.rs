//! Race lifecycle state and bookkeeping of partial results

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metrics::{Incomplete, LostWorker};
use crate::scheduler::LaneFailure;
use crate::task::Phase;

/// Race state machine
///
/// `Provisioning -> Warmup -> Measurement -> Teardown -> Finished`, where a
/// race without warmup tasks skips `Warmup` and an interrupted race moves to
/// `Teardown` early. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RaceState {
    /// Connecting, greeting and provisioning workers
    Provisioning,
    /// Running warmup steps
    Warmup,
    /// Running measurement steps
    Measurement,
    /// Shutting workers down
    Teardown,
    /// Race completed with a report
    Finished,
    /// Race produced no usable result
    Failed {
        /// Why the race failed
        reason: String,
    },
}

impl RaceState {
    /// State that runs the given phase
    pub fn running(phase: Phase) -> Self {
        match phase {
            Phase::Warmup => RaceState::Warmup,
            Phase::Measurement => RaceState::Measurement,
        }
    }

    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceState::Finished | RaceState::Failed { .. })
    }

    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: &RaceState) -> bool {
        use RaceState::*;

        match (self, next) {
            (current, Failed { .. }) => !current.is_terminal(),
            (Provisioning, Warmup | Measurement | Teardown) => true,
            (Warmup, Measurement | Teardown) => true,
            (Measurement, Teardown) => true,
            (Teardown, Finished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceState::Provisioning => f.write_str("provisioning"),
            RaceState::Warmup => f.write_str("warmup"),
            RaceState::Measurement => f.write_str("measurement"),
            RaceState::Teardown => f.write_str("teardown"),
            RaceState::Finished => f.write_str("finished"),
            RaceState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// What went wrong without failing the race
#[derive(Debug, Default)]
pub struct RaceLedger {
    lost: Vec<LostWorker>,
    failed_lanes: Vec<LaneFailure>,
    incomplete: BTreeMap<(Phase, String), String>,
}

impl RaceLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lost worker
    pub fn worker_lost(&mut self, worker: usize, name: impl Into<String>, reason: impl Into<String>) {
        self.lost.push(LostWorker {
            worker,
            name: name.into(),
            reason: reason.into(),
        });
    }

    /// Record a lane that ended early
    pub fn lane_failed(&mut self, phase: Phase, failure: LaneFailure) {
        self.mark_incomplete(phase, &failure.task, format!("lane failed: {}", failure.reason));
        self.failed_lanes.push(failure);
    }

    /// Mark a task incomplete; the first reason sticks
    pub fn mark_incomplete(&mut self, phase: Phase, task: &str, reason: impl Into<String>) {
        self.incomplete
            .entry((phase, task.to_string()))
            .or_insert_with(|| reason.into());
    }

    /// Check if any worker was lost
    pub fn is_degraded(&self) -> bool {
        !self.lost.is_empty()
    }

    /// Check if a worker was recorded as lost
    pub fn is_lost(&self, worker: usize) -> bool {
        self.lost.iter().any(|lost| lost.worker == worker)
    }

    /// Lost workers
    pub fn lost_workers(&self) -> &[LostWorker] {
        &self.lost
    }

    /// Lanes that ended early
    pub fn failed_lanes(&self) -> &[LaneFailure] {
        &self.failed_lanes
    }

    /// Incomplete tasks ordered by phase and name
    pub fn incomplete(&self) -> Vec<Incomplete> {
        self.incomplete
            .iter()
            .map(|((phase, task), reason)| Incomplete {
                phase: *phase,
                task: task.clone(),
                reason: reason.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::LaneId;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            RaceState::Provisioning,
            RaceState::Warmup,
            RaceState::Measurement,
            RaceState::Teardown,
            RaceState::Finished,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(RaceState::Provisioning.can_transition_to(&RaceState::Measurement));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!RaceState::Measurement.can_transition_to(&RaceState::Warmup));
        assert!(!RaceState::Provisioning.can_transition_to(&RaceState::Finished));
        assert!(!RaceState::Finished.can_transition_to(&RaceState::Teardown));

        let failed = RaceState::Failed {
            reason: "x".into(),
        };
        assert!(RaceState::Warmup.can_transition_to(&failed));
        assert!(!RaceState::Finished.can_transition_to(&failed));
        assert!(!failed.can_transition_to(&failed));
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_state_display_and_serde() {
        let failed = RaceState::Failed {
            reason: "no workers reachable".into(),
        };
        assert_eq!(failed.to_string(), "failed: no workers reachable");
        assert_eq!(RaceState::running(Phase::Warmup), RaceState::Warmup);

        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"no workers reachable"}"#);
    }

    #[test]
    fn test_ledger_keeps_first_reason() {
        let mut ledger = RaceLedger::new();
        ledger.mark_incomplete(Phase::Measurement, "search", "interrupted");
        ledger.mark_incomplete(Phase::Measurement, "search", "worker lost");
        ledger.lane_failed(
            Phase::Warmup,
            LaneFailure {
                lane: LaneId::new(1, 4),
                task: "bulk".into(),
                reason: "no route to host".into(),
            },
        );

        let incomplete = ledger.incomplete();
        assert_eq!(incomplete.len(), 2);
        assert_eq!(incomplete[0].phase, Phase::Warmup);
        assert_eq!(incomplete[0].reason, "lane failed: no route to host");
        assert_eq!(incomplete[1].reason, "interrupted");
        assert_eq!(ledger.failed_lanes().len(), 1);
        assert!(!ledger.is_degraded());

        ledger.worker_lost(1, "loadgen-1", "connection reset");
        assert!(ledger.is_degraded());
        assert!(ledger.is_lost(1));
        assert!(!ledger.is_lost(0));
    }
}
