//! Per-worker execution plan and step results

use serde::{Deserialize, Serialize};

use crate::sample::LaneId;
use crate::task::{Phase, Task};

/// One lane a worker owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSpec {
    /// Race-wide lane identity
    pub id: LaneId,
    /// Position of the lane within its task, across all workers
    pub index: usize,
    /// Iterations this lane issues for iteration-bounded tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
}

/// The slice of a task graph assigned to one worker
///
/// Mirrors the graph shape; each task carries only the lanes this worker
/// owns, possibly none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PlanNode {
    /// A task and the lanes of it this worker runs
    Task {
        /// Task definition
        task: Task,
        /// Owned lanes
        lanes: Vec<LaneSpec>,
    },
    /// Children run one after another
    Sequential {
        /// Child nodes
        children: Vec<PlanNode>,
    },
    /// Children start together with a shared reference time
    Parallel {
        /// Child nodes
        children: Vec<PlanNode>,
    },
}

impl PlanNode {
    /// Number of lanes in this subtree
    pub fn lane_count(&self) -> usize {
        match self {
            PlanNode::Task { lanes, .. } => lanes.len(),
            PlanNode::Sequential { children } | PlanNode::Parallel { children } => {
                children.iter().map(PlanNode::lane_count).sum()
            }
        }
    }

    /// Tasks in this subtree that own at least one lane
    pub fn assigned_tasks(&self) -> Vec<&Task> {
        match self {
            PlanNode::Task { task, lanes } if !lanes.is_empty() => vec![task],
            PlanNode::Task { .. } => Vec::new(),
            PlanNode::Sequential { children } | PlanNode::Parallel { children } => {
                children.iter().flat_map(PlanNode::assigned_tasks).collect()
            }
        }
    }

    /// Operation references the lanes of this subtree execute
    pub fn operations(&self) -> Vec<&str> {
        self.assigned_tasks()
            .into_iter()
            .map(|task| task.operation.as_str())
            .collect()
    }
}

/// Steps of one phase, executed in order with a barrier after each
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// Phase tag of every task in the plan
    pub phase: Phase,
    /// Join-point separated steps
    pub steps: Vec<PlanNode>,
}

/// A lane that ended early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneFailure {
    /// Failed lane
    pub lane: LaneId,
    /// Task the lane belonged to
    pub task: String,
    /// Why the lane ended
    pub reason: String,
}

/// Outcome of running one step on one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Requests issued by all lanes
    pub issued: u64,
    /// Lanes that reached `Done`
    pub lanes: usize,
    /// Lanes that ended early
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<LaneFailure>,
    /// Whether an interrupt cut the step short
    #[serde(default)]
    pub interrupted: bool,
    /// Abort reason when a failed request stopped the race
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl StepReport {
    /// Merge a child's report into this one
    pub fn merge(&mut self, other: StepReport) {
        self.issued += other.issued;
        self.lanes += other.lanes;
        self.failures.extend(other.failures);
        self.interrupted |= other.interrupted;
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }

    /// Check if every lane ran to completion
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.interrupted && self.aborted.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(worker: usize, lane: usize) -> LaneSpec {
        LaneSpec {
            id: LaneId::new(worker, lane),
            index: lane,
            iterations: None,
        }
    }

    #[test]
    fn test_lane_count_and_operations() {
        let plan = PlanNode::Parallel {
            children: vec![
                PlanNode::Task {
                    task: Task::new("a", "search"),
                    lanes: vec![lane(0, 0), lane(0, 2)],
                },
                PlanNode::Task {
                    task: Task::new("b", "bulk"),
                    lanes: vec![],
                },
            ],
        };
        assert_eq!(plan.lane_count(), 2);
        assert_eq!(plan.operations(), vec!["search"]);
        let tasks: Vec<&str> = plan.assigned_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tasks, vec!["a"]);
    }

    #[test]
    fn test_report_merge() {
        let mut report = StepReport {
            issued: 3,
            lanes: 1,
            ..Default::default()
        };
        report.merge(StepReport {
            issued: 4,
            lanes: 2,
            failures: vec![LaneFailure {
                lane: LaneId::new(1, 1),
                task: "a".into(),
                reason: "refused".into(),
            }],
            interrupted: true,
            aborted: Some("boom".into()),
        });
        assert_eq!(report.issued, 7);
        assert_eq!(report.lanes, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(report.interrupted);
        assert_eq!(report.aborted.as_deref(), Some("boom"));
        assert!(!report.is_clean());
        assert!(StepReport::default().is_clean());
    }

    #[test]
    fn test_plan_json_tagging() {
        let plan = PlanNode::Sequential {
            children: vec![PlanNode::Task {
                task: Task::new("a", "op"),
                lanes: vec![lane(0, 0)],
            }],
        };
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.starts_with(r#"{"node":"sequential","children":[{"node":"task""#));
        let parsed: PlanNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
    }
}
