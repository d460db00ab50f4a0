//! Task graph: the declarative workload handed to the coordinator
//!
//! A [`Task`] names one operation together with how hard, how wide and how
//! long to drive it. Tasks compose into a [`TaskGraph`] of sequential chains
//! and parallel groups.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Race phase a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Samples are collected but reported separately from measurement
    Warmup,
    /// The samples the race is judged on
    Measurement,
}

impl Phase {
    /// Phases in execution order
    pub const ALL: [Phase; 2] = [Phase::Warmup, Phase::Measurement];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Warmup => "warmup",
            Phase::Measurement => "measurement",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target throughput of a task, summed over all of its lanes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Throughput {
    /// Issue the next request as soon as the previous one returns
    #[default]
    Unthrottled,
    /// Requests per second
    Target(f64),
}

/// When a task is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Fixed number of requests, shared across lanes
    Iterations(u64),
    /// Stop scheduling new requests once this much time has passed
    Duration(Duration),
    /// Run until the race is interrupted
    UntilInterrupted,
}

impl Default for Completion {
    fn default() -> Self {
        Completion::Iterations(1)
    }
}

/// Gradual start of a task
///
/// Throttled tasks ramp their rate linearly from `initial_rate` to the target.
/// Unthrottled tasks start their lanes one after another over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampUp {
    /// Length of the ramp
    pub duration: Duration,
    /// Total rate at the start of the ramp (requests per second)
    #[serde(default)]
    pub initial_rate: f64,
}

impl RampUp {
    /// Create a ramp
    pub fn new(duration: Duration, initial_rate: f64) -> Self {
        Self {
            duration,
            initial_rate,
        }
    }
}

/// A named unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task name
    pub name: String,
    /// Reference into the worker's operation registry
    pub operation: String,
    /// Target throughput
    #[serde(default)]
    pub throughput: Throughput,
    /// Number of lanes
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Completion criterion
    #[serde(default)]
    pub completion: Completion,
    /// Phase tag
    #[serde(default = "default_phase")]
    pub phase: Phase,
    /// Optional ramp-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_up: Option<RampUp>,
}

fn default_concurrency() -> usize {
    1
}

fn default_phase() -> Phase {
    Phase::Measurement
}

impl Task {
    /// Create a single-lane, unthrottled, single-iteration measurement task
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            throughput: Throughput::Unthrottled,
            concurrency: 1,
            completion: Completion::default(),
            phase: Phase::Measurement,
            ramp_up: None,
        }
    }

    /// Set a target rate in requests per second
    pub fn with_rate(self, rate: f64) -> Self {
        self.with_throughput(Throughput::Target(rate))
    }

    /// Set the throughput
    pub fn with_throughput(mut self, throughput: Throughput) -> Self {
        self.throughput = throughput;
        self
    }

    /// Set the number of lanes
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the completion criterion
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Set the phase
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Set a ramp-up
    pub fn with_ramp_up(mut self, ramp_up: RampUp) -> Self {
        self.ramp_up = Some(ramp_up);
        self
    }

    /// Iterations owned by lane `index` when the task's iterations are split
    /// evenly across its lanes
    pub fn iterations_for_lane(&self, index: usize) -> Option<u64> {
        match self.completion {
            Completion::Iterations(total) => {
                let lanes = self.concurrency.max(1) as u64;
                let index = index as u64;
                Some(total / lanes + u64::from(index < total % lanes))
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTask(format!("{}: {reason}", self.name));

        if self.name.is_empty() {
            return Err(ConfigError::InvalidTask("task name must not be empty".into()));
        }
        if self.operation.is_empty() {
            return Err(invalid("operation reference must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if let Throughput::Target(rate) = self.throughput {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(invalid("target throughput must be positive"));
            }
            if let Some(ramp) = self.ramp_up {
                if !(0.0..rate).contains(&ramp.initial_rate) {
                    return Err(invalid("ramp-up must start below the target rate"));
                }
            }
        }
        if self.completion == Completion::Iterations(0) {
            return Err(invalid("iterations must be at least 1"));
        }
        if let Some(ramp) = self.ramp_up {
            if ramp.duration.is_zero() {
                return Err(invalid("ramp-up duration must be positive"));
            }
        }
        Ok(())
    }
}

/// Sequential and parallel composition of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGraph {
    /// A single task
    Task(Task),
    /// Children run one after another
    Sequential(Vec<TaskGraph>),
    /// Children start together; the group ends when all children end
    Parallel(Vec<TaskGraph>),
}

impl From<Task> for TaskGraph {
    fn from(task: Task) -> Self {
        TaskGraph::Task(task)
    }
}

impl TaskGraph {
    /// Sequential chain
    pub fn sequential(children: impl IntoIterator<Item = TaskGraph>) -> Self {
        TaskGraph::Sequential(children.into_iter().collect())
    }

    /// Parallel group
    pub fn parallel(children: impl IntoIterator<Item = TaskGraph>) -> Self {
        TaskGraph::Parallel(children.into_iter().collect())
    }

    /// All leaf tasks in traversal order
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks = Vec::new();
        self.collect_tasks(&mut tasks);
        tasks
    }

    fn collect_tasks<'a>(&'a self, out: &mut Vec<&'a Task>) {
        match self {
            TaskGraph::Task(task) => out.push(task),
            TaskGraph::Sequential(children) | TaskGraph::Parallel(children) => {
                for child in children {
                    child.collect_tasks(out);
                }
            }
        }
    }

    /// Whether any task is tagged with `phase`
    pub fn has_phase(&self, phase: Phase) -> bool {
        self.tasks().iter().any(|task| task.phase == phase)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_node()?;

        let mut names = HashSet::new();
        for task in self.tasks() {
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::InvalidGraph(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
        }
        Ok(())
    }

    fn validate_node(&self) -> Result<(), ConfigError> {
        match self {
            TaskGraph::Task(task) => task.validate(),
            TaskGraph::Sequential(children) | TaskGraph::Parallel(children) => {
                if children.is_empty() {
                    return Err(ConfigError::InvalidGraph(
                        "groups must contain at least one child".into(),
                    ));
                }
                children.iter().try_for_each(TaskGraph::validate_node)
            }
        }
    }

    /// The graph restricted to one phase, or `None` if nothing is left
    pub fn for_phase(&self, phase: Phase) -> Option<TaskGraph> {
        match self {
            TaskGraph::Task(task) => (task.phase == phase).then(|| self.clone()),
            TaskGraph::Sequential(children) => {
                let kept: Vec<_> = children.iter().filter_map(|c| c.for_phase(phase)).collect();
                (!kept.is_empty()).then_some(TaskGraph::Sequential(kept))
            }
            TaskGraph::Parallel(children) => {
                let kept: Vec<_> = children.iter().filter_map(|c| c.for_phase(phase)).collect();
                (!kept.is_empty()).then_some(TaskGraph::Parallel(kept))
            }
        }
    }

    /// Join-point separated steps of one phase
    ///
    /// The top-level sequential chain is split into its children; every step
    /// finishes on all workers before the next one starts.
    pub fn steps(&self, phase: Phase) -> Vec<TaskGraph> {
        match self.for_phase(phase) {
            None => Vec::new(),
            Some(TaskGraph::Sequential(children)) => children,
            Some(node) => vec![node],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmup(name: &str) -> TaskGraph {
        Task::new(name, "op").with_phase(Phase::Warmup).into()
    }

    fn measure(name: &str) -> TaskGraph {
        Task::new(name, "op").into()
    }

    #[test]
    fn test_task_defaults() {
        let task = Task::new("index", "bulk");
        assert_eq!(task.concurrency, 1);
        assert_eq!(task.throughput, Throughput::Unthrottled);
        assert_eq!(task.completion, Completion::Iterations(1));
        assert_eq!(task.phase, Phase::Measurement);
    }

    #[test]
    fn test_iterations_split_across_lanes() {
        let task = Task::new("t", "op")
            .with_concurrency(3)
            .with_completion(Completion::Iterations(10));
        let shares: Vec<_> = (0..3).filter_map(|i| task.iterations_for_lane(i)).collect();
        assert_eq!(shares, vec![4, 3, 3]);
        assert_eq!(shares.iter().sum::<u64>(), 10);
    }

    #[test]
    fn test_duration_task_has_no_iteration_share() {
        let task = Task::new("t", "op").with_completion(Completion::Duration(Duration::from_secs(1)));
        assert_eq!(task.iterations_for_lane(0), None);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let graph: TaskGraph = Task::new("t", "op").with_concurrency(0).into();
        assert!(matches!(graph.validate(), Err(ConfigError::InvalidTask(_))));
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let graph: TaskGraph = Task::new("t", "op").with_rate(rate).into();
            assert!(graph.validate().is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn test_validate_rejects_ramp_above_target() {
        let graph: TaskGraph = Task::new("t", "op")
            .with_rate(10.0)
            .with_ramp_up(RampUp::new(Duration::from_secs(5), 20.0))
            .into();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let graph = TaskGraph::parallel([measure("a"), measure("a")]);
        assert!(matches!(graph.validate(), Err(ConfigError::InvalidGraph(_))));
    }

    #[test]
    fn test_validate_rejects_empty_group() {
        let graph = TaskGraph::sequential([TaskGraph::parallel([])]);
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_steps_split_by_phase() {
        let graph = TaskGraph::sequential([
            warmup("w1"),
            TaskGraph::parallel([warmup("w2"), measure("m1")]),
            measure("m2"),
        ]);

        let warm = graph.steps(Phase::Warmup);
        assert_eq!(warm.len(), 2);
        assert_eq!(warm[1], TaskGraph::parallel([warmup("w2")]));

        let measurement = graph.steps(Phase::Measurement);
        assert_eq!(measurement.len(), 2);
        assert_eq!(measurement[0], TaskGraph::parallel([measure("m1")]));
        assert_eq!(measurement[1], measure("m2"));
    }

    #[test]
    fn test_single_parallel_group_is_one_step() {
        let graph = TaskGraph::parallel([measure("a"), measure("b")]);
        assert_eq!(graph.steps(Phase::Measurement), vec![graph.clone()]);
        assert!(graph.steps(Phase::Warmup).is_empty());
        assert!(!graph.has_phase(Phase::Warmup));
    }

    #[test]
    fn test_graph_json_shape() {
        let graph = TaskGraph::sequential([Task::new("a", "search")
            .with_rate(5.0)
            .with_completion(Completion::Iterations(3))
            .into()]);
        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.starts_with(r#"{"sequential":[{"task":{"name":"a""#));
        assert!(json.contains(r#""throughput":{"target":5.0}"#));
        assert!(json.contains(r#""completion":{"iterations":3}"#));

        let parsed: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
    }

    #[test]
    fn test_task_json_defaults() {
        let task: Task = serde_json::from_str(r#"{"name": "a", "operation": "op"}"#).unwrap();
        assert_eq!(task, Task::new("a", "op"));
    }
}
