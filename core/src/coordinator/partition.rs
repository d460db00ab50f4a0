//! Lane assignment across workers

use std::collections::BTreeMap;

use crate::sample::LaneId;
use crate::scheduler::{LaneSpec, PhasePlan, PlanNode};
use crate::task::{Phase, TaskGraph};

/// Splits a task graph into per-worker plans
///
/// Lanes are dealt round-robin over the workers with one cursor for the whole
/// race, so lane counts per worker differ by at most one. Every worker gets
/// every step, possibly with no lanes, because each step is a barrier.
#[derive(Debug, Clone)]
pub struct Partitioner {
    workers: Vec<usize>,
}

impl Partitioner {
    /// Partition over the given worker ids
    pub fn new(workers: impl IntoIterator<Item = usize>) -> Self {
        Self {
            workers: workers.into_iter().collect(),
        }
    }

    /// Per-worker phase plans
    pub fn partition(&self, graph: &TaskGraph) -> BTreeMap<usize, Vec<PhasePlan>> {
        let mut plans: BTreeMap<usize, Vec<PhasePlan>> =
            self.workers.iter().map(|&id| (id, Vec::new())).collect();
        if self.workers.is_empty() {
            return plans;
        }

        let mut cursor = Cursor::default();
        for phase in Phase::ALL {
            let steps = graph.steps(phase);
            if steps.is_empty() {
                continue;
            }

            let mut per_worker: BTreeMap<usize, Vec<PlanNode>> = BTreeMap::new();
            for step in &steps {
                for (worker, node) in self.split(step, &mut cursor) {
                    per_worker.entry(worker).or_default().push(node);
                }
            }
            for (worker, steps) in per_worker {
                if let Some(phases) = plans.get_mut(&worker) {
                    phases.push(PhasePlan { phase, steps });
                }
            }
        }
        plans
    }

    fn split(&self, graph: &TaskGraph, cursor: &mut Cursor) -> BTreeMap<usize, PlanNode> {
        match graph {
            TaskGraph::Task(task) => {
                let mut lanes: BTreeMap<usize, Vec<LaneSpec>> =
                    self.workers.iter().map(|&id| (id, Vec::new())).collect();
                for index in 0..task.concurrency {
                    let worker = self.workers[cursor.next_worker % self.workers.len()];
                    cursor.next_worker += 1;
                    let spec = LaneSpec {
                        id: LaneId::new(worker, cursor.next_lane),
                        index,
                        iterations: task.iterations_for_lane(index),
                    };
                    cursor.next_lane += 1;
                    if let Some(owned) = lanes.get_mut(&worker) {
                        owned.push(spec);
                    }
                }
                lanes
                    .into_iter()
                    .map(|(worker, lanes)| {
                        (
                            worker,
                            PlanNode::Task {
                                task: task.clone(),
                                lanes,
                            },
                        )
                    })
                    .collect()
            }
            TaskGraph::Sequential(children) => self.split_group(children, cursor, |children| {
                PlanNode::Sequential { children }
            }),
            TaskGraph::Parallel(children) => self.split_group(children, cursor, |children| {
                PlanNode::Parallel { children }
            }),
        }
    }

    fn split_group(
        &self,
        children: &[TaskGraph],
        cursor: &mut Cursor,
        group: impl Fn(Vec<PlanNode>) -> PlanNode,
    ) -> BTreeMap<usize, PlanNode> {
        let mut per_worker: BTreeMap<usize, Vec<PlanNode>> =
            self.workers.iter().map(|&id| (id, Vec::new())).collect();
        for child in children {
            for (worker, node) in self.split(child, cursor) {
                per_worker.entry(worker).or_default().push(node);
            }
        }
        per_worker
            .into_iter()
            .map(|(worker, children)| (worker, group(children)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Cursor {
    next_worker: usize,
    next_lane: usize,
}
