//! Task scheduler: turns a worker's plan into paced request issuance
//!
//! Every lane runs as its own tokio task and loops through
//! **pace -> execute -> forward -> check completion** until its task is done:
//!
//! 1. The [`Pacer`] computes the request's ideal start time (open loop)
//! 2. The lane sleeps until then, unless it is already late
//! 3. The [`OperationExecutor`] runs the operation and produces a sample
//! 4. The sample goes into the worker's bounded queue (blocking when full)
//! 5. The completion criterion decides whether to loop or stop
//!
//! Sequential plan nodes run their children one after another, each with a
//! fresh reference time. Parallel nodes start all children with the same
//! reference time so their schedules line up, and finish when the last child
//! finishes.
//!
//! # Example
//!
//! ```ignore
//! use racebench_core::scheduler::{InterruptSignal, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(registry, connections, clock, samples_tx)
//!     .with_interrupt(interrupt.clone());
//!
//! let report = scheduler.run_step(&plan, Phase::Measurement).await;
//! println!("Issued: {}", report.issued);
//! ```

mod executor;
mod lane;
mod pacer;
mod plan;

pub use executor::OperationExecutor;
pub use lane::{Lane, LaneContext, LaneOutcome, LaneReport, LaneState};
pub use pacer::{Pacer, RateSchedule};
pub use plan::{LaneFailure, LaneSpec, PhasePlan, PlanNode, StepReport};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, watch};

use crate::clock::RaceClock;
use crate::config::ErrorPolicy;
use crate::operation::{ConnectionFactory, OperationRegistry};
use crate::sample::Sample;
use crate::task::{Phase, Task};

/// Shared stop signal observed by every lane at its next suspension point
///
/// Once triggered it stays triggered.
#[derive(Clone)]
pub struct InterruptSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the signal; later calls are no-ops
    pub fn trigger(&self) {
        self.tx.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    /// Check if the signal was triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver for use with [`InterruptSignal::wait`]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal is triggered
    pub async fn wait(rx: &mut watch::Receiver<bool>) {
        let triggered = rx.wait_for(|stopped| *stopped).await.is_ok();
        if !triggered {
            // Sender gone: the signal can never fire
            std::future::pending::<()>().await;
        }
    }
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterruptSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Executes plan steps on one worker
pub struct TaskScheduler<C> {
    registry: Arc<OperationRegistry<C>>,
    connections: Arc<dyn ConnectionFactory<C>>,
    clock: RaceClock,
    samples: mpsc::Sender<Sample>,
    interrupt: InterruptSignal,
    error_policy: ErrorPolicy,
}

impl<C: Send + 'static> TaskScheduler<C> {
    /// Create a scheduler
    pub fn new(
        registry: Arc<OperationRegistry<C>>,
        connections: Arc<dyn ConnectionFactory<C>>,
        clock: RaceClock,
        samples: mpsc::Sender<Sample>,
    ) -> Self {
        Self {
            registry,
            connections,
            clock,
            samples,
            interrupt: InterruptSignal::new(),
            error_policy: ErrorPolicy::default(),
        }
    }

    /// Use a shared interrupt signal
    pub fn with_interrupt(mut self, interrupt: InterruptSignal) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Set the request failure policy
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// The interrupt signal lanes observe
    pub fn interrupt(&self) -> &InterruptSignal {
        &self.interrupt
    }

    /// Run one step to completion
    ///
    /// The step's reference time is the moment this is called.
    pub async fn run_step(&self, node: &PlanNode, phase: Phase) -> StepReport {
        let reference = self.clock.now();
        tracing::debug!(
            phase = %phase,
            lanes = node.lane_count(),
            reference_ms = reference.as_millis() as u64,
            "Step started"
        );

        let mut report = self.run_node(node, phase, reference).await;
        report.interrupted |= self.interrupt.is_triggered();

        tracing::debug!(
            phase = %phase,
            issued = report.issued,
            failed_lanes = report.failures.len(),
            interrupted = report.interrupted,
            "Step finished"
        );
        report
    }

    fn run_node<'a>(
        &'a self,
        node: &'a PlanNode,
        phase: Phase,
        reference: Duration,
    ) -> BoxFuture<'a, StepReport> {
        Box::pin(async move {
            match node {
                PlanNode::Task { task, lanes } => self.run_task(task, lanes, phase, reference).await,
                PlanNode::Sequential { children } => {
                    let mut report = StepReport::default();
                    for child in children {
                        if self.interrupt.is_triggered() {
                            report.interrupted = true;
                            break;
                        }
                        report.merge(self.run_node(child, phase, self.clock.now()).await);
                    }
                    report
                }
                PlanNode::Parallel { children } => {
                    let reports =
                        join_all(children.iter().map(|c| self.run_node(c, phase, reference))).await;
                    reports.into_iter().fold(StepReport::default(), |mut acc, r| {
                        acc.merge(r);
                        acc
                    })
                }
            }
        })
    }

    async fn run_task(
        &self,
        task: &Task,
        lanes: &[LaneSpec],
        phase: Phase,
        reference: Duration,
    ) -> StepReport {
        let mut report = StepReport::default();
        if lanes.is_empty() {
            return report;
        }

        let Some(operation) = self.registry.get(&task.operation) else {
            tracing::warn!(
                task = %task.name,
                operation = %task.operation,
                "Unknown operation, failing all lanes of task"
            );
            report.failures = lanes
                .iter()
                .map(|spec| LaneFailure {
                    lane: spec.id,
                    task: task.name.clone(),
                    reason: format!("unknown operation: {}", task.operation),
                })
                .collect();
            report.lanes = lanes.len();
            return report;
        };

        let shared = Arc::new(task.clone());
        let handles: Vec<_> = lanes
            .iter()
            .map(|spec| {
                let lane = Lane::new(
                    spec.clone(),
                    LaneContext {
                        clock: self.clock,
                        reference,
                        phase,
                        task: Arc::clone(&shared),
                        operation: Arc::clone(&operation),
                        connections: Arc::clone(&self.connections),
                        samples: self.samples.clone(),
                        interrupt: self.interrupt.clone(),
                        error_policy: self.error_policy,
                    },
                );
                (spec.id, tokio::spawn(lane.run()))
            })
            .collect();

        for (id, handle) in handles {
            report.lanes += 1;
            match handle.await {
                Ok(lane) => {
                    report.issued += lane.issued;
                    match lane.outcome {
                        LaneOutcome::Completed => {}
                        LaneOutcome::Interrupted => report.interrupted = true,
                        LaneOutcome::Failed(reason) => report.failures.push(LaneFailure {
                            lane: id,
                            task: task.name.clone(),
                            reason,
                        }),
                        LaneOutcome::Aborted(reason) => {
                            report.interrupted = true;
                            report.aborted.get_or_insert(reason);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(lane = %id, task = %task.name, error = %e, "Lane task failed");
                    report.failures.push(LaneFailure {
                        lane: id,
                        task: task.name.clone(),
                        reason: format!("lane panicked: {e}"),
                    });
                }
            }
        }

        report
    }
}

impl<C> fmt::Debug for TaskScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("registry", &self.registry)
            .field("interrupt", &self.interrupt)
            .field("error_policy", &self.error_policy)
            .finish()
    }
}
