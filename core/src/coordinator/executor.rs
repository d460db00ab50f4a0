//! Coordinator execution logic

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::clock::RaceClock;
use crate::config::RaceConfig;
use crate::error::{BenchError, BenchResult};
use crate::metrics::{MetricsAggregator, PhaseBoundary, RaceReport, WorkerSummary};
use crate::protocol::{Assignment, Barrier, CoordinatorMessage, WorkerMessage};
use crate::scheduler::{InterruptSignal, PhasePlan, PlanNode, StepReport};
use crate::task::{Completion, Phase, TaskGraph};
use crate::telemetry::{PhaseEvent, TelemetrySink};
use crate::transport::{tcp, LinkEvent, WorkerEvent, WorkerLink};
use crate::worker::WorkerStats;

use super::barrier::BarrierTracker;
use super::handle::RaceHandle;
use super::partition::Partitioner;
use super::state::{RaceLedger, RaceState};

pub(crate) type LocalLauncher =
    Box<dyn FnOnce(usize, RaceClock, mpsc::Sender<WorkerEvent>, usize) -> WorkerLink + Send>;

/// Where a worker comes from
pub(crate) enum WorkerSource {
    Local { name: String, launch: LocalLauncher },
    Remote(SocketAddr),
}

/// Coordinator owns the task graph and the race lifecycle
///
/// Responsible for partitioning lanes across workers, releasing every step
/// only after all workers finished the previous one, and turning the sample
/// stream into a [`RaceReport`].
pub struct Coordinator {
    config: RaceConfig,
    graph: TaskGraph,
    telemetry: Arc<dyn TelemetrySink>,
    sources: Vec<WorkerSource>,
}

impl Coordinator {
    /// Create a new coordinator
    ///
    /// Use `CoordinatorBuilder` for a more ergonomic construction.
    pub(crate) fn new(
        config: RaceConfig,
        graph: TaskGraph,
        telemetry: Arc<dyn TelemetrySink>,
        sources: Vec<WorkerSource>,
    ) -> Self {
        Self {
            config,
            graph,
            telemetry,
            sources,
        }
    }

    /// Get the race configuration
    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    /// Get the task graph
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Start the race in the background
    ///
    /// The race clock starts now.
    pub fn start(self) -> RaceHandle {
        let clock = RaceClock::start();
        let epoch = Utc::now();
        let (state_tx, state_rx) = watch::channel(RaceState::Provisioning);
        let interrupt = InterruptSignal::new();
        let metrics = Arc::new(RwLock::new(MetricsAggregator::new()));

        let driver_interrupt = interrupt.clone();
        let driver_metrics = Arc::clone(&metrics);
        let task = tokio::spawn(async move {
            RaceDriver::new(self, clock, epoch, state_tx, driver_interrupt, driver_metrics)
                .drive()
                .await
        });

        RaceHandle {
            state: state_rx,
            interrupt,
            metrics,
            clock,
            task,
        }
    }

    /// Run the race to completion
    pub async fn run(self) -> BenchResult<RaceReport> {
        self.start().wait().await
    }

    /// Run with Ctrl+C signal handling
    ///
    /// Ctrl+C interrupts the race; the report is still produced.
    pub async fn run_with_signal_handling(self) -> BenchResult<RaceReport> {
        self.start().wait_with_signal_handling().await
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("tasks", &self.graph.tasks().len())
            .field("workers", &self.sources.len())
            .finish()
    }
}

/// Coordinator view of one worker
struct LinkState {
    /// Present while the worker is live
    link: Option<WorkerLink>,
    name: String,
    greeted: bool,
    operations: Vec<String>,
    last_seen: Instant,
    acked: HashSet<Barrier>,
    stats: Option<WorkerStats>,
}

impl LinkState {
    fn new(name: String, link: Option<WorkerLink>) -> Self {
        Self {
            link,
            name,
            greeted: false,
            operations: Vec::new(),
            last_seen: Instant::now(),
            acked: HashSet::new(),
            stats: None,
        }
    }

    fn is_live(&self) -> bool {
        self.link.is_some()
    }
}

/// What the coordinator is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Greeting,
    Barrier,
    Teardown,
}

/// Single owner of all race state while a race runs
struct RaceDriver {
    config: RaceConfig,
    graph: TaskGraph,
    telemetry: Arc<dyn TelemetrySink>,
    sources: Vec<WorkerSource>,
    clock: RaceClock,
    epoch: DateTime<Utc>,
    state: watch::Sender<RaceState>,
    interrupt: InterruptSignal,
    interrupt_rx: watch::Receiver<bool>,
    interrupt_sent: bool,
    aborted: Option<String>,
    metrics: Arc<RwLock<MetricsAggregator>>,
    links: BTreeMap<usize, LinkState>,
    events: mpsc::Receiver<WorkerEvent>,
    events_tx: Option<mpsc::Sender<WorkerEvent>>,
    liveness: Interval,
    tracker: BarrierTracker,
    ledger: RaceLedger,
    plans: BTreeMap<usize, Vec<PhasePlan>>,
    stage: Stage,
    deadline: Option<(Instant, String)>,
    boundaries: Vec<PhaseBoundary>,
}

impl RaceDriver {
    fn new(
        coordinator: Coordinator,
        clock: RaceClock,
        epoch: DateTime<Utc>,
        state: watch::Sender<RaceState>,
        interrupt: InterruptSignal,
        metrics: Arc<RwLock<MetricsAggregator>>,
    ) -> Self {
        let Coordinator {
            config,
            graph,
            telemetry,
            sources,
        } = coordinator;

        let (events_tx, events) = mpsc::channel(config.channels.link_buffer);
        let mut liveness = tokio::time::interval(config.heartbeat_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interrupt_rx = interrupt.subscribe();

        Self {
            config,
            graph,
            telemetry,
            sources,
            clock,
            epoch,
            state,
            interrupt,
            interrupt_rx,
            interrupt_sent: false,
            aborted: None,
            metrics,
            links: BTreeMap::new(),
            events,
            events_tx: Some(events_tx),
            liveness,
            tracker: BarrierTracker::new(),
            ledger: RaceLedger::new(),
            plans: BTreeMap::new(),
            stage: Stage::Idle,
            deadline: None,
            boundaries: Vec::new(),
        }
    }

    async fn drive(mut self) -> BenchResult<RaceReport> {
        tracing::info!(
            race = %self.config.name,
            workers = self.sources.len(),
            epoch = %self.epoch,
            "Starting race"
        );

        let result = match self.execute().await {
            Ok(()) => {
                self.transition(RaceState::Teardown);
                self.teardown().await;
                self.conclude().await
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        };

        match result {
            Ok(report) => {
                self.transition(RaceState::Finished);
                tracing::info!(
                    race = %report.race,
                    samples = report.total_samples(),
                    degraded = report.degraded,
                    cancelled = report.cancelled,
                    "Race finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(race = %self.config.name, error = %e, "Race failed");
                self.transition(RaceState::Failed {
                    reason: e.message.clone(),
                });
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> BenchResult<()> {
        self.connect().await?;
        self.greet().await?;
        self.provision().await?;

        for phase in Phase::ALL {
            let steps = self.graph.steps(phase);
            if steps.is_empty() {
                continue;
            }
            if self.interrupt.is_triggered() {
                self.skip_steps(phase, &steps, 0, "interrupted before start");
                continue;
            }
            self.run_phase(phase, &steps).await?;
        }
        Ok(())
    }

    async fn connect(&mut self) -> BenchResult<()> {
        let Some(events) = self.events_tx.take() else {
            return Ok(());
        };
        let buffer = self.config.channels.link_buffer;
        let timeout = self.config.worker_timeout;

        let mut remotes = Vec::new();
        for (id, source) in std::mem::take(&mut self.sources).into_iter().enumerate() {
            match source {
                WorkerSource::Local { name, launch } => {
                    let link = launch(id, self.clock, events.clone(), buffer);
                    self.links.insert(id, LinkState::new(name, Some(link)));
                }
                WorkerSource::Remote(addr) => remotes.push((id, addr)),
            }
        }

        let connecting = remotes
            .iter()
            .map(|&(id, addr)| tcp::connect(id, addr, events.clone(), timeout, buffer));
        let results = join_all(connecting).await;
        drop(events);

        for ((id, addr), result) in remotes.into_iter().zip(results) {
            match result {
                Ok(link) => {
                    self.links.insert(id, LinkState::new(addr.to_string(), Some(link)));
                }
                Err(e) => {
                    tracing::warn!(worker_id = id, addr = %addr, error = %e, "Worker unreachable");
                    self.ledger.worker_lost(id, addr.to_string(), e.message);
                    self.links.insert(id, LinkState::new(addr.to_string(), None));
                }
            }
        }

        if self.live().is_empty() {
            return Err(BenchError::race_failed("no workers reachable"));
        }
        Ok(())
    }

    async fn greet(&mut self) -> BenchResult<()> {
        self.stage = Stage::Greeting;
        self.deadline = Some((
            Instant::now() + self.config.worker_timeout,
            "no hello within the worker timeout".to_string(),
        ));
        while !self.awaited().is_empty() {
            self.pump().await;
        }
        self.stage = Stage::Idle;
        self.deadline = None;

        if self.live().is_empty() {
            return Err(BenchError::race_failed("no workers reachable"));
        }
        Ok(())
    }

    async fn provision(&mut self) -> BenchResult<()> {
        let live = self.live();
        self.plans = Partitioner::new(live.iter().copied()).partition(&self.graph);

        for (&id, phases) in &self.plans {
            let Some(link) = self.links.get(&id) else {
                continue;
            };
            for plan in phases {
                for step in &plan.steps {
                    for operation in step.operations() {
                        if !link.operations.iter().any(|known| known == operation) {
                            tracing::warn!(
                                worker_id = id,
                                worker = %link.name,
                                operation,
                                "Worker did not announce an assigned operation"
                            );
                        }
                    }
                }
            }
        }

        for id in live {
            let Some(phases) = self.plans.get(&id).cloned() else {
                continue;
            };
            let assignment = Assignment {
                worker: id,
                race: self.config.name.clone(),
                epoch: self.epoch,
                error_policy: self.config.error_policy,
                heartbeat_interval: self.config.heartbeat_interval,
                phases,
            };
            tracing::debug!(worker_id = id, lanes = assignment.lane_count(), "Assigning lanes");
            self.send_to(id, CoordinatorMessage::Assign(assignment)).await;
        }

        let timeout = self.config.worker_timeout;
        self.await_barrier(Barrier::Provisioned, None, Some(timeout)).await;

        let live = self.live();
        if live.is_empty() {
            return Err(BenchError::race_failed("no workers could be provisioned"));
        }
        tracing::info!(
            race = %self.config.name,
            workers = live.len(),
            lanes = self.lane_count(),
            "Workers provisioned"
        );
        Ok(())
    }

    async fn run_phase(&mut self, phase: Phase, steps: &[TaskGraph]) -> BenchResult<()> {
        self.transition(RaceState::running(phase));
        let started = self.clock.now();
        self.telemetry.phase_started(&self.phase_event(phase, started));

        for step in 0..steps.len() {
            if self.interrupt.is_triggered() {
                self.skip_steps(phase, steps, step, "interrupted before start");
                break;
            }
            if self.live().is_empty() {
                self.skip_steps(phase, steps, step, "no live workers");
                break;
            }

            self.await_barrier(
                Barrier::Step { phase, step },
                Some(CoordinatorMessage::Proceed { phase, step }),
                None,
            )
            .await;

            if let Some(reason) = &self.aborted {
                return Err(BenchError::race_failed(format!("aborted: {reason}")));
            }
        }

        let ended = self.clock.now();
        self.metrics.write().await.close_phase(phase);
        self.boundaries.push(PhaseBoundary {
            phase,
            started,
            ended,
        });
        self.telemetry.phase_ended(&self.phase_event(phase, ended));
        Ok(())
    }

    /// Open `barrier`, send `message` to every live worker, and pump events
    /// until every worker reached the barrier or was lost
    async fn await_barrier(
        &mut self,
        barrier: Barrier,
        message: Option<CoordinatorMessage>,
        timeout: Option<std::time::Duration>,
    ) {
        let live = self.live();
        self.tracker.expect(barrier, live.iter().copied());
        self.stage = Stage::Barrier;
        self.deadline = timeout.map(|timeout| {
            (
                Instant::now() + timeout,
                format!("timed out waiting for {barrier}"),
            )
        });
        if self.interrupt_sent {
            self.apply_interrupt_grace();
        }

        if let Some(message) = message {
            for id in live {
                self.send_to(id, message.clone()).await;
            }
        }

        while !self.tracker.is_complete() {
            self.pump().await;
        }

        let reached = self.tracker.release();
        self.stage = Stage::Idle;
        self.deadline = None;
        tracing::debug!(barrier = %barrier, workers = reached.len(), "Barrier released");
    }

    async fn teardown(&mut self) {
        self.stage = Stage::Teardown;
        self.deadline = Some((
            Instant::now() + self.config.worker_timeout,
            "no final stats within the worker timeout".to_string(),
        ));
        for id in self.live() {
            self.send_to(id, CoordinatorMessage::Shutdown).await;
        }
        while !self.awaited().is_empty() {
            self.pump().await;
        }
        self.stage = Stage::Idle;
        self.deadline = None;
    }

    async fn conclude(&mut self) -> BenchResult<RaceReport> {
        let phases = {
            let mut metrics = self.metrics.write().await;
            let mut phases = Vec::new();
            for phase in Phase::ALL {
                metrics.close_phase(phase);
                if metrics.sample_count(phase) > 0 {
                    phases.push(metrics.finalize(phase)?);
                }
            }
            phases
        };

        for &phase in &self.config.required_phases {
            if self.graph.has_phase(phase) && !phases.iter().any(|summary| summary.phase == phase) {
                return Err(BenchError::race_failed(format!(
                    "no usable samples for the {phase} phase"
                )));
            }
        }

        let workers = self
            .links
            .iter()
            .map(|(&id, link)| WorkerSummary {
                worker: id,
                name: link.name.clone(),
                lanes: self.plans.get(&id).map(|p| plan_lanes(p)).unwrap_or(0),
                stats: link.stats.clone(),
            })
            .collect();

        Ok(RaceReport {
            race: self.config.name.clone(),
            epoch: self.epoch,
            finished: Utc::now(),
            degraded: self.ledger.is_degraded(),
            cancelled: self.interrupt.is_triggered() && self.aborted.is_none(),
            boundaries: self.boundaries.clone(),
            phases,
            incomplete: self.ledger.incomplete(),
            lost_workers: self.ledger.lost_workers().to_vec(),
            failed_lanes: self.ledger.failed_lanes().to_vec(),
            workers,
        })
    }

    /// Handle one event, interrupt or liveness check
    async fn pump(&mut self) {
        tokio::select! {
            biased;

            event = self.events.recv() => match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    for id in self.live() {
                        self.lose_worker(id, "link closed");
                    }
                }
            },

            _ = InterruptSignal::wait(&mut self.interrupt_rx), if !self.interrupt_sent => {
                self.broadcast_interrupt().await;
            }

            _ = self.liveness.tick() => self.check_liveness(),
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { worker, event } = event;
        let Some(link) = self.links.get_mut(&worker) else {
            return;
        };
        if !link.is_live() {
            return;
        }
        link.last_seen = Instant::now();

        match event {
            LinkEvent::Message(message) => self.handle_message(worker, message).await,
            LinkEvent::Disconnected(reason) => self.lose_worker(worker, reason),
        }
    }

    async fn handle_message(&mut self, worker: usize, message: WorkerMessage) {
        match message {
            WorkerMessage::Samples { samples } => {
                self.metrics.write().await.record_batch(&samples);
            }
            WorkerMessage::Heartbeat => {}
            WorkerMessage::Ready { barrier, summary } => {
                match self.tracker.acknowledge(worker, barrier) {
                    Ok(()) => {
                        if let Some(link) = self.links.get_mut(&worker) {
                            link.acked.insert(barrier);
                        }
                        tracing::debug!(
                            worker_id = worker,
                            barrier = %barrier,
                            pending = self.tracker.pending().len(),
                            "Worker reached barrier"
                        );
                        if let Barrier::Step { phase, step } = barrier {
                            self.absorb(worker, phase, step, summary);
                        }
                    }
                    Err(violation) => {
                        tracing::warn!(worker_id = worker, error = %violation, "Barrier violation");
                        self.lose_worker(worker, violation.to_string());
                    }
                }
            }
            WorkerMessage::Hello { name, operations } => {
                let Some(link) = self.links.get_mut(&worker) else {
                    return;
                };
                if link.greeted {
                    tracing::warn!(worker_id = worker, "Ignoring repeated hello");
                    return;
                }
                tracing::debug!(worker_id = worker, worker = %name, ?operations, "Worker said hello");
                link.name = name;
                link.operations = operations;
                link.greeted = true;
            }
            WorkerMessage::Aborted { reason } => {
                if self.aborted.is_none() {
                    tracing::error!(worker_id = worker, reason = %reason, "Worker aborted the race");
                    self.aborted = Some(reason);
                    self.interrupt.trigger();
                }
            }
            WorkerMessage::Finished { stats } => {
                if let Some(link) = self.links.get_mut(&worker) {
                    tracing::debug!(
                        worker_id = worker,
                        completed = stats.completed,
                        errors = stats.errors,
                        "Worker finished"
                    );
                    link.stats = Some(stats);
                    link.link = None;
                }
            }
        }
    }

    /// Fold a worker's step report into the ledger
    fn absorb(&mut self, worker: usize, phase: Phase, step: usize, summary: StepReport) {
        for failure in summary.failures {
            tracing::warn!(
                worker_id = worker,
                phase = %phase,
                task = %failure.task,
                lane = failure.lane.lane,
                reason = %failure.reason,
                "Lane ended early"
            );
            self.ledger.lane_failed(phase, failure);
        }

        if summary.interrupted {
            let cut_short: Vec<String> = self
                .step_plan(worker, phase, step)
                .map(|node| {
                    node.assigned_tasks()
                        .into_iter()
                        .filter(|task| task.completion != Completion::UntilInterrupted)
                        .map(|task| task.name.clone())
                        .collect()
                })
                .unwrap_or_default();
            for task in cut_short {
                self.ledger.mark_incomplete(phase, &task, "interrupted");
            }
        }
    }

    async fn broadcast_interrupt(&mut self) {
        self.interrupt_sent = true;
        tracing::info!(race = %self.config.name, "Interrupting race");
        for id in self.live() {
            self.send_to(id, CoordinatorMessage::Interrupt).await;
        }
        if self.stage == Stage::Barrier {
            self.apply_interrupt_grace();
        }
    }

    fn apply_interrupt_grace(&mut self) {
        let grace = Instant::now() + self.config.interrupt_grace;
        match &self.deadline {
            Some((deadline, _)) if *deadline <= grace => {}
            _ => {
                self.deadline = Some((
                    grace,
                    "did not stop within the interrupt grace period".to_string(),
                ));
            }
        }
    }

    fn check_liveness(&mut self) {
        let now = Instant::now();
        let timeout = self.config.worker_timeout;

        let silent: Vec<usize> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_live() && now.duration_since(link.last_seen) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in silent {
            self.lose_worker(id, format!("silent for more than {timeout:?}"));
        }

        if let Some((deadline, reason)) = self.deadline.clone() {
            if now >= deadline {
                for id in self.awaited() {
                    self.lose_worker(id, reason.clone());
                }
            }
        }
    }

    /// Workers the current stage is waiting for
    fn awaited(&self) -> Vec<usize> {
        match self.stage {
            Stage::Idle => Vec::new(),
            Stage::Greeting => self
                .links
                .iter()
                .filter(|(_, link)| link.is_live() && !link.greeted)
                .map(|(&id, _)| id)
                .collect(),
            Stage::Barrier => self.tracker.pending(),
            Stage::Teardown => self.live(),
        }
    }

    /// Drop a worker: its unfinished tasks become incomplete and the race
    /// becomes degraded
    fn lose_worker(&mut self, id: usize, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if link.link.take().is_none() {
            return;
        }

        tracing::warn!(worker_id = id, worker = %link.name, reason = %reason, "Lost worker");
        self.ledger.worker_lost(id, link.name.clone(), reason);
        self.tracker.forfeit(id);

        let Some(phases) = self.plans.get(&id) else {
            return;
        };
        let lost = format!("worker {} lost", link.name);
        for plan in phases {
            for (step, node) in plan.steps.iter().enumerate() {
                let barrier = Barrier::Step {
                    phase: plan.phase,
                    step,
                };
                if link.acked.contains(&barrier) {
                    continue;
                }
                for task in node.assigned_tasks() {
                    self.ledger.mark_incomplete(plan.phase, &task.name, lost.clone());
                }
            }
        }
    }

    async fn send_to(&mut self, id: usize, message: CoordinatorMessage) {
        let Some(link) = self.links.get(&id).and_then(|state| state.link.clone()) else {
            return;
        };
        if let Err(e) = link.send(message, self.config.worker_timeout).await {
            self.lose_worker(id, e.message);
        }
    }

    fn skip_steps(&mut self, phase: Phase, steps: &[TaskGraph], from: usize, reason: &str) {
        for step in steps.iter().skip(from) {
            for task in step.tasks() {
                self.ledger.mark_incomplete(phase, &task.name, reason);
            }
        }
    }

    fn transition(&self, next: RaceState) {
        let current = self.state.borrow().clone();
        if !current.can_transition_to(&next) {
            tracing::warn!(from = %current, to = %next, "Ignoring illegal race state transition");
            return;
        }
        tracing::info!(race = %self.config.name, from = %current, to = %next, "Race state changed");
        self.state.send_replace(next);
    }

    fn live(&self) -> Vec<usize> {
        self.links
            .iter()
            .filter(|(_, link)| link.is_live())
            .map(|(&id, _)| id)
            .collect()
    }

    fn lane_count(&self) -> usize {
        self.plans.values().map(|phases| plan_lanes(phases)).sum()
    }

    fn step_plan(&self, worker: usize, phase: Phase, step: usize) -> Option<&PlanNode> {
        self.plans
            .get(&worker)?
            .iter()
            .find(|plan| plan.phase == phase)?
            .steps
            .get(step)
    }

    fn phase_event(&self, phase: Phase, offset: std::time::Duration) -> PhaseEvent {
        PhaseEvent {
            race: self.config.name.clone(),
            phase,
            timestamp: Utc::now(),
            offset,
        }
    }
}

fn plan_lanes(phases: &[PhasePlan]) -> usize {
    phases
        .iter()
        .flat_map(|plan| plan.steps.iter())
        .map(PlanNode::lane_count)
        .sum()
}
