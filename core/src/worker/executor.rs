//! Worker execution loop

use crate::channel::ChannelConfig;
use crate::clock::RaceClock;
use crate::error::{BenchError, BenchResult};
use crate::operation::{ConnectionFactory, OperationRegistry};
use crate::protocol::{Assignment, Barrier, CoordinatorMessage, WorkerMessage};
use crate::sample::Sample;
use crate::scheduler::{InterruptSignal, StepReport, TaskScheduler};
use crate::task::Phase;

use super::stats::WorkerStats;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};

/// Worker owns the lanes assigned to it and streams their samples upstream
///
/// The worker talks to the coordinator only through messages: it announces
/// itself, accepts one assignment, runs steps on `Proceed`, and acknowledges
/// each step with `Ready` once every sample of that step has been sent.
pub struct Worker<C> {
    /// Worker name announced in the hello
    name: String,

    /// Operation implementations (shared across lanes via Arc)
    registry: Arc<OperationRegistry<C>>,

    /// Connection factory (one connection per lane)
    connections: Arc<dyn ConnectionFactory<C>>,

    /// Channel sizing
    channels: ChannelConfig,

    /// Race clock; derived from the assignment epoch when absent
    clock: Option<RaceClock>,
}

impl<C: Send + 'static> Worker<C> {
    /// Create a new worker
    pub fn new(
        name: String,
        registry: Arc<OperationRegistry<C>>,
        connections: Arc<dyn ConnectionFactory<C>>,
        channels: ChannelConfig,
    ) -> Self {
        Self {
            name,
            registry,
            connections,
            channels,
            clock: None,
        }
    }

    /// Share the coordinator's clock instead of aligning to the epoch
    pub fn with_clock(mut self, clock: RaceClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Get the worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the worker until the coordinator shuts it down
    ///
    /// Returns WorkerStats when complete. A closed downlink interrupts every
    /// lane and ends the run with a transport error.
    pub async fn run(
        self,
        mut downlink: mpsc::Receiver<CoordinatorMessage>,
        uplink: mpsc::Sender<WorkerMessage>,
    ) -> BenchResult<WorkerStats> {
        send(
            &uplink,
            WorkerMessage::Hello {
                name: self.name.clone(),
                operations: self.registry.names(),
            },
        )
        .await?;
        tracing::debug!(worker = %self.name, "Worker started");

        let assignment = loop {
            match downlink.recv().await {
                Some(CoordinatorMessage::Assign(assignment)) => break assignment,
                Some(CoordinatorMessage::Interrupt) => continue,
                Some(CoordinatorMessage::Shutdown) => {
                    let stats = WorkerStats::new();
                    let _ = uplink
                        .send(WorkerMessage::Finished {
                            stats: stats.clone(),
                        })
                        .await;
                    return Ok(stats);
                }
                Some(CoordinatorMessage::Proceed { phase, step }) => {
                    return Err(BenchError::protocol(format!(
                        "proceed to {phase} step {step} before assignment"
                    )));
                }
                None => return Err(BenchError::transport("coordinator link closed")),
            }
        };

        let mut session = self.provision(assignment, uplink);
        send(
            &session.uplink,
            WorkerMessage::Ready {
                barrier: Barrier::Provisioned,
                summary: StepReport::default(),
            },
        )
        .await?;

        let result = session.serve(&mut downlink).await;
        session.finish(result).await
    }

    fn provision(self, assignment: Assignment, uplink: mpsc::Sender<WorkerMessage>) -> Session<C> {
        let clock = self
            .clock
            .unwrap_or_else(|| RaceClock::aligned_to(assignment.epoch));

        for phase in &assignment.phases {
            for step in &phase.steps {
                for operation in step.operations() {
                    if !self.registry.contains(operation) {
                        tracing::warn!(
                            worker = %self.name,
                            operation,
                            "Assigned operation is not registered"
                        );
                    }
                }
            }
        }

        tracing::info!(
            worker = %self.name,
            worker_id = assignment.worker,
            lanes = assignment.lane_count(),
            "Worker provisioned"
        );

        let (samples_tx, samples_rx) = mpsc::channel(self.channels.sample_buffer);
        let interrupt = InterruptSignal::new();
        let scheduler = TaskScheduler::new(self.registry, self.connections, clock, samples_tx)
            .with_interrupt(interrupt.clone())
            .with_error_policy(assignment.error_policy);

        let mut heartbeat = tokio::time::interval(assignment.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Session {
            name: self.name,
            clock,
            assignment,
            scheduler: Arc::new(scheduler),
            interrupt,
            samples: samples_rx,
            uplink,
            heartbeat,
            running: None,
            batch_size: self.channels.sample_batch.max(1),
            aborted: false,
            stats: WorkerStats::new(),
        }
    }
}

impl<C> std::fmt::Debug for Worker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("channels", &self.channels)
            .field("clock", &self.clock)
            .finish()
    }
}

struct RunningStep {
    barrier: Barrier,
    handle: JoinHandle<StepReport>,
}

/// State of a provisioned worker
struct Session<C> {
    name: String,
    clock: RaceClock,
    assignment: Assignment,
    scheduler: Arc<TaskScheduler<C>>,
    interrupt: InterruptSignal,
    samples: mpsc::Receiver<Sample>,
    uplink: mpsc::Sender<WorkerMessage>,
    heartbeat: Interval,
    running: Option<RunningStep>,
    batch_size: usize,
    aborted: bool,
    stats: WorkerStats,
}

impl<C: Send + 'static> Session<C> {
    async fn serve(&mut self, downlink: &mut mpsc::Receiver<CoordinatorMessage>) -> BenchResult<()> {
        loop {
            tokio::select! {
                biased;

                message = downlink.recv() => match message {
                    Some(CoordinatorMessage::Proceed { phase, step }) => self.start_step(phase, step)?,
                    Some(CoordinatorMessage::Interrupt) => {
                        tracing::debug!(worker = %self.name, "Worker received interrupt");
                        self.interrupt.trigger();
                    }
                    Some(CoordinatorMessage::Shutdown) => {
                        tracing::debug!(worker = %self.name, "Worker received shutdown");
                        return Ok(());
                    }
                    Some(CoordinatorMessage::Assign(_)) => {
                        tracing::warn!(worker = %self.name, "Ignoring second assignment");
                    }
                    None => return Err(BenchError::transport("coordinator link closed")),
                },

                Some(sample) = self.samples.recv() => {
                    let mut batch = Vec::with_capacity(self.batch_size);
                    batch.push(sample);
                    while batch.len() < self.batch_size {
                        match self.samples.try_recv() {
                            Ok(sample) => batch.push(sample),
                            Err(_) => break,
                        }
                    }
                    self.forward(batch).await?;
                }

                (barrier, result) = join_step(&mut self.running) => {
                    self.running = None;
                    let report = result
                        .map_err(|e| BenchError::worker(format!("step task failed: {e}")))?;
                    self.complete_step(barrier, report).await?;
                }

                _ = self.heartbeat.tick() => {
                    send(&self.uplink, WorkerMessage::Heartbeat).await?;
                }
            }
        }
    }

    fn start_step(&mut self, phase: Phase, step: usize) -> BenchResult<()> {
        if self.running.is_some() {
            return Err(BenchError::protocol(format!(
                "proceed to {phase} step {step} while a step is running"
            )));
        }
        let node = self
            .assignment
            .step(phase, step)
            .cloned()
            .ok_or_else(|| BenchError::protocol(format!("no {phase} step {step} assigned")))?;

        tracing::debug!(worker = %self.name, phase = %phase, step, "Proceeding");
        self.stats.step_started(self.clock.now());

        let scheduler = Arc::clone(&self.scheduler);
        let handle = tokio::spawn(async move { scheduler.run_step(&node, phase).await });
        self.running = Some(RunningStep {
            barrier: Barrier::Step { phase, step },
            handle,
        });
        Ok(())
    }

    async fn complete_step(&mut self, barrier: Barrier, report: StepReport) -> BenchResult<()> {
        // Every lane is done, so the queue holds the rest of the step's samples
        self.drain().await?;
        self.stats.step_finished(&report, self.clock.now());

        if let Some(reason) = &report.aborted {
            if !self.aborted {
                self.aborted = true;
                send(
                    &self.uplink,
                    WorkerMessage::Aborted {
                        reason: reason.clone(),
                    },
                )
                .await?;
            }
        }

        tracing::debug!(
            worker = %self.name,
            barrier = %barrier,
            issued = report.issued,
            failed_lanes = report.failures.len(),
            "Step finished"
        );
        send(
            &self.uplink,
            WorkerMessage::Ready {
                barrier,
                summary: report,
            },
        )
        .await
    }

    async fn drain(&mut self) -> BenchResult<()> {
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                match self.samples.try_recv() {
                    Ok(sample) => batch.push(sample),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                return Ok(());
            }
            self.forward(batch).await?;
        }
    }

    async fn forward(&mut self, samples: Vec<Sample>) -> BenchResult<()> {
        for sample in &samples {
            self.stats.record_sample(sample);
        }
        self.stats.batches += 1;
        send(&self.uplink, WorkerMessage::Samples { samples }).await
    }

    async fn finish(mut self, result: BenchResult<()>) -> BenchResult<WorkerStats> {
        if let Some(step) = self.running.take() {
            // Lanes finish their in-flight requests before the handle resolves
            self.interrupt.trigger();
            if let Ok(report) = step.handle.await {
                let _ = self.drain().await;
                self.stats.step_finished(&report, self.clock.now());
            }
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    worker = %self.name,
                    completed = self.stats.completed,
                    errors = self.stats.errors,
                    "Worker finished"
                );
                let _ = self
                    .uplink
                    .send(WorkerMessage::Finished {
                        stats: self.stats.clone(),
                    })
                    .await;
                Ok(self.stats)
            }
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "Worker stopped");
                Err(e)
            }
        }
    }
}

async fn join_step(running: &mut Option<RunningStep>) -> (Barrier, Result<StepReport, JoinError>) {
    match running {
        Some(step) => {
            let result = (&mut step.handle).await;
            (step.barrier, result)
        }
        None => std::future::pending().await,
    }
}

async fn send(uplink: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) -> BenchResult<()> {
    uplink
        .send(message)
        .await
        .map_err(|_| BenchError::transport("coordinator link closed"))
}
