//! One concurrent execution stream of a task

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock::RaceClock;
use crate::config::ErrorPolicy;
use crate::operation::{ConnectionFactory, Operation};
use crate::sample::{LaneId, Outcome, Sample};
use crate::task::{Completion, Phase, Task, Throughput};

use super::executor::OperationExecutor;
use super::pacer::{Pacer, RateSchedule};
use super::plan::LaneSpec;
use super::InterruptSignal;

/// Lane lifecycle
///
/// `Idle → Scheduled → Executing → Completed → (Idle | Done)`; a lane may also
/// go to `Done` from `Idle` or `Scheduled` when it stops before issuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// Waiting to compute the next request
    Idle,
    /// Next request has a scheduled time; waiting for it
    Scheduled,
    /// Request in flight
    Executing,
    /// Request returned; sample forwarded
    Completed,
    /// Lane finished
    Done,
}

impl LaneState {
    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(self, next: LaneState) -> bool {
        use LaneState::*;
        matches!(
            (self, next),
            (Idle, Scheduled)
                | (Idle, Done)
                | (Scheduled, Executing)
                | (Scheduled, Done)
                | (Executing, Completed)
                | (Completed, Idle)
                | (Completed, Done)
        )
    }
}

/// How a lane ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneOutcome {
    /// Completion criterion met
    Completed,
    /// Stopped by an interrupt
    Interrupted,
    /// Ended early without a result for its remaining requests
    Failed(String),
    /// A failed request stopped the race under [`ErrorPolicy::Abort`]
    Aborted(String),
}

/// What a lane reports when it reaches `Done`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneReport {
    /// Lane identity
    pub id: LaneId,
    /// Task name
    pub task: String,
    /// Requests issued
    pub issued: u64,
    /// How the lane ended
    pub outcome: LaneOutcome,
}

/// Everything a lane shares with its siblings
pub struct LaneContext<C> {
    /// Race clock
    pub clock: RaceClock,
    /// Start-of-step reference time
    pub reference: Duration,
    /// Phase being executed
    pub phase: Phase,
    /// Read-only task definition
    pub task: Arc<Task>,
    /// Resolved operation
    pub operation: Arc<dyn Operation<C>>,
    /// Connection factory
    pub connections: Arc<dyn ConnectionFactory<C>>,
    /// Bounded sample queue
    pub samples: mpsc::Sender<Sample>,
    /// Worker-wide interrupt
    pub interrupt: InterruptSignal,
    /// Request failure policy
    pub error_policy: ErrorPolicy,
}

/// A single lane: pace, execute, forward, repeat
pub struct Lane<C> {
    spec: LaneSpec,
    context: LaneContext<C>,
    state: LaneState,
    issued: u64,
}

impl<C: Send + 'static> Lane<C> {
    /// Create a lane in the `Idle` state
    pub fn new(spec: LaneSpec, context: LaneContext<C>) -> Self {
        Self {
            spec,
            context,
            state: LaneState::Idle,
            issued: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> LaneState {
        self.state
    }

    /// Run the lane until its completion criterion is met
    pub async fn run(mut self) -> LaneReport {
        let outcome = self.drive().await;
        if self.state != LaneState::Done {
            self.advance(LaneState::Done);
        }

        tracing::debug!(
            lane = %self.spec.id,
            task = %self.context.task.name,
            issued = self.issued,
            outcome = ?outcome,
            "Lane done"
        );

        LaneReport {
            id: self.spec.id,
            task: self.context.task.name.clone(),
            issued: self.issued,
            outcome,
        }
    }

    async fn drive(&mut self) -> LaneOutcome {
        let ctx = &self.context;
        let clock = ctx.clock;
        let mut interrupt = ctx.interrupt.subscribe();

        // Unthrottled tasks with a ramp-up bring their lanes in one by one
        let start = ctx.reference + self.start_delay();
        if start > clock.now() {
            tokio::select! {
                _ = tokio::time::sleep_until(clock.instant_at(start)) => {}
                _ = InterruptSignal::wait(&mut interrupt) => return LaneOutcome::Interrupted,
            }
        }

        let mut connection = match ctx.connections.connect(self.spec.id).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(
                    lane = %self.spec.id,
                    task = %ctx.task.name,
                    error = %e,
                    "Lane could not open a connection"
                );
                return LaneOutcome::Failed(e.to_string());
            }
        };

        let executor = OperationExecutor::new(
            Arc::clone(&ctx.operation),
            clock,
            ctx.task.name.clone(),
            ctx.phase,
            self.spec.id,
        );
        let pacer = Pacer::new(ctx.reference, RateSchedule::for_lane(&ctx.task));
        let deadline = match ctx.task.completion {
            Completion::Duration(duration) => Some(ctx.reference.saturating_add(duration)),
            _ => None,
        };
        let samples = ctx.samples.clone();
        let error_policy = ctx.error_policy;
        let signal = ctx.interrupt.clone();

        let mut sequence = 0u64;
        loop {
            if self.spec.iterations.is_some_and(|limit| sequence >= limit) {
                return LaneOutcome::Completed;
            }
            if signal.is_triggered() {
                return LaneOutcome::Interrupted;
            }

            let now = clock.now();
            let scheduled = pacer.scheduled_time(sequence).unwrap_or(now);
            if deadline.is_some_and(|deadline| scheduled >= deadline || now >= deadline) {
                return LaneOutcome::Completed;
            }
            self.advance(LaneState::Scheduled);

            if scheduled > now {
                tokio::select! {
                    _ = tokio::time::sleep_until(clock.instant_at(scheduled)) => {}
                    // Scheduled but not started: dropped
                    _ = InterruptSignal::wait(&mut interrupt) => {
                        self.advance(LaneState::Done);
                        return LaneOutcome::Interrupted;
                    }
                }
            }

            self.advance(LaneState::Executing);
            let sample = executor.execute(&mut connection, sequence, scheduled).await;
            self.advance(LaneState::Completed);
            sequence += 1;
            self.issued += 1;

            let failure = match &sample.outcome {
                Outcome::Failure { reason, .. } => Some(reason.clone()),
                Outcome::Success => None,
            };
            if samples.send(sample).await.is_err() {
                return LaneOutcome::Failed("sample channel closed".to_string());
            }

            if let (Some(reason), ErrorPolicy::Abort) = (failure, error_policy) {
                tracing::warn!(
                    lane = %self.spec.id,
                    task = %self.context.task.name,
                    reason = %reason,
                    "Request failed, aborting"
                );
                signal.trigger();
                return LaneOutcome::Aborted(reason);
            }

            self.advance(LaneState::Idle);
        }
    }

    fn start_delay(&self) -> Duration {
        let task = &self.context.task;
        match (task.throughput, task.ramp_up) {
            (Throughput::Unthrottled, Some(ramp)) => {
                let lanes = task.concurrency.max(1) as u32;
                ramp.duration * self.spec.index as u32 / lanes
            }
            _ => Duration::ZERO,
        }
    }

    fn advance(&mut self, next: LaneState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal lane transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

impl<C> fmt::Debug for Lane<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("id", &self.spec.id)
            .field("task", &self.context.task.name)
            .field("state", &self.state)
            .field("issued", &self.issued)
            .finish()
    }
}
