//! Single-invocation executor

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::RaceClock;
use crate::operation::Operation;
use crate::sample::{LaneId, Outcome, Sample};
use crate::task::Phase;

/// Runs one operation call and turns it into exactly one [`Sample`]
///
/// The start time is taken immediately before the call and latency runs until
/// the call returns, whatever the outcome. Nothing is retried here.
pub struct OperationExecutor<C> {
    operation: Arc<dyn Operation<C>>,
    clock: RaceClock,
    task: String,
    phase: Phase,
    lane: LaneId,
}

impl<C> OperationExecutor<C> {
    /// Create an executor bound to one lane
    pub fn new(
        operation: Arc<dyn Operation<C>>,
        clock: RaceClock,
        task: impl Into<String>,
        phase: Phase,
        lane: LaneId,
    ) -> Self {
        Self {
            operation,
            clock,
            task: task.into(),
            phase,
            lane,
        }
    }

    /// Execute request `sequence`, which was ideally due at `scheduled`
    pub async fn execute(&self, connection: &mut C, sequence: u64, scheduled: Duration) -> Sample {
        let started = self.clock.now();
        let result = self.operation.execute(connection).await;
        let latency = self.clock.now().saturating_sub(started);

        let (outcome, weight) = match result {
            Ok(response) => (Outcome::Success, response.weight.unwrap_or(1)),
            Err(e) => {
                tracing::trace!(
                    lane = %self.lane,
                    task = %self.task,
                    sequence,
                    error = %e,
                    "Request failed"
                );
                (
                    Outcome::Failure {
                        kind: e.kind(),
                        reason: e.reason().to_string(),
                    },
                    1,
                )
            }
        };

        Sample {
            task: self.task.clone(),
            phase: self.phase,
            lane: self.lane,
            sequence,
            scheduled,
            started,
            latency,
            outcome,
            weight,
        }
    }

    /// Lane this executor reports for
    pub fn lane(&self) -> LaneId {
        self.lane
    }
}

impl<C> fmt::Debug for OperationExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("task", &self.task)
            .field("phase", &self.phase)
            .field("lane", &self.lane)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationError, OperationResponse};
    use crate::sample::FailureKind;
    use async_trait::async_trait;

    struct Sleepy {
        delay: Duration,
        result: Result<OperationResponse, OperationError>,
    }

    #[async_trait]
    impl Operation<u32> for Sleepy {
        async fn execute(&self, calls: &mut u32) -> Result<OperationResponse, OperationError> {
            *calls += 1;
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn executor(op: Sleepy, clock: RaceClock) -> OperationExecutor<u32> {
        OperationExecutor::new(Arc::new(op), clock, "search", Phase::Measurement, LaneId::new(0, 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_measures_latency_and_weight() {
        let clock = RaceClock::start();
        let exec = executor(
            Sleepy {
                delay: Duration::from_millis(40),
                result: Ok(OperationResponse::with_weight(500)),
            },
            clock,
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut calls = 0;
        let sample = exec.execute(&mut calls, 3, Duration::from_millis(5)).await;

        assert_eq!(calls, 1);
        assert!(sample.is_success());
        assert_eq!(sample.weight, 500);
        assert_eq!(sample.sequence, 3);
        assert_eq!(sample.scheduled, Duration::from_millis(5));
        assert_eq!(sample.started, Duration::from_millis(10));
        assert_eq!(sample.latency, Duration::from_millis(40));
        assert_eq!(sample.schedule_lag(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_weight_defaults_to_one() {
        let exec = executor(
            Sleepy {
                delay: Duration::ZERO,
                result: Ok(OperationResponse::new()),
            },
            RaceClock::start(),
        );
        let sample = exec.execute(&mut 0, 0, Duration::ZERO).await;
        assert_eq!(sample.weight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_becomes_failed_sample() {
        let exec = executor(
            Sleepy {
                delay: Duration::from_millis(7),
                result: Err(OperationError::Connection("refused".into())),
            },
            RaceClock::start(),
        );
        let sample = exec.execute(&mut 0, 0, Duration::ZERO).await;

        assert!(!sample.is_success());
        assert_eq!(sample.latency, Duration::from_millis(7));
        assert_eq!(
            sample.outcome,
            Outcome::Failure {
                kind: FailureKind::Connection,
                reason: "refused".into()
            }
        );
    }
}
