//! Control surface of a running race

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::clock::RaceClock;
use crate::error::{BenchError, BenchResult};
use crate::metrics::{MetricsAggregator, MetricsSnapshot, RaceReport};
use crate::scheduler::InterruptSignal;

use super::state::RaceState;

/// Handle to a race started with [`Coordinator::start`](super::Coordinator::start)
pub struct RaceHandle {
    pub(crate) state: watch::Receiver<RaceState>,
    pub(crate) interrupt: InterruptSignal,
    pub(crate) metrics: Arc<RwLock<MetricsAggregator>>,
    pub(crate) clock: RaceClock,
    pub(crate) task: JoinHandle<BenchResult<RaceReport>>,
}

impl RaceHandle {
    /// Current race state
    pub fn state(&self) -> RaceState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<RaceState> {
        self.state.clone()
    }

    /// Ask every lane to stop after its in-flight request
    pub fn interrupt(&self) {
        tracing::info!("Race interrupt requested");
        self.interrupt.trigger();
    }

    /// Point-in-time aggregate statistics
    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.read().await.snapshot()
    }

    /// The race clock
    pub fn clock(&self) -> RaceClock {
        self.clock
    }

    /// Check if the race has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the race to end
    pub async fn wait(self) -> BenchResult<RaceReport> {
        self.task
            .await
            .map_err(|e| BenchError::race_failed(format!("coordinator task failed: {e}")))?
    }

    /// Wait for the race to end, interrupting it on Ctrl+C
    pub async fn wait_with_signal_handling(self) -> BenchResult<RaceReport> {
        let interrupt = self.interrupt.clone();

        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, interrupting race...");
                    interrupt.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.wait().await;
        signal_handle.abort();
        result
    }

    /// Wait for the race to end, interrupting it after `timeout`
    pub async fn wait_with_timeout(self, timeout: Duration) -> BenchResult<RaceReport> {
        let interrupt = self.interrupt.clone();

        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!("Timeout reached, interrupting race...");
            interrupt.trigger();
        });

        let result = self.wait().await;
        timeout_handle.abort();
        result
    }
}

impl std::fmt::Debug for RaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceHandle")
            .field("state", &*self.state.borrow())
            .field("interrupt", &self.interrupt)
            .finish()
    }
}
