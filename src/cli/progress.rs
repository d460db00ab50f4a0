//! Live progress display for a running race

use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use racebench_core::{MetricsSnapshot, RaceHandle, RaceState};

const REFRESH: Duration = Duration::from_millis(250);

/// Spinner fed from point-in-time snapshots of the race
pub struct RaceProgress {
    bar: ProgressBar,
}

impl RaceProgress {
    pub fn new() -> Result<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {msg}")?,
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { bar })
    }

    /// Refresh the display until the race ends
    ///
    /// Ctrl+C and the optional time limit interrupt the race; the display
    /// keeps running until the coordinator has torn everything down.
    pub async fn follow(&self, handle: &RaceHandle, time_limit: Option<Duration>) {
        let mut ticker = tokio::time::interval(REFRESH);
        let limit = async {
            match time_limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(limit);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        while !handle.is_finished() {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = handle.snapshot().await;
                    self.update(&handle.state(), &snapshot);
                }
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    self.bar.println("Received Ctrl+C, interrupting race...");
                    handle.interrupt();
                }
                _ = &mut limit, if !interrupted => {
                    interrupted = true;
                    self.bar.println("Time limit reached, interrupting race...");
                    handle.interrupt();
                }
            }
        }

        let snapshot = handle.snapshot().await;
        self.update(&handle.state(), &snapshot);
        self.bar.finish_with_message(format!("{} samples", snapshot.samples));
    }

    fn update(&self, state: &RaceState, snapshot: &MetricsSnapshot) {
        self.bar.set_prefix(state.to_string());
        let throughput: f64 = snapshot
            .tasks
            .iter()
            .filter(|stats| !snapshot.closed.contains(&stats.phase))
            .map(|stats| stats.throughput)
            .sum();
        self.bar.set_message(format!(
            "{} samples, {} errors, {:.1} ops/s",
            snapshot.samples, snapshot.errors, throughput
        ));
    }
}
