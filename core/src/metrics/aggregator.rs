//! Running and final statistics per (phase, task)

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};
use crate::sample::{LaneId, Outcome, Sample};
use crate::task::Phase;

use super::{LatencyHistogram, LatencyPercentiles};

/// Derived statistics of one (phase, task)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Task name
    pub task: String,
    /// Phase
    pub phase: Phase,
    /// Samples recorded
    pub count: u64,
    /// Failed samples
    pub errors: u64,
    /// Errors / count
    pub error_rate: f64,
    /// Weight of successful samples
    pub success_weight: u64,
    /// Successful weight per second of the sample window
    pub throughput: f64,
    /// Earliest scheduled time (race clock offset)
    pub window_start: Duration,
    /// Latest completion time (race clock offset)
    pub window_end: Duration,
    /// Invocation latency
    pub latency: LatencyPercentiles,
    /// Scheduled time to completion
    pub response_time: LatencyPercentiles,
    /// Failures by reason
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_reasons: BTreeMap<String, u64>,
    /// Samples that arrived behind a later request of the same lane
    pub out_of_order: u64,
}

/// Summary of a closed phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    /// Phase
    pub phase: Phase,
    /// Samples over all tasks
    pub samples: u64,
    /// Failed samples over all tasks
    pub errors: u64,
    /// Successful weight per second over the whole phase window
    pub throughput: f64,
    /// Per-task statistics, ordered by task name
    pub tasks: Vec<AggregateStats>,
}

/// Point-in-time view for progress reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Samples recorded so far
    pub samples: u64,
    /// Failed samples so far
    pub errors: u64,
    /// Phases already closed
    pub closed: Vec<Phase>,
    /// Per (phase, task) statistics
    pub tasks: Vec<AggregateStats>,
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    errors: u64,
    success_weight: u64,
    latency: LatencyHistogram,
    response_time: LatencyHistogram,
    window_start: Option<Duration>,
    window_end: Option<Duration>,
    next_sequence: BTreeMap<LaneId, u64>,
    out_of_order: u64,
    error_reasons: BTreeMap<String, u64>,
}

impl Accumulator {
    fn record(&mut self, sample: &Sample) {
        self.count += 1;
        match &sample.outcome {
            Outcome::Success => self.success_weight += sample.weight,
            Outcome::Failure { reason, .. } => {
                self.errors += 1;
                *self.error_reasons.entry(reason.clone()).or_default() += 1;
            }
        }

        self.latency.record(sample.latency);
        self.response_time.record(sample.response_time());

        let completed = sample.completed();
        self.window_start = Some(self.window_start.map_or(sample.scheduled, |t| t.min(sample.scheduled)));
        self.window_end = Some(self.window_end.map_or(completed, |t| t.max(completed)));

        let next = self.next_sequence.entry(sample.lane).or_default();
        if sample.sequence < *next {
            self.out_of_order += 1;
        } else {
            *next = sample.sequence + 1;
        }
    }

    fn stats(&self, phase: Phase, task: &str) -> AggregateStats {
        let window_start = self.window_start.unwrap_or_default();
        let window_end = self.window_end.unwrap_or_default();
        AggregateStats {
            task: task.to_string(),
            phase,
            count: self.count,
            errors: self.errors,
            error_rate: ratio(self.errors, self.count),
            success_weight: self.success_weight,
            throughput: throughput(self.success_weight, window_start, window_end),
            window_start,
            window_end,
            latency: self.latency.percentiles(),
            response_time: self.response_time.percentiles(),
            error_reasons: self.error_reasons.clone(),
            out_of_order: self.out_of_order,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn throughput(weight: u64, start: Duration, end: Duration) -> f64 {
    let secs = end.saturating_sub(start).as_secs_f64();
    if secs > 0.0 {
        weight as f64 / secs
    } else {
        0.0
    }
}

/// Consumes samples and derives statistics
///
/// Final statistics of a phase are only available once the phase is closed;
/// samples arriving for a closed phase are rejected.
#[derive(Default)]
pub struct MetricsAggregator {
    entries: BTreeMap<(Phase, String), Accumulator>,
    closed: BTreeSet<Phase>,
    rejected: u64,
}

impl MetricsAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample
    ///
    /// Returns `false` if the sample's phase is already closed.
    pub fn record(&mut self, sample: &Sample) -> bool {
        if self.closed.contains(&sample.phase) {
            self.rejected += 1;
            tracing::warn!(
                phase = %sample.phase,
                task = %sample.task,
                lane = %sample.lane,
                "Sample arrived after its phase was closed"
            );
            return false;
        }

        self.entries
            .entry((sample.phase, sample.task.clone()))
            .or_default()
            .record(sample);
        true
    }

    /// Record a batch of samples, returning how many were accepted
    pub fn record_batch<'a>(&mut self, samples: impl IntoIterator<Item = &'a Sample>) -> usize {
        samples.into_iter().filter(|sample| self.record(sample)).count()
    }

    /// Mark a phase as closed: every contributing sample has been collected
    pub fn close_phase(&mut self, phase: Phase) {
        if self.closed.insert(phase) {
            tracing::debug!(phase = %phase, samples = self.sample_count(phase), "Phase closed");
        }
    }

    /// Check if a phase is closed
    pub fn is_closed(&self, phase: Phase) -> bool {
        self.closed.contains(&phase)
    }

    /// Samples recorded for a phase
    pub fn sample_count(&self, phase: Phase) -> u64 {
        self.phase_entries(phase).map(|(_, acc)| acc.count).sum()
    }

    /// Samples rejected because their phase was closed
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tasks: Vec<AggregateStats> = self
            .entries
            .iter()
            .map(|((phase, task), acc)| acc.stats(*phase, task))
            .collect();
        MetricsSnapshot {
            samples: tasks.iter().map(|s| s.count).sum(),
            errors: tasks.iter().map(|s| s.errors).sum(),
            closed: self.closed.iter().copied().collect(),
            tasks,
        }
    }

    /// Final statistics of a closed phase
    ///
    /// Pure with respect to the recorded samples: calling it again without new
    /// samples yields identical output.
    ///
    /// # Errors
    /// Returns an error while the phase is still open.
    pub fn finalize(&self, phase: Phase) -> BenchResult<PhaseSummary> {
        if !self.is_closed(phase) {
            return Err(BenchError::metrics(format!(
                "phase {phase} is still open"
            )));
        }

        let tasks: Vec<AggregateStats> = self
            .phase_entries(phase)
            .map(|((_, task), acc)| acc.stats(phase, task))
            .collect();

        let success_weight = tasks.iter().map(|s| s.success_weight).sum();
        let start = tasks.iter().map(|s| s.window_start).min().unwrap_or_default();
        let end = tasks.iter().map(|s| s.window_end).max().unwrap_or_default();

        Ok(PhaseSummary {
            phase,
            samples: tasks.iter().map(|s| s.count).sum(),
            errors: tasks.iter().map(|s| s.errors).sum(),
            throughput: throughput(success_weight, start, end),
            tasks,
        })
    }

    fn phase_entries(&self, phase: Phase) -> impl Iterator<Item = (&(Phase, String), &Accumulator)> {
        self.entries.iter().filter(move |((p, _), _)| *p == phase)
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("keys", &self.entries.len())
            .field("closed", &self.closed)
            .field("rejected", &self.rejected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::FailureKind;

    fn sample(task: &str, phase: Phase, lane: usize, sequence: u64, scheduled_ms: u64, latency_ms: u64) -> Sample {
        Sample {
            task: task.to_string(),
            phase,
            lane: LaneId::new(0, lane),
            sequence,
            scheduled: Duration::from_millis(scheduled_ms),
            started: Duration::from_millis(scheduled_ms),
            latency: Duration::from_millis(latency_ms),
            outcome: Outcome::Success,
            weight: 1,
        }
    }

    fn failed(mut s: Sample, reason: &str) -> Sample {
        s.outcome = Outcome::Failure {
            kind: FailureKind::Connection,
            reason: reason.to_string(),
        };
        s
    }

    #[test]
    fn test_throughput_uses_sample_window() {
        let mut agg = MetricsAggregator::new();
        // 10 requests scheduled every 100ms from 5s, each taking 100ms
        for i in 0..10 {
            agg.record(&sample("search", Phase::Measurement, 0, i, 5_000 + i * 100, 100));
        }
        agg.close_phase(Phase::Measurement);

        let summary = agg.finalize(Phase::Measurement).unwrap();
        let stats = &summary.tasks[0];
        assert_eq!(stats.count, 10);
        assert_eq!(stats.window_start, Duration::from_secs(5));
        assert_eq!(stats.window_end, Duration::from_secs(6));
        assert!((stats.throughput - 10.0).abs() < 1e-9);
        assert!((summary.throughput - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_weight_is_excluded() {
        let mut agg = MetricsAggregator::new();
        for i in 0..4 {
            agg.record(&failed(sample("t", Phase::Measurement, 0, i, i * 10, 5), "refused"));
        }
        agg.close_phase(Phase::Measurement);

        let stats = &agg.finalize(Phase::Measurement).unwrap().tasks[0];
        assert_eq!(stats.count, 4);
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.error_rate, 1.0);
        assert_eq!(stats.success_weight, 0);
        assert_eq!(stats.throughput, 0.0);
        assert_eq!(stats.error_reasons.get("refused"), Some(&4));
    }

    #[test]
    fn test_weighted_throughput() {
        let mut agg = MetricsAggregator::new();
        let mut s = sample("bulk", Phase::Measurement, 0, 0, 0, 500);
        s.weight = 1_000;
        agg.record(&s);
        agg.record(&failed(sample("bulk", Phase::Measurement, 0, 1, 500, 500), "rejected"));
        agg.close_phase(Phase::Measurement);

        let stats = &agg.finalize(Phase::Measurement).unwrap().tasks[0];
        assert_eq!(stats.success_weight, 1_000);
        assert!((stats.throughput - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_requires_closed_phase() {
        let mut agg = MetricsAggregator::new();
        agg.record(&sample("t", Phase::Warmup, 0, 0, 0, 1));
        let err = agg.finalize(Phase::Warmup).unwrap_err();
        assert!(err.message.contains("still open"));

        agg.close_phase(Phase::Warmup);
        assert!(agg.finalize(Phase::Warmup).is_ok());
        assert!(agg.finalize(Phase::Measurement).is_err());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut agg = MetricsAggregator::new();
        for i in 0..50 {
            agg.record(&sample("a", Phase::Measurement, (i % 3) as usize, i / 3, i * 7, i % 11));
            agg.record(&sample("b", Phase::Measurement, 5, i, i * 3, 2));
        }
        agg.close_phase(Phase::Measurement);

        let first = serde_json::to_vec(&agg.finalize(Phase::Measurement).unwrap()).unwrap();
        let second = serde_json::to_vec(&agg.finalize(Phase::Measurement).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_late_samples_are_rejected() {
        let mut agg = MetricsAggregator::new();
        agg.record(&sample("t", Phase::Warmup, 0, 0, 0, 1));
        agg.close_phase(Phase::Warmup);

        assert!(!agg.record(&sample("t", Phase::Warmup, 0, 1, 10, 1)));
        assert!(agg.record(&sample("t", Phase::Measurement, 0, 0, 20, 1)));
        assert_eq!(agg.rejected(), 1);
        assert_eq!(agg.sample_count(Phase::Warmup), 1);
    }

    #[test]
    fn test_phases_are_aggregated_separately() {
        let mut agg = MetricsAggregator::new();
        let batch = vec![
            sample("t", Phase::Warmup, 0, 0, 0, 1),
            sample("t", Phase::Warmup, 0, 1, 10, 1),
            sample("t", Phase::Measurement, 0, 0, 100, 1),
        ];
        assert_eq!(agg.record_batch(&batch), 3);

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.samples, 3);
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.tasks[0].phase, Phase::Warmup);
        assert_eq!(snapshot.tasks[0].count, 2);
        assert!(snapshot.closed.is_empty());
    }

    #[test]
    fn test_out_of_order_lane_sequence_is_counted() {
        let mut agg = MetricsAggregator::new();
        agg.record(&sample("t", Phase::Measurement, 0, 0, 0, 1));
        agg.record(&sample("t", Phase::Measurement, 0, 2, 20, 1));
        agg.record(&sample("t", Phase::Measurement, 0, 1, 10, 1));
        agg.record(&sample("t", Phase::Measurement, 1, 0, 0, 1));

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.tasks[0].out_of_order, 1);
    }

    #[test]
    fn test_response_time_includes_schedule_lag() {
        let mut agg = MetricsAggregator::new();
        let mut s = sample("t", Phase::Measurement, 0, 0, 0, 10);
        s.started = Duration::from_millis(90);
        agg.record(&s);

        let stats = &agg.snapshot().tasks[0];
        assert!((stats.latency.p50 - 10.0).abs() < 0.1);
        assert!((stats.response_time.p50 - 100.0).abs() < 0.5);
    }
}
