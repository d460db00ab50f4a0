//! Metrics aggregation and percentile calculation
//!
//! Samples stream into a [`MetricsAggregator`] keyed by (phase, task). The
//! aggregator keeps running counts and two HdrHistograms per key: latency
//! (invocation time) and response time (ideal schedule to completion, which
//! exposes queueing behind the open-loop schedule).

mod aggregator;
mod report;

pub use aggregator::{AggregateStats, MetricsAggregator, MetricsSnapshot, PhaseSummary};
pub use report::{Incomplete, LostWorker, PhaseBoundary, RaceReport, WorkerSummary};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Latency percentiles (all values in milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatencyPercentiles {
    /// Minimum value
    pub min: f64,
    /// 50th percentile (median)
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 99th percentile
    pub p99: f64,
    /// 100th percentile (maximum)
    pub p100: f64,
    /// Mean value
    pub mean: f64,
    /// Standard deviation
    pub stddev: f64,
}

/// Incremental histogram for percentile calculation
///
/// Microsecond precision, values up to one hour; larger values saturate.
#[derive(Clone)]
pub struct LatencyHistogram {
    histogram: hdrhistogram::Histogram<u64>,
}

impl LatencyHistogram {
    const MAX_MICROS: u64 = 3_600_000_000;

    /// Create a new histogram
    pub fn new() -> Self {
        // Bounds are constant and valid
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, Self::MAX_MICROS, 3)
            .expect("Failed to create histogram");
        Self { histogram }
    }

    /// Record a duration
    pub fn record(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(micros);
    }

    /// Get the number of recorded values
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    /// Check if the histogram is empty
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Calculate percentiles from the histogram
    pub fn percentiles(&self) -> LatencyPercentiles {
        if self.histogram.is_empty() {
            return LatencyPercentiles::default();
        }

        let ms = |micros: u64| micros as f64 / 1000.0;
        LatencyPercentiles {
            min: ms(self.histogram.min()),
            p50: ms(self.histogram.value_at_quantile(0.50)),
            p90: ms(self.histogram.value_at_quantile(0.90)),
            p99: ms(self.histogram.value_at_quantile(0.99)),
            p100: ms(self.histogram.max()),
            mean: self.histogram.mean() / 1000.0,
            stddev: self.histogram.stdev() / 1000.0,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("len", &self.len())
            .finish()
    }
}
