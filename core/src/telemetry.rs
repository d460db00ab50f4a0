//! Telemetry hook notified at phase boundaries
//!
//! Telemetry attached to the target cluster (node stats, GC logs, ...) lives
//! outside the engine. The coordinator only tells a [`TelemetrySink`] when a
//! phase starts and ends.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Phase;

/// A phase boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    /// Race name
    pub race: String,
    /// Phase that starts or ends
    pub phase: Phase,
    /// Wall-clock time of the boundary
    pub timestamp: DateTime<Utc>,
    /// Offset on the race clock
    pub offset: Duration,
}

/// Receives phase boundaries
pub trait TelemetrySink: Send + Sync {
    /// Called before the first step of a phase is released
    fn phase_started(&self, event: &PhaseEvent);

    /// Called once every worker finished the last step of a phase
    fn phase_ended(&self, event: &PhaseEvent);
}

/// Sink that logs phase boundaries
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn phase_started(&self, event: &PhaseEvent) {
        tracing::info!(
            race = %event.race,
            phase = %event.phase,
            offset_ms = event.offset.as_millis() as u64,
            "Phase started"
        );
    }

    fn phase_ended(&self, event: &PhaseEvent) {
        tracing::info!(
            race = %event.race,
            phase = %event.phase,
            offset_ms = event.offset.as_millis() as u64,
            "Phase ended"
        );
    }
}
