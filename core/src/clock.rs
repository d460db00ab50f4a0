//! Race clock
//!
//! Every timestamp in a race is an offset from one origin. The clock is an
//! explicit value handed to whoever needs it, so a worker can be driven in
//! isolation (and under tokio's paused test clock) without global state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic race clock
#[derive(Debug, Clone, Copy)]
pub struct RaceClock {
    origin: Instant,
}

impl RaceClock {
    /// Start a clock whose origin is now
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Build a clock aligned to a wall-clock epoch taken on another machine
    ///
    /// The wall clock is read once to place the origin; afterwards the clock is
    /// purely monotonic. An epoch in the future is treated as "now".
    pub fn aligned_to(epoch: DateTime<Utc>) -> Self {
        let now = Instant::now();
        let skew = (Utc::now() - epoch).to_std().unwrap_or(Duration::ZERO);
        Self {
            origin: now.checked_sub(skew).unwrap_or(now),
        }
    }

    /// Offset of the current instant from the origin
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Instant corresponding to an offset
    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }

    /// The origin instant
    pub fn origin(&self) -> Instant {
        self.origin
    }
}
