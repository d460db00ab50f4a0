//! Open-loop request pacing
//!
//! The pacer answers one question: when should request `n` of a lane ideally
//! start? The answer depends only on the lane's reference time, its rate
//! function and `n`, never on when earlier requests actually finished, so one
//! slow request cannot shift the rest of the schedule.

use std::fmt;
use std::time::Duration;

use crate::task::{Task, Throughput};

/// Per-lane rate function
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateSchedule {
    /// No pacing; every request is due immediately
    Unthrottled,
    /// Fixed rate in requests per second
    Constant {
        /// Requests per second
        rate: f64,
    },
    /// Linear ramp from `initial` to `target` over `duration`, then `target`
    Ramp {
        /// Rate at the start of the ramp
        initial: f64,
        /// Rate once the ramp is over
        target: f64,
        /// Ramp length
        duration: Duration,
    },
}

impl RateSchedule {
    /// Rate function of one lane of `task`
    ///
    /// The task's throughput is the total over all lanes, so each lane gets an
    /// equal share.
    pub fn for_lane(task: &Task) -> Self {
        let lanes = task.concurrency.max(1) as f64;
        match task.throughput {
            Throughput::Unthrottled => RateSchedule::Unthrottled,
            Throughput::Target(rate) => match task.ramp_up {
                Some(ramp) if ramp.initial_rate < rate && !ramp.duration.is_zero() => {
                    RateSchedule::Ramp {
                        initial: ramp.initial_rate.max(0.0) / lanes,
                        target: rate / lanes,
                        duration: ramp.duration,
                    }
                }
                _ => RateSchedule::Constant { rate: rate / lanes },
            },
        }
    }

    /// Check if requests are paced at all
    pub fn is_throttled(&self) -> bool {
        !matches!(self, RateSchedule::Unthrottled)
    }

    /// Instantaneous rate `elapsed` after the reference time
    pub fn rate_at(&self, elapsed: Duration) -> Option<f64> {
        match *self {
            RateSchedule::Unthrottled => None,
            RateSchedule::Constant { rate } => Some(rate),
            RateSchedule::Ramp {
                initial,
                target,
                duration,
            } => {
                let progress = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
                Some(initial + (target - initial) * progress)
            }
        }
    }

    /// Ideal offset of request `index` from the reference time
    ///
    /// Request `n` is due when the integral of the rate function reaches `n`.
    pub fn offset_of(&self, index: u64) -> Option<Duration> {
        let n = index as f64;
        let secs = match *self {
            RateSchedule::Unthrottled => return None,
            RateSchedule::Constant { rate } => n / rate,
            RateSchedule::Ramp {
                initial,
                target,
                duration,
            } => {
                let ramp_secs = duration.as_secs_f64();
                let ramp_requests = (initial + target) / 2.0 * ramp_secs;
                if n >= ramp_requests {
                    ramp_secs + (n - ramp_requests) / target
                } else {
                    let slope = (target - initial) / ramp_secs;
                    (-initial + (initial * initial + 2.0 * slope * n).sqrt()) / slope
                }
            }
        };
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

/// Computes scheduled times for one lane
#[derive(Clone, Copy)]
pub struct Pacer {
    reference: Duration,
    schedule: RateSchedule,
}

impl Pacer {
    /// Create a pacer anchored at `reference` (race clock offset)
    pub fn new(reference: Duration, schedule: RateSchedule) -> Self {
        Self {
            reference,
            schedule,
        }
    }

    /// Ideal start of request `index`, or `None` when it is due immediately
    pub fn scheduled_time(&self, index: u64) -> Option<Duration> {
        self.schedule
            .offset_of(index)
            .map(|offset| self.reference.saturating_add(offset))
    }

    /// How long to wait at `now` before issuing request `index`
    ///
    /// Zero when unthrottled or already past due; a late request fires
    /// immediately and later requests keep their own ideal times.
    pub fn wait_time(&self, index: u64, now: Duration) -> Duration {
        self.scheduled_time(index)
            .map(|scheduled| scheduled.saturating_sub(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Reference time of the lane
    pub fn reference(&self) -> Duration {
        self.reference
    }

    /// Rate function
    pub fn schedule(&self) -> RateSchedule {
        self.schedule
    }

    /// Check if pacing is enabled
    pub fn is_throttled(&self) -> bool {
        self.schedule.is_throttled()
    }
}

impl fmt::Debug for Pacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pacer")
            .field("reference", &self.reference)
            .field("schedule", &self.schedule)
            .field("throttled", &self.is_throttled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RampUp;

    fn count_within(pacer: &Pacer, window: Duration) -> u64 {
        let end = pacer.reference() + window;
        (0..)
            .take_while(|&n| pacer.scheduled_time(n).is_some_and(|t| t < end))
            .count() as u64
    }

    fn close(a: Duration, b: Duration) -> bool {
        a.abs_diff(b) < Duration::from_micros(1)
    }

    #[test]
    fn test_unthrottled_is_always_due() {
        let pacer = Pacer::new(Duration::from_secs(3), RateSchedule::Unthrottled);
        assert!(!pacer.is_throttled());
        assert_eq!(pacer.scheduled_time(0), None);
        assert_eq!(pacer.scheduled_time(1_000_000), None);
        assert_eq!(pacer.wait_time(42, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_constant_rate_schedule() {
        let pacer = Pacer::new(
            Duration::from_secs(1),
            RateSchedule::Constant { rate: 10.0 },
        );
        assert_eq!(pacer.scheduled_time(0), Some(Duration::from_secs(1)));
        assert!(close(
            pacer.scheduled_time(5).unwrap(),
            Duration::from_millis(1500)
        ));
    }

    #[test]
    fn test_throttled_count_within_one_of_rate_times_duration() {
        for rate in [1.0, 3.0, 7.5, 10.0, 250.0] {
            for secs in [0.5, 1.0, 2.0, 9.3] {
                let pacer = Pacer::new(Duration::ZERO, RateSchedule::Constant { rate });
                let count = count_within(&pacer, Duration::from_secs_f64(secs));
                let expected = rate * secs;
                assert!(
                    (count as f64 - expected).abs() <= 1.0,
                    "rate {rate} over {secs}s scheduled {count}"
                );
            }
        }
    }

    #[test]
    fn test_late_request_fires_immediately() {
        let pacer = Pacer::new(Duration::ZERO, RateSchedule::Constant { rate: 10.0 });
        // request 2 is due at 200ms; we are at 450ms
        assert_eq!(pacer.wait_time(2, Duration::from_millis(450)), Duration::ZERO);
        // request 5 keeps its own ideal time
        assert!(close(
            pacer.wait_time(5, Duration::from_millis(450)),
            Duration::from_millis(50)
        ));
    }

    #[test]
    fn test_ramp_gaps_strictly_decrease() {
        let task = Task::new("t", "op")
            .with_rate(10.0)
            .with_ramp_up(RampUp::new(Duration::from_secs(10), 1.0));
        let schedule = RateSchedule::for_lane(&task);
        let pacer = Pacer::new(Duration::ZERO, schedule);

        let ramp_end = Duration::from_secs(10);
        let times: Vec<Duration> = (0..)
            .map_while(|n| pacer.scheduled_time(n).filter(|t| *t <= ramp_end))
            .collect();
        assert!(times.len() > 10);

        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] < pair[0], "gap grew: {:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_ramp_reaches_target_rate() {
        let schedule = RateSchedule::Ramp {
            initial: 1.0,
            target: 10.0,
            duration: Duration::from_secs(10),
        };
        assert_eq!(schedule.rate_at(Duration::ZERO), Some(1.0));
        assert_eq!(schedule.rate_at(Duration::from_secs(5)), Some(5.5));
        assert_eq!(schedule.rate_at(Duration::from_secs(60)), Some(10.0));

        // 55 requests fit into the ramp, then one every 100ms
        let at_ramp_end = schedule.offset_of(55).unwrap();
        assert!(close(at_ramp_end, Duration::from_secs(10)));
        let after = schedule.offset_of(65).unwrap();
        assert!(close(after, Duration::from_secs(11)));
    }

    #[test]
    fn test_ramp_from_zero() {
        let schedule = RateSchedule::Ramp {
            initial: 0.0,
            target: 4.0,
            duration: Duration::from_secs(2),
        };
        assert_eq!(schedule.offset_of(0), Some(Duration::ZERO));
        // integral of 2t over [0, t] is t^2: request 1 is due at 1s
        assert!(close(schedule.offset_of(1).unwrap(), Duration::from_secs(1)));
    }

    #[test]
    fn test_rate_split_across_lanes() {
        let task = Task::new("t", "op").with_rate(10.0).with_concurrency(2);
        assert_eq!(
            RateSchedule::for_lane(&task),
            RateSchedule::Constant { rate: 5.0 }
        );
    }

    #[test]
    fn test_pacer_debug() {
        let pacer = Pacer::new(Duration::ZERO, RateSchedule::Constant { rate: 100.0 });
        let debug = format!("{:?}", pacer);
        assert!(debug.contains("Pacer"));
        assert!(debug.contains("100.0"));
        assert!(debug.contains("true"));
    }
}
