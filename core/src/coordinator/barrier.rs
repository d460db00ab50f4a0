//! Barrier bookkeeping
//!
//! Only the coordinator mutates the tracker, driven by the acknowledgments it
//! receives. A barrier is released once every expected worker either
//! acknowledged it or was lost.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::protocol::Barrier;

/// An acknowledgment that does not fit the current barrier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierViolation {
    /// No barrier is open
    #[error("worker {worker} acknowledged {barrier} but no barrier is open")]
    Unexpected {
        /// Worker id
        worker: usize,
        /// Barrier the worker acknowledged
        barrier: Barrier,
    },

    /// The worker acknowledged a different barrier
    #[error("worker {worker} acknowledged {got} while waiting for {expected}")]
    Mismatch {
        /// Worker id
        worker: usize,
        /// Open barrier
        expected: Barrier,
        /// Barrier the worker acknowledged
        got: Barrier,
    },

    /// The worker is not part of the open barrier
    #[error("worker {worker} is not expected at {barrier}")]
    UnknownWorker {
        /// Worker id
        worker: usize,
        /// Open barrier
        barrier: Barrier,
    },

    /// The worker already acknowledged the open barrier
    #[error("worker {worker} acknowledged {barrier} twice")]
    Duplicate {
        /// Worker id
        worker: usize,
        /// Open barrier
        barrier: Barrier,
    },
}

/// Tracks which workers reached the open barrier
#[derive(Debug, Default)]
pub struct BarrierTracker {
    current: Option<Barrier>,
    pending: BTreeSet<usize>,
    reached: BTreeSet<usize>,
}

impl BarrierTracker {
    /// Create a tracker with no open barrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a barrier every listed worker must reach
    pub fn expect(&mut self, barrier: Barrier, workers: impl IntoIterator<Item = usize>) {
        debug_assert!(self.current.is_none(), "barrier {:?} still open", self.current);
        self.current = Some(barrier);
        self.pending = workers.into_iter().collect();
        self.reached.clear();
    }

    /// Record an acknowledgment
    pub fn acknowledge(&mut self, worker: usize, barrier: Barrier) -> Result<(), BarrierViolation> {
        let Some(expected) = self.current else {
            return Err(BarrierViolation::Unexpected { worker, barrier });
        };
        if barrier != expected {
            return Err(BarrierViolation::Mismatch {
                worker,
                expected,
                got: barrier,
            });
        }
        if self.reached.contains(&worker) {
            return Err(BarrierViolation::Duplicate { worker, barrier });
        }
        if !self.pending.remove(&worker) {
            return Err(BarrierViolation::UnknownWorker { worker, barrier });
        }
        self.reached.insert(worker);
        Ok(())
    }

    /// Stop waiting for a lost worker; returns whether it was pending
    pub fn forfeit(&mut self, worker: usize) -> bool {
        self.pending.remove(&worker)
    }

    /// The open barrier
    pub fn current(&self) -> Option<Barrier> {
        self.current
    }

    /// Workers that have not reached the open barrier
    pub fn pending(&self) -> Vec<usize> {
        self.pending.iter().copied().collect()
    }

    /// Check if the open barrier can be released
    pub fn is_complete(&self) -> bool {
        self.current.is_some() && self.pending.is_empty()
    }

    /// Close the open barrier and return the workers that reached it
    pub fn release(&mut self) -> Vec<usize> {
        self.current = None;
        self.pending.clear();
        std::mem::take(&mut self.reached).into_iter().collect()
    }
}
