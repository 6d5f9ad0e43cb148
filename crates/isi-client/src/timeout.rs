//! # Timeout Scheduler
//!
//! One-shot deadlines keyed by transaction id. The scheduler owns no timer
//! of its own: the reactor asks for [`next_deadline`](TimeoutScheduler::next_deadline),
//! sleeps until then, and the client drains whatever has expired.
//!
//! A zero timeout means "wait indefinitely" and arms nothing.

use quanta::Instant;
use std::collections::BTreeSet;
use std::time::Duration;

/// Per-transaction deadlines ordered by expiry.
#[derive(Debug)]
pub struct TimeoutScheduler {
    armed: [Option<Instant>; 256],
    queue: BTreeSet<(Instant, u8)>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        TimeoutScheduler {
            armed: [None; 256],
            queue: BTreeSet::new(),
        }
    }

    /// Arm `id` to expire `after` from `now`, replacing any earlier deadline.
    /// Returns `false` (and arms nothing) for a zero duration.
    pub fn arm(&mut self, id: u8, now: Instant, after: Duration) -> bool {
        self.disarm(id);
        if after.is_zero() {
            return false;
        }
        let deadline = now + after;
        self.armed[id as usize] = Some(deadline);
        self.queue.insert((deadline, id));
        true
    }

    /// Cancel the deadline of `id`. Returns whether one was armed.
    pub fn disarm(&mut self, id: u8) -> bool {
        match self.armed[id as usize].take() {
            Some(deadline) => {
                self.queue.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: u8) -> bool {
        self.armed[id as usize].is_some()
    }

    pub fn deadline(&self, id: u8) -> Option<Instant> {
        self.armed[id as usize]
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().next().map(|&(deadline, _)| deadline)
    }

    /// Remove and return one id whose deadline is at or before `now`.
    ///
    /// Expired ids come out earliest first; call repeatedly until `None`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<u8> {
        let &(deadline, id) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        self.queue.remove(&(deadline, id));
        self.armed[id as usize] = None;
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every deadline.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed = [None; 256];
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}
