//! Deferred work.
//!
//! The scheduler is a deadline-ordered queue on a virtual clock.  It does
//! not sleep and does not run anything itself: the event loop asks for
//! [`Scheduler::next_deadline`], waits until then, moves the clock with
//! [`Scheduler::advance`] and drains [`Scheduler::pop_due`].  Keeping the
//! clock out of the queue lets tests drive it tick by tick.
//!
//! Items fire once.  Polling is done by an item submitting itself again.

use std::collections::BTreeMap;
use std::time::Duration;

/// Delay-ordered queue of work items.
#[derive(Debug)]
pub struct Scheduler<W> {
    now: Duration,
    seq: u64,
    queue: BTreeMap<(Duration, u64), W>,
}

impl<W> Scheduler<W> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            seq: 0,
            queue: BTreeMap::new(),
        }
    }

    /// Queue `work` to fire `delay` after the current clock.
    ///
    /// Items with the same deadline fire in submission order.
    pub fn submit(&mut self, delay: Duration, work: W) {
        let key = (self.now + delay, self.seq);
        self.seq += 1;
        self.queue.insert(key, work);
    }

    /// Current clock, time since the scheduler was created.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Move the clock forward.  The clock never runs backwards.
    pub fn advance(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Move the clock to the next deadline, if any.
    pub fn advance_to_next(&mut self) -> Option<Duration> {
        let deadline = self.next_deadline()?;
        self.advance(deadline);
        Some(deadline)
    }

    /// Take the earliest item whose deadline has passed.
    pub fn pop_due(&mut self) -> Option<W> {
        let (&(deadline, _), _) = self.queue.first_key_value()?;
        if deadline > self.now {
            return None;
        }
        self.queue.pop_first().map(|(_, work)| work)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}
