//! Deferred actions for the tick loop.
//!
//! Nothing on the tick loop is allowed to sleep. Anything that has to happen
//! "later" (closing the reward relay, the next step of the end plate flash) is
//! queued here with the tick-clock time it becomes due, and collected by the
//! loop on every tick.

use std::collections::BTreeMap;

/// A time-ordered queue of actions of type `A`.
///
/// Actions due at the same time come out in the order they were scheduled.
#[derive(Debug, Clone)]
pub struct Scheduler<A> {
    // Keyed by (due time bits, insertion sequence). Due times are never
    // negative, so their bit patterns sort like the values themselves.
    entries: BTreeMap<(u64, u64), A>,
    next_seq: u64,
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Scheduler<A> {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Queue `action` to become due at time `due` (seconds on the tick
    /// clock). Negative times are treated as zero.
    pub fn schedule(&mut self, due: f64, action: A) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((clock_key(due), seq), action);
    }

    /// Drop every pending action matching `pred`, returning how many went.
    pub fn cancel_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&A) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, action| !pred(action));
        before - self.entries.len()
    }

    /// Remove and return, in order, every action due at or before `now`.
    pub fn take_due(&mut self, now: f64) -> Vec<A> {
        let now_bits = clock_key(now);
        let pending = self.entries.split_off(&(now_bits, u64::MAX));
        let due = std::mem::replace(&mut self.entries, pending);
        due.into_values().collect()
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Adding zero turns -0.0 into 0.0.
fn clock_key(t: f64) -> u64 {
    (t.max(0.0) + 0.0).to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_fire_in_time_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(2.0, "b");
        scheduler.schedule(1.0, "a");
        scheduler.schedule(3.0, "c");

        assert!(scheduler.take_due(0.5).is_empty());
        assert_eq!(scheduler.take_due(2.0), vec!["a", "b"]);
        assert_eq!(scheduler.take_due(10.0), vec!["c"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(1.0, 1);
        scheduler.schedule(1.0, 2);
        scheduler.schedule(1.0, 3);
        assert_eq!(scheduler.take_due(1.0), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_actions_never_fire() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(1.0, "keep");
        scheduler.schedule(1.0, "drop");

        assert_eq!(scheduler.cancel_where(|a| *a == "drop"), 1);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.take_due(5.0), vec!["keep"]);
        assert_eq!(scheduler.cancel_where(|_| true), 0);
    }

    #[test]
    fn cancel_where_filters_by_action() {
        let mut scheduler = Scheduler::new();
        for i in 0..6 {
            scheduler.schedule(i as f64, i);
        }
        assert_eq!(scheduler.cancel_where(|a| a % 2 == 0), 3);
        assert_eq!(scheduler.take_due(10.0), vec![1, 3, 5]);
    }
}
