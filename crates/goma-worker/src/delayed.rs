//! Delayed closures: a min-heap of pending work keyed by deadline, with a
//! cancellable slot per entry (spec §4.B "a delayed closure can be
//! canceled; cancel deletes the embedded callback but the handle itself is
//! freed by the run loop").

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::closure::{Closure, Location};

pub(crate) type Slot = Arc<Mutex<Option<(Location, Closure)>>>;

struct DelayedEntry {
    deadline: Instant,
    seq: u64,
    slot: Slot,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}

impl Ord for DelayedEntry {
    // Reversed so a `BinaryHeap` (a max-heap) pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Caller-held handle to a scheduled-but-not-yet-run delayed closure.
///
/// Canceling is memory-safe from any thread (the embedded closure lives
/// behind a `Mutex`), though per spec it should still be routed through
/// `run_closure_in_thread` onto the owning worker to avoid racing the run
/// loop's own decision to fire it.
#[derive(Clone)]
pub struct DelayedHandle {
    slot: Slot,
}

impl DelayedHandle {
    pub(crate) fn new(slot: Slot) -> Self {
        DelayedHandle { slot }
    }

    /// Removes the closure so it won't run. No-op if it already ran or was
    /// already canceled. The heap entry itself is reclaimed lazily, when
    /// the run loop's deadline comes due and finds the slot empty.
    pub fn cancel(&self) {
        *self.slot.lock().expect("delayed closure slot poisoned") = None;
    }
}

pub(crate) struct DelayedQueue {
    heap: BinaryHeap<DelayedEntry>,
    next_seq: u64,
}

impl DelayedQueue {
    pub fn new() -> Self {
        DelayedQueue { heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Allocates a slot without inserting it into any heap — used when a
    /// caller on another thread needs the handle back before the owning
    /// worker has seen the entry at all (see `Command::ScheduleDelayed`).
    pub(crate) fn new_slot(location: Location, closure: Closure) -> Slot {
        Arc::new(Mutex::new(Some((location, closure))))
    }

    pub fn schedule(&mut self, location: Location, deadline: Instant, closure: Closure) -> DelayedHandle {
        let slot: Slot = Arc::new(Mutex::new(Some((location, closure))));
        self.push_slot(deadline, Arc::clone(&slot));
        DelayedHandle { slot }
    }

    /// Inserts an entry for a slot already allocated by the caller (used
    /// when a delayed closure is posted across threads: the handle is
    /// constructed immediately, before the worker thread ever sees it).
    pub(crate) fn push_slot(&mut self, deadline: Instant, slot: Slot) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DelayedEntry { deadline, seq, slot });
    }

    /// Returns the deadline of the earliest still-pending entry, used to
    /// tighten the reactor's poll interval (spec §4.B step 2).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops and returns every entry due at or before `now`. Canceled
    /// entries (empty slot) are silently dropped rather than returned.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(Location, Closure)> {
        let mut out = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("just peeked");
            if let Some(located) = entry.slot.lock().expect("delayed closure slot poisoned").take() {
                out.push(located);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_deadline_drains_first() {
        let mut queue = DelayedQueue::new();
        let now = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        queue.schedule("late", now + Duration::from_secs(10), Box::new(move |_| o1.lock().unwrap().push("late")));
        let o2 = Arc::clone(&order);
        queue.schedule("early", now + Duration::from_millis(1), Box::new(move |_| o2.lock().unwrap().push("early")));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(1)));
        let due = queue.drain_due(now + Duration::from_millis(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "early");
    }

    #[test]
    fn canceled_entry_is_dropped_not_run() {
        let mut queue = DelayedQueue::new();
        let now = Instant::now();
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);

        let handle = queue.schedule("x", now, Box::new(move |_| *ran_clone.lock().unwrap() = true));
        handle.cancel();

        let due = queue.drain_due(now + Duration::from_millis(1));
        assert!(due.is_empty());
        assert!(!*ran.lock().unwrap());
    }
}
