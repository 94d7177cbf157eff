//! Periodic closures, invoked on a fixed interval until unregistered
//! (spec §4.B `register_periodic`/`unregister_periodic`).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::closure::{Location, PeriodicFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodicId(pub u64);

pub(crate) struct PeriodicEntry {
    pub id: PeriodicId,
    pub location: Location,
    pub period: Duration,
    pub next_fire: Instant,
    /// Shared so a due entry can be handed to a queued one-shot `Closure`
    /// (see `Worker::promote_due`) without holding a borrow of the table
    /// itself across the closure's later invocation.
    pub closure: Arc<Mutex<PeriodicFn>>,
}

pub(crate) struct PeriodicTable {
    entries: Vec<PeriodicEntry>,
}

impl PeriodicTable {
    pub fn new() -> Self {
        PeriodicTable { entries: Vec::new() }
    }

    pub fn insert(&mut self, id: PeriodicId, location: Location, period: Duration, closure: PeriodicFn) {
        self.entries.push(PeriodicEntry {
            id,
            location,
            period,
            next_fire: Instant::now() + period,
            closure: Arc::new(Mutex::new(closure)),
        });
    }

    pub fn remove(&mut self, id: PeriodicId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Returns ids due to fire at or before `now`, advancing their
    /// `next_fire` by one period each (catch-up drift is not accumulated:
    /// a long stall advances `next_fire` relative to `now`, not by
    /// repeatedly adding `period`, so a woken-up worker doesn't burst-fire
    /// a backlog of missed ticks).
    pub fn take_due(&mut self, now: Instant) -> Vec<PeriodicId> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next_fire <= now {
                due.push(entry.id);
                entry.next_fire = now + entry.period;
            }
        }
        due
    }

    /// A cloned handle to the entry's closure plus its location, so the
    /// caller can fire it later without holding a reference into this table.
    pub fn handle(&self, id: PeriodicId) -> Option<(Location, Arc<Mutex<PeriodicFn>>)> {
        self.entries.iter().find(|e| e.id == id).map(|e| (e.location, Arc::clone(&e.closure)))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_fire).min()
    }
}
