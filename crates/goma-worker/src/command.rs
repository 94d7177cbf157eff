//! Messages posted across thread boundaries into a single worker's loop.
//!
//! Everything a running closure can do to its own worker via
//! [`crate::context::WorkerContext`] is also reachable from another thread
//! by posting a `Command` — this is what `run_closure_in_thread` and the
//! manager's periodic registration use.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use goma_reactor::Priority;

use crate::closure::{Closure, Location, PeriodicFn};
use crate::delayed::Slot;
use crate::periodic::PeriodicId;

pub(crate) enum Command {
    Enqueue(Priority, Location, Closure),
    ScheduleDelayed(Instant, Slot),
    RegisterPeriodic(PeriodicId, Location, Duration, PeriodicFn),
    UnregisterPeriodic(PeriodicId, Arc<AtomicBool>),
    Shutdown,
}
