//! The value closures run with while executing on their owning worker.
//!
//! Registering a descriptor, arming a delayed closure, or enqueueing more
//! work from inside a running closure all go through `WorkerContext` rather
//! than a thread-local "current worker" — spec §9's "pass the worker
//! explicitly via closure capture or a per-task context value; avoid
//! globally visible thread-local state."

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use goma_reactor::{DescriptorId, Interest, Priority, Reactor};
use mio::event::Source;

use crate::closure::{Closure, Location};
use crate::delayed::{DelayedHandle, DelayedQueue};
use crate::descriptor::DescriptorCallbacks;
use std::collections::HashMap;

pub(crate) struct Queues {
    pub immediate: VecDeque<(Location, Closure)>,
    pub high: VecDeque<(Location, Closure)>,
    pub med: VecDeque<(Location, Closure)>,
    pub low: VecDeque<(Location, Closure)>,
}

impl Queues {
    pub fn new() -> Self {
        Queues {
            immediate: VecDeque::new(),
            high: VecDeque::new(),
            med: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    pub fn queue_for(&mut self, priority: Priority) -> &mut VecDeque<(Location, Closure)> {
        match priority {
            Priority::Immediate => &mut self.immediate,
            Priority::High => &mut self.high,
            Priority::Med => &mut self.med,
            Priority::Low => &mut self.low,
        }
    }

    pub fn is_empty_at(&self, priority: Priority) -> bool {
        match priority {
            Priority::Immediate => self.immediate.is_empty(),
            Priority::High => self.high.is_empty(),
            Priority::Med => self.med.is_empty(),
            Priority::Low => self.low.is_empty(),
        }
    }
}

pub struct WorkerContext<'a> {
    pub(crate) id: usize,
    pub(crate) reactor: &'a mut Reactor,
    pub(crate) callbacks: &'a mut HashMap<DescriptorId, DescriptorCallbacks>,
    pub(crate) queues: &'a mut Queues,
    pub(crate) delayed: &'a mut DelayedQueue,
}

impl<'a> WorkerContext<'a> {
    pub fn worker_id(&self) -> usize {
        self.id
    }

    /// Enqueue a closure onto this same worker's `priority` queue. Safe to
    /// call from within a running closure; does not round-trip through the
    /// command channel.
    pub fn enqueue(&mut self, location: Location, priority: Priority, closure: Closure) {
        self.queues.queue_for(priority).push_back((location, closure));
    }

    /// Arm a closure to run after `delay` elapses, on this same worker.
    pub fn schedule_delayed(&mut self, location: Location, delay: Duration, closure: Closure) -> DelayedHandle {
        self.delayed.schedule(location, Instant::now() + delay, closure)
    }

    /// Register `source` for I/O readiness under `id`, with callbacks to run
    /// (as immediate-priority closures) when the reactor reports it.
    pub fn register_descriptor(
        &mut self,
        id: DescriptorId,
        source: &mut dyn Source,
        interest: Interest,
        priority: Priority,
        callbacks: DescriptorCallbacks,
    ) -> Result<(), goma_reactor::ReactorError> {
        self.reactor.register(id, source, interest, priority)?;
        self.callbacks.insert(id, callbacks);
        Ok(())
    }

    pub fn unregister_descriptor(&mut self, id: DescriptorId, source: &mut dyn Source) {
        self.reactor.unregister(id, source);
        self.callbacks.remove(&id);
    }

    /// Arm (or replace) a read-timeout on an already-registered descriptor.
    /// The descriptor's `on_timeout` callback (set at registration) fires
    /// once the deadline elapses with no I/O in between.
    pub fn set_read_timeout(&mut self, id: DescriptorId, priority: Priority, deadline: Instant) {
        self.reactor.register_timeout(id, priority, deadline);
    }

    pub fn clear_read_timeout(&mut self, id: DescriptorId) {
        self.reactor.unregister_timeout(id);
    }
}
