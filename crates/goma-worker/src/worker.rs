//! The run loop (spec §4.B): each worker thread repeatedly picks one
//! closure to run, computed from four priority queues, a delayed-closure
//! heap, periodic closures, and whatever the reactor reports ready.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use goma_reactor::{DescriptorId, PollEvent, Priority, Reactor};
use tracing::{debug, trace, warn};

use crate::closure::Location;
use crate::command::Command;
use crate::context::{Queues, WorkerContext};
use crate::delayed::DelayedQueue;
use crate::descriptor::DescriptorCallbacks;
use crate::periodic::PeriodicTable;

/// Default interval the reactor blocks for when no closure queue has work
/// (spec §4.B step 2).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive empty ticks before the loop sleeps for one poll interval
/// instead of spinning (spec §4.B anti-starvation note).
const IDLE_TICK_LIMIT: u32 = 5000;

pub(crate) struct Worker {
    id: usize,
    reactor: Reactor,
    queues: Queues,
    callbacks: HashMap<DescriptorId, DescriptorCallbacks>,
    delayed: DelayedQueue,
    periodic: PeriodicTable,
    receiver: Receiver<Command>,
    idle_ticks: u32,
}

impl Worker {
    pub fn new(id: usize, reactor: Reactor, receiver: Receiver<Command>) -> Self {
        Worker {
            id,
            reactor,
            queues: Queues::new(),
            callbacks: HashMap::new(),
            delayed: DelayedQueue::new(),
            periodic: PeriodicTable::new(),
            receiver,
            idle_ticks: 0,
        }
    }

    /// Drives the loop until a [`Command::Shutdown`] is received or the
    /// sending half of the channel is dropped.
    pub fn run(&mut self) {
        loop {
            match self.drain_commands() {
                ControlFlow::Shutdown => break,
                ControlFlow::Continue => {}
            }
            let did_work = self.tick();
            if did_work {
                self.idle_ticks = 0;
            } else {
                self.idle_ticks += 1;
                if self.idle_ticks >= IDLE_TICK_LIMIT {
                    trace!(worker = self.id, "idle tick limit reached, yielding");
                    std::thread::sleep(DEFAULT_POLL_INTERVAL);
                    self.idle_ticks = 0;
                }
            }
        }
        debug!(worker = self.id, "worker loop exiting");
    }

    fn drain_commands(&mut self) -> ControlFlow {
        loop {
            match self.receiver.try_recv() {
                Ok(Command::Enqueue(priority, location, closure)) => {
                    self.queues.queue_for(priority).push_back((location, closure));
                }
                Ok(Command::ScheduleDelayed(deadline, slot)) => {
                    self.delayed.push_slot(deadline, slot);
                }
                Ok(Command::RegisterPeriodic(id, location, period, closure)) => {
                    self.periodic.insert(id, location, period, closure);
                }
                Ok(Command::UnregisterPeriodic(id, done)) => {
                    self.periodic.remove(id);
                    done.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                Ok(Command::Shutdown) => return ControlFlow::Shutdown,
                Err(TryRecvError::Empty) => return ControlFlow::Continue,
                Err(TryRecvError::Disconnected) => return ControlFlow::Shutdown,
            }
        }
    }

    /// One iteration of the algorithm in spec §4.B. Returns whether a
    /// closure ran or an I/O/timeout event was observed.
    fn tick(&mut self) -> bool {
        // Step 1: immediate closures preempt everything, including polling.
        if let Some((location, closure)) = self.queues.immediate.pop_front() {
            self.run_one(location, closure);
            return true;
        }

        // Step 2: pick the highest-priority non-empty lower queue; that
        // sets both the poll interval (0 if there's already work waiting)
        // and the min_priority the reactor polls at.
        let chosen = [Priority::High, Priority::Med, Priority::Low]
            .into_iter()
            .find(|p| !self.queues.is_empty_at(*p));
        let mut poll_interval = if chosen.is_some() { Duration::ZERO } else { DEFAULT_POLL_INTERVAL };
        poll_interval = self.tighten_to_next_deadline(poll_interval);
        let min_priority = chosen.unwrap_or(Priority::Low);

        let events = match self.reactor.poll(Some(poll_interval), min_priority) {
            Ok(events) => events,
            Err(err) => {
                warn!(worker = self.id, error = %err, "reactor poll failed");
                Vec::new()
            }
        };
        let had_events = !events.is_empty();

        // Step 3: promote elapsed delayed/periodic closures into immediate.
        self.promote_due(Instant::now());

        // Step 4: convert I/O / timeout events into immediate closures.
        for event in events {
            self.convert_event(event);
        }

        // Step 5/6: run one closure, preferring immediate (now populated by
        // steps 3-4), falling back to the queue chosen in step 2.
        if let Some((location, closure)) = self.queues.immediate.pop_front() {
            self.run_one(location, closure);
            return true;
        }
        if let Some(priority) = chosen {
            if let Some((location, closure)) = self.queues.queue_for(priority).pop_front() {
                self.run_one(location, closure);
                return true;
            }
        }
        had_events
    }

    fn tighten_to_next_deadline(&self, interval: Duration) -> Duration {
        let mut interval = interval;
        let now = Instant::now();
        for deadline in [self.delayed.next_deadline(), self.periodic.next_deadline()].into_iter().flatten() {
            let remaining = deadline.saturating_duration_since(now);
            if remaining < interval {
                interval = remaining;
            }
        }
        interval
    }

    /// Materializes elapsed delayed/periodic closures into IMMEDIATE (spec
    /// §4.B step 3); neither runs here, preserving the one-closure-per-tick
    /// discipline step 5/6 enforces.
    fn promote_due(&mut self, now: Instant) {
        for (location, closure) in self.delayed.drain_due(now) {
            self.queues.immediate.push_back((location, closure));
        }
        for id in self.periodic.take_due(now) {
            if let Some((location, handle)) = self.periodic.handle(id) {
                let wrapper: crate::closure::Closure = Box::new(move |ctx: &mut WorkerContext| {
                    let mut closure = handle.lock().expect("periodic closure mutex poisoned");
                    closure(ctx);
                });
                self.queues.immediate.push_back((location, wrapper));
            }
        }
    }

    fn convert_event(&mut self, event: PollEvent) {
        let id = event.id();
        let Some(callbacks) = self.callbacks.get_mut(&id) else { return };
        match event {
            PollEvent::Io { readable, writable, .. } => {
                if readable {
                    if let Some(closure) = callbacks.on_readable.take() {
                        self.queues.immediate.push_back(("descriptor::on_readable", closure));
                    }
                }
                if writable {
                    if let Some(closure) = callbacks.on_writable.take() {
                        self.queues.immediate.push_back(("descriptor::on_writable", closure));
                    }
                }
            }
            PollEvent::TimedOut { .. } => {
                if let Some(closure) = callbacks.on_timeout.take() {
                    self.queues.immediate.push_back(("descriptor::on_timeout", closure));
                }
            }
        }
    }

    fn run_one(&mut self, location: Location, closure: crate::closure::Closure) {
        let mut ctx = WorkerContext {
            id: self.id,
            reactor: &mut self.reactor,
            callbacks: &mut self.callbacks,
            queues: &mut self.queues,
            delayed: &mut self.delayed,
        };
        trace!(worker = self.id, location, "running closure");
        closure(&mut ctx);
    }

    pub fn waker(&self) -> std::sync::Arc<mio::Waker> {
        self.reactor.waker()
    }
}

enum ControlFlow {
    Continue,
    Shutdown,
}
