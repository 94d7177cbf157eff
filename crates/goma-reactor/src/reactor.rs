//! The descriptor reactor (spec §4.A).
//!
//! One `Reactor` belongs to exactly one worker. It wraps a single
//! `mio::Poll` instance and layers on top of it the two things mio doesn't
//! give you for free: per-descriptor read-timeout deadlines, and a
//! `min_priority` filter so a worker can temporarily ignore low-priority
//! descriptors while it drains higher-priority closure queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use tracing::trace;

use crate::descriptor::{DescriptorId, DescriptorMeta, Interest};
use crate::error::ReactorError;
use crate::priority::Priority;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// One fired event for a single descriptor, as yielded by [`Reactor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// I/O readiness fired (possibly both directions at once).
    Io { id: DescriptorId, readable: bool, writable: bool },
    /// The descriptor's read-timeout deadline elapsed with no I/O this poll.
    TimedOut { id: DescriptorId },
}

impl PollEvent {
    pub fn id(&self) -> DescriptorId {
        match self {
            PollEvent::Io { id, .. } => *id,
            PollEvent::TimedOut { id } => *id,
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    descriptors: HashMap<DescriptorId, DescriptorMeta>,
    /// Insertion order of ids with an active read-timeout, so the
    /// purely-timed-out pass iterates in registration order (spec §4.A
    /// ordering rule).
    timeout_order: Vec<DescriptorId>,
}

impl Reactor {
    pub fn new(events_capacity: usize) -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Reactor {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            waker,
            descriptors: HashMap::new(),
            timeout_order: Vec::new(),
        })
    }

    /// A clonable handle other threads can use to interrupt a blocking
    /// [`Reactor::poll`] call (spec §4.A `signal()`).
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Wake this reactor's (possibly other-thread-blocking) `poll` now.
    pub fn signal(&self) -> std::io::Result<()> {
        self.waker.wake()
    }

    /// Register `source` for `interest` under `id` at `priority`.
    /// Idempotent: registering an id that's already registered for I/O
    /// modifies its interest/priority rather than erroring.
    pub fn register(
        &mut self,
        id: DescriptorId,
        source: &mut dyn Source,
        interest: Interest,
        priority: Priority,
    ) -> Result<(), ReactorError> {
        let mio_interest = interest
            .to_mio()
            .unwrap_or(mio::Interest::READABLE);
        let token = Token(id.0);

        match self.descriptors.get_mut(&id) {
            Some(meta) if meta.io_registered => {
                self.poll.registry().reregister(source, token, mio_interest)?;
                meta.interest = interest;
                meta.priority = priority;
            }
            Some(meta) => {
                self.poll.registry().register(source, token, mio_interest)?;
                meta.io_registered = true;
                meta.interest = interest;
                meta.priority = priority;
            }
            None => {
                self.poll.registry().register(source, token, mio_interest)?;
                self.descriptors.insert(
                    id,
                    DescriptorMeta { priority, interest, read_timeout: None, io_registered: true },
                );
            }
        }
        Ok(())
    }

    /// Unregister `id` from I/O polling. Tolerates repeated removal of an
    /// already-removed descriptor (spec §4.A).
    pub fn unregister(&mut self, id: DescriptorId, source: &mut dyn Source) {
        let _ = self.poll.registry().deregister(source);
        if let Some(meta) = self.descriptors.get_mut(&id) {
            meta.io_registered = false;
            if meta.read_timeout.is_none() {
                self.descriptors.remove(&id);
            }
        }
    }

    /// Register (or replace) a read-timeout deadline for `id`, independent
    /// of whether it also has an I/O registration.
    pub fn register_timeout(&mut self, id: DescriptorId, priority: Priority, deadline: Instant) {
        let first_registration = match self.descriptors.get_mut(&id) {
            Some(meta) => {
                let was_present = meta.read_timeout.is_some();
                meta.read_timeout = Some(deadline);
                !was_present
            }
            None => {
                self.descriptors.insert(
                    id,
                    DescriptorMeta {
                        priority,
                        interest: Interest::default(),
                        read_timeout: Some(deadline),
                        io_registered: false,
                    },
                );
                true
            }
        };
        if first_registration {
            self.timeout_order.push(id);
        }
    }

    /// Tolerates repeated removal of an id with no active timeout.
    pub fn unregister_timeout(&mut self, id: DescriptorId) {
        if let Some(meta) = self.descriptors.get_mut(&id) {
            meta.read_timeout = None;
            if !meta.io_registered {
                self.descriptors.remove(&id);
            }
        }
        self.timeout_order.retain(|existing| *existing != id);
    }

    /// Poll for I/O readiness and elapsed read-timeouts.
    ///
    /// Descriptors registered below `min_priority` are skipped entirely for
    /// this call (their events, if any, are picked up on a later poll once
    /// the worker lowers its `min_priority`). I/O events are yielded first,
    /// in OS order; purely-timed-out descriptors follow, in registration
    /// order. A descriptor that both timed out and had I/O fire this round
    /// is yielded only as `Io`, per spec §4.A.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        min_priority: Priority,
    ) -> Result<Vec<PollEvent>, ReactorError> {
        self.poll.poll(&mut self.events, timeout)?;

        let mut out = Vec::new();
        let mut fired_io: Vec<DescriptorId> = Vec::new();

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let id = DescriptorId(event.token().0);
            let Some(meta) = self.descriptors.get(&id) else {
                continue;
            };
            if meta.priority < min_priority {
                continue;
            }
            out.push(PollEvent::Io {
                id,
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
            fired_io.push(id);
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        for &id in &self.timeout_order {
            if fired_io.contains(&id) {
                continue;
            }
            let Some(meta) = self.descriptors.get(&id) else { continue };
            if meta.priority < min_priority {
                continue;
            }
            if let Some(deadline) = meta.read_timeout {
                if deadline <= now {
                    out.push(PollEvent::TimedOut { id });
                    expired.push(id);
                }
            }
        }
        for id in expired {
            trace!(?id, "descriptor read-timeout elapsed");
            self.unregister_timeout(id);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use mio::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = StdUnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (UnixStream::from_std(a), UnixStream::from_std(b))
    }

    #[test]
    fn register_then_write_yields_readable_event() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let (mut a, mut b) = pair();
        reactor
            .register(DescriptorId(1), &mut a, Interest::READABLE, Priority::Med)
            .expect("register");

        use std::io::Write;
        b.write_all(b"x").expect("write");

        let events = reactor
            .poll(Some(Duration::from_millis(500)), Priority::Low)
            .expect("poll");
        assert!(events
            .iter()
            .any(|e| e.id() == DescriptorId(1) && matches!(e, PollEvent::Io { readable: true, .. })));
    }

    #[test]
    fn min_priority_filters_out_lower_priority_descriptors() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let (mut a, mut b) = pair();
        reactor
            .register(DescriptorId(2), &mut a, Interest::READABLE, Priority::Low)
            .expect("register");

        use std::io::Write;
        b.write_all(b"x").expect("write");

        let events = reactor
            .poll(Some(Duration::from_millis(200)), Priority::High)
            .expect("poll");
        assert!(events.is_empty(), "low-priority descriptor must be filtered at High min_priority");
    }

    #[test]
    fn timeout_elapses_without_io() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let deadline = Instant::now() - Duration::from_millis(1);
        reactor.register_timeout(DescriptorId(3), Priority::Med, deadline);

        let events = reactor
            .poll(Some(Duration::from_millis(10)), Priority::Low)
            .expect("poll");
        assert_eq!(events, vec![PollEvent::TimedOut { id: DescriptorId(3) }]);
    }

    #[test]
    fn io_takes_precedence_over_timeout_for_same_descriptor() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let (mut a, mut b) = pair();
        reactor
            .register(DescriptorId(4), &mut a, Interest::READABLE, Priority::Med)
            .expect("register");
        reactor.register_timeout(DescriptorId(4), Priority::Med, Instant::now() - Duration::from_millis(1));

        use std::io::Write;
        b.write_all(b"x").expect("write");

        let events = reactor
            .poll(Some(Duration::from_millis(200)), Priority::Low)
            .expect("poll");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PollEvent::Io { .. }));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let (mut a, _b) = pair();
        reactor
            .register(DescriptorId(5), &mut a, Interest::READABLE, Priority::Med)
            .expect("register");
        reactor.unregister(DescriptorId(5), &mut a);
        reactor.unregister(DescriptorId(5), &mut a);
    }

    #[test]
    fn signal_wakes_a_blocking_poll() {
        let reactor = Arc::new(std::sync::Mutex::new(Reactor::new(16).expect("reactor")));
        let waker_reactor = Arc::clone(&reactor);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker_reactor.lock().unwrap().signal().expect("signal");
        });

        let start = Instant::now();
        let events = reactor
            .lock()
            .unwrap()
            .poll(Some(Duration::from_secs(5)), Priority::Low)
            .expect("poll");
        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
