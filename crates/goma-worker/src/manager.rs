//! Fixed pool of worker threads (spec §4.B): each owns one [`Reactor`] and
//! processes its own priority queues independently. `WorkerThreadManager` is
//! the cross-thread handle callers use to post work.
//!
//! Dedicated named OS threads, one `mpsc` channel per worker, generalized
//! here from a one-shot dispatch-and-reply pool into a persistent run-loop
//! per worker that also multiplexes descriptor I/O.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use goma_reactor::{Priority, Reactor};

use crate::closure::{Closure, Location, PeriodicFn};
use crate::command::Command;
use crate::delayed::{DelayedHandle, DelayedQueue};
use crate::error::WorkerError;
use crate::periodic::PeriodicId;
use crate::worker::Worker;

const EVENTS_CAPACITY: usize = 256;

struct WorkerHandle {
    sender: Sender<Command>,
    waker: Arc<mio::Waker>,
    join: Option<JoinHandle<()>>,
}

/// Fixed-size pool of worker threads, each running its own reactor-driven
/// loop. Construction blocks until every worker thread has its reactor up
/// and its command channel ready.
pub struct WorkerThreadManager {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    next_periodic_id: AtomicI64,
}

impl WorkerThreadManager {
    /// Spawns `size` worker threads (minimum 1), named `goma-worker-{n}`.
    pub fn new(size: usize) -> Result<Self, WorkerError> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let reactor = Reactor::new(EVENTS_CAPACITY)?;
            let waker = reactor.waker();
            let (sender, receiver) = mpsc::channel();
            let join = std::thread::Builder::new()
                .name(format!("goma-worker-{id}"))
                .spawn(move || {
                    let mut worker = Worker::new(id, reactor, receiver);
                    worker.run();
                })
                .expect("failed to spawn worker thread");
            workers.push(WorkerHandle { sender, waker, join: Some(join) });
        }
        Ok(WorkerThreadManager { workers, next_worker: AtomicUsize::new(0), next_periodic_id: AtomicI64::new(0) })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn handle(&self, worker_id: usize) -> Result<&WorkerHandle, WorkerError> {
        self.workers
            .get(worker_id)
            .ok_or(WorkerError::NoSuchWorker(worker_id, self.workers.len()))
    }

    fn post(&self, worker_id: usize, command: Command) -> Result<(), WorkerError> {
        let handle = self.handle(worker_id)?;
        let _ = handle.sender.send(command);
        let _ = handle.waker.wake();
        Ok(())
    }

    /// Posts `closure` to a worker chosen round-robin (spec §4.B
    /// `run_closure`: caller doesn't care which worker runs it).
    pub fn run_closure(&self, location: Location, priority: Priority, closure: Closure) -> Result<(), WorkerError> {
        let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.run_closure_in_thread(worker_id, location, priority, closure)
    }

    /// Posts `closure` to a specific worker (spec §4.B `run_closure_in_thread`:
    /// used when state — a descriptor, a cache slot — is pinned to one
    /// worker and must only ever be touched there).
    pub fn run_closure_in_thread(
        &self,
        worker_id: usize,
        location: Location,
        priority: Priority,
        closure: Closure,
    ) -> Result<(), WorkerError> {
        self.post(worker_id, Command::Enqueue(priority, location, closure))
    }

    /// Arms `closure` to run after `delay` on `worker_id`. Returns a handle
    /// immediately; the closure itself isn't touched until the owning
    /// worker's loop pops it from its delayed heap.
    pub fn run_delayed_closure(
        &self,
        worker_id: usize,
        location: Location,
        delay: Duration,
        closure: Closure,
    ) -> Result<DelayedHandle, WorkerError> {
        let slot = DelayedQueue::new_slot(location, closure);
        let handle = DelayedHandle::new(Arc::clone(&slot));
        let deadline = Instant::now() + delay;
        self.post(worker_id, Command::ScheduleDelayed(deadline, slot))?;
        Ok(handle)
    }

    /// Registers a periodic closure on `worker_id`. Fires first after one
    /// `period`, then every `period` thereafter.
    pub fn register_periodic(
        &self,
        worker_id: usize,
        location: Location,
        period: Duration,
        closure: PeriodicFn,
    ) -> Result<PeriodicId, WorkerError> {
        let id = PeriodicId(self.next_periodic_id.fetch_add(1, Ordering::Relaxed) as u64);
        self.post(worker_id, Command::RegisterPeriodic(id, location, period, closure))?;
        Ok(id)
    }

    /// Unregisters a periodic closure, blocking (with a short backoff poll)
    /// until the owning worker has actually removed it, so the caller can
    /// safely free anything the closure captured.
    pub fn unregister_periodic(&self, worker_id: usize, id: PeriodicId) -> Result<(), WorkerError> {
        let done = Arc::new(AtomicBool::new(false));
        self.post(worker_id, Command::UnregisterPeriodic(id, Arc::clone(&done)))?;
        while !done.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_micros(200));
        }
        Ok(())
    }

    /// Signals every worker to stop its loop and joins all threads.
    pub fn shutdown(&mut self) {
        for handle in &self.workers {
            let _ = handle.sender.send(Command::Shutdown);
            let _ = handle.waker.wake();
        }
        for handle in &mut self.workers {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for WorkerThreadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn run_closure_executes_on_some_worker() {
        let manager = WorkerThreadManager::new(2).expect("manager");
        let (tx, rx) = channel();
        manager
            .run_closure("test::run_closure", Priority::Med, Box::new(move |_ctx| {
                tx.send(()).unwrap();
            }))
            .expect("post");
        rx.recv_timeout(Duration::from_secs(2)).expect("closure ran");
    }

    #[test]
    fn run_closure_in_thread_targets_the_requested_worker() {
        let manager = WorkerThreadManager::new(3).expect("manager");
        let (tx, rx) = channel();
        manager
            .run_closure_in_thread(2, "test::pinned", Priority::High, Box::new(move |ctx| {
                tx.send(ctx.worker_id()).unwrap();
            }))
            .expect("post");
        let observed = rx.recv_timeout(Duration::from_secs(2)).expect("closure ran");
        assert_eq!(observed, 2);
    }

    #[test]
    fn delayed_closure_runs_after_its_deadline_and_can_be_canceled() {
        let manager = WorkerThreadManager::new(1).expect("manager");
        let (tx, rx) = channel();
        let handle = manager
            .run_delayed_closure(0, "test::delayed", Duration::from_millis(20), Box::new(move |_ctx| {
                tx.send(()).unwrap();
            }))
            .expect("post");
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        handle.cancel(); // already ran; cancel after the fact is a no-op

        let (tx2, rx2) = channel();
        let handle2 = manager
            .run_delayed_closure(0, "test::canceled", Duration::from_millis(200), Box::new(move |_ctx| {
                tx2.send(()).unwrap();
            }))
            .expect("post");
        handle2.cancel();
        assert!(rx2.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn periodic_closure_fires_more_than_once_then_can_be_unregistered() {
        let manager = WorkerThreadManager::new(1).expect("manager");
        let (tx, rx) = channel();
        let id = manager
            .register_periodic(0, "test::periodic", Duration::from_millis(10), Box::new(move |_ctx| {
                let _ = tx.send(());
            }))
            .expect("register");

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

        manager.unregister_periodic(0, id).expect("unregister");
    }
}
