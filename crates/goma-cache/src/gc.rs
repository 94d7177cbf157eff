//! Garbage collector thread (spec §4.G): sleeps on a condition variable,
//! wakes on `save()` crossing a threshold, evicts the insertion-ordered
//! head (oldest mtime / least recently used) until both counters are back
//! under their thresholds.
//!
//! An `Arc<(Mutex<_>, Condvar)>` pair, one dedicated named thread,
//! `notify_one` on state change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info};

use crate::store::Shared;

pub(crate) struct GcSignal {
    pub(crate) wake: Mutex<bool>,
    pub(crate) cvar: Condvar,
    pub(crate) shutdown: AtomicBool,
}

impl GcSignal {
    pub(crate) fn new() -> Self {
        GcSignal { wake: Mutex::new(false), cvar: Condvar::new(), shutdown: AtomicBool::new(false) }
    }

    pub(crate) fn wake_gc(&self) {
        *self.wake.lock().expect("gc signal mutex poisoned") = true;
        self.cvar.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_gc();
    }
}

/// Spawns the collector thread. `shared` must already reflect the
/// completed startup scan (the collector never runs during it).
pub(crate) fn spawn(shared: Arc<Shared>, signal: Arc<GcSignal>) {
    std::thread::Builder::new()
        .name("goma-cache-gc".into())
        .spawn(move || run(&shared, &signal))
        .expect("failed to spawn local output cache GC thread");
}

fn run(shared: &Arc<Shared>, signal: &GcSignal) {
    loop {
        {
            let mut woken = signal.wake.lock().expect("gc signal mutex poisoned");
            while !*woken {
                woken = signal.cvar.wait(woken).expect("gc signal mutex poisoned");
            }
            *woken = false;
        }
        if signal.shutdown.load(Ordering::SeqCst) {
            return;
        }
        collect(shared);
    }
}

fn collect(shared: &Shared) {
    let mut evicted = 0usize;
    loop {
        let mut index = shared.index.lock().expect("local output cache index poisoned");
        if index.bytes_total <= shared.threshold_bytes && index.cache.len() <= shared.threshold_items {
            break;
        }
        let Some((key, path, size)) = index.pop_oldest() else { break };
        index.bytes_total = index.bytes_total.saturating_sub(size);
        drop(index);
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(key, error = %err, "gc: cache entry already gone on disk");
        }
        evicted += 1;
    }
    if evicted > 0 {
        info!(evicted, "local output cache garbage collection pass complete");
    }
}
