//! Shared, process-wide state for the local output cache: the in-memory
//! LRU index plus the byte-sum accounting the garbage collector watches.
//!
//! A `Mutex<LruCache<..>>` is the core of it; the value side carries a
//! size (for the byte-sum counter) and an on-disk path, and a second pair
//! of thresholds drives the GC wake/collect-to split.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;

pub(crate) struct EntryMeta {
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
}

pub(crate) struct Index {
    pub(crate) cache: LruCache<String, EntryMeta>,
    pub(crate) bytes_total: u64,
}

impl Index {
    pub(crate) fn new() -> Self {
        // Effectively unbounded by count here; `max_items`/`threshold_items`
        // are enforced by the GC pass, not by the LRU's own capacity.
        let cap = NonZeroUsize::new(usize::MAX).expect("usize::MAX is nonzero");
        Index { cache: LruCache::new(cap), bytes_total: 0 }
    }

    /// Removes and returns the least-recently-used entry, if any.
    pub(crate) fn pop_oldest(&mut self) -> Option<(String, PathBuf, u64)> {
        let (key, meta) = self.cache.pop_lru()?;
        Some((key, meta.path, meta.size))
    }
}

pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) max_bytes: u64,
    pub(crate) threshold_bytes: u64,
    pub(crate) max_items: usize,
    pub(crate) threshold_items: usize,
    pub(crate) index: std::sync::Mutex<Index>,
}

impl Shared {
    pub(crate) fn over_max(&self, index: &Index) -> bool {
        index.bytes_total > self.max_bytes || index.cache.len() > self.max_items
    }
}

/// `<dir>/<first-two-hex-chars>/<full-key>` (spec.md §6).
pub(crate) fn entry_path(dir: &std::path::Path, key_hex: &str) -> PathBuf {
    let prefix = &key_hex[..key_hex.len().min(2)];
    dir.join(prefix).join(key_hex)
}
