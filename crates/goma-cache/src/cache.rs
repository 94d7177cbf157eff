//! The local output cache itself (spec §4.G): `init`, `save`, `lookup`.
//!
//! Generalized from an in-memory-only `Mutex<LruCache<..>>` keyed by a
//! source hash to a disk-backed store keyed by a normalized-request hash,
//! bounded by both byte-sum and item-count rather than item-count alone.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use goma_proto::{ExecReq, ExecResp};

use crate::gc::{self, GcSignal};
use crate::key::derive_key;
use crate::record::Record;
use crate::store::{entry_path, EntryMeta, Index, Shared};

/// Self-imposed deadline on the startup directory walk (grounded on
/// `local_output_cache.cc`'s `kLoadCacheEntriesTimeout = absl::Seconds(1)`).
/// Past this, `init` proceeds with whatever partial listing it obtained
/// rather than blocking every caller forever on a stalled filesystem.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LocalOutputCache {
    shared: Arc<Shared>,
    signal: Arc<GcSignal>,
    ready: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

impl LocalOutputCache {
    /// Starts the background scan and GC thread, then returns immediately.
    /// Queries (`save`/`lookup`) block until the scan completes.
    pub fn init(dir: impl Into<PathBuf>, max_bytes: u64, threshold_bytes: u64, max_items: usize, threshold_items: usize) -> Arc<Self> {
        Self::init_with_timeout(dir, max_bytes, threshold_bytes, max_items, threshold_items, DEFAULT_LOAD_TIMEOUT)
    }

    pub fn init_with_timeout(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        threshold_bytes: u64,
        max_items: usize,
        threshold_items: usize,
        load_timeout: Duration,
    ) -> Arc<Self> {
        let dir = dir.into();
        let shared = Arc::new(Shared {
            dir: dir.clone(),
            max_bytes,
            threshold_bytes,
            max_items,
            threshold_items,
            index: Mutex::new(Index::new()),
        });
        let signal = Arc::new(GcSignal::new());
        let ready = Arc::new((Mutex::new(false), std::sync::Condvar::new()));

        gc::spawn(Arc::clone(&shared), Arc::clone(&signal));

        {
            let shared = Arc::clone(&shared);
            let ready = Arc::clone(&ready);
            let signal = Arc::clone(&signal);
            std::thread::Builder::new()
                .name("goma-cache-scan".into())
                .spawn(move || {
                    let over_max = scan(&shared, load_timeout);
                    *ready.0.lock().expect("local output cache ready mutex poisoned") = true;
                    ready.1.notify_all();
                    if over_max {
                        signal.wake_gc();
                    }
                })
                .expect("failed to spawn local output cache scan thread");
        }

        Arc::new(LocalOutputCache { shared, signal, ready })
    }

    fn block_until_ready(&self) {
        let guard = self.ready.0.lock().expect("local output cache ready mutex poisoned");
        let _ = self
            .ready
            .1
            .wait_while(guard, |ready| !*ready)
            .expect("local output cache ready mutex poisoned");
    }

    pub fn key_for(&self, req: &ExecReq) -> String {
        derive_key(req)
    }

    /// Write-tmp-then-rename (spec.md §3 crash safety). I/O errors are
    /// logged and the candidate dropped; they never propagate (spec §7).
    pub fn save(&self, key_hex: &str, resp: &ExecResp) {
        self.block_until_ready();

        let final_path = entry_path(&self.shared.dir, key_hex);
        let Some(parent) = final_path.parent() else { return };
        if let Err(err) = fs::create_dir_all(parent) {
            warn!(key = key_hex, error = %err, "local output cache: failed to create prefix directory");
            return;
        }

        let record = Record::from_resp(resp);
        let bytes = match bincode::serialize(&record) {
            Ok(b) => b,
            Err(err) => {
                warn!(key = key_hex, error = %err, "local output cache: failed to serialize record");
                return;
            }
        };

        let tmp_path = final_path.with_extension("tmp");
        if let Err(err) = write_then_rename(&tmp_path, &final_path, &bytes) {
            warn!(key = key_hex, error = %err, "local output cache: failed to persist entry");
            return;
        }

        let size = bytes.len() as u64;
        let over_max = {
            let mut index = self.shared.index.lock().expect("local output cache index poisoned");
            index.bytes_total += size;
            index.cache.put(key_hex.to_string(), EntryMeta { path: final_path, size });
            self.shared.over_max(&index)
        };
        if over_max {
            self.signal.wake_gc();
        }
    }

    /// Returns `None` if the key isn't in the in-memory index or the file
    /// has since been removed (spec §7: treated as a miss, never an error).
    pub fn lookup(&self, key_hex: &str) -> Option<ExecResp> {
        self.block_until_ready();

        let path = {
            let mut index = self.shared.index.lock().expect("local output cache index poisoned");
            index.cache.get(key_hex).map(|meta| meta.path.clone())
        }?;

        match fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<Record>(&bytes) {
                Ok(record) => Some(record.into_resp()),
                Err(err) => {
                    warn!(key = key_hex, error = %err, "local output cache: corrupt entry, treating as miss");
                    None
                }
            },
            Err(err) => {
                debug!(key = key_hex, error = %err, "local output cache: entry missing on disk, treating as miss");
                self.shared.index.lock().expect("local output cache index poisoned").cache.pop(key_hex);
                None
            }
        }
    }

    pub fn bytes_total(&self) -> u64 {
        self.shared.index.lock().expect("local output cache index poisoned").bytes_total
    }

    pub fn item_count(&self) -> usize {
        self.shared.index.lock().expect("local output cache index poisoned").cache.len()
    }

    pub fn shutdown(&self) {
        self.signal.shutdown();
    }
}

fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp, dest)
}

/// Walks `<dir>/<xx>/<key>` two levels deep, sorts by mtime, and populates
/// the in-memory index in mtime order (spec §4.G `init`). Bounded by
/// `load_timeout` so a stalled filesystem can't block startup forever.
fn scan(shared: &Shared, load_timeout: Duration) -> bool {
    let started = Instant::now();
    let Ok(prefixes) = fs::read_dir(&shared.dir) else {
        debug!(dir = %shared.dir.display(), "local output cache: no existing directory, starting empty");
        return false;
    };

    let mut entries: Vec<(PathBuf, String, u64, std::time::SystemTime)> = Vec::new();
    for prefix in prefixes.flatten() {
        if started.elapsed() > load_timeout {
            warn!("local output cache: startup scan timed out, proceeding with partial listing");
            break;
        }
        if !prefix.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(files) = fs::read_dir(prefix.path()) else { continue };
        for file in files.flatten() {
            if file.path().extension().map(|e| e == "tmp").unwrap_or(false) {
                continue;
            }
            let Ok(meta) = file.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            let Some(key) = file.file_name().to_str().map(str::to_string) else { continue };
            entries.push((file.path(), key, meta.len(), mtime));
        }
    }

    entries.sort_by_key(|(_, _, _, mtime)| *mtime);

    let mut index = shared.index.lock().expect("local output cache index poisoned");
    for (path, key, size, _) in entries {
        index.bytes_total += size;
        index.cache.put(key, EntryMeta { path, size });
    }
    let over_max = shared.over_max(&index);
    drop(index);

    if over_max {
        debug!("local output cache: startup scan found the store already over its max, GC will run once ready");
    }
    over_max
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use goma_proto::{ExecReq, OutputFile, RequesterInfo};

    use super::*;

    fn req() -> ExecReq {
        ExecReq {
            compiler_path: "/usr/bin/clang".into(),
            args: vec!["-c".into(), "main.cc".into()],
            cwd: "/tmp/x".into(),
            env: BTreeMap::new(),
            input_paths: vec!["main.cc".into()],
            compiler_fingerprint: "clang-18.0".into(),
            requester_info: RequesterInfo::default(),
            trace_id: "t1".into(),
        }
    }

    fn resp() -> ExecResp {
        ExecResp {
            exit_status: 0,
            stdout: b"hi".to_vec(),
            stderr: Vec::new(),
            output: vec![OutputFile { filename: "main.o".into(), content: vec![1, 2, 3], is_executable: false }],
            cache_hit: goma_proto::CacheHit::None,
        }
    }

    #[test]
    fn save_then_lookup_round_trips_and_marks_local_output_cache_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalOutputCache::init(dir.path(), 1 << 20, 1 << 19, 1000, 900);
        let key = cache.key_for(&req());

        cache.save(&key, &resp());
        let hit = cache.lookup(&key).expect("entry should be present");
        assert_eq!(hit.stdout, b"hi");
        assert_eq!(hit.output[0].filename, "main.o");
        assert_eq!(hit.cache_hit, goma_proto::CacheHit::LocalOutputCache);

        cache.shutdown();
    }

    #[test]
    fn lookup_miss_on_unknown_key_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalOutputCache::init(dir.path(), 1 << 20, 1 << 19, 1000, 900);
        assert!(cache.lookup("deadbeef").is_none());
        cache.shutdown();
    }

    #[test]
    fn save_persists_under_the_two_level_prefix_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalOutputCache::init(dir.path(), 1 << 20, 1 << 19, 1000, 900);
        let key = cache.key_for(&req());
        cache.save(&key, &resp());

        let expected = dir.path().join(&key[..2]).join(&key);
        assert!(expected.is_file(), "expected entry at {expected:?}");
        cache.shutdown();
    }

    #[test]
    fn exceeding_max_items_triggers_gc_down_to_the_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        // max_items = 3, threshold_items = 1: pushing a 4th entry must wake
        // the collector and bring the count back down to 1.
        let cache = LocalOutputCache::init(dir.path(), 1 << 20, 1 << 20, 3, 1);

        for i in 0..4 {
            let mut r = req();
            r.trace_id = format!("t{i}");
            let key = derive_key(&r);
            // Vary the key by hand since `derive_key` ignores `trace_id`.
            let key = format!("{key}{i:02x}");
            cache.save(&key, &resp());
        }

        // Give the background GC thread a moment to run its pass.
        std::thread::sleep(Duration::from_millis(200));
        assert!(cache.item_count() <= 1, "gc should have collected down to the threshold");
        cache.shutdown();
    }
}
