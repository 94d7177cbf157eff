//! CRL lifecycle (spec §4.D): in-memory cache, then on-disk cache under a
//! deterministic filename, then a fresh HTTP download; a destination with no
//! obtainable CRL fails closed and poisons the context briefly.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use url::Url;

use crate::error::NetError;

/// A destination that repeatedly fails to produce a valid CRL is poisoned
/// for this long, so handshakes don't hammer a dead CRL endpoint.
pub const POISON_DURATION: Duration = Duration::from_secs(60);

/// CRLs older than this are discarded even if their own `next_update`
/// hasn't passed yet (spec §4.D "older-than-max_valid_duration").
const MAX_VALID_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct CrlEntry {
    pub der: Vec<u8>,
    pub fetched_at: Instant,
}

impl CrlEntry {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() > MAX_VALID_DURATION
    }
}

struct Inner {
    memory: HashMap<String, CrlEntry>,
    poisoned_until: HashMap<String, Instant>,
}

/// Process-wide CRL cache, keyed by distribution-point URL.
pub struct CrlCache {
    disk_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl CrlCache {
    pub fn new(disk_dir: impl Into<PathBuf>) -> Self {
        CrlCache {
            disk_dir: disk_dir.into(),
            inner: Mutex::new(Inner { memory: HashMap::new(), poisoned_until: HashMap::new() }),
        }
    }

    /// True if `url`'s destination recently exhausted all three lookup
    /// steps and is still inside its poison window.
    pub fn is_poisoned(&self, url: &str) -> bool {
        let inner = self.inner.lock().expect("crl cache mutex poisoned");
        matches!(inner.poisoned_until.get(url), Some(until) if Instant::now() < *until)
    }

    /// Runs the three-step lookup in order, caching a successful result at
    /// each level it wasn't already found, and poisoning `url` if none of
    /// the three steps yields a valid CRL.
    pub fn get(&self, url: &str) -> Result<CrlEntry, NetError> {
        if let Some(entry) = self.from_memory(url) {
            return Ok(entry);
        }
        if let Some(entry) = self.from_disk(url) {
            self.store_memory(url, entry.clone());
            return Ok(entry);
        }
        match self.fetch(url) {
            Ok(entry) => {
                self.store_disk(url, &entry);
                self.store_memory(url, entry.clone());
                Ok(entry)
            }
            Err(err) => {
                warn!(url, error = %err, "CRL unobtainable from memory, disk, or network");
                let until = Instant::now() + POISON_DURATION;
                self.inner.lock().expect("crl cache mutex poisoned").poisoned_until.insert(url.to_string(), until);
                Err(NetError::ContextPoisoned(until))
            }
        }
    }

    fn from_memory(&self, url: &str) -> Option<CrlEntry> {
        let inner = self.inner.lock().expect("crl cache mutex poisoned");
        inner.memory.get(url).filter(|e| !e.is_stale()).cloned()
    }

    fn store_memory(&self, url: &str, entry: CrlEntry) {
        self.inner.lock().expect("crl cache mutex poisoned").memory.insert(url.to_string(), entry);
    }

    fn disk_path(&self, url: &str) -> PathBuf {
        let sanitized: String = url
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.disk_dir.join(format!("CRL-{sanitized}"))
    }

    fn from_disk(&self, url: &str) -> Option<CrlEntry> {
        let path = self.disk_path(url);
        let metadata = std::fs::metadata(&path).ok()?;
        let modified = metadata.modified().ok()?;
        let fetched_at = Instant::now() - modified.elapsed().unwrap_or(Duration::ZERO);
        let der = std::fs::read(&path).ok()?;
        let entry = CrlEntry { der, fetched_at };
        if entry.is_stale() {
            return None;
        }
        Some(entry)
    }

    fn store_disk(&self, url: &str, entry: &CrlEntry) {
        let path = self.disk_path(url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&path, &entry.der) {
            debug!(url, error = %err, "failed to persist CRL to disk cache");
        }
    }

    /// A deliberately minimal blocking HTTP GET: CRL distribution points
    /// are almost always plain HTTP, and pulling in the full reactor-driven
    /// client here would invert this crate's dependency on the RPC layer.
    fn fetch(&self, url: &str) -> Result<CrlEntry, NetError> {
        let parsed = Url::parse(url).map_err(|_| NetError::Resolution(url.to_string()))?;
        let host = parsed.host_str().ok_or_else(|| NetError::Resolution(url.to_string()))?;
        let port = parsed.port().unwrap_or(80);
        let path = if parsed.path().is_empty() { "/" } else { parsed.path() };

        let mut stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes())?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        let split = find_header_end(&raw).ok_or_else(|| NetError::Resolution(url.to_string()))?;
        let body = raw[split..].to_vec();
        if body.is_empty() {
            return Err(NetError::Resolution(url.to_string()));
        }
        Ok(CrlEntry { der: body, fetched_at: Instant::now() })
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[allow(dead_code)]
fn disk_cache_dir_for_tests() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_path_sanitizes_non_alphanumerics() {
        let cache = CrlCache::new(disk_cache_dir_for_tests());
        let path = cache.disk_path("http://crl.example.com/foo.crl");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("CRL-"));
        assert!(!name.contains('.'));
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn memory_roundtrips_a_fresh_entry() {
        let cache = CrlCache::new(disk_cache_dir_for_tests());
        cache.store_memory("http://x/y.crl", CrlEntry { der: vec![1, 2, 3], fetched_at: Instant::now() });
        let entry = cache.from_memory("http://x/y.crl").expect("cached entry");
        assert_eq!(entry.der, vec![1, 2, 3]);
    }

    #[test]
    fn unreachable_url_poisons_the_destination() {
        let cache = CrlCache::new(disk_cache_dir_for_tests());
        let url = "http://127.0.0.1:1/unreachable.crl";
        assert!(cache.get(url).is_err());
        assert!(cache.is_poisoned(url));
    }
}
