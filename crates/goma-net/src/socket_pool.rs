//! Socket/address pool (spec §4.C).
//!
//! Grounded on `socket_pool.h`'s `SocketPool`: resolve once, keep a vector
//! of candidate addresses each stamped with its last error time, round-robin
//! past cooled-down ones, and recycle idle connected sockets keyed by the
//! time they were released.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::NetError;

/// How long an address that just failed is skipped in favor of others.
const ERROR_COOLDOWN: Duration = Duration::from_secs(15);
/// How long an idle socket may sit in the recycle queue before it's no
/// longer offered back (avoids handing out a connection the peer may have
/// already timed out).
const IDLE_SOCKET_MAX_AGE: Duration = Duration::from_secs(55);
const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_CAP_MULTIPLIER: u32 = 128;
const CONNECT_DEADLINE: Duration = Duration::from_secs(600);

struct AddrEntry {
    addr: std::net::SocketAddr,
    last_error: Option<Instant>,
}

impl AddrEntry {
    fn cooled_down(&self) -> bool {
        match self.last_error {
            Some(t) => t.elapsed() < ERROR_COOLDOWN,
            None => false,
        }
    }
}

struct Inner {
    addrs: Vec<AddrEntry>,
    /// Index into `addrs` of the address last used, so the next attempt
    /// round-robins forward rather than always retrying index 0.
    cursor: usize,
    idle: VecDeque<(TcpStream, usize, Instant)>,
}

/// A connected, pool-owned socket. `release_socket`/`close_socket` consume
/// it; dropping it without either marks its address errored, same as
/// `close_socket(_, true)` would.
pub struct PooledSocket {
    stream: Option<TcpStream>,
    addr_index: usize,
    pool: Weak<SocketPool>,
}

impl PooledSocket {
    pub fn stream(&self) -> &TcpStream {
        self.stream.as_ref().expect("stream taken")
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream taken")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if self.stream.is_some() {
            warn!("PooledSocket dropped without release_socket/close_socket; treating as error close");
            if let Some(pool) = self.pool.upgrade() {
                pool.mark_error(self.addr_index);
            }
        }
    }
}

pub struct SocketPool {
    host: String,
    port: u16,
    inner: Mutex<Inner>,
}

impl SocketPool {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, NetError> {
        let host = host.into();
        let addrs = resolve(&host, port)?;
        Ok(SocketPool {
            host,
            port,
            inner: Mutex::new(Inner { addrs, cursor: 0, idle: VecDeque::new() }),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn number_of_addresses(&self) -> usize {
        self.inner.lock().expect("socket pool mutex poisoned").addrs.len()
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().expect("socket pool mutex poisoned");
        format!(
            "SocketPool{{host={}:{}, addrs={}, idle={}}}",
            self.host,
            self.port,
            inner.addrs.len(),
            inner.idle.len()
        )
    }

    /// Returns a connected, non-blocking, close-on-exec socket. Reuses an
    /// idle socket if one is fresh enough; otherwise dials an address whose
    /// cooldown has elapsed, retrying `ECONNREFUSED` with jittered
    /// exponential backoff up to [`CONNECT_DEADLINE`].
    pub fn new_socket(self: &Arc<Self>) -> Result<PooledSocket, NetError> {
        if let Some(reused) = self.take_fresh_idle() {
            return Ok(reused);
        }

        let deadline = Instant::now() + CONNECT_DEADLINE;
        let mut backoff = Backoff::new(CONNECT_BACKOFF_BASE, CONNECT_BACKOFF_CAP_MULTIPLIER);

        loop {
            let attempt = self.next_attempt_index();
            let Some(index) = attempt else {
                return Err(NetError::AllAddressesCooledDown);
            };
            let addr = self.inner.lock().expect("socket pool mutex poisoned").addrs[index].addr;

            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    set_close_on_exec(&stream);
                    return Ok(PooledSocket { stream: Some(stream), addr_index: index, pool: Arc::downgrade(self) });
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    if Instant::now() >= deadline {
                        self.mark_error(index);
                        return Err(NetError::ConnectTimeout(CONNECT_DEADLINE));
                    }
                    debug!(%addr, "connection refused, backing off before retry");
                    std::thread::sleep(backoff.next_delay());
                }
                Err(err) => {
                    self.mark_error(index);
                    return Err(NetError::Io(err));
                }
            }
        }
    }

    /// Puts a socket back into the idle recycle queue.
    pub fn release_socket(&self, mut socket: PooledSocket) {
        if let Some(stream) = socket.stream.take() {
            let mut inner = self.inner.lock().expect("socket pool mutex poisoned");
            inner.idle.push_back((stream, socket.addr_index, Instant::now()));
        }
    }

    /// Closes a socket, optionally stamping its address as failed so it's
    /// skipped for the next [`ERROR_COOLDOWN`] window.
    pub fn close_socket(&self, mut socket: PooledSocket, had_error: bool) {
        let addr_index = socket.addr_index;
        socket.stream = None;
        if had_error {
            self.mark_error(addr_index);
        }
    }

    fn take_fresh_idle(self: &Arc<Self>) -> Option<PooledSocket> {
        let mut inner = self.inner.lock().expect("socket pool mutex poisoned");
        while let Some((stream, addr_index, released_at)) = inner.idle.pop_front() {
            if released_at.elapsed() < IDLE_SOCKET_MAX_AGE {
                return Some(PooledSocket { stream: Some(stream), addr_index, pool: Arc::downgrade(self) });
            }
        }
        None
    }

    /// Picks the next address in round-robin order whose cooldown has
    /// elapsed, or `None` if every address is currently cooled down.
    fn next_attempt_index(&self) -> Option<usize> {
        let mut inner = self.inner.lock().expect("socket pool mutex poisoned");
        let n = inner.addrs.len();
        if n == 0 {
            return None;
        }
        for step in 0..n {
            let idx = (inner.cursor + step) % n;
            if !inner.addrs[idx].cooled_down() {
                inner.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn mark_error(&self, addr_index: usize) {
        let mut inner = self.inner.lock().expect("socket pool mutex poisoned");
        if let Some(entry) = inner.addrs.get_mut(addr_index) {
            entry.last_error = Some(Instant::now());
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<AddrEntry>, NetError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolution(host.to_string()))?
        .map(|addr| AddrEntry { addr, last_error: None })
        .collect();
    if addrs.is_empty() {
        return Err(NetError::Resolution(host.to_string()));
    }
    Ok(addrs)
}

#[cfg(unix)]
fn set_close_on_exec(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[cfg(not(unix))]
fn set_close_on_exec(_stream: &TcpStream) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn new_socket_connects_to_a_listening_loopback_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let pool = Arc::new(SocketPool::new(addr.ip().to_string(), addr.port()).expect("pool"));

        let socket = pool.new_socket().expect("connect");
        assert!(socket.stream().set_nodelay(true).is_ok());
        pool.release_socket(socket);
    }

    #[test]
    fn release_then_new_socket_reuses_the_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let pool = Arc::new(SocketPool::new(addr.ip().to_string(), addr.port()).expect("pool"));

        let first = pool.new_socket().expect("connect");
        let first_local_port = first.stream().local_addr().unwrap().port();
        pool.release_socket(first);

        let second = pool.new_socket().expect("connect");
        assert_eq!(second.stream().local_addr().unwrap().port(), first_local_port);
    }

    #[test]
    fn close_socket_with_error_marks_address_as_cooled_down() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let pool = Arc::new(SocketPool::new(addr.ip().to_string(), addr.port()).expect("pool"));

        let socket = pool.new_socket().expect("connect");
        pool.close_socket(socket, true);

        assert!(pool.inner.lock().unwrap().addrs[0].cooled_down());
    }

    #[test]
    fn dropping_a_socket_without_release_marks_its_address_as_cooled_down() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let pool = Arc::new(SocketPool::new(addr.ip().to_string(), addr.port()).expect("pool"));

        let socket = pool.new_socket().expect("connect");
        drop(socket);

        assert!(pool.inner.lock().unwrap().addrs[0].cooled_down());
    }
}
