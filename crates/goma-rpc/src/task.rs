//! The RPC `Task` state machine (spec §3 "Rpc task state", §4.E lifecycle).
//!
//! A `Task` drives one request/response exchange through the reactor: wait
//! for an access token, wait out any throttle window, obtain a socket,
//! optionally wrap it in TLS, write the request, read the response, and
//! run an at-most-once completion callback with the resulting [`Status`].
//!
//! Connect is the one place this module steps outside the reactor: like
//! `oauth2.rs`'s refresh round trip, `SocketPool::new_socket` does its own
//! blocking retry-with-backoff loop, so it runs on a throwaway thread and
//! posts back into the owning worker rather than stalling that worker's
//! run loop for up to the 10-minute connect deadline.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

use goma_net::{PooledSocket, SocketPool, TlsContextRegistry, TlsEngine};
use goma_proto::{ErrorKind, SizeBreakdown, Status, Timing};
use goma_worker::{DescriptorCallbacks, DescriptorId, Interest, Priority, WorkerThreadManager};

use crate::compression;
use crate::error::RpcError;
use crate::health::{throttle_retry_delay, HealthState};
use crate::oauth2::OAuth2RefreshTask;
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Total time a task will wait for an OAuth2 refresh before giving up
/// (spec §4.E step 2).
const TOKEN_WAIT_CAP: Duration = Duration::from_secs(5 * 60);
/// Total time a task will spend backing off behind the throttle counter
/// (spec §4.E step 3).
const THROTTLE_WAIT_CAP: Duration = Duration::from_secs(10 * 60);
const CONNECT_RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Pending,
    SendingRequest,
    RequestSent,
    ReceivingResponse,
    ResponseReceived,
}

pub type CompletionFn = Box<dyn FnOnce(Status, Option<Vec<u8>>) + Send>;

/// Tracks request-rate and server-error-rate over a short sliding window
/// to decide whether new requests should back off (spec §4.E step 3
/// "server-side error rate or per-second request cap").
pub struct ThrottleCounter {
    window: Duration,
    max_per_window: u32,
    error_fraction_trip: f64,
    recent: Mutex<VecDeque<(Instant, bool)>>,
}

impl ThrottleCounter {
    pub fn new(window: Duration, max_per_window: u32, error_fraction_trip: f64) -> Self {
        ThrottleCounter { window, max_per_window, error_fraction_trip, recent: Mutex::new(VecDeque::new()) }
    }

    fn record(&self, was_error: bool) {
        let mut recent = self.recent.lock().expect("throttle counter mutex poisoned");
        let now = Instant::now();
        recent.push_back((now, was_error));
        while recent.front().map(|(t, _)| now.duration_since(*t) > self.window).unwrap_or(false) {
            recent.pop_front();
        }
    }

    pub fn record_success(&self) {
        self.record(false);
    }

    pub fn record_error(&self) {
        self.record(true);
    }

    pub fn should_throttle(&self) -> bool {
        let recent = self.recent.lock().expect("throttle counter mutex poisoned");
        if recent.len() as u32 > self.max_per_window {
            return true;
        }
        if recent.is_empty() {
            return false;
        }
        let errors = recent.iter().filter(|(_, e)| *e).count() as f64;
        errors / recent.len() as f64 >= self.error_fraction_trip
    }
}

impl Default for ThrottleCounter {
    fn default() -> Self {
        ThrottleCounter::new(Duration::from_secs(1), 50, 0.5)
    }
}

/// A reactor-driven HTTP client bound to one destination (spec §4.E).
pub struct HttpClient {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    socket_pool: Arc<SocketPool>,
    tls_registry: Option<Arc<TlsContextRegistry>>,
    workers: Arc<WorkerThreadManager>,
    oauth2: Option<Arc<OAuth2RefreshTask>>,
    health: Mutex<HealthState>,
    throttle: ThrottleCounter,
    fail_now: std::sync::atomic::AtomicBool,
    next_descriptor_id: AtomicUsize,
    request_side_compression_disabled: std::sync::atomic::AtomicBool,
}

impl HttpClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        use_tls: bool,
        workers: Arc<WorkerThreadManager>,
        oauth2: Option<Arc<OAuth2RefreshTask>>,
    ) -> Result<Arc<Self>, RpcError> {
        let host = host.into();
        let socket_pool = Arc::new(SocketPool::new(host.clone(), port)?);
        let tls_registry = if use_tls {
            Some(Arc::new(TlsContextRegistry::new(std::env::temp_dir().join("goma-crl-cache"))))
        } else {
            None
        };
        Ok(Arc::new(HttpClient {
            host,
            port,
            use_tls,
            socket_pool,
            tls_registry,
            workers,
            oauth2,
            health: Mutex::new(HealthState::new(Duration::from_secs(1), Duration::from_secs(60), true)),
            throttle: ThrottleCounter::default(),
            fail_now: std::sync::atomic::AtomicBool::new(false),
            next_descriptor_id: AtomicUsize::new(1),
            request_side_compression_disabled: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    pub fn fail_now(&self) -> bool {
        self.fail_now.load(Ordering::SeqCst)
            || self.health.lock().expect("health mutex poisoned").fail_now(Instant::now())
    }

    /// Shuts the client down: in-flight tasks fail at their next suspension
    /// point (spec §5 "Cancellation").
    pub fn shutdown(&self) {
        self.fail_now.store(true, Ordering::SeqCst);
        if let Some(oauth2) = &self.oauth2 {
            oauth2.shutdown();
        }
    }

    pub fn health_string(&self) -> goma_proto::HealthStatus {
        self.health.lock().expect("health mutex poisoned").status_string(Instant::now())
    }

    fn request_compression_disabled(&self) -> bool {
        self.request_side_compression_disabled.load(Ordering::SeqCst)
    }

    /// Starts a ping task: a distinguished request with no body, used for
    /// health probing (spec §4.E "Ping").
    pub fn ping(self: &Arc<Self>, worker_id: usize, path: &str, on_complete: impl FnOnce(Status) + Send + 'static) {
        let request = HttpRequest::new(crate::request::Method::Get, path, self.host.clone());
        self.execute(worker_id, request, vec![Duration::from_secs(10)], true, Box::new(move |status, _body| on_complete(status)));
    }

    /// Starts an RPC task (spec §4.E "Task lifecycle").
    pub fn execute(
        self: &Arc<Self>,
        worker_id: usize,
        mut request: HttpRequest,
        deadlines: Vec<Duration>,
        is_ping: bool,
        on_complete: CompletionFn,
    ) {
        if self.fail_now() {
            on_complete(Status::fail("client is in fail-now state"), None);
            return;
        }

        if !is_ping && !self.request_compression_disabled() {
            request.accept_encoding = compression::CLIENT_ENCODINGS.to_vec();
        }

        let task = Arc::new(Mutex::new(Task {
            client: Arc::clone(self),
            worker_id,
            request,
            deadlines: VecDeque::from(deadlines),
            state: TaskState::Init,
            socket: None,
            tls: None,
            descriptor_id: DescriptorId(0),
            write_buf: Vec::new(),
            response: HttpResponse::new(),
            connect_attempts: 0,
            is_ping,
            started_at: Instant::now(),
            throttle_started_at: None,
            token_wait_started_at: None,
            on_complete: Some(on_complete),
        }));

        Self::await_token(task);
    }

    fn await_token(task: Arc<Mutex<Task>>) {
        let client = Arc::clone(&task.lock().expect("task mutex poisoned").client);
        let worker_id = task.lock().expect("task mutex poisoned").worker_id;

        let Some(oauth2) = client.oauth2.clone() else {
            Self::check_throttle(task);
            return;
        };

        if !oauth2.should_refresh() {
            let auth = oauth2.get_authorization();
            if !auth.is_empty() {
                task.lock().expect("task mutex poisoned").request.authorization = Some(auth);
            }
            Self::check_throttle(task);
            return;
        }

        {
            let mut guard = task.lock().expect("task mutex poisoned");
            guard.token_wait_started_at.get_or_insert(Instant::now());
        }

        let continuation_task = Arc::clone(&task);
        let oauth2_for_closure = Arc::clone(&oauth2);
        oauth2.run_after_refresh(
            worker_id,
            Box::new(move |_ctx, result| {
                let waited_too_long = {
                    let guard = continuation_task.lock().expect("task mutex poisoned");
                    guard.token_wait_started_at.map(|t| t.elapsed() > TOKEN_WAIT_CAP).unwrap_or(false)
                };
                if waited_too_long {
                    Task::finish(continuation_task, Status::timeout("waited longer than 5 minutes for an access token"), None);
                    return;
                }
                if let Err(err) = result {
                    let _ = err;
                    Task::finish(continuation_task, Status::timeout("oauth2 refresh failed"), None);
                    return;
                }
                let auth = oauth2_for_closure.get_authorization();
                if !auth.is_empty() {
                    continuation_task.lock().expect("task mutex poisoned").request.authorization = Some(auth);
                }
                HttpClient::check_throttle(continuation_task);
            }),
        );
    }

    fn check_throttle(task: Arc<Mutex<Task>>) {
        let (client, worker_id) = {
            let guard = task.lock().expect("task mutex poisoned");
            (Arc::clone(&guard.client), guard.worker_id)
        };

        if !client.throttle.should_throttle() {
            Self::connect(task);
            return;
        }

        let backoff = client.health.lock().expect("health mutex poisoned").backoff();
        let delay = throttle_retry_delay(backoff);

        let waited_too_long = {
            let mut guard = task.lock().expect("task mutex poisoned");
            let started = *guard.throttle_started_at.get_or_insert(Instant::now());
            started.elapsed() + delay > THROTTLE_WAIT_CAP
        };
        if waited_too_long {
            Task::finish(task, Status::timeout("throttled for longer than the 10-minute cap"), None);
            return;
        }

        let retry_task = Arc::clone(&task);
        let _ = client.workers.run_delayed_closure(
            worker_id,
            "rpc::task::throttle_retry",
            delay,
            Box::new(move |_ctx| HttpClient::check_throttle(retry_task)),
        );
    }

    /// Obtains a descriptor via the socket pool on a throwaway thread (see
    /// module docs), then resumes this task on its own worker.
    fn connect(task: Arc<Mutex<Task>>) {
        let (client, worker_id, is_ping) = {
            let mut guard = task.lock().expect("task mutex poisoned");
            guard.state = TaskState::Pending;
            (Arc::clone(&guard.client), guard.worker_id, guard.is_ping)
        };

        let retry_budget = (client.socket_pool.number_of_addresses() as u32).min(5);
        let attempt_task = Arc::clone(&task);
        let workers = Arc::clone(&client.workers);

        std::thread::Builder::new()
            .name("goma-rpc-connect".into())
            .spawn(move || {
                let result = client.socket_pool.new_socket();
                let _ = workers.run_closure_in_thread(
                    worker_id,
                    "rpc::task::connect_result",
                    Priority::High,
                    Box::new(move |_ctx| match result {
                        Ok(socket) => HttpClient::on_connected(attempt_task, socket),
                        Err(err) => {
                            let attempts = {
                                let mut guard = attempt_task.lock().expect("task mutex poisoned");
                                guard.connect_attempts += 1;
                                guard.connect_attempts
                            };
                            if is_ping || attempts >= retry_budget.max(1) {
                                Task::finish(attempt_task, Status::fail(format!("connect failed: {err}")), None);
                            } else {
                                let backoff = CONNECT_RETRY_BACKOFF_BASE * attempts;
                                let retry_worker = worker_id;
                                let retry_task = Arc::clone(&attempt_task);
                                debug!(attempts, "rpc connect retrying after backoff");
                                HttpClient::schedule_connect_retry(retry_task, retry_worker, backoff);
                            }
                        }
                    }),
                );
            })
            .expect("failed to spawn rpc connect thread");
    }

    fn schedule_connect_retry(task: Arc<Mutex<Task>>, worker_id: usize, delay: Duration) {
        let client = Arc::clone(&task.lock().expect("task mutex poisoned").client);
        let _ = client.workers.run_delayed_closure(
            worker_id,
            "rpc::task::connect_retry",
            delay,
            Box::new(move |_ctx| HttpClient::connect(task)),
        );
    }

    fn on_connected(task: Arc<Mutex<Task>>, socket: PooledSocket) {
        let (client, use_tls, host) = {
            let guard = task.lock().expect("task mutex poisoned");
            (Arc::clone(&guard.client), guard.client.use_tls, guard.client.host.clone())
        };

        let tls = if use_tls {
            match client.tls_registry.as_ref().expect("use_tls implies a registry").get_or_create(&host) {
                Ok(ctx) => match TlsEngine::new(&ctx, &host) {
                    Ok(engine) => Some(engine),
                    Err(err) => {
                        Task::finish(task, Status::fail(format!("tls engine init failed: {err}")), None);
                        return;
                    }
                },
                Err(err) => {
                    Task::finish(task, Status::fail(format!("tls context unavailable: {err}")), None);
                    return;
                }
            }
        } else {
            None
        };

        {
            let mut guard = task.lock().expect("task mutex poisoned");
            let id = DescriptorId(guard.client.next_descriptor_id.fetch_add(1, Ordering::Relaxed));
            guard.descriptor_id = id;
            guard.socket = Some(socket);
            guard.tls = tls;
            guard.state = TaskState::SendingRequest;
        }

        Task::drive_write(task);
    }
}

struct Task {
    client: Arc<HttpClient>,
    worker_id: usize,
    request: HttpRequest,
    /// Successive per-phase deadlines (spec §5 "Timeouts"): connect,
    /// header receipt, and so on; popped as each phase completes.
    deadlines: VecDeque<Duration>,
    state: TaskState,
    socket: Option<PooledSocket>,
    tls: Option<TlsEngine>,
    descriptor_id: DescriptorId,
    write_buf: Vec<u8>,
    response: HttpResponse,
    connect_attempts: u32,
    is_ping: bool,
    started_at: Instant,
    throttle_started_at: Option<Instant>,
    token_wait_started_at: Option<Instant>,
    on_complete: Option<CompletionFn>,
}

impl Task {
    /// Raw fd of the connected socket, used to register with the reactor
    /// via `SourceFd` rather than transferring ownership into a
    /// `mio::net::TcpStream` (spec §9: the descriptor is owned by the
    /// worker, the fd itself stays owned by the pooled socket).
    fn raw_fd(&self) -> i32 {
        self.socket.as_ref().expect("socket connected before registration").stream().as_raw_fd()
    }

    fn drive_write(task: Arc<Mutex<Task>>) {
        let pending_plaintext = {
            let mut guard = task.lock().expect("task mutex poisoned");
            if guard.write_buf.is_empty() {
                let wire = match guard.request.to_wire_bytes() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        drop(guard);
                        Task::finish(task, Status::fail(format!("failed to serialize request: {err}")), None);
                        return;
                    }
                };
                guard.write_buf = wire;
            }
            guard.tls.is_none()
        };

        if pending_plaintext {
            Task::pump_plaintext_write(task);
        } else {
            Task::pump_tls_write(task);
        }
    }

    fn pump_plaintext_write(task: Arc<Mutex<Task>>) {
        let worker_id;
        let client;
        let done;
        {
            let mut guard = task.lock().expect("task mutex poisoned");
            worker_id = guard.worker_id;
            client = Arc::clone(&guard.client);
            loop {
                if guard.write_buf.is_empty() {
                    break;
                }
                let buf = guard.write_buf.clone();
                let write_result = guard.socket.as_ref().expect("connected").stream().write(&buf);
                match write_result {
                    Ok(0) => break,
                    Ok(n) => {
                        guard.write_buf.drain(..n);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        drop(guard);
                        Task::finish(task, Status::fail(format!("write failed: {err}")), None);
                        return;
                    }
                }
            }
            done = guard.write_buf.is_empty();
        }

        if done {
            Task::on_request_sent(task);
            return;
        }

        let fd = task.lock().expect("task mutex poisoned").raw_fd();
        let id = task.lock().expect("task mutex poisoned").descriptor_id;
        let continuation = Arc::clone(&task);
        let registered = client.workers.run_closure_in_thread(
            worker_id,
            "rpc::task::register_writable",
            Priority::High,
            Box::new(move |ctx| {
                let mut source = SourceFd(&fd);
                let _ = ctx.register_descriptor(
                    id,
                    &mut source,
                    Interest::WRITABLE,
                    Priority::High,
                    DescriptorCallbacks::writable(Box::new(move |_ctx| {
                        Task::pump_plaintext_write(continuation)
                    })),
                );
            }),
        );
        if registered.is_err() {
            Task::finish(task, Status::fail("failed to register descriptor for write"), None);
        }
    }

    fn pump_tls_write(task: Arc<Mutex<Task>>) {
        let (plaintext, worker_id, client) = {
            let guard = task.lock().expect("task mutex poisoned");
            (guard.write_buf.clone(), guard.worker_id, Arc::clone(&guard.client))
        };

        {
            let mut guard = task.lock().expect("task mutex poisoned");
            if !plaintext.is_empty() {
                match guard.tls.as_mut().expect("tls engine present").write(&plaintext) {
                    Ok(n) => {
                        guard.write_buf.drain(..n);
                    }
                    Err(goma_net::NetError::WantWrite) => {}
                    Err(err) => {
                        drop(guard);
                        Task::finish(task, Status::fail(format!("tls write failed: {err}")), None);
                        return;
                    }
                }
            }
            let ciphertext = guard.tls.as_mut().expect("tls engine present").get_bytes_to_send();
            if !ciphertext.is_empty() {
                if let Err(err) = guard.socket.as_ref().expect("connected").stream().write_all(&ciphertext) {
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        drop(guard);
                        Task::finish(task, Status::fail(format!("tls transport write failed: {err}")), None);
                        return;
                    }
                }
            }
        }

        let done = task.lock().expect("task mutex poisoned").write_buf.is_empty();
        if done {
            Task::on_request_sent(task);
            return;
        }

        let fd = task.lock().expect("task mutex poisoned").raw_fd();
        let id = task.lock().expect("task mutex poisoned").descriptor_id;
        let continuation = Arc::clone(&task);
        let _ = client.workers.run_closure_in_thread(
            worker_id,
            "rpc::task::register_tls_writable",
            Priority::High,
            Box::new(move |ctx| {
                let mut source = SourceFd(&fd);
                let _ = ctx.register_descriptor(
                    id,
                    &mut source,
                    Interest::WRITABLE,
                    Priority::High,
                    DescriptorCallbacks::writable(Box::new(move |_ctx| Task::pump_tls_write(continuation))),
                );
            }),
        );
    }

    fn on_request_sent(task: Arc<Mutex<Task>>) {
        {
            let mut guard = task.lock().expect("task mutex poisoned");
            guard.state = TaskState::RequestSent;
            guard.deadlines.pop_front();
            guard.state = TaskState::ReceivingResponse;
        }
        Task::pump_read(task, None);
    }

    /// `first_byte_at` is set the moment any response byte arrives, so the
    /// read-timeout (spec §4.E step 6) only starts ticking from there.
    fn pump_read(task: Arc<Mutex<Task>>, first_byte_at: Option<Instant>) {
        let (worker_id, client, use_tls) = {
            let guard = task.lock().expect("task mutex poisoned");
            (guard.worker_id, Arc::clone(&guard.client), guard.tls.is_some())
        };

        let mut buf = [0u8; 16 * 1024];
        let (read_result, new_first_byte_at) = {
            let mut guard = task.lock().expect("task mutex poisoned");
            let result = if use_tls {
                match guard.tls.as_mut().expect("tls present").read(&mut buf) {
                    Ok(n) => Ok(n),
                    Err(goma_net::NetError::WantRead) => Err(std::io::ErrorKind::WouldBlock.into()),
                    Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())),
                }
            } else {
                guard.socket.as_ref().expect("connected").stream().read(&mut buf)
            };
            let stamped = if result.as_ref().map(|n| *n > 0).unwrap_or(false) {
                Some(first_byte_at.unwrap_or_else(Instant::now))
            } else {
                first_byte_at
            };
            (result, stamped)
        };

        match read_result {
            Ok(0) => {
                let content_length_known = task.lock().expect("task mutex poisoned").response.status().is_some();
                if content_length_known && task.lock().expect("task mutex poisoned").response.is_complete() {
                    Task::on_response_complete(task);
                } else {
                    Task::finish(task, Status::fail("peer closed connection before response completed"), None);
                }
            }
            Ok(n) => {
                let (complete, parse_err) = {
                    let mut guard = task.lock().expect("task mutex poisoned");
                    match guard.response.feed(&buf[..n]) {
                        Ok(()) => (guard.response.is_complete(), None),
                        Err(err) => (false, Some(err)),
                    }
                };
                if let Some(err) = parse_err {
                    Task::finish(task, Status::fail(format!("malformed response: {err}")), None);
                    return;
                }
                if complete {
                    Task::on_response_complete(task);
                } else {
                    Task::pump_read(task, new_first_byte_at);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Task::arm_read_wait(task, worker_id, client, new_first_byte_at);
            }
            Err(err) => {
                Task::finish(task, Status::fail(format!("read failed: {err}")), None);
            }
        }
    }

    fn arm_read_wait(task: Arc<Mutex<Task>>, worker_id: usize, client: Arc<HttpClient>, first_byte_at: Option<Instant>) {
        let fd = task.lock().expect("task mutex poisoned").raw_fd();
        let id = task.lock().expect("task mutex poisoned").descriptor_id;

        let deadline = first_byte_at.map(|t| t + task.lock().expect("task mutex poisoned").read_timeout_budget());

        let continuation = Arc::clone(&task);
        let timeout_task = Arc::clone(&task);
        let _ = client.workers.run_closure_in_thread(
            worker_id,
            "rpc::task::register_readable",
            Priority::High,
            Box::new(move |ctx| {
                let mut source = SourceFd(&fd);
                let callbacks = DescriptorCallbacks {
                    on_readable: Some(Box::new(move |_ctx| Task::pump_read(continuation, first_byte_at))),
                    on_writable: None,
                    on_timeout: Some(Box::new(move |_ctx| {
                        Task::finish(timeout_task, Status::timeout("response read-timeout elapsed"), None)
                    })),
                };
                let _ = ctx.register_descriptor(id, &mut source, Interest::READABLE, Priority::High, callbacks);
                if let Some(deadline) = deadline {
                    ctx.set_read_timeout(id, Priority::High, deadline);
                }
            }),
        );
    }

    /// Base read-timeout plus an estimate of remaining transfer time if the
    /// response declared a large `Content-Length` (spec §4.E step 6: "the
    /// per-read timeout adapts by adding an estimated receive-time based on
    /// historical throughput"). A conservative fixed floor stands in for
    /// the historical-throughput estimator; bytes already buffered are
    /// assumed to cost `ASSUMED_BYTES_PER_SEC` apiece.
    fn read_timeout_budget(&self) -> Duration {
        const BASE: Duration = Duration::from_secs(30);
        const ASSUMED_BYTES_PER_SEC: u64 = 1_000_000;
        let extra_secs = self.response.declared_len().map(|len| len as u64 / ASSUMED_BYTES_PER_SEC).unwrap_or(0);
        BASE + Duration::from_secs(extra_secs)
    }

    fn on_response_complete(task: Arc<Mutex<Task>>) {
        let (client, status_code, accept_encoding_header, body, socket, worker_id, started_at, request_compressed) = {
            let mut guard = task.lock().expect("task mutex poisoned");
            guard.state = TaskState::ResponseReceived;
            let body = guard.response.body().ok();
            let status_code = guard.response.status();
            let accept_encoding_header = guard.response.accept_encoding_header().map(str::to_string);
            let socket = guard.socket.take();
            let worker_id = guard.worker_id;
            let started_at = guard.started_at;
            let request_compressed = guard.request.content_encoding.is_some();
            (Arc::clone(&guard.client), status_code, accept_encoding_header, body, socket, worker_id, started_at, request_compressed)
        };

        let descriptor_id = task.lock().expect("task mutex poisoned").descriptor_id;
        let _ = client.workers.run_closure_in_thread(
            worker_id,
            "rpc::task::unregister_descriptor",
            Priority::High,
            Box::new(move |ctx| {
                // A released/closed socket is dropped right after, so the
                // fd this id refers to is already gone; unregister only
                // clears reactor-side bookkeeping (spec §4.A: tolerates
                // removal of an id whose source never fires again).
                let mut dummy = NoopSource;
                ctx.unregister_descriptor(descriptor_id, &mut dummy);
            }),
        );

        Task::apply_health_transition(&client, status_code, request_compressed);

        if let Some(header) = accept_encoding_header {
            if compression::negotiate(&header).is_none() && header.split(',').any(|v| v.trim() == "lzma2") {
                crate::health::warn_on_lzma2_quirk();
            }
        }
        if matches!(status_code, Some(400) | Some(415)) {
            client.request_side_compression_disabled.store(true, Ordering::SeqCst);
        }

        if let Some(socket) = socket {
            let had_error = !matches!(status_code, Some(200..=299));
            if had_error {
                client.socket_pool.close_socket(socket, true);
            } else {
                client.socket_pool.release_socket(socket);
            }
        }

        let status = match status_code {
            Some(code) if (200..300).contains(&code) => Status {
                err: ErrorKind::Ok,
                http_return_code: Some(code),
                err_message: String::new(),
                timing: Timing { total: Some(started_at.elapsed()), ..Default::default() },
                sizes: SizeBreakdown { response_bytes: body.as_ref().map(|b| b.len() as u64).unwrap_or(0), ..Default::default() },
                retry_count: 0,
            },
            Some(400) | Some(401) => Status { err: ErrorKind::IpcRejected, http_return_code: status_code, ..Default::default() },
            Some(code) => Status { err: ErrorKind::Fail, http_return_code: Some(code), err_message: format!("http {code}"), ..Default::default() },
            None => Status::fail("no status line parsed"),
        };

        client.throttle.record(status.err != ErrorKind::Ok);
        Task::finish(task, status, body);
    }

    fn apply_health_transition(client: &Arc<HttpClient>, status_code: Option<u16>, _request_compressed: bool) {
        let mut health = client.health.lock().expect("health mutex poisoned");
        let now = Instant::now();
        match status_code {
            Some(302) | Some(401) | Some(403) => health.on_rejected(now),
            Some(200) => health.on_success_200(now),
            Some(code) if (200..300).contains(&code) => health.on_success_other_2xx(),
            Some(_) => health.on_failure(),
            None => health.on_failure(),
        }
    }

    fn finish(task: Arc<Mutex<Task>>, status: Status, body: Option<Vec<u8>>) {
        let on_complete = task.lock().expect("task mutex poisoned").on_complete.take();
        if let Some(on_complete) = on_complete {
            on_complete(status, body);
        } else {
            warn!("task completion callback already consumed; ignoring duplicate terminal transition");
        }
    }

}

/// A `mio::event::Source` that does nothing, used only to satisfy
/// `Reactor::unregister`'s signature when the underlying fd has already
/// been handed back to the socket pool (or closed) by the time we clean up
/// reactor bookkeeping for its descriptor id.
struct NoopSource;

impl mio::event::Source for NoopSource {
    fn register(&mut self, _registry: &mio::Registry, _token: mio::Token, _interests: mio::Interest) -> std::io::Result<()> {
        Ok(())
    }
    fn reregister(&mut self, _registry: &mio::Registry, _token: mio::Token, _interests: mio::Interest) -> std::io::Result<()> {
        Ok(())
    }
    fn deregister(&mut self, _registry: &mio::Registry) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::mpsc::channel;

    /// Spawns a one-shot server that replies with a fixed response to the
    /// first request it receives on `listener`.
    fn serve_once(listener: TcpListener, response: &'static [u8]) {
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
            }
            let mut stream = stream;
            stream.write_all(response).expect("write response");
        });
    }

    /// Spec §8 scenario 1: ping against `HTTP/1.1 200 OK ... ok`.
    #[test]
    fn ping_ok_over_plaintext_reports_200_and_ok_health() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        serve_once(listener, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let workers = Arc::new(WorkerThreadManager::new(1).expect("workers"));
        let client = HttpClient::new(addr.ip().to_string(), addr.port(), false, workers, None).expect("client");

        let (tx, rx) = channel();
        client.ping(0, "/pingz", move |status| tx.send(status).unwrap());

        let status = rx.recv_timeout(Duration::from_secs(5)).expect("ping completed");
        assert_eq!(status.http_return_code, Some(200));
        assert_eq!(status.err, ErrorKind::Ok);
        assert_eq!(client.health_string().to_string(), "ok");
    }

    /// Spec §8 scenario 2: ping against a 401, health becomes the literal
    /// "access to backend servers was rejected." message.
    #[test]
    fn ping_401_disables_the_client_and_reports_the_rejection_message() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        serve_once(listener, b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 5\r\n\r\nerror");

        let workers = Arc::new(WorkerThreadManager::new(1).expect("workers"));
        let client = HttpClient::new(addr.ip().to_string(), addr.port(), false, workers, None).expect("client");

        let (tx, rx) = channel();
        client.ping(0, "/pingz", move |status| tx.send(status).unwrap());

        let status = rx.recv_timeout(Duration::from_secs(5)).expect("ping completed");
        assert_eq!(status.http_return_code, Some(401));
        assert_eq!(client.health_string().to_string(), "error: access to backend servers was rejected.");
    }

    #[test]
    fn throttle_counter_trips_once_error_fraction_crosses_threshold() {
        let throttle = ThrottleCounter::new(Duration::from_secs(60), 1000, 0.5);
        for _ in 0..3 {
            throttle.record_success();
        }
        assert!(!throttle.should_throttle());
        for _ in 0..5 {
            throttle.record_error();
        }
        assert!(throttle.should_throttle());
    }
}
