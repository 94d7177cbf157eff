//! OAuth2 token refresh (spec §4.E), polymorphic over a small closed set
//! of refresh-config variants (spec §9: sum type, not an open-ended
//! virtual base class with downcasts).
//!
//! The actual token-endpoint round trip is a small hand-rolled blocking
//! request on its own thread, deliberately not routed through the
//! reactor-driven `Task` machinery in this crate: refreshing a token is
//! rare (minutes apart) and happens off the worker threads entirely, so
//! paying for a second connection path here is simpler than threading a
//! `Task` through its own authorization dependency on itself.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use goma_net::Backoff;
use goma_proto::ErrorKind;
use goma_worker::{Priority, WorkerContext, WorkerThreadManager};

use crate::error::RpcError;

const OVERALL_REFRESH_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Minimum gap after a failed refresh episode before a caller is allowed
/// to trigger another one, so two callers racing `should_refresh()` right
/// after a failure don't each kick off a fresh 10s retry loop back to back.
const RETRY_BACKOFF_AFTER_FAILURE: Duration = Duration::from_secs(5);
const INVALIDATE_RATE_LIMIT: Duration = Duration::from_secs(60);
/// Refresh ahead of expiration so a concurrent request never observes a
/// token that died mid-flight (spec §4.E: "scheduled at expires_in - 120s").
const REFRESH_SKEW: Duration = Duration::from_secs(120);

/// What a waiter enqueued via [`OAuth2RefreshTask::run_after_refresh`]
/// receives once the refresh it was waiting on resolves: `Ok(())` if a
/// usable token is now held, `Err(ErrorKind::ErrTimeout)` if the refresh
/// failed for the whole overall deadline.
pub type WaiterClosure = Box<dyn FnOnce(&mut WorkerContext, Result<(), ErrorKind>) + Send>;

#[derive(Clone)]
pub enum RefreshConfig {
    /// `GCE_METADATA_HOST` override per spec.md §2 supplement; defaults to
    /// `metadata.google.internal` when absent.
    GoogleMetadata { metadata_host: String },
    ServiceAccountJwt { client_email: String, private_key_pem: String, token_uri: String, scope: String },
    UserRefreshToken { client_id: String, client_secret: String, refresh_token: String, token_uri: String },
    LuciLocalAuth { rpc_port: u16, secret: String, account_id: String },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Deserialize)]
struct LuciTokenResponse {
    access_token: String,
    expiry: Option<u64>,
}

impl RefreshConfig {
    fn perform_blocking(&self) -> Result<(String, String, Duration), RpcError> {
        match self {
            RefreshConfig::GoogleMetadata { metadata_host } => {
                let path = "/computeMetadata/v1/instance/service-accounts/default/token";
                let body = http_get(metadata_host, 80, path, &[("Metadata-Flavor", "Google")])?;
                let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
                Ok((parsed.token_type.unwrap_or_else(|| "Bearer".to_string()), parsed.access_token, Duration::from_secs(parsed.expires_in.unwrap_or(3600))))
            }
            RefreshConfig::ServiceAccountJwt { client_email, private_key_pem, token_uri, scope } => {
                let assertion = sign_jwt_assertion(client_email, private_key_pem, token_uri, scope)?;
                let form = format!(
                    "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion={assertion}"
                );
                let (host, port, path) = split_url(token_uri)?;
                let body = http_post_form(&host, port, &path, form.as_bytes())?;
                let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
                Ok((parsed.token_type.unwrap_or_else(|| "Bearer".to_string()), parsed.access_token, Duration::from_secs(parsed.expires_in.unwrap_or(3600))))
            }
            RefreshConfig::UserRefreshToken { client_id, client_secret, refresh_token, token_uri } => {
                let form = format!(
                    "grant_type=refresh_token&client_id={client_id}&client_secret={client_secret}&refresh_token={refresh_token}"
                );
                let (host, port, path) = split_url(token_uri)?;
                let body = http_post_form(&host, port, &path, form.as_bytes())?;
                let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
                Ok((parsed.token_type.unwrap_or_else(|| "Bearer".to_string()), parsed.access_token, Duration::from_secs(parsed.expires_in.unwrap_or(3600))))
            }
            RefreshConfig::LuciLocalAuth { rpc_port, secret, account_id } => {
                let payload = json!({ "scopes": ["https://www.googleapis.com/auth/userinfo.email"], "secret": secret, "account_id": account_id });
                let body = http_post_json("127.0.0.1", *rpc_port, "/rpc/LuciLocalAuthService.GetOAuthToken", &payload)?;
                let parsed: LuciTokenResponse = serde_json::from_slice(&body).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
                let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
                let remaining = parsed.expiry.map(|exp| exp.saturating_sub(now)).unwrap_or(3600);
                Ok(("Bearer".to_string(), parsed.access_token, Duration::from_secs(remaining)))
            }
        }
    }
}

fn split_url(url: &str) -> Result<(String, u16, String), RpcError> {
    let parsed = url::Url::parse(url).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| RpcError::RefreshFailed("token_uri missing host".into()))?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(443);
    Ok((host, port, parsed.path().to_string()))
}

fn sign_jwt_assertion(client_email: &str, private_key_pem: &str, token_uri: &str, scope: &str) -> Result<String, RpcError> {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    #[derive(serde::Serialize)]
    struct Claims<'a> {
        iss: &'a str,
        scope: &'a str,
        aud: &'a str,
        exp: u64,
        iat: u64,
    }

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let claims = Claims { iss: client_email, scope, aud: token_uri, exp: now + 3600, iat: now };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
    encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| RpcError::RefreshFailed(e.to_string()))
}

/// A minimal blocking plain-HTTP GET, used only for the metadata-service
/// variant which is always loopback-adjacent and never TLS (mirrors the
/// CRL fetcher's rationale in `goma-net`).
fn http_get(host: &str, port: u16, path: &str, extra_headers: &[(&str, &str)]) -> Result<Vec<u8>, RpcError> {
    let mut stream = TcpStream::connect((host, port))?;
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;
    read_http_body(&mut stream)
}

fn http_post_form(host: &str, port: u16, path: &str, body: &[u8]) -> Result<Vec<u8>, RpcError> {
    http_post(host, port, path, "application/x-www-form-urlencoded", body)
}

fn http_post_json(host: &str, port: u16, path: &str, value: &serde_json::Value) -> Result<Vec<u8>, RpcError> {
    let body = serde_json::to_vec(value).map_err(|e| RpcError::RefreshFailed(e.to_string()))?;
    http_post(host, port, path, "application/json", &body)
}

fn http_post(host: &str, port: u16, path: &str, content_type: &str, body: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut stream = TcpStream::connect((host, port))?;
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes().as_ref())?;
    request.clear();
    stream.write_all(body)?;
    read_http_body(&mut stream)
}

fn read_http_body(stream: &mut TcpStream) -> Result<Vec<u8>, RpcError> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n").ok_or_else(|| RpcError::MalformedResponse("no header terminator".into()))?;
    Ok(buf[header_end + 4..].to_vec())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    NotStarted,
    Run,
}

struct Token {
    token_type: String,
    access_token: String,
    expiry: Instant,
}

struct Inner {
    state: RefreshState,
    token: Option<Token>,
    last_invalidate: Option<Instant>,
    last_network_error: Option<Instant>,
    waiters: Vec<(usize, WaiterClosure)>,
}

/// Holds a current access token and drives its refresh (spec §3 "OAuth2
/// refresh task").
pub struct OAuth2RefreshTask {
    config: RefreshConfig,
    inner: Mutex<Inner>,
    workers: Arc<WorkerThreadManager>,
    shutting_down: AtomicBool,
}

impl OAuth2RefreshTask {
    pub fn new(config: RefreshConfig, workers: Arc<WorkerThreadManager>) -> Arc<Self> {
        Arc::new(OAuth2RefreshTask {
            config,
            inner: Mutex::new(Inner {
                state: RefreshState::NotStarted,
                token: None,
                last_invalidate: None,
                last_network_error: None,
                waiters: Vec::new(),
            }),
            workers,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// `"<type> <token>"`, or empty if no valid token is held.
    pub fn get_authorization(&self) -> String {
        let inner = self.inner.lock().expect("oauth2 task mutex poisoned");
        match &inner.token {
            Some(token) if Instant::now() < token.expiry => format!("{} {}", token.token_type, token.access_token),
            _ => String::new(),
        }
    }

    pub fn should_refresh(&self) -> bool {
        let inner = self.inner.lock().expect("oauth2 task mutex poisoned");
        let token_valid = matches!(&inner.token, Some(token) if Instant::now() < token.expiry);
        if token_valid {
            // Still usable, but force a retry if a background forced-refresh
            // has been failing for the whole overall deadline.
            return inner.last_network_error.map(|since| since.elapsed() >= OVERALL_REFRESH_DEADLINE).unwrap_or(false);
        }
        match inner.last_network_error {
            Some(since) => since.elapsed() >= RETRY_BACKOFF_AFTER_FAILURE,
            None => true,
        }
    }

    /// Enqueues `closure` to run on `worker_id` once a refresh (if any is
    /// in flight or needed) completes; runs it immediately if a valid
    /// token is already held and no refresh is due.
    pub fn run_after_refresh(self: &Arc<Self>, worker_id: usize, closure: WaiterClosure) {
        let mut inner = self.inner.lock().expect("oauth2 task mutex poisoned");
        if inner.state == RefreshState::Run {
            inner.waiters.push((worker_id, closure));
            return;
        }
        if self.should_refresh() {
            inner.state = RefreshState::Run;
            inner.waiters.push((worker_id, closure));
            drop(inner);
            self.spawn_refresh();
            return;
        }
        drop(inner);
        let _ = self.workers.run_closure_in_thread(
            worker_id,
            "oauth2::run_after_refresh",
            Priority::High,
            Box::new(move |ctx| closure(ctx, Ok(()))),
        );
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("goma-oauth2-refresh".into())
            .spawn(move || this.run_refresh())
            .expect("failed to spawn oauth2 refresh thread");
    }

    /// Retries `perform_blocking` with randomized backoff until it
    /// succeeds or `OVERALL_REFRESH_DEADLINE` elapses (spec §4.E: transient
    /// OAuth2 errors are retried with backoff, not surfaced on the first
    /// failure).
    fn run_refresh(self: &Arc<Self>) {
        let deadline = Instant::now() + OVERALL_REFRESH_DEADLINE;
        let mut backoff = Backoff::new(RETRY_BACKOFF_BASE, 8);
        let mut attempt = 0u32;
        let mut outcome = self.config.perform_blocking();
        while outcome.is_err() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempt += 1;
            let delay = backoff.next_delay().min(remaining);
            warn!(attempt, error = ?outcome.as_ref().err(), ?delay, "oauth2 refresh failed, retrying");
            std::thread::sleep(delay);
            outcome = self.config.perform_blocking();
        }

        let waiter_result;
        let waiters = {
            let mut inner = self.inner.lock().expect("oauth2 task mutex poisoned");
            match outcome {
                Ok((token_type, access_token, expires_in)) => {
                    inner.last_network_error = None;
                    waiter_result = Ok(());
                    if expires_in <= REFRESH_SKEW {
                        warn!(?expires_in, "oauth2 token expires_in too small for the refresh skew, not scheduling auto-refresh");
                        inner.token = Some(Token { token_type, access_token, expiry: Instant::now() + expires_in });
                    } else {
                        let refresh_at = expires_in - REFRESH_SKEW;
                        inner.token = Some(Token { token_type, access_token, expiry: Instant::now() + expires_in });
                        self.schedule_forced_refresh(refresh_at);
                    }
                    info!("oauth2 token refreshed");
                }
                Err(err) => {
                    error!(error = %err, attempts = attempt + 1, "oauth2 refresh failed for the whole overall deadline, giving up");
                    inner.last_network_error = Some(Instant::now());
                    waiter_result = Err(ErrorKind::ErrTimeout);
                }
            }
            inner.state = RefreshState::NotStarted;
            std::mem::take(&mut inner.waiters)
        };

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        for (worker_id, closure) in waiters {
            let _ = self.workers.run_closure_in_thread(
                worker_id,
                "oauth2::waiter",
                Priority::High,
                Box::new(move |ctx| closure(ctx, waiter_result)),
            );
        }
    }

    fn schedule_forced_refresh(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        let _ = self.workers.run_delayed_closure(
            0,
            "oauth2::forced_refresh",
            delay,
            Box::new(move |_ctx| {
                if this.should_refresh() {
                    this.run_after_refresh(0, Box::new(|_ctx, _result| {}));
                }
            }),
        );
    }

    /// Drops the current token. Rate-limited to once per minute (spec §3
    /// "an invalidation is ignored if it happened too recently").
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().expect("oauth2 task mutex poisoned");
        let now = Instant::now();
        if inner.last_invalidate.map(|last| now.duration_since(last) < INVALIDATE_RATE_LIMIT).unwrap_or(false) {
            return;
        }
        inner.last_invalidate = Some(now);
        inner.token = None;
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_authorization_is_empty_without_a_token() {
        let workers = Arc::new(WorkerThreadManager::new(1).expect("manager"));
        let task = OAuth2RefreshTask::new(RefreshConfig::GoogleMetadata { metadata_host: "metadata.google.internal".into() }, workers);
        assert_eq!(task.get_authorization(), "");
        assert!(task.should_refresh());
    }

    #[test]
    fn invalidate_is_rate_limited_to_once_per_minute() {
        let workers = Arc::new(WorkerThreadManager::new(1).expect("manager"));
        let task = OAuth2RefreshTask::new(RefreshConfig::GoogleMetadata { metadata_host: "x".into() }, workers);
        {
            let mut inner = task.inner.lock().unwrap();
            inner.token = Some(Token { token_type: "Bearer".into(), access_token: "abc".into(), expiry: Instant::now() + Duration::from_secs(3600) });
        }
        task.invalidate();
        assert_eq!(task.get_authorization(), "", "first invalidate always takes effect");

        {
            let mut inner = task.inner.lock().unwrap();
            inner.token = Some(Token { token_type: "Bearer".into(), access_token: "def".into(), expiry: Instant::now() + Duration::from_secs(3600) });
        }
        task.invalidate();
        assert_eq!(task.get_authorization(), "Bearer def", "second invalidate within the rate limit window is ignored");
    }

    #[test]
    fn should_refresh_backs_off_after_a_failure_before_retrying() {
        let workers = Arc::new(WorkerThreadManager::new(1).expect("manager"));
        let task = OAuth2RefreshTask::new(RefreshConfig::GoogleMetadata { metadata_host: "metadata.google.internal".into() }, workers);
        {
            let mut inner = task.inner.lock().unwrap();
            inner.last_network_error = Some(Instant::now());
        }
        assert!(!task.should_refresh(), "a just-failed attempt should not immediately retry");

        {
            let mut inner = task.inner.lock().unwrap();
            inner.last_network_error = Some(Instant::now() - RETRY_BACKOFF_AFTER_FAILURE);
        }
        assert!(task.should_refresh(), "backoff window elapsed, retry allowed");
    }
}
