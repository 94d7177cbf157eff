//! Unix-domain-socket IPC server (spec §4.H). One dedicated OS thread
//! accepts connections; each connection gets its own short-lived handler
//! thread, mirroring the blocking-I/O-on-a-throwaway-thread pattern used
//! elsewhere in this workspace (the subprocess helper's reader thread, the
//! OAuth2 refresh round trip) rather than routing local, low-latency
//! traffic through the worker reactor.
//!
//! The four endpoints are dispatched to caller-supplied handler closures so
//! this crate doesn't need to know about the cache, the subprocess
//! controller, or the RPC client — the binary wiring those together
//! (`goma-client`) owns that decision.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use goma_proto::{ExecReq, ExecResp, HealthStatus};

use crate::credentials;
use crate::error::IpcError;
use crate::request::IncomingRequest;

pub type ExecHandler = Arc<dyn Fn(ExecReq) -> ExecResp + Send + Sync>;
pub type LookupHandler = Arc<dyn Fn(ExecReq) -> Option<ExecResp> + Send + Sync>;
pub type HealthHandler = Arc<dyn Fn() -> HealthStatus + Send + Sync>;
pub type PortHandler = Arc<dyn Fn() -> u16 + Send + Sync>;

/// The callbacks an `IpcServer` dispatches requests to, one per endpoint
/// named in spec §4.H / §6.
#[derive(Clone)]
pub struct Handlers {
    pub exec: ExecHandler,
    pub lookup: LookupHandler,
    pub health: HealthHandler,
    pub port: PortHandler,
}

pub struct IpcServer {
    socket_path: std::path::PathBuf,
    accept_thread: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Binds `socket_path` and starts accepting connections immediately.
    /// Any stale socket file left by a crashed prior instance is removed
    /// first, matching the gomacc convention of one live socket per user
    /// session.
    pub fn bind(socket_path: impl Into<std::path::PathBuf>, handlers: Handlers) -> Result<Self, IpcError> {
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;

        let path_for_thread = socket_path.clone();
        let accept_thread = std::thread::Builder::new()
            .name("goma-ipc-acceptor".into())
            .spawn(move || accept_loop(listener, handlers, &path_for_thread))
            .expect("failed to spawn ipc acceptor thread");

        Ok(IpcServer { socket_path, accept_thread: Some(accept_thread) })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        // Dropping the listener (by removing the socket file, which causes
        // subsequent accepts to eventually error out) is the simplest
        // available shutdown signal; the acceptor thread is daemon-like
        // and exits with the process.
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(handle) = self.accept_thread.take() {
            drop(handle); // detach; accept() on a removed socket keeps blocking until process exit
        }
    }
}

fn accept_loop(listener: UnixListener, handlers: Handlers, socket_path: &std::path::Path) {
    info!(path = %socket_path.display(), "ipc server listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let handlers = handlers.clone();
                std::thread::Builder::new()
                    .name("goma-ipc-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &handlers) {
                            debug!(error = %err, "ipc connection ended with an error");
                        }
                    })
                    .expect("failed to spawn ipc connection thread");
            }
            Err(err) => {
                warn!(error = %err, "ipc accept failed");
                break;
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, handlers: &Handlers) -> Result<(), IpcError> {
    credentials::check_same_user(stream.as_raw_fd())?;

    let mut request = IncomingRequest::new();
    let mut buf = [0u8; 16 * 1024];
    while !request.is_complete() {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(IpcError::MalformedRequest("connection closed before request completed".into()));
        }
        request.feed(&buf[..n])?;
    }

    let response = dispatch(request.path(), request.body(), handlers)?;
    stream.write_all(&response)?;
    Ok(())
}

fn dispatch(path: &str, body: &[u8], handlers: &Handlers) -> Result<Vec<u8>, IpcError> {
    match path {
        "/e" => {
            let req: ExecReq = bincode::deserialize(body).map_err(|err| IpcError::BadBody(err.to_string()))?;
            let resp = (handlers.exec)(req);
            let payload = bincode::serialize(&resp).map_err(|err| IpcError::BadBody(err.to_string()))?;
            Ok(http_response(200, "OK", "binary/x-protocol-buffer", &payload))
        }
        "/l" => {
            let req: ExecReq = bincode::deserialize(body).map_err(|err| IpcError::BadBody(err.to_string()))?;
            match (handlers.lookup)(req) {
                Some(resp) => {
                    let payload = bincode::serialize(&resp).map_err(|err| IpcError::BadBody(err.to_string()))?;
                    Ok(http_response(200, "OK", "binary/x-protocol-buffer", &payload))
                }
                None => Ok(http_response(404, "Not Found", "text/plain", b"cache miss")),
            }
        }
        "/pingz" => {
            let status = (handlers.health)();
            Ok(http_response(200, "OK", "text/plain", status.to_string().as_bytes()))
        }
        "/portz" => {
            let port = (handlers.port)();
            Ok(http_response(200, "OK", "text/plain", port.to_string().as_bytes()))
        }
        other => {
            Err(IpcError::UnknownEndpoint(other.to_string()))
        }
    }
}

fn http_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 128);
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use goma_proto::RequesterInfo;
    use std::collections::BTreeMap;

    fn sample_req() -> ExecReq {
        ExecReq {
            compiler_path: "/usr/bin/cc".into(),
            args: vec!["-c".into(), "a.c".into()],
            cwd: "/tmp".into(),
            env: BTreeMap::new(),
            input_paths: vec!["a.c".into()],
            compiler_fingerprint: "deadbeef".into(),
            requester_info: RequesterInfo::default(),
            trace_id: "t0".into(),
        }
    }

    #[test]
    fn ping_and_port_endpoints_respond_without_a_body() {
        let handlers = Handlers {
            exec: Arc::new(|_req| ExecResp::default()),
            lookup: Arc::new(|_req| None),
            health: Arc::new(|| HealthStatus::Ok),
            port: Arc::new(|| 8088),
        };
        let resp = dispatch("/pingz", &[], &handlers).expect("pingz");
        assert!(String::from_utf8_lossy(&resp).contains("200 OK"));
        assert!(String::from_utf8_lossy(&resp).ends_with("ok"));

        let resp = dispatch("/portz", &[], &handlers).expect("portz");
        assert!(String::from_utf8_lossy(&resp).ends_with("8088"));
    }

    #[test]
    fn lookup_miss_returns_404() {
        let handlers = Handlers {
            exec: Arc::new(|_req| ExecResp::default()),
            lookup: Arc::new(|_req| None),
            health: Arc::new(|| HealthStatus::Ok),
            port: Arc::new(|| 0),
        };
        let body = bincode::serialize(&sample_req()).unwrap();
        let resp = dispatch("/l", &body, &handlers).expect("lookup");
        assert!(String::from_utf8_lossy(&resp).contains("404 Not Found"));
    }

    #[test]
    fn execute_round_trips_through_bincode() {
        let handlers = Handlers {
            exec: Arc::new(|req| ExecResp { exit_status: 0, stdout: req.args.join(" ").into_bytes(), ..Default::default() }),
            lookup: Arc::new(|_req| None),
            health: Arc::new(|| HealthStatus::Ok),
            port: Arc::new(|| 0),
        };
        let body = bincode::serialize(&sample_req()).unwrap();
        let resp = dispatch("/e", &body, &handlers).expect("exec");
        let text = String::from_utf8_lossy(&resp);
        assert!(text.contains("200 OK"));
        assert!(text.contains("binary/x-protocol-buffer"));
    }

    #[test]
    fn unknown_path_is_rejected() {
        let handlers = Handlers {
            exec: Arc::new(|_req| ExecResp::default()),
            lookup: Arc::new(|_req| None),
            health: Arc::new(|| HealthStatus::Ok),
            port: Arc::new(|| 0),
        };
        assert!(dispatch("/nope", &[], &handlers).is_err());
    }
}
