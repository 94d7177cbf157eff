//! Builds the `goma_ipc::Handlers` the IPC server dispatches into, closing
//! over a `RuntimeContext`. Each handler runs on the IPC connection's own
//! thread (spec §4.H accepts connections off the worker reactor) and
//! blocks on an `mpsc` channel for the RPC task's (or subprocess task's)
//! completion callback, which fires on a worker thread — the same
//! cross-thread handoff pattern `goma-subprocess`'s client itself uses for
//! `STARTED`/`TERMINATED`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use tracing::warn;

use goma_ipc::Handlers;
use goma_proto::{CacheHit, ExecReq, ExecResp};
use goma_rpc::{HttpRequest, Method};
use goma_subprocess::{SubprocessReq, TerminationKind, Weight};

use crate::context::RuntimeContext;

/// Per-RPC deadline sequence (spec §5 "Timeouts": connect, then header
/// receipt) — a compile request gets a generous connect budget and a much
/// longer budget for the full round trip.
fn default_deadlines() -> Vec<std::time::Duration> {
    vec![std::time::Duration::from_secs(10), std::time::Duration::from_secs(120)]
}

pub fn build(context: Arc<RuntimeContext>) -> Handlers {
    let next_worker = Arc::new(AtomicUsize::new(0));

    Handlers {
        exec: {
            let context = Arc::clone(&context);
            let next_worker = Arc::clone(&next_worker);
            Arc::new(move |req| exec(Arc::clone(&context), Arc::clone(&next_worker), req))
        },
        lookup: {
            let context = Arc::clone(&context);
            Arc::new(move |req| lookup(&context, req))
        },
        health: {
            let context = Arc::clone(&context);
            Arc::new(move || context.http.health_string())
        },
        port: {
            let context = Arc::clone(&context);
            Arc::new(move || context.config.remote_port)
        },
    }
}

fn pick_worker(next_worker: &AtomicUsize, worker_count: usize) -> usize {
    next_worker.fetch_add(1, Ordering::Relaxed) % worker_count.max(1)
}

fn lookup(context: &RuntimeContext, req: ExecReq) -> Option<ExecResp> {
    let key = context.cache.key_for(&req);
    context.cache.lookup(&key)
}

fn maybe_cache(context: &RuntimeContext, key: &str, resp: &ExecResp) {
    let worth_caching = resp.exit_status == 0 || !context.config.use_success;
    if worth_caching {
        context.cache.save(key, resp);
    }
}

fn exec(context: Arc<RuntimeContext>, next_worker: Arc<AtomicUsize>, req: ExecReq) -> ExecResp {
    let key = context.cache.key_for(&req);

    if !context.config.store_only {
        if let Some(hit) = context.cache.lookup(&key) {
            return hit;
        }
    }

    let worker_id = pick_worker(&next_worker, context.workers.worker_count());
    let remote = run_remote(&context, worker_id, &req);

    let resp = match remote {
        Some(resp) => resp,
        None if context.config.use_local && context.config.fallback => {
            run_local_fallback(&context, worker_id, &req)
        }
        None => ExecResp { exit_status: -1, stderr: b"remote execution failed and fallback is disabled".to_vec(), ..Default::default() },
    };

    maybe_cache(&context, &key, &resp);
    resp
}

/// Returns `None` on any RPC-level failure (non-2xx, timeout, transport
/// error) so the caller can decide whether to fall back locally.
fn run_remote(context: &Arc<RuntimeContext>, worker_id: usize, req: &ExecReq) -> Option<ExecResp> {
    let body = match bincode::serialize(req) {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, "failed to serialize ExecReq for remote dispatch");
            return None;
        }
    };

    let request = HttpRequest::new(Method::Post, context.config.remote_exec_path.clone(), context.config.remote_host.clone())
        .with_body(body);

    let (tx, rx) = mpsc::channel();
    context.http.execute(
        worker_id,
        request,
        default_deadlines(),
        false,
        Box::new(move |status, body| {
            let result = if status.is_ok() {
                body.and_then(|bytes| bincode::deserialize::<ExecResp>(&bytes).ok())
            } else {
                None
            };
            let _ = tx.send(result);
        }),
    );

    rx.recv().ok().flatten().map(|mut resp| {
        resp.cache_hit = CacheHit::RemoteCache;
        resp
    })
}

/// Runs the compiler locally via the subprocess helper (spec §4.F; never
/// forks in this process — spec §5 "Fork safety"), used when the remote
/// RPC fails and `fallback`/`use_local` permit it.
fn run_local_fallback(context: &Arc<RuntimeContext>, worker_id: usize, req: &ExecReq) -> ExecResp {
    let Ok(stdout_file) = tempfile::NamedTempFile::new() else {
        return failed_fallback("failed to allocate stdout capture file");
    };
    let Ok(stderr_file) = tempfile::NamedTempFile::new() else {
        return failed_fallback("failed to allocate stderr capture file");
    };

    let sub_req = SubprocessReq {
        path: req.compiler_path.clone(),
        args: req.args.clone(),
        env: req.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        cwd: Some(req.cwd.clone()),
        detach: false,
        weight: Weight::Heavy,
        is_low_priority: false,
        stdout_path: Some(stdout_file.path().to_string_lossy().into_owned()),
        stderr_path: Some(stderr_file.path().to_string_lossy().into_owned()),
    };

    let (tx, rx) = mpsc::channel();
    let id = context.subprocess.register_task(worker_id, sub_req, |_pid| {}, move |exit_code, kind| {
        let _ = tx.send((exit_code, kind));
    });
    context.subprocess.request_run(id);

    let (exit_status, kind) = rx.recv().unwrap_or((-1, TerminationKind::FailedToSpawn));
    if !matches!(kind, TerminationKind::Exited) {
        warn!(?kind, "local fallback compiler did not run to completion");
    }

    ExecResp {
        exit_status,
        stdout: std::fs::read(stdout_file.path()).unwrap_or_default(),
        stderr: std::fs::read(stderr_file.path()).unwrap_or_default(),
        output: Vec::new(),
        cache_hit: CacheHit::None,
    }
}

fn failed_fallback(message: &str) -> ExecResp {
    warn!("{message}");
    ExecResp { exit_status: -1, stderr: message.as_bytes().to_vec(), ..Default::default() }
}
