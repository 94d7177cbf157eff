//! Client side of the subprocess controller (spec §4.F). Spawns the helper
//! binary once at startup via `std::process::Command` (posix_spawn under
//! the hood on POSIX, not a raw `fork`, so this is safe from a
//! multi-threaded process); every actual subprocess fork/spawn happens
//! inside the helper, never here.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use goma_worker::{Closure, WorkerThreadManager};
use tracing::{error, info, warn};

use crate::protocol::{read_frame, write_frame, Caps, Payload, SubprocessReq, TerminationKind};

/// How often the sweeper re-sends `KILL` to tasks stuck in `Signaled`
/// (spec §4.F "signaled sweeper").
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Registered,
    Running,
    Signaled,
    Terminated,
}

struct TaskEntry {
    worker_id: usize,
    state: TaskState,
    on_started: Option<Box<dyn FnOnce(u32) + Send>>,
    on_terminated: Option<Box<dyn FnOnce(i32, TerminationKind) + Send>>,
}

struct Inner {
    tasks: HashMap<u64, TaskEntry>,
    writer: ChildStdin,
}

/// Client-side handle to the subprocess helper. One instance per process;
/// construct via [`SubprocessControllerClient::spawn`].
pub struct SubprocessControllerClient {
    child: Mutex<Child>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    workers: Arc<WorkerThreadManager>,
}

impl SubprocessControllerClient {
    pub fn spawn(helper_path: &str, workers: Arc<WorkerThreadManager>) -> std::io::Result<Arc<Self>> {
        let mut child = Command::new(helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let writer = child.stdin.take().expect("piped stdin");
        let reader = BufReader::new(child.stdout.take().expect("piped stdout"));

        let client = Arc::new(SubprocessControllerClient {
            child: Mutex::new(child),
            inner: Mutex::new(Inner { tasks: HashMap::new(), writer }),
            next_id: AtomicU64::new(1),
            workers,
        });

        client.spawn_reader_thread(reader);
        client.start_sweeper();
        Ok(client)
    }

    fn spawn_reader_thread(self: &Arc<Self>, mut reader: BufReader<std::process::ChildStdout>) {
        let client = Arc::clone(self);
        std::thread::Builder::new()
            .name("goma-subprocess-reader".into())
            .spawn(move || loop {
                match read_frame(&mut reader) {
                    Ok(payload) => client.handle_incoming(payload),
                    Err(err) => {
                        warn!(error = %err, "subprocess helper channel closed, reader exiting");
                        break;
                    }
                }
            })
            .expect("failed to spawn subprocess reader thread");
    }

    fn start_sweeper(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let _ = self.workers.register_periodic(
            0,
            "subprocess::sweep_signaled",
            SWEEP_INTERVAL,
            Box::new(move |_ctx| client.sweep_signaled()),
        );
    }

    fn sweep_signaled(&self) {
        let stuck: Vec<u64> = {
            let inner = self.inner.lock().expect("subprocess client mutex poisoned");
            inner.tasks.iter().filter(|(_, t)| t.state == TaskState::Signaled).map(|(id, _)| *id).collect()
        };
        for id in stuck {
            info!(id, "re-sending KILL for signaled task with no TERMINATED yet");
            let _ = self.send(&Payload::Kill { id });
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, payload: &Payload) -> std::io::Result<()> {
        let mut inner = self.inner.lock().expect("subprocess client mutex poisoned");
        write_frame(&mut inner.writer, payload).map_err(|err| match err {
            crate::protocol::FramingError::Io(io_err) => io_err,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        })
    }

    /// Assigns a monotonic id and emits `REGISTER`. A `req.detach` request
    /// never invokes `on_started`/`on_terminated` and the id isn't tracked
    /// afterward (spec §4.F).
    pub fn register_task(
        &self,
        worker_id: usize,
        req: SubprocessReq,
        on_started: impl FnOnce(u32) + Send + 'static,
        on_terminated: impl FnOnce(i32, TerminationKind) + Send + 'static,
    ) -> u64 {
        let id = self.next_id();
        let detach = req.detach;
        if !detach {
            let mut inner = self.inner.lock().expect("subprocess client mutex poisoned");
            inner.tasks.insert(
                id,
                TaskEntry {
                    worker_id,
                    state: TaskState::Registered,
                    on_started: Some(Box::new(on_started)),
                    on_terminated: Some(Box::new(on_terminated)),
                },
            );
        }
        if let Err(err) = self.send(&Payload::Register { id, req }) {
            error!(id, error = %err, "failed to send REGISTER to subprocess helper");
        }
        id
    }

    pub fn request_run(&self, id: u64) {
        let _ = self.send(&Payload::RequestRun { id });
    }

    pub fn kill(&self, id: u64) {
        if let Some(entry) = self.inner.lock().expect("subprocess client mutex poisoned").tasks.get_mut(&id) {
            entry.state = TaskState::Signaled;
        }
        let _ = self.send(&Payload::Kill { id });
    }

    pub fn set_option(&self, caps: Caps) {
        let _ = self.send(&Payload::SetOption { caps });
    }

    fn handle_incoming(&self, payload: Payload) {
        match payload {
            Payload::Started { id, pid } => {
                let entry = {
                    let mut inner = self.inner.lock().expect("subprocess client mutex poisoned");
                    inner.tasks.get_mut(&id).map(|t| {
                        t.state = TaskState::Running;
                        (t.worker_id, t.on_started.take())
                    })
                };
                match entry {
                    Some((worker_id, Some(on_started))) => {
                        let location = "subprocess::on_started";
                        let closure: Closure = Box::new(move |_ctx| on_started(pid));
                        let _ = self.workers.run_closure_in_thread(worker_id, location, goma_worker::Priority::High, closure);
                    }
                    Some((_, None)) => {}
                    None => warn!(id, "STARTED for unknown subprocess task id"),
                }
            }
            Payload::Terminated { id, exit_code, kind } => {
                let entry = {
                    let mut inner = self.inner.lock().expect("subprocess client mutex poisoned");
                    inner.tasks.remove(&id)
                };
                match entry {
                    Some(TaskEntry { worker_id, on_terminated: Some(on_terminated), .. }) => {
                        let location = "subprocess::on_terminated";
                        let closure: Closure = Box::new(move |_ctx| on_terminated(exit_code, kind));
                        let _ = self.workers.run_closure_in_thread(worker_id, location, goma_worker::Priority::High, closure);
                    }
                    Some(_) => {}
                    None => warn!(id, "TERMINATED for unknown subprocess task id (already canceled or never existed)"),
                }
            }
            Payload::Closed { id } => {
                self.inner.lock().expect("subprocess client mutex poisoned").tasks.remove(&id);
            }
            other => warn!(?other, "unexpected client-bound payload"),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.send(&Payload::Shutdown);
        let _ = self.child.lock().expect("subprocess client mutex poisoned").wait();
    }
}
