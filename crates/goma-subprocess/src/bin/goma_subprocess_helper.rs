//! The subprocess helper (spec §4.F "Helper-side contract"): a small,
//! single-purpose process that owns every `fork`/`spawn` of a compiler
//! child. It talks the same framed protocol as the client, but over its
//! own stdin/stdout, and exits when its parent does (stdin EOF).

use std::collections::{HashMap, VecDeque};
use std::io::{stdin, stdout, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use goma_subprocess::protocol::{read_frame, write_frame, Caps, Payload, SubprocessReq, TerminationKind, Weight};

struct RunningChild {
    /// Own mutex (not the outer `State` lock) so the reaper thread can
    /// block in `wait()` without holding up every other task's dispatch.
    child: Arc<Mutex<std::process::Child>>,
    weight: Weight,
    is_low_priority: bool,
}

struct State {
    caps: Caps,
    running: HashMap<u64, RunningChild>,
    pending: VecDeque<(u64, SubprocessReq)>,
}

impl State {
    fn weight_in_use(&self, heavy: bool, low_priority: bool) -> u32 {
        self.running
            .values()
            .filter(|r| (r.weight == Weight::Heavy) == heavy && r.is_low_priority == low_priority)
            .count() as u32
    }

    fn eligible(&self, req: &SubprocessReq) -> bool {
        if self.running.len() as u32 >= self.caps.max_subprocs {
            return false;
        }
        if req.weight == Weight::Heavy && self.weight_in_use(true, false) >= self.caps.max_subprocs_heavy_weight {
            return false;
        }
        if req.is_low_priority && self.weight_in_use(false, true) >= self.caps.max_subprocs_low_priority {
            return false;
        }
        true
    }
}

fn main() {
    let writer: Arc<Mutex<std::io::Stdout>> = Arc::new(Mutex::new(stdout()));
    let state = Arc::new(Mutex::new(State { caps: Caps::default(), running: HashMap::new(), pending: VecDeque::new() }));

    let mut reader = BufReader::new(stdin());
    loop {
        let payload = match read_frame(&mut reader) {
            Ok(p) => p,
            Err(_) => break, // Parent gone (stdin closed): exit.
        };

        match payload {
            Payload::Register { id, req } => {
                if req.detach {
                    let _ = spawn_detached(&req);
                    continue;
                }
                state.lock().expect("helper state poisoned").pending.push_back((id, req));
                dispatch_pending(&state, &writer);
            }
            Payload::RequestRun { .. } => {
                dispatch_pending(&state, &writer);
            }
            Payload::Kill { id } => {
                let mut guard = state.lock().expect("helper state poisoned");
                if let Some(running) = guard.running.get(&id) {
                    let child = Arc::clone(&running.child);
                    drop(guard);
                    let _ = child.lock().expect("child mutex poisoned").kill();
                } else if let Some(pos) = guard.pending.iter().position(|(pid, _)| *pid == id) {
                    guard.pending.remove(pos);
                    drop(guard);
                    send(&writer, &Payload::Terminated { id, exit_code: -1, kind: TerminationKind::NotStarted });
                }
            }
            Payload::SetOption { caps } => {
                state.lock().expect("helper state poisoned").caps = caps;
                dispatch_pending(&state, &writer);
            }
            Payload::Shutdown => break,
            _ => {}
        }
    }
}

fn spawn_detached(req: &SubprocessReq) -> std::io::Result<()> {
    build_command(req).spawn()?;
    Ok(())
}

fn build_command(req: &SubprocessReq) -> Command {
    let mut command = Command::new(&req.path);
    command.args(&req.args);
    command.envs(req.env.iter().cloned());
    if let Some(cwd) = &req.cwd {
        command.current_dir(cwd);
    }
    command.stdin(Stdio::null());
    command.stdout(redirect_stdio(&req.stdout_path));
    command.stderr(redirect_stdio(&req.stderr_path));
    command
}

/// Redirects into the requested file when the caller wants the child's
/// output captured for later reading (spec.md §3 "Subprocess request");
/// otherwise piped and discarded, matching the prior behavior.
fn redirect_stdio(path: &Option<String>) -> Stdio {
    match path {
        Some(path) => std::fs::File::create(path).map(Stdio::from).unwrap_or_else(|_| Stdio::piped()),
        None => Stdio::piped(),
    }
}

fn dispatch_pending(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<std::io::Stdout>>) {
    loop {
        let next = {
            let mut guard = state.lock().expect("helper state poisoned");
            let position = guard.pending.iter().position(|(_, req)| guard.eligible(req));
            position.map(|pos| guard.pending.remove(pos).unwrap())
        };
        let Some((id, req)) = next else { break };
        start_child(state, writer, id, req);
    }
}

fn start_child(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<std::io::Stdout>>, id: u64, req: SubprocessReq) {
    match build_command(&req).spawn() {
        Ok(child) => {
            let pid = child.id();
            let weight = req.weight;
            let is_low_priority = req.is_low_priority;
            let child = Arc::new(Mutex::new(child));
            state
                .lock()
                .expect("helper state poisoned")
                .running
                .insert(id, RunningChild { child, weight, is_low_priority });
            send(writer, &Payload::Started { id, pid });
            spawn_reaper(state, writer, id);
        }
        Err(err) => {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                TerminationKind::FailedToLookup
            } else {
                TerminationKind::FailedToSpawn
            };
            send(writer, &Payload::Terminated { id, exit_code: -1, kind });
        }
    }
}

fn spawn_reaper(state: &Arc<Mutex<State>>, writer: &Arc<Mutex<std::io::Stdout>>, id: u64) {
    let state = Arc::clone(state);
    let writer = Arc::clone(writer);
    std::thread::spawn(move || {
        let Some(child) = state.lock().expect("helper state poisoned").running.get(&id).map(|r| Arc::clone(&r.child)) else {
            return;
        };
        let status = child.lock().expect("child mutex poisoned").wait();
        state.lock().expect("helper state poisoned").running.remove(&id);
        let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
        send(&writer, &Payload::Terminated { id, exit_code, kind: TerminationKind::Exited });
        dispatch_pending(&state, &writer);
    });
}

fn send(writer: &Arc<Mutex<std::io::Stdout>>, payload: &Payload) {
    let mut guard = writer.lock().expect("helper writer poisoned");
    let _ = write_frame(&mut *guard, payload);
    let _ = guard.flush();
}
