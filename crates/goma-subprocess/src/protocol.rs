//! Wire format for the client/helper channel (spec §4.F): a 4-byte opcode,
//! a 4-byte little-endian payload length, then that many payload bytes.
//! Payloads are `bincode`-encoded, matching the rest of this workspace's
//! binary-framed internal protocols.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    Register = 1,
    RequestRun = 2,
    Kill = 3,
    SetOption = 4,
    Shutdown = 5,
    Started = 6,
    Terminated = 7,
    Closed = 8,
}

impl Opcode {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Opcode::Register,
            2 => Opcode::RequestRun,
            3 => Opcode::Kill,
            4 => Opcode::SetOption,
            5 => Opcode::Shutdown,
            6 => Opcode::Started,
            7 => Opcode::Terminated,
            8 => Opcode::Closed,
            _ => return None,
        })
    }
}

/// Relative cost of a subprocess against the helper's weight-based caps
/// (spec §4.F "weight per task").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weight {
    Light,
    Heavy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessReq {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
    /// A detached request is fire-and-forget: the helper runs it but never
    /// reports `STARTED`/`TERMINATED` back (spec §4.F).
    pub detach: bool,
    pub weight: Weight,
    pub is_low_priority: bool,
    /// Files the helper redirects the child's stdout/stderr into (spec.md
    /// §3 "Subprocess request" record: `stdout-file`, `stderr-file`); the
    /// caller reads them back after `TERMINATED` since the wire protocol
    /// itself only carries the exit code.
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

/// Startup-failure taxonomy reported in `TERMINATED` (spec §4.F
/// "Helper-side contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationKind {
    Exited,
    Signaled,
    NotStarted,
    FailedToLookup,
    FailedToSpawn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caps {
    pub max_subprocs: u32,
    pub max_subprocs_heavy_weight: u32,
    pub max_subprocs_low_priority: u32,
}

impl Default for Caps {
    fn default() -> Self {
        Caps { max_subprocs: 64, max_subprocs_heavy_weight: 16, max_subprocs_low_priority: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Register { id: u64, req: SubprocessReq },
    RequestRun { id: u64 },
    Kill { id: u64 },
    SetOption { caps: Caps },
    Shutdown,
    Started { id: u64, pid: u32 },
    Terminated { id: u64, exit_code: i32, kind: TerminationKind },
    Closed { id: u64 },
}

impl Payload {
    pub fn opcode(&self) -> Opcode {
        match self {
            Payload::Register { .. } => Opcode::Register,
            Payload::RequestRun { .. } => Opcode::RequestRun,
            Payload::Kill { .. } => Opcode::Kill,
            Payload::SetOption { .. } => Opcode::SetOption,
            Payload::Shutdown => Opcode::Shutdown,
            Payload::Started { .. } => Opcode::Started,
            Payload::Terminated { .. } => Opcode::Terminated,
            Payload::Closed { .. } => Opcode::Closed,
        }
    }
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("payload decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn write_frame(writer: &mut impl Write, payload: &Payload) -> Result<(), FramingError> {
    let opcode = payload.opcode() as u32;
    let body = bincode::serialize(payload)?;
    writer.write_all(&opcode.to_le_bytes())?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame(reader: &mut impl Read) -> Result<Payload, FramingError> {
    let mut opcode_bytes = [0u8; 4];
    reader.read_exact(&mut opcode_bytes)?;
    let opcode = Opcode::from_u32(u32::from_le_bytes(opcode_bytes))
        .ok_or_else(|| FramingError::UnknownOpcode(u32::from_le_bytes(opcode_bytes)))?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let payload: Payload = bincode::deserialize(&body)?;
    debug_assert_eq!(payload.opcode(), opcode);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_round_trips() {
        let mut buf = Vec::new();
        let req = SubprocessReq {
            path: "/usr/bin/cc1".into(),
            args: vec!["-O2".into()],
            env: vec![("PATH".into(), "/usr/bin".into())],
            cwd: Some("/tmp".into()),
            detach: false,
            weight: Weight::Heavy,
            is_low_priority: false,
            stdout_path: None,
            stderr_path: None,
        };
        write_frame(&mut buf, &Payload::Register { id: 7, req }).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap();
        match decoded {
            Payload::Register { id, req } => {
                assert_eq!(id, 7);
                assert_eq!(req.path, "/usr/bin/cc1");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn terminated_frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Payload::Terminated { id: 3, exit_code: 1, kind: TerminationKind::FailedToSpawn }).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).unwrap(),
            Payload::Terminated { id: 3, exit_code: 1, kind: TerminationKind::FailedToSpawn }
        ));
    }
}
