//! Error taxonomy and per-RPC outcome reporting.
//!
//! These are error *kinds*, not Rust error types in the `std::error::Error`
//! sense — see spec §7. Every RPC terminates with a [`Status`] carrying one
//! of these plus timing/size/retry bookkeeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error kind attached to a terminal [`Status`].
///
/// `TlsWantRead`/`TlsWantWrite` are internal signals used only inside the
/// TLS engine's read/write loop; they must never appear in a [`Status`]
/// surfaced above the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Ok,
    Fail,
    ErrTimeout,
    TlsWantRead,
    TlsWantWrite,
    TlsVerifyError,
    IpcRejected,
}

impl ErrorKind {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ErrorKind::TlsWantRead | ErrorKind::TlsWantWrite)
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::Ok
    }
}

/// Timing breakdown for a single RPC, per spec §9 supplement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Timing {
    pub connect: Option<Duration>,
    pub request_sent: Option<Duration>,
    pub response_received: Option<Duration>,
    pub total: Option<Duration>,
}

/// Byte-count breakdown for a single RPC.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SizeBreakdown {
    pub request_bytes: u64,
    pub response_bytes: u64,
}

/// The terminal outcome of an RPC task (spec §3 "Rpc task state", §7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub err: ErrorKind,
    pub http_return_code: Option<u16>,
    pub err_message: String,
    pub timing: Timing,
    pub sizes: SizeBreakdown,
    pub retry_count: u32,
}

impl Status {
    pub fn ok(http_return_code: u16) -> Self {
        Status {
            err: ErrorKind::Ok,
            http_return_code: Some(http_return_code),
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Status {
            err: ErrorKind::Fail,
            err_message: message.into(),
            ..Default::default()
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Status {
            err: ErrorKind::ErrTimeout,
            err_message: message.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err == ErrorKind::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_error_kind_is_ok() {
        assert_eq!(ErrorKind::default(), ErrorKind::Ok);
    }

    #[test]
    fn tls_want_read_is_not_terminal() {
        assert!(!ErrorKind::TlsWantRead.is_terminal());
        assert!(ErrorKind::Fail.is_terminal());
    }

    #[test]
    fn status_ok_round_trips_through_json() {
        let status = Status::ok(200);
        let json = serde_json::to_string(&status).expect("serialize Status");
        let back: Status = serde_json::from_str(&json).expect("deserialize Status");
        assert!(back.is_ok());
        assert_eq!(back.http_return_code, Some(200));
    }

    #[test]
    fn status_fail_carries_message() {
        let status = Status::fail("connect refused");
        assert_eq!(status.err, ErrorKind::Fail);
        assert_eq!(status.err_message, "connect refused");
    }
}
