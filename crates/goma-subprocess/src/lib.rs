//! Subprocess controller client (spec §4.F). The actual `fork`/`spawn` of
//! compiler child processes happens only in the `goma-subprocess-helper`
//! binary; this crate never forks.

pub mod client;
pub mod protocol;

pub use client::{SubprocessControllerClient, TaskState};
pub use protocol::{Caps, SubprocessReq, TerminationKind, Weight};
