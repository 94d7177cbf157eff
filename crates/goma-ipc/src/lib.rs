//! Local IPC front door (spec §4.H): a Unix-domain socket on POSIX, a named
//! pipe on Windows, both speaking HTTP/1.1 over the local transport so the
//! same status-page logic that serves `/healthz` over TCP also answers
//! `/pingz` here.

pub mod credentials;
pub mod error;
pub mod request;
pub mod server;

#[cfg(windows)]
pub mod windows_pipe;

pub use error::IpcError;
pub use server::{ExecHandler, HealthHandler, Handlers, IpcServer, LookupHandler, PortHandler};
