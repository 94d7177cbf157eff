//! Top-level wiring (spec §9's closing design note): threads a
//! [`RuntimeContext`] through construction of every other crate in this
//! workspace and exposes the handler closures the local IPC server
//! dispatches into.

pub mod context;
pub mod error;
pub mod handlers;
pub mod oauth;

pub use context::RuntimeContext;
pub use error::ClientError;
