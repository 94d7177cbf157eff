//! Shared data model for the compilation-accelerator core: the `ExecReq`/
//! `ExecResp` RPC contract, the error taxonomy, process configuration, and
//! the health-status string. Every other crate in this workspace depends
//! on this one and nothing else in the reverse direction.

pub mod config;
pub mod error;
pub mod exec;
pub mod health;
pub mod requester_info;

pub use config::Config;
pub use error::{ErrorKind, SizeBreakdown, Status, Timing};
pub use exec::{CacheHit, ExecReq, ExecResp, OutputFile};
pub use health::HealthStatus;
pub use requester_info::RequesterInfo;
