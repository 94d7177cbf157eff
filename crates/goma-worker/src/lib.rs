//! Worker-thread scheduler (spec §4.B): a fixed pool of OS threads, each
//! running its own reactor-driven loop over four closure priority queues
//! plus delayed and periodic closures.

mod closure;
mod command;
mod context;
mod delayed;
mod descriptor;
mod error;
mod manager;
mod periodic;
mod worker;

pub use closure::{Closure, Location, PeriodicFn};
pub use context::WorkerContext;
pub use delayed::DelayedHandle;
pub use descriptor::DescriptorCallbacks;
pub use error::WorkerError;
pub use manager::WorkerThreadManager;
pub use periodic::PeriodicId;
pub use worker::DEFAULT_POLL_INTERVAL;

pub use goma_reactor::{DescriptorId, Interest, Priority};
