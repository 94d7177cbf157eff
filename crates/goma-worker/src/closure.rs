//! Closure types run by a worker's loop.
//!
//! `Location` stands in for the `FROM_HERE` call-site tag the original
//! scheduler stamps on every posted closure: a `&'static str` the caller
//! writes by hand (typically `"module::function"`), surfaced in logs and
//! panic messages so a stuck worker can be traced back to who scheduled it.

use crate::context::WorkerContext;

pub type Location = &'static str;

/// A one-shot unit of work. Runs with `&mut WorkerContext` so it can, while
/// executing on its owning worker, register descriptors/timeouts or post
/// more work without reaching for thread-local or global state.
pub type Closure = Box<dyn FnOnce(&mut WorkerContext) + Send>;

/// A unit of work invoked repeatedly by [`crate::manager::WorkerThreadManager::register_periodic`].
pub type PeriodicFn = Box<dyn FnMut(&mut WorkerContext) + Send>;
