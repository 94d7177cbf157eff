//! Descriptor-driven I/O reactor (spec §4.A): polls sockets/pipes for
//! read/write/timeout readiness and yields events in priority order.

pub mod descriptor;
pub mod error;
pub mod priority;
pub mod reactor;

pub use descriptor::{DescriptorId, Interest};
pub use error::ReactorError;
pub use priority::{Priority, NUM_PRIORITIES};
pub use reactor::{PollEvent, Reactor};
