//! Descriptor identity and registration metadata (spec §3 "Descriptor").
//!
//! The reactor only tracks what it needs to multiplex I/O: identity,
//! desired events, priority (for `poll`'s `min_priority` filter), and a
//! read-timeout deadline. Callbacks and the "closed"/"can-reuse" flags are
//! consumer state, owned by the worker that registered the descriptor
//! (spec §3: "Owned by exactly one worker; mutated only on that worker").

use std::time::Instant;

use crate::priority::Priority;

/// Opaque identity for a registered descriptor. Stable for the lifetime of
/// one registration; the caller chooses the value (typically derived from
/// the underlying raw fd/handle) and must not reuse an id still registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub usize);

impl From<usize> for DescriptorId {
    fn from(value: usize) -> Self {
        DescriptorId(value)
    }
}

/// Which directions a descriptor currently wants polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    pub fn to_mio(self) -> Option<mio::Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Bookkeeping the reactor keeps per registered descriptor.
#[derive(Debug, Clone)]
pub(crate) struct DescriptorMeta {
    pub priority: Priority,
    pub interest: Interest,
    pub read_timeout: Option<Instant>,
    /// True once a mio registration exists for this id (timeout-only
    /// descriptors never set this).
    pub io_registered: bool,
}
