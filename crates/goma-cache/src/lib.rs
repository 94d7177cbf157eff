//! Content-addressed local output cache (spec §4.G): a bounded, disk-backed
//! store keyed by a normalized-`ExecReq` hash, with a background
//! garbage collector and a startup directory scan.

mod cache;
mod gc;
mod key;
mod record;
mod store;

pub use cache::{LocalOutputCache, DEFAULT_LOAD_TIMEOUT};
pub use key::derive_key;
