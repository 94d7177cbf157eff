//! Socket/address pool (spec §4.C) and TLS engine (spec §4.D).

pub mod backoff;
pub mod error;
pub mod socket_pool;
pub mod tls;

pub use backoff::Backoff;
pub use error::NetError;
pub use socket_pool::{PooledSocket, SocketPool};
pub use tls::{CrlCache, TlsContext, TlsContextRegistry, TlsEngine};
