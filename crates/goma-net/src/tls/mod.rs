//! TLS engine (spec §4.D): wraps a raw socket with a TLS session through a
//! memory-BIO-shaped API, so ciphertext flows through the same reactor
//! plumbing plaintext would.

pub mod context;
pub mod crl;
pub mod verifier;

use std::io::{Read, Write};

use rustls::pki_types::ServerName;
use rustls::ClientConnection;

use crate::error::NetError;
pub use context::{TlsContext, TlsContextRegistry};
pub use crl::CrlCache;

pub struct TlsEngine {
    conn: ClientConnection,
}

impl TlsEngine {
    /// Starts the handshake immediately (spec §4.D "Handshake: started on
    /// construction").
    pub fn new(context: &TlsContext, server_name: &str) -> Result<Self, NetError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| NetError::VerifyError(format!("invalid server name: {server_name}")))?;
        let conn = ClientConnection::new(context.config.clone(), name)
            .map_err(|err| NetError::VerifyError(err.to_string()))?;
        Ok(TlsEngine { conn })
    }

    /// Bytes the engine wants written to the transport socket now
    /// (handshake flight or encrypted application data queued by `write`).
    pub fn get_bytes_to_send(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// Feeds ciphertext read off the transport socket into the engine.
    pub fn set_bytes_from_transport(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        let mut cursor = std::io::Cursor::new(bytes);
        while (cursor.position() as usize) < bytes.len() {
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => return Err(NetError::Io(err)),
            }
        }
        self.conn
            .process_new_packets()
            .map_err(|err| NetError::VerifyError(err.to_string()))?;
        Ok(())
    }

    /// Reads decrypted application data. `WouldBlock` maps to
    /// [`NetError::WantRead`] per spec's `{want_read, want_write}` mapping.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(NetError::WantRead),
            Err(err) => Err(NetError::Io(err)),
        }
    }

    /// Queues plaintext for encryption; call [`Self::get_bytes_to_send`]
    /// afterward to pull the resulting ciphertext off the engine.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        match self.conn.writer().write(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(NetError::WantWrite),
            Err(err) => Err(NetError::Io(err)),
        }
    }

    /// True while the engine still has ciphertext it wants to write or is
    /// waiting on more input to make progress (handshake or otherwise).
    pub fn is_io_pending(&self) -> bool {
        self.conn.wants_write() || self.conn.wants_read()
    }

    /// True once the handshake has completed and plaintext can flow.
    pub fn is_ready(&self) -> bool {
        !self.conn.is_handshaking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> TlsContextRegistry {
        TlsContextRegistry::new(std::env::temp_dir().join("goma-net-test-crl"))
    }

    #[test]
    fn new_engine_starts_handshaking_and_has_a_client_hello_queued() {
        let reg = registry();
        let ctx = reg.get_or_create("example.com").expect("context");
        let mut engine = TlsEngine::new(&ctx, "example.com").expect("engine");

        assert!(!engine.is_ready());
        let hello = engine.get_bytes_to_send();
        assert!(!hello.is_empty(), "ClientHello should be queued immediately on construction");
    }

    #[test]
    fn registry_reuses_the_same_context_for_the_same_host() {
        let reg = registry();
        let a = reg.get_or_create("example.com").expect("context");
        let b = reg.get_or_create("example.com").expect("context");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidate_forces_a_fresh_context_next_time() {
        let reg = registry();
        let a = reg.get_or_create("example.com").expect("context");
        reg.invalidate("example.com");
        let b = reg.get_or_create("example.com").expect("context");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
