//! One [`TlsContext`] per destination hostname (spec §3 "TLS context").
//! `TlsContextRegistry` is the process-wide, copy-on-write-ish cache the
//! runtime context threads through construction (spec §9 redesign note).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rustls::{ClientConfig, RootCertStore};
use tracing::warn;

use crate::error::NetError;
use crate::tls::crl::CrlCache;
use crate::tls::verifier::CrlCheckingVerifier;

pub struct TlsContext {
    pub host: String,
    pub config: Arc<ClientConfig>,
    pub crl_cache: Arc<CrlCache>,
}

fn default_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = store.add(cert);
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load native root certificates, falling back to webpki-roots");
        }
    }
    if store.is_empty() {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    store
}

impl TlsContext {
    fn new(host: String, crl_dir: PathBuf) -> Result<Self, NetError> {
        let crl_cache = Arc::new(CrlCache::new(crl_dir));
        let verifier = CrlCheckingVerifier::new(default_root_store(), Arc::clone(&crl_cache))
            .map_err(|err| NetError::VerifyError(err.to_string()))?;

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(TlsContext { host, config: Arc::new(config), crl_cache })
    }
}

/// Process-wide cache of [`TlsContext`]s, one per destination hostname.
pub struct TlsContextRegistry {
    crl_dir: PathBuf,
    contexts: RwLock<HashMap<String, Arc<TlsContext>>>,
}

impl TlsContextRegistry {
    pub fn new(crl_dir: impl Into<PathBuf>) -> Self {
        TlsContextRegistry { crl_dir: crl_dir.into(), contexts: RwLock::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, host: &str) -> Result<Arc<TlsContext>, NetError> {
        if let Some(existing) = self.contexts.read().expect("tls registry poisoned").get(host) {
            return Ok(Arc::clone(existing));
        }
        let mut contexts = self.contexts.write().expect("tls registry poisoned");
        if let Some(existing) = contexts.get(host) {
            return Ok(Arc::clone(existing));
        }
        let context = Arc::new(TlsContext::new(host.to_string(), self.crl_dir.clone())?);
        contexts.insert(host.to_string(), Arc::clone(&context));
        Ok(context)
    }

    /// Drops a poisoned or verify-failed context so the next connection to
    /// `host` rebuilds it from scratch, reloading CRLs (spec §7: a TLS
    /// verify error invalidates the context).
    pub fn invalidate(&self, host: &str) {
        self.contexts.write().expect("tls registry poisoned").remove(host);
    }
}
