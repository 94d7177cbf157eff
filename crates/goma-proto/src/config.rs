//! The string-typed configuration options of spec §6.
//!
//! Each acts on a specific decision documented in §4; implementers must
//! preserve the semantics, not the spelling. This module is the single
//! place those options are named and typed; every other crate reads
//! `Config`, never the raw environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// OAuth2 refresh variant selection (§4.E), expressed as plain data so this
/// crate (the bottom of the dependency graph) never has to depend on
/// `goma-rpc`'s `RefreshConfig` — callers downstream translate one into the
/// other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OAuthConfig {
    GoogleMetadata { metadata_host: Option<String> },
    ServiceAccountJwt { client_email: String, private_key_pem_path: PathBuf, token_uri: String, scope: String },
    UserRefreshToken { client_id: String, client_secret: String, refresh_token: String, token_uri: String },
    LuciLocalAuth { rpc_port: u16, secret: String, account_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix-domain-socket name / named-pipe name for the IPC server (§4.H).
    pub socket_name: String,
    /// How long the named-pipe transport waits for a connection on Windows.
    pub namedpipe_wait_timeout: Duration,
    /// Where the compiler-proxy daemon's stderr is redirected.
    pub compiler_proxy_daemon_stderr: Option<PathBuf>,
    /// Lock file used by the `gomacc` CLI shim to serialize daemon startup.
    pub gomacc_lock_filename: PathBuf,

    /// If false, every request is routed remotely and local fallback never
    /// runs, even on remote failure.
    pub use_local: bool,
    /// If true, a remote failure triggers local execution as a fallback.
    pub fallback: bool,
    /// If true, results are saved to the local cache but never served from
    /// it (write-only mode, useful for cache-warming runs).
    pub store_only: bool,
    /// If true, only cache results whose remote exit status was success.
    pub use_success: bool,
    /// Verification command run against fallback output, if set.
    pub verify_command: Option<String>,
    /// If true, compare fallback and remote output and log divergence.
    pub verify_output: bool,
    /// Extra input files to include when falling back locally.
    pub fallback_input_files: Vec<PathBuf>,
    /// Input files implicitly required by every request (e.g. SDK headers).
    pub implicit_input_files: Vec<PathBuf>,
    /// If true, the compiler binary itself is uploaded as an input.
    pub send_compiler_binary_as_input: bool,

    /// If true, `gomacc` starts a `compiler-proxy` daemon if none is running.
    pub start_compiler_proxy: bool,
    /// Path to the `compiler-proxy` binary `gomacc` should start.
    pub compiler_proxy_binary: Option<PathBuf>,

    /// Dump raw request/response bytes for debugging.
    pub dump: bool,
    pub dump_request: bool,
    pub dump_response: bool,
    pub dump_time: bool,
    /// Write the final `ExecResp` to a file, for offline inspection.
    pub output_exec_resp: Option<PathBuf>,

    /// Number of times a failed RPC is retried before falling back/failing.
    pub retry: u32,

    /// Remote compilation-accelerator server host:port (§4.E destination).
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_use_tls: bool,
    /// Path the remote HTTP client POSTs `ExecReq`s to.
    pub remote_exec_path: String,
    /// `None` disables authorization entirely (e.g. a trusted internal
    /// network), matching a deployment that never configured OAuth2.
    pub oauth: Option<OAuthConfig>,

    /// Worker threads backing the reactor-driven scheduler (§4.B).
    pub worker_pool_size: usize,
    /// Path to the `goma-subprocess-helper` binary (§4.F / §5 "Fork safety").
    pub subprocess_helper_binary: PathBuf,

    /// Local output cache directory and byte/count bounds (§4.G).
    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,
    pub cache_threshold_bytes: u64,
    pub cache_max_items: usize,
    pub cache_threshold_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_name: "goma.ipc".to_string(),
            namedpipe_wait_timeout: Duration::from_secs(5),
            compiler_proxy_daemon_stderr: None,
            gomacc_lock_filename: PathBuf::from("goma_compiler_proxy.lock"),
            use_local: true,
            fallback: true,
            store_only: false,
            use_success: true,
            verify_command: None,
            verify_output: false,
            fallback_input_files: Vec::new(),
            implicit_input_files: Vec::new(),
            send_compiler_binary_as_input: false,
            start_compiler_proxy: true,
            compiler_proxy_binary: None,
            dump: false,
            dump_request: false,
            dump_response: false,
            dump_time: false,
            output_exec_resp: None,
            retry: 5,

            remote_host: "localhost".to_string(),
            remote_port: 8088,
            remote_use_tls: false,
            remote_exec_path: "/e".to_string(),
            oauth: None,

            worker_pool_size: 4,
            subprocess_helper_binary: PathBuf::from("goma-subprocess-helper"),

            cache_dir: std::env::temp_dir().join("goma_cache"),
            cache_max_bytes: 10 * (1 << 30),
            cache_threshold_bytes: 8 * (1 << 30),
            cache_max_items: 100_000,
            cache_threshold_items: 90_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_local_and_fallback() {
        let config = Config::default();
        assert!(config.use_local);
        assert!(config.fallback);
        assert!(!config.store_only);
    }

    #[test]
    fn default_retry_matches_connect_retry_budget() {
        // Spec §8: "attempts exactly min(5, addresses) connections" — the
        // default retry budget must be at least that large.
        assert_eq!(Config::default().retry, 5);
    }

    #[test]
    fn default_config_has_no_oauth_and_a_plaintext_remote() {
        let config = Config::default();
        assert!(config.oauth.is_none());
        assert!(!config.remote_use_tls);
    }

    #[test]
    fn default_cache_threshold_is_below_max() {
        let config = Config::default();
        assert!(config.cache_threshold_bytes < config.cache_max_bytes);
        assert!(config.cache_threshold_items < config.cache_max_items);
    }
}
