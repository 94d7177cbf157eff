//! `compiler-proxy`: the daemon that embeds this workspace's core (spec §6
//! "CLI surface (of the process that embeds this core)"). Parses the
//! string-typed configuration options, builds a `RuntimeContext`, and
//! starts the local IPC server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use goma_client::{handlers, RuntimeContext};
use goma_ipc::IpcServer;
use goma_proto::Config;

/// Mirrors spec §6's string-typed options one field per flag/env var; the
/// core itself exposes no flags, but the process that embeds it does.
#[derive(Parser, Debug)]
#[command(name = "compiler-proxy", about = "Local compilation-accelerator daemon")]
struct Args {
    #[arg(long, env = "SOCKET_NAME", default_value = "goma.ipc")]
    socket_name: String,
    #[arg(long, env = "NAMEDPIPE_WAIT_TIMEOUT_MS", default_value_t = 5000)]
    namedpipe_wait_timeout_ms: u64,
    #[arg(long, env = "COMPILER_PROXY_DAEMON_STDERR")]
    compiler_proxy_daemon_stderr: Option<PathBuf>,
    #[arg(long, env = "GOMACC_LOCK_FILENAME", default_value = "goma_compiler_proxy.lock")]
    gomacc_lock_filename: PathBuf,

    #[arg(long, env = "USE_LOCAL", default_value_t = true)]
    use_local: bool,
    #[arg(long, env = "FALLBACK", default_value_t = true)]
    fallback: bool,
    #[arg(long, env = "STORE_ONLY", default_value_t = false)]
    store_only: bool,
    #[arg(long, env = "USE_SUCCESS", default_value_t = true)]
    use_success: bool,
    #[arg(long, env = "RETRY", default_value_t = 5)]
    retry: u32,

    #[arg(long, env = "REMOTE_HOST", default_value = "localhost")]
    remote_host: String,
    #[arg(long, env = "REMOTE_PORT", default_value_t = 8088)]
    remote_port: u16,
    #[arg(long, env = "REMOTE_USE_TLS", default_value_t = false)]
    remote_use_tls: bool,

    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = 4)]
    worker_pool_size: usize,
    #[arg(long, env = "SUBPROCESS_HELPER_BINARY", default_value = "goma-subprocess-helper")]
    subprocess_helper_binary: PathBuf,

    #[arg(long, env = "CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    #[arg(long, env = "CACHE_MAX_BYTES", default_value_t = 10 * (1u64 << 30))]
    cache_max_bytes: u64,
    #[arg(long, env = "CACHE_THRESHOLD_BYTES", default_value_t = 8 * (1u64 << 30))]
    cache_threshold_bytes: u64,
    #[arg(long, env = "CACHE_MAX_ITEMS", default_value_t = 100_000)]
    cache_max_items: usize,
    #[arg(long, env = "CACHE_THRESHOLD_ITEMS", default_value_t = 90_000)]
    cache_threshold_items: usize,

    #[arg(long, env = "DUMP", default_value_t = false)]
    dump: bool,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::default();
        config.socket_name = self.socket_name;
        config.namedpipe_wait_timeout = Duration::from_millis(self.namedpipe_wait_timeout_ms);
        config.compiler_proxy_daemon_stderr = self.compiler_proxy_daemon_stderr;
        config.gomacc_lock_filename = self.gomacc_lock_filename;
        config.use_local = self.use_local;
        config.fallback = self.fallback;
        config.store_only = self.store_only;
        config.use_success = self.use_success;
        config.retry = self.retry;
        config.remote_host = self.remote_host;
        config.remote_port = self.remote_port;
        config.remote_use_tls = self.remote_use_tls;
        config.worker_pool_size = self.worker_pool_size;
        config.subprocess_helper_binary = self.subprocess_helper_binary;
        config.cache_dir = self.cache_dir.unwrap_or(config.cache_dir);
        config.cache_max_bytes = self.cache_max_bytes;
        config.cache_threshold_bytes = self.cache_threshold_bytes;
        config.cache_max_items = self.cache_max_items;
        config.cache_threshold_items = self.cache_threshold_items;
        config.dump = self.dump;
        config
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Args::parse().into_config();
    let context = RuntimeContext::new(config)?;

    let socket_path = std::env::temp_dir().join(&context.config.socket_name);
    let handlers = handlers::build(std::sync::Arc::clone(&context));

    #[cfg(unix)]
    let _server = IpcServer::bind(socket_path.clone(), handlers)?;
    #[cfg(not(unix))]
    {
        let _ = (&socket_path, handlers);
        anyhow::bail!("compiler-proxy's IPC server is POSIX-only in this build; see goma_ipc::windows_pipe");
    }

    info!(socket = %socket_path.display(), "compiler-proxy ready");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
