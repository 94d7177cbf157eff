//! `RuntimeContext` (spec §9's closing design note): the typed structure
//! that holds every process-wide singleton this workspace has — worker
//! pool, remote RPC client, local output cache, subprocess controller —
//! and is threaded through construction instead of being reached via
//! globals. Test harnesses build their own `RuntimeContext` with a subset
//! of these overridden (e.g. an in-process loopback server for `http`).

use std::sync::Arc;

use tracing::info;

use goma_cache::LocalOutputCache;
use goma_proto::Config;
use goma_rpc::{HttpClient, OAuth2RefreshTask};
use goma_subprocess::SubprocessControllerClient;
use goma_worker::WorkerThreadManager;

use crate::error::ClientError;
use crate::oauth;

pub struct RuntimeContext {
    pub config: Config,
    pub workers: Arc<WorkerThreadManager>,
    pub http: Arc<HttpClient>,
    pub oauth2: Option<Arc<OAuth2RefreshTask>>,
    pub cache: Arc<LocalOutputCache>,
    pub subprocess: Arc<SubprocessControllerClient>,
}

impl RuntimeContext {
    pub fn new(config: Config) -> Result<Arc<Self>, ClientError> {
        let workers = Arc::new(WorkerThreadManager::new(config.worker_pool_size)?);
        info!(workers = config.worker_pool_size, "worker thread manager started");

        let oauth2 = config
            .oauth
            .as_ref()
            .map(oauth::to_refresh_config)
            .transpose()?
            .map(|refresh_config| OAuth2RefreshTask::new(refresh_config, Arc::clone(&workers)));

        let http = HttpClient::new(
            config.remote_host.clone(),
            config.remote_port,
            config.remote_use_tls,
            Arc::clone(&workers),
            oauth2.clone(),
        )?;
        info!(host = %config.remote_host, port = config.remote_port, tls = config.remote_use_tls, "rpc client ready");

        let cache = LocalOutputCache::init(
            config.cache_dir.clone(),
            config.cache_max_bytes,
            config.cache_threshold_bytes,
            config.cache_max_items,
            config.cache_threshold_items,
        );

        let helper_path = config.subprocess_helper_binary.to_string_lossy().into_owned();
        let subprocess = SubprocessControllerClient::spawn(&helper_path, Arc::clone(&workers))
            .map_err(ClientError::SubprocessHelper)?;
        info!(helper = %helper_path, "subprocess helper spawned");

        Ok(Arc::new(RuntimeContext { config, workers, http, oauth2, cache, subprocess }))
    }

    /// Orderly shutdown: stops accepting new RPC/subprocess work first, the
    /// worker pool's own `Drop` joins its threads once every `Arc` clone
    /// (held by in-flight tasks) has been released.
    pub fn shutdown(&self) {
        self.http.shutdown();
        self.subprocess.shutdown();
        self.cache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fails_cleanly_when_the_subprocess_helper_binary_is_missing() {
        let mut config = Config::default();
        config.worker_pool_size = 1;
        config.subprocess_helper_binary = "/nonexistent/goma-subprocess-helper".into();
        config.cache_dir = tempfile::tempdir().expect("tempdir").into_path();

        let result = RuntimeContext::new(config);
        assert!(result.is_err());
    }
}
