use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("worker thread manager: {0}")]
    Worker(#[from] goma_worker::WorkerError),
    #[error("rpc client: {0}")]
    Rpc(#[from] goma_rpc::RpcError),
    #[error("ipc server: {0}")]
    Ipc(#[from] goma_ipc::IpcError),
    #[error("failed to spawn subprocess helper: {0}")]
    SubprocessHelper(std::io::Error),
    #[error("failed to read oauth2 private key at {path}: {source}")]
    OAuthKeyRead { path: std::path::PathBuf, source: std::io::Error },
}
