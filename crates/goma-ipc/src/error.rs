use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("peer credential check failed: {0}")]
    CredentialRejected(String),
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("request body could not be decoded: {0}")]
    BadBody(String),
}
