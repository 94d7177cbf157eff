use thiserror::Error;

use goma_proto::ErrorKind;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Net(#[from] goma_net::NetError),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("response exceeded the per-read timeout")]
    ReadTimeout,
    #[error("client is in fail-now state")]
    FailNow,
    #[error("throttled for longer than the 10-minute cap")]
    ThrottleCapExceeded,
    #[error("waited longer than 5 minutes for an access token")]
    TokenWaitCapExceeded,
    #[error("oauth2 refresh failed: {0}")]
    RefreshFailed(String),
}

impl RpcError {
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            RpcError::ReadTimeout | RpcError::ThrottleCapExceeded | RpcError::TokenWaitCapExceeded => ErrorKind::ErrTimeout,
            RpcError::Net(net) => net.to_error_kind(),
            _ => ErrorKind::Fail,
        }
    }
}
