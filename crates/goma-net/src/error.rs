use thiserror::Error;

use goma_proto::ErrorKind;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dns resolution failed for {0}")]
    Resolution(String),
    #[error("all addresses for this destination are cooled down")]
    AllAddressesCooledDown,
    #[error("connect deadline ({0:?}) exceeded")]
    ConnectTimeout(std::time::Duration),
    #[error("tls handshake wants more input (not an error)")]
    WantRead,
    #[error("tls handshake wants to write (not an error)")]
    WantWrite,
    #[error("certificate verification failed: {0}")]
    VerifyError(String),
    #[error("tls context poisoned until {0:?} after repeated CRL failures")]
    ContextPoisoned(std::time::Instant),
}

impl NetError {
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            NetError::WantRead => ErrorKind::TlsWantRead,
            NetError::WantWrite => ErrorKind::TlsWantWrite,
            NetError::VerifyError(_) => ErrorKind::TlsVerifyError,
            NetError::ConnectTimeout(_) => ErrorKind::ErrTimeout,
            _ => ErrorKind::Fail,
        }
    }
}
