use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("i/o error polling descriptors: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor {0:?} already registered for I/O")]
    AlreadyRegistered(crate::descriptor::DescriptorId),
}
