use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("reactor error: {0}")]
    Reactor(#[from] goma_reactor::ReactorError),
    #[error("worker id {0} out of range (manager has {1} workers)")]
    NoSuchWorker(usize, usize),
    #[error("worker thread {0} panicked")]
    ThreadPanicked(usize),
}
