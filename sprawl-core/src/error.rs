use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Object disposed: {0}")]
    Disposed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Processing fault: {0}")]
    ProcessingFault(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrawlError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CrawlError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
