use thiserror::Error;

/// Failures reported by host bridge implementations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No implementation was supplied for a required bridge
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// The credential key-value store failed
    #[error("Key-value store error: {0}")]
    Storage(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
