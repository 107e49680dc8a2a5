use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Authentication error: {0}")]
    Auth(#[from] core_auth::AuthError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] core_transfer::TransferError),
}

impl CoreError {
    /// Stable code for hosts; provider codes pass through unchanged.
    pub fn code(&self) -> &str {
        match self {
            CoreError::InitializationFailed(_) | CoreError::Runtime(_) => "RequestInvalid",
            CoreError::Auth(error) => error.provider_code().unwrap_or("AuthenticationInvalid"),
            CoreError::Transfer(error) => error.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
