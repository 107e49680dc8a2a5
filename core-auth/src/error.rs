use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Non-2xx answer from the open platform, `code` parsed from the body.
    #[error("Provider error {code} (HTTP {status}): {message}")]
    Provider {
        status: u16,
        code: String,
        message: String,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Authorization code is missing")]
    MissingAuthCode,

    #[error("Token server cannot issue tokens: {0}")]
    TokenServer(String),

    #[error("QR code authorization failed: {0}")]
    QrCode(String),

    #[error("Authorization cancelled: {0}")]
    Cancelled(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl AuthError {
    /// Provider error code, or the HTTP status when the body carried none.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            AuthError::Provider { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
