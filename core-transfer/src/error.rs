//! Error types for transfers

use bridge_traits::error::BridgeError;
use core_auth::AuthError;
use thiserror::Error;

/// Transfer errors.
///
/// Validation problems surface synchronously from the build operations.
/// Once a task exists, errors only reach the host inside
/// `TaskState::Failed`.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Rejected before any request was made
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote resource cannot be transferred (folder, empty, unnamed)
    #[error("Resource not transferable: {0}")]
    NotTransferable(String),

    /// The upload target already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Signed URL lease ran out; the engine refetches and resumes
    #[error("Signed URL expired: {0}")]
    SignedUrlExpired(String),

    #[error("Transfer cancelled")]
    Cancelled,

    /// API answered with a non-2xx status
    #[error("Provider error {code} (HTTP {status}): {message}")]
    Provider {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Authentication error: {0}")]
    Auth(AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Malformed response: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Provider code asking the uploader to retry without pre-hash.
pub const PRE_HASH_MATCHED: &str = "PreHashMatched";

impl TransferError {
    /// Stable error code for hosts.
    pub fn code(&self) -> &str {
        match self {
            TransferError::InvalidArgument(_) => "RequestInvalid",
            TransferError::NotTransferable(_) => "ResourceNotTransferable",
            TransferError::Conflict(_) => "FileAlreadyExist",
            TransferError::SignedUrlExpired(_) => "SignedUrlExpired",
            TransferError::Cancelled => "Cancelled",
            TransferError::Provider { code, .. } => code,
            TransferError::Auth(_) => "AuthenticationInvalid",
            TransferError::Io(_) => "IoError",
            TransferError::Http(_) => "NetworkError",
            TransferError::Runtime(_) => "RequestInvalid",
            TransferError::Serialization(_) => "ResponseInvalid",
        }
    }

    /// Only an expired signed URL is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::SignedUrlExpired(_))
    }

    pub fn is_pre_hash_matched(&self) -> bool {
        matches!(self, TransferError::Provider { code, .. } if code == PRE_HASH_MATCHED)
    }
}

impl From<AuthError> for TransferError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Provider {
                status,
                code,
                message,
            } => TransferError::Provider {
                status,
                code,
                message,
            },
            AuthError::Http(e) => TransferError::Http(e),
            other => TransferError::Auth(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_expiry_is_retryable() {
        assert!(TransferError::SignedUrlExpired("x".into()).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn test_provider_errors_keep_their_code() {
        let error: TransferError = AuthError::Provider {
            status: 400,
            code: "PreHashMatched".to_string(),
            message: "pre hash matched".to_string(),
        }
        .into();

        assert_eq!(error.code(), "PreHashMatched");
        assert!(error.is_pre_hash_matched());
        assert_eq!(
            TransferError::InvalidArgument("drive id".into()).code(),
            "RequestInvalid"
        );
    }
}
