//! Error types for EntglDb core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in EntglDb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// JSON content could not be parsed or produced.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A peer address was not of the form `host:port`.
    #[error("invalid peer address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// Unknown peer type code.
    #[error("unknown peer type code: {0}")]
    UnknownPeerType(u8),

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The storage collaborator failed to read or persist.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid address error.
    pub fn invalid_address(address: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
