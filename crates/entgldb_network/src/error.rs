//! Error types for the network layer.

use entgldb_core::CoreError;
use entgldb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// How a failure should be treated by the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connect, read, write or disconnect. Retried on the next cycle.
    Transport,
    /// Bad key exchange, rejected token, failed decryption. Fatal for the
    /// connection, not retried within the cycle.
    Authorization,
    /// Unexpected or malformed message. Fatal for the connection.
    Protocol,
    /// Local or remote storage failed.
    Storage,
    /// Misconfiguration or a failed background task.
    Internal,
}

/// Errors that can occur in the network layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error on a socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach a peer.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Peer address.
        address: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The peer closed the connection, possibly mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation exceeded its time limit.
    #[error("{operation} timed out")]
    Timeout {
        /// What timed out.
        operation: &'static str,
    },

    /// The peer refused the application handshake.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Reason given by the peer.
        reason: String,
    },

    /// Frame or message level failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Store(#[from] CoreError),

    /// The peer could not apply pushed entries.
    #[error("peer rejected push: {0}")]
    PushRejected(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The component was stopped and cannot be restarted.
    #[error("component stopped")]
    Stopped,

    /// A background task failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NetworkError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns the failure category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetworkError::Io(_)
            | NetworkError::Connect { .. }
            | NetworkError::ConnectionClosed
            | NetworkError::Timeout { .. } => ErrorCategory::Transport,
            NetworkError::HandshakeRejected { .. } => ErrorCategory::Authorization,
            NetworkError::Protocol(e) if e.is_security_failure() => ErrorCategory::Authorization,
            NetworkError::Protocol(_) => ErrorCategory::Protocol,
            NetworkError::Store(_) | NetworkError::PushRejected(_) => ErrorCategory::Storage,
            NetworkError::Config(_) | NetworkError::Stopped | NetworkError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns true if the fault lies with this node rather than the peer
    /// or the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            NetworkError::Store(_)
                | NetworkError::Config(_)
                | NetworkError::Stopped
                | NetworkError::Internal(_)
        )
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_faults() {
        assert!(NetworkError::Store(CoreError::storage("disk full")).is_local());
        assert!(NetworkError::Internal("join failed".into()).is_local());
        assert!(!NetworkError::PushRejected("disk full".into()).is_local());
        assert!(!NetworkError::ConnectionClosed.is_local());
    }

    #[test]
    fn categories() {
        assert_eq!(
            NetworkError::ConnectionClosed.category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            NetworkError::Timeout { operation: "connect" }.category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            NetworkError::HandshakeRejected {
                reason: "bad token".into()
            }
            .category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            NetworkError::Protocol(ProtocolError::Decryption).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            NetworkError::Protocol(ProtocolError::UnknownMessageType(3)).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            NetworkError::Store(CoreError::storage("disk full")).category(),
            ErrorCategory::Storage
        );
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(NetworkError::ConnectionClosed.is_retryable());
        assert!(!NetworkError::Protocol(ProtocolError::Decryption).is_retryable());
        assert!(!NetworkError::PushRejected("no".into()).is_retryable());
        assert!(!NetworkError::Stopped.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = NetworkError::Timeout {
            operation: "handshake",
        };
        assert_eq!(err.to_string(), "handshake timed out");
    }
}
