//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding, decoding or protecting protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message body could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// The frame carried a type code this protocol does not define.
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A well-formed message arrived where another was required.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// What arrived instead.
        actual: &'static str,
    },

    /// Declared frame or payload length exceeds the configured limit.
    #[error("frame too large: {length} bytes (limit {limit})")]
    FrameTooLarge {
        /// Declared length.
        length: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The compression flag is not one this protocol defines.
    #[error("unknown compression flag: {0}")]
    UnknownCompression(u8),

    /// A compressed payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// A secure envelope was structurally invalid.
    #[error("invalid secure envelope: {0}")]
    InvalidEnvelope(String),

    /// Authenticated decryption failed.
    #[error("decryption failed")]
    Decryption,

    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// A plaintext frame arrived on a channel that requires encryption,
    /// or an envelope arrived on a channel without keys.
    #[error("channel security mismatch: {0}")]
    SecurityMismatch(&'static str),

    /// Key agreement or key derivation failed.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// An oplog entry on the wire could not be converted.
    #[error("malformed oplog entry: {0}")]
    MalformedEntry(String),
}

impl ProtocolError {
    /// Returns true if the error means the peer could not be trusted
    /// (as opposed to a malformed or unexpected message).
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decryption
                | ProtocolError::InvalidEnvelope(_)
                | ProtocolError::SecurityMismatch(_)
                | ProtocolError::KeyExchange(_)
        )
    }
}
