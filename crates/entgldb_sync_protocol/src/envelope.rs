//! Secure envelope wrapping an encrypted frame.

use crate::cbor::{from_cbor, to_cbor};
use crate::cipher::{NONCE_SIZE, TAG_SIZE};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Ciphertext of `[type | compression flag | payload]` with its nonce and tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureEnvelope {
    /// AES-256-GCM ciphertext without the tag.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Fresh random nonce.
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// GCM authentication tag.
    #[serde(with = "serde_bytes")]
    pub auth_tag: Vec<u8>,
}

impl SecureEnvelope {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and checks nonce and tag sizes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Self =
            from_cbor(bytes).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        if envelope.nonce.len() != NONCE_SIZE {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "nonce is {} bytes",
                envelope.nonce.len()
            )));
        }
        if envelope.auth_tag.len() != TAG_SIZE {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "auth tag is {} bytes",
                envelope.auth_tag.len()
            )));
        }
        Ok(envelope)
    }
}
