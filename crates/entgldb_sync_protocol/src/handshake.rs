//! Ephemeral X25519 key agreement.
//!
//! Each side creates a [`KeyExchange`], sends its 32-byte public key over the
//! raw stream, and completes the exchange with the peer's key to obtain a
//! [`CipherState`]. The transport that carries the keys lives elsewhere.

use crate::cipher::{CipherState, HandshakeRole};
use crate::error::{ProtocolError, ProtocolResult};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Size of an encoded public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// One side of an ephemeral key agreement.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns the public key to send to the peer.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Completes the agreement with the peer's public key.
    ///
    /// Low-order peer keys, which would force a predictable secret, are
    /// rejected.
    pub fn complete(
        self,
        peer_public: [u8; PUBLIC_KEY_SIZE],
        role: HandshakeRole,
    ) -> ProtocolResult<CipherState> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(ProtocolError::KeyExchange(
                "peer sent a low-order public key".into(),
            ));
        }
        CipherState::derive(shared.as_bytes(), role)
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let initiator = KeyExchange::new();
        let responder = KeyExchange::new();
        let (ipub, rpub) = (initiator.public_key(), responder.public_key());

        let icipher = initiator.complete(rpub, HandshakeRole::Initiator).unwrap();
        let rcipher = responder.complete(ipub, HandshakeRole::Responder).unwrap();

        let envelope = icipher.seal(b"ping").unwrap();
        assert_eq!(rcipher.open(&envelope).unwrap(), b"ping");
        let envelope = rcipher.seal(b"pong").unwrap();
        assert_eq!(icipher.open(&envelope).unwrap(), b"pong");
    }

    #[test]
    fn fresh_keys_each_time() {
        assert_ne!(KeyExchange::new().public_key(), KeyExchange::new().public_key());
    }

    #[test]
    fn low_order_key_rejected() {
        let exchange = KeyExchange::new();
        let result = exchange.complete([0u8; PUBLIC_KEY_SIZE], HandshakeRole::Initiator);
        assert!(matches!(result, Err(ProtocolError::KeyExchange(_))));
    }
}
