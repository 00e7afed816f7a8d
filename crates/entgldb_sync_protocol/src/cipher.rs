//! Per-connection symmetric cipher state.
//!
//! Two AES-256-GCM keys are derived from the key-agreement secret with
//! HKDF-SHA256, one per direction. The initiator encrypts with key 0 and
//! decrypts with key 1; the responder does the reverse, so no key is ever
//! used in both directions.

use crate::envelope::SecureEnvelope;
use crate::error::{ProtocolError, ProtocolResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const KDF_INFO: &[u8] = b"entgldb-channel-v1";

/// Which side of the connection a node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// The side that opened the connection.
    Initiator,
    /// The side that accepted the connection.
    Responder,
}

/// Directional keys for one connection. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    encrypt_key: [u8; KEY_SIZE],
    decrypt_key: [u8; KEY_SIZE],
}

impl CipherState {
    /// Derives both directional keys from a shared secret.
    pub fn derive(shared_secret: &[u8], role: HandshakeRole) -> ProtocolResult<Self> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut key0 = [0u8; KEY_SIZE];
        let mut key1 = [0u8; KEY_SIZE];
        expand(&hk, 0, &mut key0)?;
        expand(&hk, 1, &mut key1)?;

        let state = match role {
            HandshakeRole::Initiator => Self {
                encrypt_key: key0,
                decrypt_key: key1,
            },
            HandshakeRole::Responder => Self {
                encrypt_key: key1,
                decrypt_key: key0,
            },
        };
        key0.zeroize();
        key1.zeroize();
        Ok(state)
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> ProtocolResult<SecureEnvelope> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.encrypt_key));
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Encryption)?;
        let split = ciphertext
            .len()
            .checked_sub(TAG_SIZE)
            .ok_or(ProtocolError::Encryption)?;
        let auth_tag = ciphertext.split_off(split);

        Ok(SecureEnvelope {
            ciphertext,
            nonce: nonce.to_vec(),
            auth_tag,
        })
    }

    /// Authenticates and decrypts an envelope.
    pub fn open(&self, envelope: &SecureEnvelope) -> ProtocolResult<Vec<u8>> {
        if envelope.nonce.len() != NONCE_SIZE || envelope.auth_tag.len() != TAG_SIZE {
            return Err(ProtocolError::InvalidEnvelope(
                "bad nonce or tag length".into(),
            ));
        }
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.decrypt_key));
        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);

        cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), sealed.as_slice())
            .map_err(|_| ProtocolError::Decryption)
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("encrypt_key", &"[REDACTED]")
            .field("decrypt_key", &"[REDACTED]")
            .finish()
    }
}

fn expand(hk: &Hkdf<Sha256>, tag: u8, out: &mut [u8; KEY_SIZE]) -> ProtocolResult<()> {
    let mut info = Vec::with_capacity(KDF_INFO.len() + 1);
    info.extend_from_slice(KDF_INFO);
    info.push(tag);
    hk.expand(&info, out)
        .map_err(|_| ProtocolError::KeyExchange("HKDF expand failed".into()))
}
