//! Cluster token validation.
//!
//! The configured token is never compared directly. Both the expected and the
//! presented token are run through HMAC-SHA256 under a per-process random key,
//! and the tags are compared in constant time.

use crate::error::{NetworkError, NetworkResult};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Checks presented auth tokens against the configured cluster secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: [u8; 32],
    expected: Vec<u8>,
}

impl TokenValidator {
    /// Creates a validator for `token`.
    pub fn new(token: &str) -> NetworkResult<Self> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let expected = Self::mac(&key, token.as_bytes())?
            .finalize()
            .into_bytes()
            .to_vec();
        Ok(Self { key, expected })
    }

    /// Returns true if `presented` equals the configured token.
    pub fn validate(&self, presented: &str) -> bool {
        match Self::mac(&self.key, presented.as_bytes()) {
            Ok(mac) => mac.verify_slice(&self.expected).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(key: &[u8], data: &[u8]) -> NetworkResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| NetworkError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}
