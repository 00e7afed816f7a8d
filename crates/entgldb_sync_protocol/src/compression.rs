//! Payload compression.
//!
//! Compression is negotiated per connection during the application
//! handshake. A payload is compressed only when it exceeds the threshold and
//! compression actually makes it smaller.

use crate::error::{ProtocolError, ProtocolResult};

/// Payloads at or below this size are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Frame flag for an uncompressed payload.
pub const FLAG_NONE: u8 = 0;

/// A supported compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionScheme {
    /// LZ4 block format with a 4-byte little-endian size prefix.
    Lz4,
}

impl CompressionScheme {
    /// All schemes this build can read, in preference order.
    pub const SUPPORTED: &'static [CompressionScheme] = &[CompressionScheme::Lz4];

    /// Returns the name used during negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionScheme::Lz4 => "lz4",
        }
    }

    /// Parses a negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lz4" => Some(CompressionScheme::Lz4),
            _ => None,
        }
    }

    /// Returns the frame flag for this scheme.
    pub fn flag(&self) -> u8 {
        match self {
            CompressionScheme::Lz4 => 1,
        }
    }

    /// Maps a frame flag to a scheme. `None` means uncompressed.
    pub fn from_flag(flag: u8) -> ProtocolResult<Option<Self>> {
        match flag {
            FLAG_NONE => Ok(None),
            1 => Ok(Some(CompressionScheme::Lz4)),
            other => Err(ProtocolError::UnknownCompression(other)),
        }
    }

    /// Names of all supported schemes, for a handshake offer.
    pub fn supported_names() -> Vec<String> {
        Self::SUPPORTED.iter().map(|s| s.name().to_string()).collect()
    }

    /// Picks the first locally supported scheme the peer offered.
    pub fn negotiate(offered: &[String]) -> Option<Self> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|scheme| offered.iter().any(|name| name == scheme.name()))
    }

    /// Compresses `payload` if it is larger than `threshold` and shrinks.
    pub fn compress_if_smaller(&self, payload: &[u8], threshold: usize) -> Option<Vec<u8>> {
        if payload.len() <= threshold {
            return None;
        }
        let compressed = match self {
            CompressionScheme::Lz4 => lz4_flex::compress_prepend_size(payload),
        };
        (compressed.len() < payload.len()).then_some(compressed)
    }

    /// Inflates a payload, refusing outputs larger than `limit`.
    pub fn decompress(&self, payload: &[u8], limit: usize) -> ProtocolResult<Vec<u8>> {
        match self {
            CompressionScheme::Lz4 => {
                let prefix: [u8; 4] = payload
                    .get(..4)
                    .and_then(|p| p.try_into().ok())
                    .ok_or_else(|| ProtocolError::Decompression("missing size prefix".into()))?;
                let declared = u32::from_le_bytes(prefix) as usize;
                if declared > limit {
                    return Err(ProtocolError::FrameTooLarge {
                        length: declared,
                        limit,
                    });
                }
                lz4_flex::decompress_size_prepended(payload)
                    .map_err(|e| ProtocolError::Decompression(e.to_string()))
            }
        }
    }
}
