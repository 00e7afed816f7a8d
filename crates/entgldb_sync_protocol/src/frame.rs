//! Frame layout and the per-connection frame codec.
//!
//! Byte layout of every frame:
//!
//! ```text
//! length: u32 LE | type: u8 | compression flag: u8 | payload: [u8; length]
//! ```
//!
//! With a cipher state, `[type | flag | payload]` is sealed into a
//! [`SecureEnvelope`] that becomes the payload of an outer frame of type
//! [`MessageType::SecureEnvelope`] with flag 0.

use crate::cipher::CipherState;
use crate::compression::{CompressionScheme, COMPRESSION_THRESHOLD, FLAG_NONE};
use crate::envelope::SecureEnvelope;
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{MessageType, SyncMessage};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of a frame set aside for the message wrapper and the envelope when
/// sizing a page of entries.
pub const FRAME_RESERVE: usize = 1024;

/// Returns the entry budget of one page for frames of at most
/// `max_frame_size` bytes.
pub fn page_budget(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(FRAME_RESERVE).max(1)
}

/// The fixed header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Raw message type code.
    pub message_type: u8,
    /// Raw compression flag.
    pub flag: u8,
}

impl FrameHeader {
    /// Encodes the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4] = self.message_type;
        bytes[5] = self.flag;
        bytes
    }

    /// Decodes a header.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            message_type: bytes[4],
            flag: bytes[5],
        }
    }
}

/// Encodes and decodes frames for one connection.
///
/// Starts as a plaintext codec without compression. The cipher is installed
/// after the key exchange and compression after the application handshake.
#[derive(Debug)]
pub struct FrameCodec {
    cipher: Option<CipherState>,
    compression: Option<CompressionScheme>,
    compression_threshold: usize,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a plaintext codec.
    pub fn new() -> Self {
        Self {
            cipher: None,
            compression: None,
            compression_threshold: COMPRESSION_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Encrypts all subsequent frames with `cipher`.
    pub fn with_cipher(mut self, cipher: CipherState) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Sets the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the maximum accepted payload size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Enables or disables compression for outgoing frames.
    pub fn set_compression(&mut self, scheme: Option<CompressionScheme>) {
        self.compression = scheme;
    }

    /// Returns the negotiated compression scheme.
    pub fn compression(&self) -> Option<CompressionScheme> {
        self.compression
    }

    /// Returns true if frames are encrypted.
    pub fn is_secure(&self) -> bool {
        self.cipher.is_some()
    }

    /// Returns the entry budget of one change-set or push page.
    pub fn page_budget(&self) -> usize {
        page_budget(self.max_frame_size)
    }

    /// Returns the maximum accepted payload size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encodes a message into a complete frame.
    pub fn encode_message(&self, message: &SyncMessage) -> ProtocolResult<Vec<u8>> {
        self.encode(message.message_type(), &message.encode()?)
    }

    /// Encodes a payload of the given type into a complete frame.
    pub fn encode(&self, message_type: MessageType, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        let compressed = self
            .compression
            .and_then(|scheme| {
                scheme
                    .compress_if_smaller(payload, self.compression_threshold)
                    .map(|bytes| (scheme.flag(), bytes))
            });
        let (flag, body) = match &compressed {
            Some((flag, bytes)) => (*flag, bytes.as_slice()),
            None => (FLAG_NONE, payload),
        };

        match &self.cipher {
            Some(cipher) => {
                let mut inner = Vec::with_capacity(body.len() + 2);
                inner.push(message_type.to_code());
                inner.push(flag);
                inner.extend_from_slice(body);
                let envelope = cipher.seal(&inner)?.encode()?;
                self.frame(MessageType::SecureEnvelope.to_code(), FLAG_NONE, &envelope)
            }
            None => self.frame(message_type.to_code(), flag, body),
        }
    }

    /// Validates a received header before its payload is read.
    pub fn check_header(&self, header: &FrameHeader) -> ProtocolResult<()> {
        let length = header.length as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                length,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Decodes a received frame into its message type and plain payload.
    pub fn decode(
        &self,
        header: &FrameHeader,
        body: &[u8],
    ) -> ProtocolResult<(MessageType, Vec<u8>)> {
        self.check_header(header)?;
        let outer = MessageType::from_code(header.message_type)?;

        let opened;
        let (type_code, flag, payload) = match (outer, &self.cipher) {
            (MessageType::SecureEnvelope, Some(cipher)) => {
                opened = cipher.open(&SecureEnvelope::decode(body)?)?;
                if opened.len() < 2 {
                    return Err(ProtocolError::InvalidEnvelope(
                        "sealed frame shorter than its header".into(),
                    ));
                }
                (opened[0], opened[1], &opened[2..])
            }
            (MessageType::SecureEnvelope, None) => {
                return Err(ProtocolError::SecurityMismatch(
                    "encrypted frame on a plaintext channel",
                ))
            }
            (_, Some(_)) => {
                return Err(ProtocolError::SecurityMismatch(
                    "plaintext frame on an encrypted channel",
                ))
            }
            (_, None) => (header.message_type, header.flag, body),
        };

        let message_type = MessageType::from_code(type_code)?;
        if message_type == MessageType::SecureEnvelope {
            return Err(ProtocolError::InvalidEnvelope("nested envelope".into()));
        }
        let payload = match CompressionScheme::from_flag(flag)? {
            Some(scheme) => scheme.decompress(payload, self.max_frame_size)?,
            None => payload.to_vec(),
        };
        Ok((message_type, payload))
    }

    /// Decodes a received frame into a message.
    pub fn decode_message(&self, header: &FrameHeader, body: &[u8]) -> ProtocolResult<SyncMessage> {
        let (message_type, payload) = self.decode(header, body)?;
        SyncMessage::decode(message_type, &payload)
    }

    fn frame(&self, type_code: u8, flag: u8, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                length: payload.len(),
                limit: self.max_frame_size,
            });
        }
        let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;
        let header = FrameHeader {
            length,
            message_type: type_code,
            flag,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
