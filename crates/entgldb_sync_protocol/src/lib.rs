//! # EntglDb Sync Protocol
//!
//! Wire protocol for EntglDb peer-to-peer sync.
//!
//! This crate provides:
//! - `SyncMessage` and its request/response bodies (Handshake, GetClock, Pull, Push)
//! - `FrameCodec` for length-prefixed frames with optional compression and encryption
//! - `SecureEnvelope`, the encrypted frame wrapper
//! - `KeyExchange` and `CipherState` for per-connection key agreement and AEAD
//! - `CompressionScheme` negotiation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod cipher;
mod compression;
mod envelope;
mod error;
mod frame;
mod handshake;
mod messages;

pub use cipher::{CipherState, HandshakeRole, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use compression::{CompressionScheme, COMPRESSION_THRESHOLD, FLAG_NONE};
pub use envelope::SecureEnvelope;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    page_budget, FrameCodec, FrameHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_RESERVE, HEADER_LEN,
};
pub use handshake::{KeyExchange, PUBLIC_KEY_SIZE};
pub use messages::{
    AckResponse, ChangeSetResponse, ClockResponse, HandshakeRequest, HandshakeResponse,
    MessageType, PullChangesRequest, PushChangesRequest, SyncMessage, WireEntry,
};
