//! Protocol messages for sync.
//!
//! Every message travels in one frame whose type byte is the message's
//! [`MessageType`] code. Bodies are CBOR maps.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use entgldb_core::{HlcTimestamp, OperationType, OplogEntry};
use serde::{Deserialize, Serialize};

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Application handshake request.
    HandshakeReq,
    /// Application handshake response.
    HandshakeRes,
    /// Request for the responder's latest oplog timestamp.
    GetClockReq,
    /// Latest oplog timestamp.
    ClockRes,
    /// Request for entries newer than a timestamp.
    PullChangesReq,
    /// Entries answering a pull.
    ChangeSetRes,
    /// Entries pushed to the responder.
    PushChangesReq,
    /// Acknowledgement of a push.
    AckRes,
    /// Outer frame type of an encrypted message.
    SecureEnvelope,
}

impl MessageType {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            MessageType::HandshakeReq => 1,
            MessageType::HandshakeRes => 2,
            MessageType::GetClockReq => 3,
            MessageType::ClockRes => 4,
            MessageType::PullChangesReq => 5,
            MessageType::ChangeSetRes => 6,
            MessageType::PushChangesReq => 7,
            MessageType::AckRes => 8,
            MessageType::SecureEnvelope => 0xFF,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            1 => Ok(MessageType::HandshakeReq),
            2 => Ok(MessageType::HandshakeRes),
            3 => Ok(MessageType::GetClockReq),
            4 => Ok(MessageType::ClockRes),
            5 => Ok(MessageType::PullChangesReq),
            6 => Ok(MessageType::ChangeSetRes),
            7 => Ok(MessageType::PushChangesReq),
            8 => Ok(MessageType::AckRes),
            0xFF => Ok(MessageType::SecureEnvelope),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Returns the message name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::HandshakeReq => "HandshakeReq",
            MessageType::HandshakeRes => "HandshakeRes",
            MessageType::GetClockReq => "GetClockReq",
            MessageType::ClockRes => "ClockRes",
            MessageType::PullChangesReq => "PullChangesReq",
            MessageType::ChangeSetRes => "ChangeSetRes",
            MessageType::PushChangesReq => "PushChangesReq",
            MessageType::AckRes => "AckRes",
            MessageType::SecureEnvelope => "SecureEnvelope",
        }
    }
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Handshake request.
    HandshakeRequest(HandshakeRequest),
    /// Handshake response.
    HandshakeResponse(HandshakeResponse),
    /// Clock request. Carries no body.
    GetClockRequest,
    /// Clock response.
    ClockResponse(ClockResponse),
    /// Pull request.
    PullChangesRequest(PullChangesRequest),
    /// Pull response.
    ChangeSetResponse(ChangeSetResponse),
    /// Push request.
    PushChangesRequest(PushChangesRequest),
    /// Push acknowledgement.
    AckResponse(AckResponse),
}

impl SyncMessage {
    /// Returns the frame type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::HandshakeRequest(_) => MessageType::HandshakeReq,
            SyncMessage::HandshakeResponse(_) => MessageType::HandshakeRes,
            SyncMessage::GetClockRequest => MessageType::GetClockReq,
            SyncMessage::ClockResponse(_) => MessageType::ClockRes,
            SyncMessage::PullChangesRequest(_) => MessageType::PullChangesReq,
            SyncMessage::ChangeSetResponse(_) => MessageType::ChangeSetRes,
            SyncMessage::PushChangesRequest(_) => MessageType::PushChangesReq,
            SyncMessage::AckResponse(_) => MessageType::AckRes,
        }
    }

    /// Returns the message name for logs and errors.
    pub fn name(&self) -> &'static str {
        self.message_type().name()
    }

    /// Encodes the message body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        match self {
            SyncMessage::HandshakeRequest(m) => to_cbor(m),
            SyncMessage::HandshakeResponse(m) => to_cbor(m),
            SyncMessage::GetClockRequest => Ok(Vec::new()),
            SyncMessage::ClockResponse(m) => to_cbor(m),
            SyncMessage::PullChangesRequest(m) => to_cbor(m),
            SyncMessage::ChangeSetResponse(m) => to_cbor(m),
            SyncMessage::PushChangesRequest(m) => to_cbor(m),
            SyncMessage::AckResponse(m) => to_cbor(m),
        }
    }

    /// Decodes a message body of the given type.
    pub fn decode(message_type: MessageType, body: &[u8]) -> ProtocolResult<Self> {
        Ok(match message_type {
            MessageType::HandshakeReq => SyncMessage::HandshakeRequest(from_cbor(body)?),
            MessageType::HandshakeRes => SyncMessage::HandshakeResponse(from_cbor(body)?),
            MessageType::GetClockReq => SyncMessage::GetClockRequest,
            MessageType::ClockRes => SyncMessage::ClockResponse(from_cbor(body)?),
            MessageType::PullChangesReq => SyncMessage::PullChangesRequest(from_cbor(body)?),
            MessageType::ChangeSetRes => SyncMessage::ChangeSetResponse(from_cbor(body)?),
            MessageType::PushChangesReq => SyncMessage::PushChangesRequest(from_cbor(body)?),
            MessageType::AckRes => SyncMessage::AckResponse(from_cbor(body)?),
            MessageType::SecureEnvelope => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "sync message",
                    actual: MessageType::SecureEnvelope.name(),
                })
            }
        })
    }
}

/// Application-level handshake sent by the connecting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Id of the connecting node.
    pub node_id: String,
    /// Pre-shared cluster secret.
    pub auth_token: String,
    /// Compression schemes the sender can read, by name.
    pub supported_compression: Vec<String>,
}

impl HandshakeRequest {
    /// Creates a new handshake request.
    pub fn new(
        node_id: impl Into<String>,
        auth_token: impl Into<String>,
        supported_compression: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            auth_token: auth_token.into(),
            supported_compression,
        }
    }
}

/// Handshake response from the accepting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Id of the accepting node.
    pub node_id: String,
    /// Whether the session was authorized.
    pub accepted: bool,
    /// Compression scheme both sides will use, if any.
    pub selected_compression: Option<String>,
    /// Why the session was refused.
    pub reason: Option<String>,
}

impl HandshakeResponse {
    /// Creates an accepting response.
    pub fn accepted(node_id: impl Into<String>, selected_compression: Option<String>) -> Self {
        Self {
            node_id: node_id.into(),
            accepted: true,
            selected_compression,
            reason: None,
        }
    }

    /// Creates a refusing response.
    pub fn rejected(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            accepted: false,
            selected_compression: None,
            reason: Some(reason.into()),
        }
    }
}

/// The responder's latest oplog timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockResponse {
    /// Latest timestamp, zero for an empty log.
    pub timestamp: HlcTimestamp,
}

/// Request for entries strictly newer than `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullChangesRequest {
    /// Exclusive lower bound.
    pub since: HlcTimestamp,
}

/// Entries answering a pull, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetResponse {
    /// Entries in wire form.
    pub entries: Vec<WireEntry>,
}

impl ChangeSetResponse {
    /// Builds a response from oplog entries.
    pub fn from_entries(entries: &[OplogEntry]) -> ProtocolResult<Self> {
        Ok(Self {
            entries: WireEntry::encode_all(entries)?,
        })
    }

    /// Builds a response from the leading entries that fit in `budget`
    /// encoded bytes. See [`WireEntry::page`].
    pub fn page(entries: &[OplogEntry], budget: usize) -> ProtocolResult<Self> {
        Ok(Self {
            entries: WireEntry::page(entries, budget)?,
        })
    }

    /// Converts the carried entries back to oplog entries.
    pub fn into_entries(self) -> ProtocolResult<Vec<OplogEntry>> {
        WireEntry::decode_all(self.entries)
    }
}

/// Entries pushed to the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushChangesRequest {
    /// Entries in wire form.
    pub entries: Vec<WireEntry>,
}

impl PushChangesRequest {
    /// Builds a request from oplog entries.
    pub fn from_entries(entries: &[OplogEntry]) -> ProtocolResult<Self> {
        Ok(Self {
            entries: WireEntry::encode_all(entries)?,
        })
    }

    /// Builds a request from the leading entries that fit in `budget`
    /// encoded bytes. See [`WireEntry::page`].
    pub fn page(entries: &[OplogEntry], budget: usize) -> ProtocolResult<Self> {
        Ok(Self {
            entries: WireEntry::page(entries, budget)?,
        })
    }

    /// Converts the carried entries back to oplog entries.
    pub fn into_entries(self) -> ProtocolResult<Vec<OplogEntry>> {
        WireEntry::decode_all(self.entries)
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Whether all entries were applied.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl AckResponse {
    /// Creates a successful ack.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Creates a failed ack.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// An oplog entry as carried on the wire.
///
/// The payload travels as JSON text so documents keep their exact JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Collection name.
    pub collection: String,
    /// Document key.
    pub key: String,
    /// `"Put"` or `"Delete"`.
    pub operation: String,
    /// JSON payload, absent for deletes.
    pub json_data: Option<String>,
    /// Originating timestamp.
    pub timestamp: HlcTimestamp,
}

impl WireEntry {
    /// Converts an oplog entry to wire form.
    pub fn from_entry(entry: &OplogEntry) -> ProtocolResult<Self> {
        let json_data = entry
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ProtocolError::MalformedEntry(e.to_string()))?;
        Ok(Self {
            collection: entry.collection.clone(),
            key: entry.key.clone(),
            operation: entry.operation.as_str().to_string(),
            json_data,
            timestamp: entry.timestamp.clone(),
        })
    }

    /// Converts back to an oplog entry.
    pub fn into_entry(self) -> ProtocolResult<OplogEntry> {
        let operation: OperationType = self
            .operation
            .parse()
            .map_err(ProtocolError::MalformedEntry)?;
        let payload = self
            .json_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                ProtocolError::MalformedEntry(format!("{}/{}: {e}", self.collection, self.key))
            })?;
        Ok(OplogEntry {
            collection: self.collection,
            key: self.key,
            operation,
            payload,
            timestamp: self.timestamp,
        })
    }

    /// Converts the longest prefix of `entries` whose encoded size stays
    /// within `budget` bytes.
    ///
    /// A page always holds at least one entry, and never ends between two
    /// entries sharing a timestamp, so a reader resuming after the last
    /// timestamp of a page misses nothing.
    pub fn page(entries: &[OplogEntry], budget: usize) -> ProtocolResult<Vec<Self>> {
        let mut page = Vec::new();
        let mut used = 0usize;
        for entry in entries {
            let wire = Self::from_entry(entry)?;
            let len = to_cbor(&wire)?.len();
            let same_timestamp = page
                .last()
                .is_some_and(|last: &Self| last.timestamp == wire.timestamp);
            if !page.is_empty() && !same_timestamp && used.saturating_add(len) > budget {
                break;
            }
            used = used.saturating_add(len);
            page.push(wire);
        }
        Ok(page)
    }

    fn encode_all(entries: &[OplogEntry]) -> ProtocolResult<Vec<Self>> {
        entries.iter().map(Self::from_entry).collect()
    }

    fn decode_all(entries: Vec<Self>) -> ProtocolResult<Vec<OplogEntry>> {
        entries.into_iter().map(Self::into_entry).collect()
    }
}
