//! Framed, optionally encrypted message channel over a byte stream.

use crate::error::{NetworkError, NetworkResult};
use entgldb_sync_protocol::{CompressionScheme, FrameCodec, FrameHeader, SyncMessage, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// A connection that exchanges whole [`SyncMessage`]s.
///
/// Generic over the stream so tests can run over in-memory pipes.
#[derive(Debug)]
pub struct SecureChannel<S> {
    stream: S,
    codec: FrameCodec,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream` with a configured codec.
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    /// Sends one message as a single frame.
    pub async fn send(&mut self, message: &SyncMessage) -> NetworkResult<()> {
        let frame = self.codec.encode_message(message)?;
        trace!(message = message.name(), bytes = frame.len(), "send frame");
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next message.
    ///
    /// A clean or mid-frame close yields [`NetworkError::ConnectionClosed`].
    pub async fn receive(&mut self) -> NetworkResult<SyncMessage> {
        let mut header = [0u8; HEADER_LEN];
        self.read_exact_or_closed(&mut header).await?;
        let header = FrameHeader::decode(&header);
        self.codec.check_header(&header)?;

        let mut body = vec![0u8; header.length as usize];
        self.read_exact_or_closed(&mut body).await?;
        let message = self.codec.decode_message(&header, &body)?;
        trace!(message = message.name(), bytes = body.len(), "received frame");
        Ok(message)
    }

    /// Switches compression for outgoing frames.
    pub fn set_compression(&mut self, scheme: Option<CompressionScheme>) {
        self.codec.set_compression(scheme);
    }

    /// Returns the encoded-entry budget of one change-set or push frame.
    pub fn page_budget(&self) -> usize {
        self.codec.page_budget()
    }

    /// Returns true if frames are encrypted.
    pub fn is_secure(&self) -> bool {
        self.codec.is_secure()
    }

    /// Closes the write half.
    pub async fn shutdown(&mut self) -> NetworkResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_exact_or_closed(&mut self, buf: &mut [u8]) -> NetworkResult<()> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(NetworkError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entgldb_core::{HlcTimestamp, OplogEntry};
    use entgldb_sync_protocol::{
        CipherState, ClockResponse, HandshakeRole, ProtocolError, PushChangesRequest,
    };
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn secure_pair() -> (SecureChannel<DuplexStream>, SecureChannel<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let secret = [9u8; 32];
        let left = FrameCodec::new()
            .with_cipher(CipherState::derive(&secret, HandshakeRole::Initiator).unwrap());
        let right = FrameCodec::new()
            .with_cipher(CipherState::derive(&secret, HandshakeRole::Responder).unwrap());
        (SecureChannel::new(a, left), SecureChannel::new(b, right))
    }

    #[tokio::test]
    async fn plaintext_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = SecureChannel::new(a, FrameCodec::new());
        let mut right = SecureChannel::new(b, FrameCodec::new());

        left.send(&SyncMessage::GetClockRequest).await.unwrap();
        assert_eq!(right.receive().await.unwrap(), SyncMessage::GetClockRequest);
        assert!(!left.is_secure());
    }

    #[tokio::test]
    async fn encrypted_compressed_round_trip() {
        let (mut left, mut right) = secure_pair();
        left.set_compression(Some(CompressionScheme::Lz4));
        assert!(left.is_secure());

        let entries: Vec<_> = (0..50)
            .map(|i| {
                OplogEntry::put(
                    "docs",
                    format!("k{i}"),
                    json!({ "body": "x".repeat(200) }),
                    HlcTimestamp::new(i, 0, "a"),
                )
            })
            .collect();
        let message =
            SyncMessage::PushChangesRequest(PushChangesRequest::from_entries(&entries).unwrap());

        left.send(&message).await.unwrap();
        assert_eq!(right.receive().await.unwrap(), message);

        let reply = SyncMessage::ClockResponse(ClockResponse {
            timestamp: HlcTimestamp::new(5, 1, "b"),
        });
        right.send(&reply).await.unwrap();
        assert_eq!(left.receive().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn close_reports_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        let mut channel = SecureChannel::new(a, FrameCodec::new());
        drop(b);
        assert!(matches!(
            channel.receive().await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_reports_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut channel = SecureChannel::new(a, FrameCodec::new());
        // Header announces 10 bytes, only 3 follow.
        b.write_all(&[10, 0, 0, 0, 3, 0, 1, 2, 3]).await.unwrap();
        drop(b);
        assert!(matches!(
            channel.receive().await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_read() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut channel = SecureChannel::new(a, FrameCodec::new().with_max_frame_size(16));
        b.write_all(&[0, 1, 0, 0, 3, 0]).await.unwrap();
        assert!(matches!(
            channel.receive().await,
            Err(NetworkError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn plaintext_peer_rejected_by_secure_side() {
        let (a, b) = tokio::io::duplex(4096);
        let mut plain = SecureChannel::new(a, FrameCodec::new());
        let secure_codec = FrameCodec::new()
            .with_cipher(CipherState::derive(&[1u8; 32], HandshakeRole::Responder).unwrap());
        let mut secure = SecureChannel::new(b, secure_codec);

        plain.send(&SyncMessage::GetClockRequest).await.unwrap();
        let err = secure.receive().await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Protocol(ProtocolError::SecurityMismatch(_))
        ));
    }
}
