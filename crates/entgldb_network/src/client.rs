//! Outbound sync sessions.

use crate::channel::SecureChannel;
use crate::config::NodeConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::handshake::perform_handshake;
use entgldb_core::{HlcTimestamp, OplogEntry, PeerNode};
use entgldb_sync_protocol::{
    CompressionScheme, FrameCodec, HandshakeRequest, HandshakeRole, ProtocolError,
    PullChangesRequest, PushChangesRequest, SyncMessage,
};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens authenticated sessions to peers.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    config: NodeConfig,
}

impl TcpPeerClient {
    /// Creates a client using the node's identity and timeouts.
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Connects to `peer`, runs the key exchange if enabled and completes the
    /// application handshake.
    pub async fn connect(&self, peer: &PeerNode) -> NetworkResult<PeerSession<TcpStream>> {
        let address = peer.node_address()?;
        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "connect",
        })?
        .map_err(|source| NetworkError::Connect {
            address: peer.address.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        debug!(peer = %peer.node_id, address = %peer.address, "connected");

        let mut codec = self.config.frame_codec();
        if self.config.secure {
            let cipher = perform_handshake(
                &mut stream,
                HandshakeRole::Initiator,
                self.config.handshake_timeout,
            )
            .await?;
            codec = codec.with_cipher(cipher);
        }

        let mut session = PeerSession::new(stream, codec, self.config.io_timeout);
        let request = HandshakeRequest::new(
            self.config.node_id.clone(),
            self.config.auth_token.clone(),
            if self.config.compression {
                CompressionScheme::supported_names()
            } else {
                Vec::new()
            },
        );
        tokio::time::timeout(self.config.handshake_timeout, session.handshake(request))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: "handshake",
            })??;
        Ok(session)
    }
}

/// An authenticated request/response session with one peer.
#[derive(Debug)]
pub struct PeerSession<S> {
    channel: SecureChannel<S>,
    io_timeout: Duration,
    remote_node_id: Option<String>,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream.
    pub fn new(stream: S, codec: FrameCodec, io_timeout: Duration) -> Self {
        Self {
            channel: SecureChannel::new(stream, codec),
            io_timeout,
            remote_node_id: None,
        }
    }

    /// Returns the peer's id once the handshake succeeded.
    pub fn remote_node_id(&self) -> Option<&str> {
        self.remote_node_id.as_deref()
    }

    /// Sends the application handshake and applies the negotiated compression.
    pub async fn handshake(&mut self, request: HandshakeRequest) -> NetworkResult<()> {
        self.channel
            .send(&SyncMessage::HandshakeRequest(request))
            .await?;
        let response = match self.channel.receive().await? {
            SyncMessage::HandshakeResponse(response) => response,
            other => return Err(unexpected("HandshakeRes", &other)),
        };
        if !response.accepted {
            return Err(NetworkError::HandshakeRejected {
                reason: response.reason.unwrap_or_else(|| "no reason given".into()),
            });
        }
        let scheme = response
            .selected_compression
            .as_deref()
            .and_then(CompressionScheme::from_name);
        self.channel.set_compression(scheme);
        debug!(
            peer = %response.node_id,
            compression = scheme.map(|s| s.name()),
            "handshake accepted"
        );
        self.remote_node_id = Some(response.node_id);
        Ok(())
    }

    /// Asks for the peer's latest oplog timestamp.
    pub async fn get_clock(&mut self) -> NetworkResult<HlcTimestamp> {
        match self.request(SyncMessage::GetClockRequest).await? {
            SyncMessage::ClockResponse(response) => Ok(response.timestamp),
            other => Err(unexpected("ClockRes", &other)),
        }
    }

    /// Pulls the peer's entries newer than `since`.
    pub async fn pull_changes(&mut self, since: &HlcTimestamp) -> NetworkResult<Vec<OplogEntry>> {
        let request = SyncMessage::PullChangesRequest(PullChangesRequest {
            since: since.clone(),
        });
        match self.request(request).await? {
            SyncMessage::ChangeSetResponse(response) => Ok(response.into_entries()?),
            other => Err(unexpected("ChangeSetRes", &other)),
        }
    }

    /// Pushes entries in frame-sized pages, waiting for the peer's
    /// acknowledgement of each. Stops at the first rejected page.
    pub async fn push_changes(&mut self, entries: &[OplogEntry]) -> NetworkResult<()> {
        let budget = self.channel.page_budget();
        let mut rest = entries;
        while !rest.is_empty() {
            let page = PushChangesRequest::page(rest, budget)?;
            let sent = page.entries.len();
            match self.request(SyncMessage::PushChangesRequest(page)).await? {
                SyncMessage::AckResponse(ack) if ack.success => {}
                SyncMessage::AckResponse(ack) => {
                    return Err(NetworkError::PushRejected(
                        ack.error.unwrap_or_else(|| "no reason given".into()),
                    ))
                }
                other => return Err(unexpected("AckRes", &other)),
            }
            rest = &rest[sent..];
            debug!(count = sent, remaining = rest.len(), "pushed page");
        }
        Ok(())
    }

    /// Closes the session.
    pub async fn close(mut self) -> NetworkResult<()> {
        self.channel.shutdown().await
    }

    async fn request(&mut self, message: SyncMessage) -> NetworkResult<SyncMessage> {
        let name = message.name();
        with_timeout(self.io_timeout, name, async {
            self.channel.send(&message).await?;
            self.channel.receive().await
        })
        .await
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    future: impl Future<Output = NetworkResult<T>>,
) -> NetworkResult<T> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| NetworkError::Timeout { operation })?
}

fn unexpected(expected: &'static str, actual: &SyncMessage) -> NetworkError {
    ProtocolError::UnexpectedMessage {
        expected,
        actual: actual.name(),
    }
    .into()
}
