//! Key exchange over a raw stream.
//!
//! Before any frame is sent, each side writes its 32-byte ephemeral public
//! key. The initiator writes first and then reads; the responder reads first.

use crate::error::{NetworkError, NetworkResult};
use entgldb_sync_protocol::{CipherState, HandshakeRole, KeyExchange, PUBLIC_KEY_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Runs the key exchange and returns the session cipher.
pub(crate) async fn perform_handshake<S>(
    stream: &mut S,
    role: HandshakeRole,
    limit: Duration,
) -> NetworkResult<CipherState>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, exchange(stream, role))
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "key exchange",
        })?
}

async fn exchange<S>(stream: &mut S, role: HandshakeRole) -> NetworkResult<CipherState>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = KeyExchange::new();
    let mut peer = [0u8; PUBLIC_KEY_SIZE];

    match role {
        HandshakeRole::Initiator => {
            stream.write_all(&local.public_key()).await?;
            stream.flush().await?;
            read_key(stream, &mut peer).await?;
        }
        HandshakeRole::Responder => {
            read_key(stream, &mut peer).await?;
            stream.write_all(&local.public_key()).await?;
            stream.flush().await?;
        }
    }

    let cipher = local.complete(peer, role)?;
    debug!(?role, "key exchange complete");
    Ok(cipher)
}

async fn read_key<S>(stream: &mut S, buf: &mut [u8; PUBLIC_KEY_SIZE]) -> NetworkResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NetworkError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}
