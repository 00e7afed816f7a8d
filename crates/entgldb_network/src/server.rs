//! TCP sync server.

use crate::auth::TokenValidator;
use crate::channel::SecureChannel;
use crate::config::NodeConfig;
use crate::error::{ErrorCategory, NetworkError, NetworkResult};
use crate::handler::SyncMessageProcessor;
use crate::handshake::perform_handshake;
use crate::task::BackgroundTasks;
use entgldb_core::PeerDatabase;
use entgldb_sync_protocol::{page_budget, HandshakeRole, ProtocolError, SyncMessage};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts peer connections and answers their sync requests.
///
/// Each connection runs in its own task. At most `max_connections` sessions
/// are served at once; further connections are closed on accept.
pub struct TcpSyncServer {
    config: NodeConfig,
    processor: SyncMessageProcessor,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    tasks: BackgroundTasks,
}

struct ConnectionContext {
    config: NodeConfig,
    processor: SyncMessageProcessor,
}

impl TcpSyncServer {
    /// Creates a stopped server.
    pub fn new(config: NodeConfig, database: Arc<PeerDatabase>) -> NetworkResult<Self> {
        let validator = TokenValidator::new(&config.auth_token)?;
        let processor = SyncMessageProcessor::new(database, validator, config.compression)
            .with_page_budget(page_budget(config.max_frame_size));
        Ok(Self {
            config,
            processor,
            running: Mutex::new(None),
        })
    }

    /// Binds the listener and starts accepting. Returns the bound address.
    ///
    /// Calling this on a running server returns the existing address.
    pub async fn start(&self) -> NetworkResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener =
            TcpListener::bind(SocketAddr::new(self.config.bind_host, self.config.tcp_port)).await?;
        let local_addr = listener.local_addr()?;

        let mut tasks = BackgroundTasks::new();
        let context = Arc::new(ConnectionContext {
            config: self.config.clone(),
            processor: self.processor.clone(),
        });
        tasks.spawn(accept_loop(listener, context, tasks.token()));

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            // Lost a race with a concurrent start; the new listener is dropped
            // when its task is cancelled.
            let addr = existing.local_addr;
            drop(running);
            tasks.token().cancel();
            return Ok(addr);
        }
        *running = Some(Running { local_addr, tasks });
        info!(node_id = %self.config.node_id, %local_addr, "sync server listening");
        Ok(local_addr)
    }

    /// Stops accepting, closes all sessions and waits for them to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.tasks.shutdown().await;
            info!(node_id = %self.config.node_id, "sync server stopped");
        }
    }

    /// Returns the bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Returns the bound port while running.
    pub fn listening_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Returns true while the server accepts connections.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl std::fmt::Debug for TcpSyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSyncServer")
            .field("node_id", &self.config.node_id)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    token: CancellationToken,
) {
    let limit = Arc::new(Semaphore::new(context.config.max_connections));
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
                        warn!(%peer, "connection limit reached, closing");
                        drop(stream);
                        continue;
                    };
                    let context = Arc::clone(&context);
                    let token = token.clone();
                    sessions.spawn(async move {
                        let _permit = permit;
                        match handle_connection(stream, &context, token).await {
                            Ok(()) => debug!(%peer, "session closed"),
                            Err(e) if e.category() == ErrorCategory::Transport => {
                                debug!(%peer, error = %e, "session ended")
                            }
                            Err(e) => warn!(%peer, error = %e, "session failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    sessions.shutdown().await;
}

async fn handle_connection(
    mut stream: TcpStream,
    context: &ConnectionContext,
    token: CancellationToken,
) -> NetworkResult<()> {
    let config = &context.config;
    stream.set_nodelay(true)?;

    let mut codec = config.frame_codec();
    if config.secure {
        let cipher =
            perform_handshake(&mut stream, HandshakeRole::Responder, config.handshake_timeout)
                .await?;
        codec = codec.with_cipher(cipher);
    }
    let mut channel = SecureChannel::new(stream, codec);

    let first = tokio::time::timeout(config.handshake_timeout, channel.receive())
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "handshake",
        })??;
    let request = match first {
        SyncMessage::HandshakeRequest(request) => request,
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "HandshakeReq",
                actual: other.name(),
            }
            .into())
        }
    };
    let (response, scheme) = context.processor.handshake(&request);
    let rejection = (!response.accepted).then(|| response.reason.clone().unwrap_or_default());
    channel.send(&SyncMessage::HandshakeResponse(response)).await?;
    if let Some(reason) = rejection {
        return Err(NetworkError::HandshakeRejected { reason });
    }
    channel.set_compression(scheme);
    let peer_id = request.node_id;
    debug!(peer = %peer_id, secure = channel.is_secure(), "session open");

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            received = tokio::time::timeout(config.idle_timeout, channel.receive()) => {
                match received {
                    Err(_) => {
                        debug!(peer = %peer_id, "idle session closed");
                        return Ok(());
                    }
                    Ok(Err(NetworkError::ConnectionClosed)) => return Ok(()),
                    Ok(result) => result?,
                }
            }
        };
        let response = context.processor.process(message).await?;
        channel.send(&response).await?;
    }
}
