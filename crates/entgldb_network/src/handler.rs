//! Server-side request handling.

use crate::auth::TokenValidator;
use crate::error::{NetworkError, NetworkResult};
use crate::task::run_blocking;
use entgldb_core::PeerDatabase;
use entgldb_sync_protocol::{
    page_budget, AckResponse, ChangeSetResponse, ClockResponse, CompressionScheme,
    HandshakeRequest, HandshakeResponse, ProtocolError, SyncMessage, DEFAULT_MAX_FRAME_SIZE,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers sync requests from authenticated peers against the local database.
#[derive(Clone)]
pub struct SyncMessageProcessor {
    database: Arc<PeerDatabase>,
    validator: TokenValidator,
    compression_enabled: bool,
    page_budget: usize,
}

impl SyncMessageProcessor {
    /// Creates a processor.
    pub fn new(
        database: Arc<PeerDatabase>,
        validator: TokenValidator,
        compression_enabled: bool,
    ) -> Self {
        Self {
            database,
            validator,
            compression_enabled,
            page_budget: page_budget(DEFAULT_MAX_FRAME_SIZE),
        }
    }

    /// Caps the encoded size of the entries in one pull response.
    pub fn with_page_budget(mut self, budget: usize) -> Self {
        self.page_budget = budget.max(1);
        self
    }

    /// Checks a handshake and picks the session compression.
    ///
    /// Returns the response to send and, on acceptance, the compression the
    /// channel should switch to.
    pub fn handshake(
        &self,
        request: &HandshakeRequest,
    ) -> (HandshakeResponse, Option<CompressionScheme>) {
        let local_id = self.database.node_id();
        if !self.validator.validate(&request.auth_token) {
            warn!(peer = %request.node_id, "rejected handshake: invalid auth token");
            return (HandshakeResponse::rejected(local_id, "invalid auth token"), None);
        }
        if request.node_id.is_empty() {
            return (HandshakeResponse::rejected(local_id, "missing node id"), None);
        }

        let scheme = if self.compression_enabled {
            CompressionScheme::negotiate(&request.supported_compression)
        } else {
            None
        };
        debug!(
            peer = %request.node_id,
            compression = scheme.map(|s| s.name()),
            "accepted handshake"
        );
        (
            HandshakeResponse::accepted(local_id, scheme.map(|s| s.name().to_string())),
            scheme,
        )
    }

    /// Produces the response to one post-handshake request.
    ///
    /// Storage failures during a push are reported to the peer as a failed
    /// acknowledgement. Any message that is not a request is a protocol error.
    pub async fn process(&self, message: SyncMessage) -> NetworkResult<SyncMessage> {
        match message {
            SyncMessage::GetClockRequest => {
                let database = Arc::clone(&self.database);
                let timestamp = run_blocking(move || Ok(database.latest_timestamp()?)).await?;
                Ok(SyncMessage::ClockResponse(ClockResponse { timestamp }))
            }
            SyncMessage::PullChangesRequest(request) => {
                let database = Arc::clone(&self.database);
                let entries =
                    run_blocking(move || Ok(database.oplog_after(&request.since)?)).await?;
                let page = ChangeSetResponse::page(&entries, self.page_budget)?;
                debug!(
                    count = page.entries.len(),
                    remaining = entries.len() - page.entries.len(),
                    "serving pull"
                );
                Ok(SyncMessage::ChangeSetResponse(page))
            }
            SyncMessage::PushChangesRequest(request) => {
                let entries = request.into_entries()?;
                let count = entries.len();
                let database = Arc::clone(&self.database);
                let applied =
                    run_blocking(move || Ok(database.apply_remote_changes(&entries)?)).await;
                let ack = match applied {
                    Ok(summary) => {
                        debug!(
                            count,
                            applied = summary.applied,
                            ignored = summary.ignored,
                            "applied push"
                        );
                        AckResponse::ok()
                    }
                    Err(NetworkError::Store(e)) => {
                        warn!(error = %e, "failed to apply push");
                        AckResponse::failed(e.to_string())
                    }
                    Err(e) => return Err(e),
                };
                Ok(SyncMessage::AckResponse(ack))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "sync request",
                actual: other.name(),
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for SyncMessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMessageProcessor")
            .field("node_id", &self.database.node_id())
            .field("compression_enabled", &self.compression_enabled)
            .finish_non_exhaustive()
    }
}
