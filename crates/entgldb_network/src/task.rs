//! Background task bookkeeping.

use crate::error::{NetworkError, NetworkResult};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A group of background loops sharing one cancellation token.
#[derive(Debug, Default)]
pub(crate) struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Token the loops should watch.
    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels all loops and waits for them to finish.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "background task panicked");
                }
            }
        }
    }
}

/// Runs blocking store work off the async worker threads.
pub(crate) async fn run_blocking<T, F>(f: F) -> NetworkResult<T>
where
    F: FnOnce() -> NetworkResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NetworkError::Internal(format!("blocking task failed: {e}")))?
}
