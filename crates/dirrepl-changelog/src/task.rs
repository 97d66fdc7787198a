//! Cancellable background tasks with bounded shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A spawned loop plus the token that asks it to stop.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `body` on the current tokio runtime; it must return once the token is
    /// cancelled.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        debug!(task = name, "background task started");
        Self {
            name,
            token,
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the task and waits up to `timeout` for it; aborts it past that.
    ///
    /// Returns true when the task stopped on its own.
    pub(crate) async fn stop(mut self, timeout: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!(task = self.name, "background task stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "background task ended abnormally");
                false
            }
            Err(_) => {
                error!(
                    task = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "background task did not stop in time, aborting"
                );
                self.handle.abort();
                false
            }
        }
    }
}
