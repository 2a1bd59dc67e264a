use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::transport::retry::{retry_transient, RetryError};
use crate::transport::{ManagerTransport, StatusUpdate};

/// Sending half of the status reporter queue.
#[derive(Debug, Clone)]
pub struct ReporterHandle {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ReporterHandle {
    /// A handle whose updates land in the returned receiver instead of a
    /// running reporter.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an update. Returns false once the reporter has stopped.
    pub fn enqueue(&self, update: StatusUpdate) -> bool {
        let job_id = update.job_id();
        let kind = update.kind();
        if self.tx.send(update).is_err() {
            tracing::warn!(job_id = %job_id, kind, "Reporter stopped, status update dropped");
            return false;
        }
        true
    }
}

/// Delivers status updates to the manager one at a time, in order.
///
/// Each update is retried with backoff until the manager acknowledges it,
/// answers with a permanent error, or the node shuts down.
pub struct StatusReporter {
    manager: Arc<dyn ManagerTransport>,
    node_url: String,
    retry: RetryConfig,
    rx: mpsc::UnboundedReceiver<StatusUpdate>,
}

impl StatusReporter {
    pub fn new(
        manager: Arc<dyn ManagerTransport>,
        node_url: impl Into<String>,
        retry: RetryConfig,
    ) -> (Self, ReporterHandle) {
        let (handle, rx) = ReporterHandle::detached();
        let reporter = Self {
            manager,
            node_url: node_url.into(),
            retry,
            rx,
        };
        (reporter, handle)
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let update = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                update = self.rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            self.deliver(update, &token).await;
        }
        tracing::debug!("Status reporter stopped");
    }

    async fn deliver(&self, update: StatusUpdate, token: &CancellationToken) {
        let job_id = update.job_id();
        let kind = update.kind();

        let result = retry_transient("status report", &self.retry, token, || {
            let manager = self.manager.clone();
            let node_url = self.node_url.clone();
            let update = update.clone();
            async move { manager.report(&node_url, &update).await }
        })
        .await;

        match result {
            Ok(()) => tracing::debug!(job_id = %job_id, kind, "Status delivered"),
            Err(RetryError::Permanent(e)) => {
                tracing::warn!(job_id = %job_id, kind, error = %e, "Manager refused status update");
            }
            Err(RetryError::Cancelled) => {
                tracing::info!(job_id = %job_id, kind, "Shutdown before status was delivered");
            }
        }
    }
}
