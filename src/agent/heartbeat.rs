use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::transport::ManagerTransport;

/// Keeps the node registered with the manager.
///
/// Announces the node on startup, retrying until the manager accepts, then
/// sends heartbeats on a fixed interval. A heartbeat answered with
/// `registered = false` triggers a fresh announcement.
pub struct HeartbeatSender {
    manager: Arc<dyn ManagerTransport>,
    node_url: String,
    interval: Duration,
    init_retry_interval: Duration,
}

impl HeartbeatSender {
    pub fn new(
        manager: Arc<dyn ManagerTransport>,
        node_url: impl Into<String>,
        interval: Duration,
        init_retry_interval: Duration,
    ) -> Self {
        Self {
            manager,
            node_url: node_url.into(),
            interval,
            init_retry_interval,
        }
    }

    /// Announce the node until the manager accepts. Returns false if shut
    /// down first.
    pub async fn announce(&self, token: &CancellationToken) -> bool {
        loop {
            match self.manager.node_init(&self.node_url).await {
                Ok(()) => {
                    tracing::info!(node = %self.node_url, "Registered with manager");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        node = %self.node_url,
                        error = %e,
                        retry_ms = self.init_retry_interval.as_millis() as u64,
                        "Manager did not accept node init"
                    );
                }
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.init_retry_interval) => {}
            }
        }
    }

    /// One heartbeat. Failures are logged; the next tick tries again.
    pub async fn beat(&self) {
        match self.manager.heartbeat(&self.node_url).await {
            Ok(ack) if ack.registered => {
                tracing::trace!(node = %self.node_url, "Heartbeat acknowledged");
            }
            Ok(_) => {
                tracing::warn!(node = %self.node_url, "Manager does not know this node, re-registering");
                if let Err(e) = self.manager.node_init(&self.node_url).await {
                    tracing::warn!(node = %self.node_url, error = %e, "Re-registration failed");
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.node_url, error = %e, "Heartbeat failed");
            }
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        if !self.announce(&token).await {
            return;
        }
        clock::periodic("heartbeat", self.interval, token, || {
            let sender = self.clone();
            async move { sender.beat().await }
        })
        .await;
    }
}
