use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::{HandlerRegistry, HeartbeatSender, NodeAgent, StatusReporter};
use crate::api;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::transport::routes::normalize_base_url;
use crate::transport::{HttpManagerClient, ManagerTransport};

/// A worker node process.
///
/// Runs three things side by side until shutdown:
/// 1. the node HTTP surface (job push, cancel, liveness probe)
/// 2. the heartbeat sender, which first announces the node to the manager
/// 3. the status reporter, which delivers job outcomes in order
pub struct Node {
    config: AgentConfig,
    agent: NodeAgent,
    heartbeat: Arc<HeartbeatSender>,
    reporter: StatusReporter,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: AgentConfig,
        handlers: HandlerRegistry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let manager = Arc::new(HttpManagerClient::new(
            &config.manager_url,
            config.request_timeout,
        )?);
        Self::with_transport(config, handlers, manager, shutdown)
    }

    pub fn with_transport(
        config: AgentConfig,
        handlers: HandlerRegistry,
        manager: Arc<dyn ManagerTransport>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let public_url = normalize_base_url(&config.public_url)?;
        let (reporter, handle) =
            StatusReporter::new(manager.clone(), public_url.clone(), config.retry.clone());
        let agent = NodeAgent::new(public_url.clone(), handlers, handle, shutdown.child_token());
        let heartbeat = Arc::new(HeartbeatSender::new(
            manager,
            public_url,
            config.heartbeat_interval,
            config.init_retry_interval,
        ));

        Ok(Self {
            config,
            agent,
            heartbeat,
            reporter,
            shutdown,
        })
    }

    pub fn agent(&self) -> NodeAgent {
        self.agent.clone()
    }

    pub fn router(&self) -> Router {
        api::node::router(self.agent.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let router = self.router();
        let token = self.shutdown.clone();

        let reporter = tokio::spawn(self.reporter.run(token.clone()));
        let heartbeat = tokio::spawn(self.heartbeat.clone().run(token.clone()));

        tracing::info!(
            node = %self.agent.url(),
            manager = %self.config.manager_url,
            "Node starting"
        );
        let served = api::serve(listener, router, token.clone()).await;

        token.cancel();
        for (name, task) in [("reporter", reporter), ("heartbeat", heartbeat)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        served?;
        Ok(())
    }
}
