use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::Result;
use crate::scheduler::{
    DispatchTrigger, Dispatcher, EventBus, JobManager, JobStore, LivenessMonitor, NodeRegistry,
};
use crate::transport::{HttpNodeClient, NodeTransport};

/// The manager process: job store, node registry, dispatcher, liveness
/// monitor and the HTTP API, all stopped by one token.
pub struct ManagerServer {
    config: ManagerConfig,
    manager: Arc<JobManager>,
    dispatcher: Arc<Dispatcher>,
    liveness: Arc<LivenessMonitor>,
    trigger_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
}

impl ManagerServer {
    pub fn new(config: ManagerConfig, shutdown: CancellationToken) -> Result<Self> {
        let transport = Arc::new(HttpNodeClient::new(config.request_timeout)?);
        Ok(Self::with_parts(config, Arc::new(SystemClock), transport, shutdown))
    }

    /// Build with an explicit clock and node transport.
    pub fn with_parts(
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn NodeTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        let store = Arc::new(JobStore::with_limits(
            clock.clone(),
            config.max_jobs,
            config.claim_ttl,
        ));
        let registry = Arc::new(NodeRegistry::new(clock));
        let events = EventBus::default();
        let (trigger, trigger_rx) = DispatchTrigger::new();

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            transport.clone(),
            events.clone(),
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            trigger.clone(),
            config.dead_threshold,
        ));
        let manager = Arc::new(JobManager::new(
            store,
            registry,
            transport,
            events,
            trigger,
            config.request_timeout,
        ));

        Self {
            config,
            manager,
            dispatcher,
            liveness,
            trigger_rx,
            shutdown,
        }
    }

    pub fn manager(&self) -> Arc<JobManager> {
        self.manager.clone()
    }

    pub fn router(&self) -> Router {
        api::manager::router(self.manager.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let router = self.router();
        let token = self.shutdown.clone();

        let dispatcher = tokio::spawn(self.dispatcher.clone().run(
            self.trigger_rx,
            self.config.dispatch_interval,
            token.clone(),
        ));
        let liveness = tokio::spawn(
            self.liveness
                .clone()
                .run(self.config.liveness_interval, token.clone()),
        );

        tracing::info!(
            addr = %self.config.listen_addr,
            dead_threshold_ms = self.config.dead_threshold.as_millis() as u64,
            "Manager starting"
        );
        let served = api::serve(listener, router, token.clone()).await;

        token.cancel();
        for (name, task) in [("dispatcher", dispatcher), ("liveness", liveness)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        served?;
        Ok(())
    }
}
