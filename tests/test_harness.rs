//! Test harness for manager, dispatcher and node agent tests.
//!
//! Provides in-memory transports that record every call, a manager wired to
//! a manual clock, and helpers for running real manager and node servers on
//! ephemeral ports.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman::agent::{HandlerRegistry, NodeAgent};
use foreman::clock::ManualClock;
use foreman::config::{AgentConfig, ManagerConfig, RetryConfig};
use foreman::node::Node;
use foreman::scheduler::job::{DispatchedJob, JobSpec};
use foreman::scheduler::{
    DispatchTrigger, Dispatcher, EventBus, JobManager, JobStore, LivenessMonitor, NodeRegistry,
};
use foreman::server::ManagerServer;
use foreman::transport::{
    HeartbeatAck, HttpManagerClient, ManagerTransport, NodeCancelOutcome, NodeTransport,
    PushOutcome, StatusUpdate, TransportError,
};

pub const N1: &str = "http://127.0.0.1:7001/";
pub const N2: &str = "http://127.0.0.1:7002/";
pub const N3: &str = "http://127.0.0.1:7003/";

pub fn spec(name: &str) -> JobSpec {
    JobSpec::new(name, "payload", "echo", "tester")
}

pub fn dispatched(payload_type: &str, payload: &str) -> DispatchedJob {
    DispatchedJob {
        id: Uuid::new_v4(),
        name: "test-job".to_string(),
        serialized: payload.to_string(),
        payload_type: payload_type.to_string(),
        created_by: "tester".to_string(),
    }
}

/// Retry policy short enough for tests.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        multiplier: 2.0,
        jitter_ratio: 0.0,
    }
}

// =============================================================================
// Fake node transport
// =============================================================================

#[derive(Debug, Default)]
struct FakeNodeState {
    busy: HashSet<String>,
    reject: HashMap<String, String>,
    unreachable: HashSet<String>,
    cancel_answer: HashMap<String, NodeCancelOutcome>,
    push_delay: Option<Duration>,
    pushes: Vec<(String, Uuid)>,
    cancels: Vec<(String, Uuid)>,
}

/// Node transport that answers from configured per-url behaviour and records
/// every push and cancel. Unconfigured urls accept everything.
#[derive(Debug, Default)]
pub struct FakeNodeTransport {
    state: Mutex<FakeNodeState>,
}

impl FakeNodeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_busy(&self, url: &str) {
        self.state.lock().unwrap().busy.insert(url.to_string());
    }

    pub fn set_reject(&self, url: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .reject
            .insert(url.to_string(), reason.to_string());
    }

    pub fn set_unreachable(&self, url: &str) {
        self.state.lock().unwrap().unreachable.insert(url.to_string());
    }

    pub fn set_cancel_answer(&self, url: &str, answer: NodeCancelOutcome) {
        self.state
            .lock()
            .unwrap()
            .cancel_answer
            .insert(url.to_string(), answer);
    }

    /// Hold every accepted push for `delay` before answering.
    pub fn set_push_delay(&self, delay: Duration) {
        self.state.lock().unwrap().push_delay = Some(delay);
    }

    pub fn pushes(&self) -> Vec<(String, Uuid)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn cancels(&self) -> Vec<(String, Uuid)> {
        self.state.lock().unwrap().cancels.clone()
    }
}

#[async_trait]
impl NodeTransport for FakeNodeTransport {
    async fn push_job(
        &self,
        node_url: &str,
        job: &DispatchedJob,
    ) -> Result<PushOutcome, TransportError> {
        let (outcome, delay) = {
            let mut state = self.state.lock().unwrap();
            state.pushes.push((node_url.to_string(), job.id));
            if state.unreachable.contains(node_url) {
                return Err(TransportError::Connect {
                    url: node_url.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            let outcome = if state.busy.contains(node_url) {
                PushOutcome::Busy
            } else if let Some(reason) = state.reject.get(node_url) {
                PushOutcome::Rejected(reason.clone())
            } else {
                PushOutcome::Accepted
            };
            (outcome, state.push_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome)
    }

    async fn cancel_job(
        &self,
        node_url: &str,
        job_id: Uuid,
    ) -> Result<NodeCancelOutcome, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.cancels.push((node_url.to_string(), job_id));
        if state.unreachable.contains(node_url) {
            return Err(TransportError::Timeout {
                url: node_url.to_string(),
            });
        }
        Ok(state
            .cancel_answer
            .get(node_url)
            .copied()
            .unwrap_or(NodeCancelOutcome::Cancelling))
    }
}

// =============================================================================
// Fake manager transport
// =============================================================================

#[derive(Debug)]
struct FakeManagerState {
    registered: bool,
    failing_inits: usize,
    failing_reports: usize,
    refuse_reports: bool,
    inits: Vec<String>,
    heartbeats: usize,
    reports: Vec<StatusUpdate>,
    report_attempts: usize,
}

/// Manager transport that records calls. Failures can be scripted.
#[derive(Debug)]
pub struct FakeManagerTransport {
    state: Mutex<FakeManagerState>,
}

impl FakeManagerTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeManagerState {
                registered: true,
                failing_inits: 0,
                failing_reports: 0,
                refuse_reports: false,
                inits: Vec::new(),
                heartbeats: 0,
                reports: Vec::new(),
                report_attempts: 0,
            }),
        })
    }

    /// Heartbeats answer `registered = false` until the next node init.
    pub fn forget_node(&self) {
        self.state.lock().unwrap().registered = false;
    }

    /// The next `count` node inits fail with a connection error.
    pub fn fail_inits(&self, count: usize) {
        self.state.lock().unwrap().failing_inits = count;
    }

    /// The next `count` reports fail with a 503.
    pub fn fail_reports(&self, count: usize) {
        self.state.lock().unwrap().failing_reports = count;
    }

    /// Every report is answered with a 400.
    pub fn refuse_reports(&self) {
        self.state.lock().unwrap().refuse_reports = true;
    }

    pub fn inits(&self) -> Vec<String> {
        self.state.lock().unwrap().inits.clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    pub fn reports(&self) -> Vec<StatusUpdate> {
        self.state.lock().unwrap().reports.clone()
    }

    pub fn report_attempts(&self) -> usize {
        self.state.lock().unwrap().report_attempts
    }

    pub fn terminal_reports(&self) -> Vec<StatusUpdate> {
        self.reports()
            .into_iter()
            .filter(StatusUpdate::is_terminal)
            .collect()
    }
}

#[async_trait]
impl ManagerTransport for FakeManagerTransport {
    async fn node_init(&self, node_url: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.inits.push(node_url.to_string());
        if state.failing_inits > 0 {
            state.failing_inits -= 1;
            return Err(TransportError::Connect {
                url: "http://manager/".to_string(),
                message: "connection refused".to_string(),
            });
        }
        state.registered = true;
        Ok(())
    }

    async fn heartbeat(&self, _node_url: &str) -> Result<HeartbeatAck, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.heartbeats += 1;
        Ok(HeartbeatAck {
            registered: state.registered,
        })
    }

    async fn report(&self, _node_url: &str, update: &StatusUpdate) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.report_attempts += 1;
        if state.refuse_reports {
            return Err(TransportError::Status {
                url: "http://manager/".to_string(),
                status: 400,
                body: "bad report".to_string(),
            });
        }
        if state.failing_reports > 0 {
            state.failing_reports -= 1;
            return Err(TransportError::Status {
                url: "http://manager/".to_string(),
                status: 503,
                body: String::new(),
            });
        }
        state.reports.push(update.clone());
        Ok(())
    }
}

// =============================================================================
// Manager wired to a manual clock
// =============================================================================

/// Every manager component, sharing one manual clock and one fake node
/// transport. Nothing runs in the background; tests drive each step.
pub struct TestManager {
    pub clock: Arc<ManualClock>,
    pub transport: Arc<FakeNodeTransport>,
    pub store: Arc<JobStore>,
    pub registry: Arc<NodeRegistry>,
    pub events: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub liveness: Arc<LivenessMonitor>,
    pub manager: Arc<JobManager>,
    pub trigger_rx: mpsc::Receiver<()>,
}

impl TestManager {
    pub fn new() -> Self {
        Self::with_limits(100, Duration::from_secs(60), Duration::from_secs(30))
    }

    pub fn with_limits(max_jobs: usize, claim_ttl: Duration, dead_threshold: Duration) -> Self {
        let clock = Arc::new(ManualClock::new());
        let transport = FakeNodeTransport::new();
        let store = Arc::new(JobStore::with_limits(clock.clone(), max_jobs, claim_ttl));
        let registry = Arc::new(NodeRegistry::new(clock.clone()));
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
            dead_threshold,
        ));
        let manager = Arc::new(JobManager::new(
            store.clone(),
            registry.clone(),
            transport.clone(),
            events.clone(),
            trigger,
            Duration::from_secs(1),
        ));

        Self {
            clock,
            transport,
            store,
            registry,
            events,
            dispatcher,
            liveness,
            manager,
            trigger_rx,
        }
    }

    pub async fn register(&self, urls: &[&str]) {
        for url in urls {
            self.manager.node_initialized(url).await.unwrap();
        }
    }

    /// Submit a job and hand it to a node in one go.
    pub async fn start_job_on(&self, name: &str, node: &str) -> Uuid {
        let job_id = self.manager.submit(spec(name)).await.unwrap();
        let claim = self.store.claim_for_assignment().await.unwrap();
        assert_eq!(claim.job_id(), job_id, "older jobs are still queued");
        assert!(self.store.reserve_node(&claim, node).await);
        self.store.record_assignment(&claim, node).await.unwrap();
        job_id
    }

    /// Discard pending dispatch wake-ups.
    pub fn drain_triggers(&mut self) {
        while self.trigger_rx.try_recv().is_ok() {}
    }

    pub fn was_triggered(&mut self) -> bool {
        let triggered = self.trigger_rx.try_recv().is_ok();
        self.drain_triggers();
        triggered
    }

    pub async fn result_of(&self, job_id: Uuid) -> Option<String> {
        self.store.history(&job_id).await.and_then(|h| h.result)
    }

    pub async fn detail_texts(&self, job_id: Uuid) -> Vec<String> {
        self.store
            .details(&job_id)
            .await
            .into_iter()
            .map(|d| d.text)
            .collect()
    }
}

// =============================================================================
// Real servers
// =============================================================================

/// A manager serving HTTP on an ephemeral port.
pub struct RunningManager {
    pub url: String,
    pub manager: Arc<JobManager>,
    pub client: HttpManagerClient,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningManager {
    pub async fn start(dead_threshold: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ManagerConfig::new(addr)
            .with_dead_threshold(dead_threshold)
            .with_liveness_interval(Duration::from_millis(50))
            .with_dispatch_interval(Duration::from_millis(100))
            .with_request_timeout(Duration::from_secs(2));

        let token = CancellationToken::new();
        let server = ManagerServer::new(config, token.clone()).unwrap();
        let manager = server.manager();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("Manager server error: {}", e);
            }
        });

        let url = format!("http://{}/", addr);
        let client = HttpManagerClient::new(&url, Duration::from_secs(2)).unwrap();
        Self {
            url,
            manager,
            client,
            token,
            handle,
        }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// A node agent serving HTTP on an ephemeral port.
pub struct RunningNode {
    pub url: String,
    pub agent: NodeAgent,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningNode {
    pub async fn start(manager_url: &str) -> Self {
        Self::start_with(manager_url, HandlerRegistry::with_builtins()).await
    }

    pub async fn start_with(manager_url: &str, handlers: HandlerRegistry) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = AgentConfig::new(addr, manager_url)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_init_retry_interval(Duration::from_millis(50))
            .with_request_timeout(Duration::from_secs(2))
            .with_retry(fast_retry());

        let token = CancellationToken::new();
        let node = Node::new(config, handlers, token.clone()).unwrap();
        let agent = node.agent();
        let handle = tokio::spawn(async move {
            if let Err(e) = node.serve(listener).await {
                tracing::error!("Node server error: {}", e);
            }
        });

        Self {
            url: agent.url().to_string(),
            agent,
            token,
            handle,
        }
    }

    /// Stop the node as if its process died.
    pub async fn kill(self) {
        self.token.cancel();
        self.handle.abort();
        let _ = self.handle.await;
    }
}

// =============================================================================
// Polling helpers
// =============================================================================

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
