use std::net::SocketAddr;
use std::time::Duration;

/// Backoff policy for outbound calls that must eventually be delivered.
///
/// Delays grow geometrically from `initial_backoff_ms` up to
/// `max_backoff_ms`. Up to `jitter_ratio` of each delay is randomised.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

/// Manager process configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: SocketAddr,
    /// A node whose last heartbeat is older than this is considered dead.
    pub dead_threshold: Duration,
    /// How often the liveness monitor scans the registry.
    pub liveness_interval: Duration,
    /// Periodic dispatch tick, on top of event-driven triggers.
    pub dispatch_interval: Duration,
    /// How long a dispatch claim may stay unconfirmed before it is reclaimed.
    pub claim_ttl: Duration,
    /// Timeout for every outbound call to a node.
    pub request_timeout: Duration,
    /// Maximum number of jobs in the working queue.
    pub max_jobs: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9000"
                .parse()
                .expect("default listen address is valid"),
            dead_threshold: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(5),
            dispatch_interval: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            max_jobs: 10_000,
        }
    }
}

impl ManagerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dead_threshold(mut self, threshold: Duration) -> Self {
        self.dead_threshold = threshold;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }
}

/// Worker node (agent) process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Base URL the manager uses to reach this node. Also its identity.
    pub public_url: String,
    /// Base URL of the manager.
    pub manager_url: String,
    pub heartbeat_interval: Duration,
    /// Delay between startup notification attempts.
    pub init_retry_interval: Duration,
    /// Timeout for every outbound call to the manager.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9050"
                .parse()
                .expect("default listen address is valid"),
            public_url: "http://127.0.0.1:9050/".to_string(),
            manager_url: "http://127.0.0.1:9000/".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            init_retry_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Build a config for a node listening on `listen_addr`, advertising
    /// itself under the same address.
    pub fn new(listen_addr: SocketAddr, manager_url: impl Into<String>) -> Self {
        Self {
            listen_addr,
            public_url: format!("http://{}/", listen_addr),
            manager_url: manager_url.into(),
            ..Default::default()
        }
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_init_retry_interval(mut self, interval: Duration) -> Self {
        self.init_retry_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
