use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::transport::routes::normalize_base_url;

/// A worker node known to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNode {
    pub id: Uuid,
    pub url: String,
    pub alive: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerNode {
    fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.last_heartbeat > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub id: Uuid,
    /// First time this url registered.
    pub created: bool,
    /// The node had been marked dead and is alive again.
    pub resurrected: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    nodes: HashMap<String, WorkerNode>,
    /// Urls in registration order.
    order: Vec<String>,
}

/// Authoritative set of worker nodes, keyed by normalized url.
#[derive(Debug)]
pub struct NodeRegistry {
    state: RwLock<RegistryState>,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clock,
        }
    }

    /// Register a node. Registering a known url returns its existing id and
    /// revives it if it was dead.
    pub async fn register(&self, url: &str) -> Result<RegisterOutcome> {
        let url = normalize_base_url(url)?;
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if let Some(node) = state.nodes.get_mut(&url) {
            let resurrected = !node.alive;
            node.alive = true;
            node.last_heartbeat = now;
            if resurrected {
                tracing::info!(node = %url, node_id = %node.id, "Dead node registered again");
            } else {
                tracing::debug!(node = %url, "Node already registered");
            }
            return Ok(RegisterOutcome {
                id: node.id,
                created: false,
                resurrected,
            });
        }

        let node = WorkerNode {
            id: Uuid::new_v4(),
            url: url.clone(),
            alive: true,
            last_heartbeat: now,
            registered_at: now,
        };
        let id = node.id;
        state.nodes.insert(url.clone(), node);
        state.order.push(url.clone());
        tracing::info!(node = %url, node_id = %id, "Node registered");

        Ok(RegisterOutcome {
            id,
            created: true,
            resurrected: false,
        })
    }

    /// Refresh a node's heartbeat. Unknown urls are ignored and return false.
    pub async fn record_heartbeat(&self, url: &str) -> bool {
        let Ok(url) = normalize_base_url(url) else {
            tracing::warn!(node = url, "Heartbeat with invalid url ignored");
            return false;
        };
        let now = self.clock.now();
        let mut state = self.state.write().await;

        match state.nodes.get_mut(&url) {
            Some(node) => {
                if !node.alive {
                    tracing::info!(node = %url, "Heartbeat revived dead node");
                }
                node.alive = true;
                node.last_heartbeat = now;
                true
            }
            None => {
                tracing::warn!(node = %url, "Heartbeat from unregistered node ignored");
                false
            }
        }
    }

    pub async fn get(&self, url: &str) -> Option<WorkerNode> {
        let url = normalize_base_url(url).ok()?;
        self.state.read().await.nodes.get(&url).cloned()
    }

    /// Every node, in registration order.
    pub async fn list_all(&self) -> Vec<WorkerNode> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|url| state.nodes.get(url).cloned())
            .collect()
    }

    /// Alive nodes, in registration order.
    pub async fn list_alive(&self) -> Vec<WorkerNode> {
        self.list_all()
            .await
            .into_iter()
            .filter(|node| node.alive)
            .collect()
    }

    /// Mark alive nodes whose heartbeat is older than `threshold` as dead and
    /// return their urls. Nodes already dead are not reported again.
    pub async fn mark_dead_if_stale(&self, threshold: std::time::Duration) -> Vec<String> {
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::MAX);
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let RegistryState { nodes, order } = &mut *state;

        let mut dead = Vec::new();
        for url in order.iter() {
            if let Some(node) = nodes.get_mut(url) {
                if node.alive && node.is_stale(now, threshold) {
                    node.alive = false;
                    tracing::warn!(
                        node = %url,
                        last_heartbeat = %node.last_heartbeat,
                        "Node missed heartbeats, marked dead"
                    );
                    dead.push(url.clone());
                }
            }
        }
        dead
    }

    /// Forget a node entirely.
    pub async fn remove(&self, url: &str) -> bool {
        let Ok(url) = normalize_base_url(url) else {
            return false;
        };
        let mut state = self.state.write().await;
        let removed = state.nodes.remove(&url).is_some();
        if removed {
            state.order.retain(|u| u != &url);
            tracing::info!(node = %url, "Node decommissioned");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }
}
