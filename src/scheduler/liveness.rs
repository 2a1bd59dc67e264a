use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::scheduler::events::{DispatchTrigger, EventBus, ManagerEvent};
use crate::scheduler::job::JobStatus;
use crate::scheduler::registry::NodeRegistry;
use crate::scheduler::store::JobStore;

/// Summary of one liveness pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub dead_nodes: Vec<String>,
    pub requeued: usize,
    pub canceled: usize,
    pub expired_claims: usize,
}

/// Declares silent nodes dead and gives their work back to the queue.
pub struct LivenessMonitor {
    registry: Arc<NodeRegistry>,
    store: Arc<JobStore>,
    events: EventBus,
    trigger: DispatchTrigger,
    dead_threshold: Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<JobStore>,
        events: EventBus,
        trigger: DispatchTrigger,
        dead_threshold: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            trigger,
            dead_threshold,
        }
    }

    pub async fn check_once(&self) -> LivenessReport {
        let mut report = LivenessReport {
            dead_nodes: self.registry.mark_dead_if_stale(self.dead_threshold).await,
            ..Default::default()
        };

        for node in &report.dead_nodes {
            self.events
                .publish(ManagerEvent::NodeDied { node: node.clone() });

            let freed = self.store.free_node(node).await;
            for job_id in &freed.requeued {
                self.events.publish(ManagerEvent::JobRequeued {
                    job_id: *job_id,
                    node: node.clone(),
                });
            }
            for job_id in &freed.canceled {
                self.events.publish(ManagerEvent::JobStatusChanged {
                    job_id: *job_id,
                    status: JobStatus::Canceled,
                });
            }
            report.requeued += freed.requeued.len();
            report.canceled += freed.canceled.len();
        }

        report.expired_claims = self.store.release_expired_claims().await;

        if report.requeued > 0 || report.expired_claims > 0 {
            self.trigger.notify();
        }
        if !report.dead_nodes.is_empty() {
            tracing::info!(
                dead = report.dead_nodes.len(),
                requeued = report.requeued,
                canceled = report.canceled,
                "Liveness check released jobs"
            );
        }
        report
    }

    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            threshold_ms = self.dead_threshold.as_millis() as u64,
            "Liveness monitor started"
        );
        clock::periodic("liveness", interval, token, || {
            let monitor = self.clone();
            async move {
                monitor.check_once().await;
            }
        })
        .await;
    }
}
