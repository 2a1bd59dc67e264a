use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::events::{EventBus, ManagerEvent};
use crate::scheduler::registry::{NodeRegistry, WorkerNode};
use crate::scheduler::store::{Claim, JobStore};
use crate::transport::{NodeCancelOutcome, NodeTransport, PushOutcome};

/// What a single dispatch cycle achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing waiting.
    Idle,
    NoFreeNodes,
    Assigned { job_id: Uuid, node: String },
    /// A node said the job can never run; it was removed.
    Rejected { job_id: Uuid, node: String, reason: String },
    /// Every free node refused or failed; the job stays queued.
    Deferred { job_id: Uuid },
    /// The job was canceled or the claim expired while the push was in flight.
    Lost { job_id: Uuid },
}

impl DispatchOutcome {
    /// Whether another cycle could make progress right away.
    fn made_progress(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Assigned { .. }
                | DispatchOutcome::Rejected { .. }
                | DispatchOutcome::Lost { .. }
        )
    }
}

/// Matches queued jobs to free nodes.
pub struct Dispatcher {
    store: Arc<JobStore>,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            events,
        }
    }

    /// Alive nodes not running or being handed a job, in registration order.
    pub async fn free_nodes(&self) -> Vec<WorkerNode> {
        let busy = self.store.busy_nodes().await;
        self.registry
            .list_alive()
            .await
            .into_iter()
            .filter(|node| !busy.contains(&node.url))
            .collect()
    }

    /// Try to hand the oldest unassigned job to one free node.
    pub async fn run_cycle(&self) -> DispatchOutcome {
        let Some(claim) = self.store.claim_for_assignment().await else {
            return DispatchOutcome::Idle;
        };
        let job_id = claim.job_id();

        let candidates = self.free_nodes().await;
        if candidates.is_empty() {
            self.store.release_claim(&claim).await;
            tracing::debug!(job_id = %job_id, "No free nodes");
            return DispatchOutcome::NoFreeNodes;
        }

        for node in candidates {
            if !self.store.reserve_node(&claim, &node.url).await {
                continue;
            }
            if let Some(outcome) = self.offer(&claim, &node.url).await {
                return outcome;
            }
            self.store.release_node(&claim).await;
        }

        self.store.release_claim(&claim).await;
        tracing::info!(job_id = %job_id, "No node accepted the job, will retry");
        DispatchOutcome::Deferred { job_id }
    }

    /// Push the claimed job to `node`. `None` means try the next candidate.
    async fn offer(&self, claim: &Claim, node: &str) -> Option<DispatchOutcome> {
        let job = claim.job().to_dispatched();
        let job_id = job.id;

        match self.transport.push_job(node, &job).await {
            Ok(PushOutcome::Accepted) => Some(self.confirm(claim, node).await),
            Ok(PushOutcome::Busy) => {
                tracing::debug!(job_id = %job_id, node, "Node busy");
                None
            }
            Ok(PushOutcome::Rejected(reason)) => {
                let reason = if reason.trim().is_empty() {
                    "Removed because of bad request".to_string()
                } else {
                    format!("Removed because of bad request: {}", reason.trim())
                };
                if self
                    .store
                    .reject_and_remove(&job_id, Some(node), &reason)
                    .await
                {
                    self.events.publish(ManagerEvent::JobRejected {
                        job_id,
                        node: node.to_string(),
                        reason: reason.clone(),
                    });
                }
                Some(DispatchOutcome::Rejected {
                    job_id,
                    node: node.to_string(),
                    reason,
                })
            }
            Ok(PushOutcome::Unexpected(status)) => {
                tracing::warn!(job_id = %job_id, node, status, "Unexpected answer to job push");
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, node, error = %e, "Job push failed");
                None
            }
        }
    }

    async fn confirm(&self, claim: &Claim, node: &str) -> DispatchOutcome {
        let job_id = claim.job_id();
        match self.store.record_assignment(claim, node).await {
            Ok(()) => {
                self.events.publish(ManagerEvent::JobAssigned {
                    job_id,
                    node: node.to_string(),
                });
                DispatchOutcome::Assigned {
                    job_id,
                    node: node.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, node, error = %e, "Node accepted a job it no longer owns");
                self.store.release_claim(claim).await;
                match self.transport.cancel_job(node, job_id).await {
                    Ok(NodeCancelOutcome::Cancelling | NodeCancelOutcome::AlreadyCancelling) => {}
                    Ok(other) => {
                        tracing::debug!(job_id = %job_id, node, outcome = ?other, "Orphan cancel answered");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, node, error = %e, "Failed to cancel orphaned job");
                    }
                }
                DispatchOutcome::Lost { job_id }
            }
        }
    }

    /// Run cycles until one makes no progress. Returns the number of jobs
    /// that left the queue (assigned or rejected).
    pub async fn drain(&self) -> usize {
        let mut moved = 0;
        loop {
            let outcome = self.run_cycle().await;
            if !outcome.made_progress() {
                return moved;
            }
            if !matches!(outcome, DispatchOutcome::Lost { .. }) {
                moved += 1;
            }
        }
    }

    /// Drain on every trigger and every `interval` until `token` is cancelled.
    ///
    /// Each drain runs in its own task; a panic inside it is logged and the
    /// loop keeps going.
    pub async fn run(
        self: Arc<Self>,
        mut trigger: mpsc::Receiver<()>,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut trigger_open = true;
        tracing::info!(interval_ms = interval.as_millis() as u64, "Dispatcher started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                received = trigger.recv(), if trigger_open => {
                    if received.is_none() {
                        tracing::debug!("Dispatch trigger closed, polling only");
                        trigger_open = false;
                        continue;
                    }
                }
            }

            let dispatcher = self.clone();
            match tokio::spawn(async move { dispatcher.drain().await }).await {
                Ok(0) => {}
                Ok(moved) => tracing::debug!(moved, "Dispatch pass finished"),
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "Dispatch pass panicked");
                }
                Err(e) => tracing::warn!(error = %e, "Dispatch pass aborted"),
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}
