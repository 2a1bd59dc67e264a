use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::events::{DispatchTrigger, EventBus, ManagerEvent};
use crate::scheduler::job::{JobDefinition, JobHistory, JobHistoryDetail, JobSpec, JobStatus};
use crate::scheduler::registry::{NodeRegistry, WorkerNode};
use crate::scheduler::store::{CancelStep, FreedJobs, JobStore, TransitionOutcome};
use crate::transport::routes::normalize_base_url;
use crate::transport::{NodeCancelOutcome, NodeTransport};

/// Result of a client cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and is gone.
    Deleted,
    /// The owning node was asked to stop; its callback will finish the job.
    Canceling,
    AlreadyCanceling,
    /// The owning node did not hold the job, so it was canceled directly.
    Canceled,
    NotFound,
}

/// Entry point for every manager operation exposed over HTTP.
///
/// Every call that can free a node or queue work wakes the dispatcher.
pub struct JobManager {
    store: Arc<JobStore>,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    events: EventBus,
    trigger: DispatchTrigger,
    cancel_timeout: Duration,
}

impl JobManager {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        events: EventBus,
        trigger: DispatchTrigger,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            events,
            trigger,
            cancel_timeout,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let job_id = self.store.submit(spec).await?;
        tracing::info!(job_id = %job_id, "Job submitted");
        self.events.publish(ManagerEvent::JobSubmitted { job_id });
        self.trigger.notify();
        Ok(job_id)
    }

    pub async fn cancel(&self, job_id: Uuid) -> CancelOutcome {
        match self.store.begin_cancel(&job_id).await {
            CancelStep::NotFound => CancelOutcome::NotFound,
            CancelStep::Deleted => {
                self.publish_status(job_id, JobStatus::Deleted);
                CancelOutcome::Deleted
            }
            CancelStep::AlreadyCanceling { .. } => CancelOutcome::AlreadyCanceling,
            CancelStep::Canceling { node } => {
                self.publish_status(job_id, JobStatus::Canceling);
                self.tell_node_to_cancel(job_id, &node).await
            }
        }
    }

    /// Best-effort, bounded cancel request to the node running `job_id`.
    async fn tell_node_to_cancel(&self, job_id: Uuid, node: &str) -> CancelOutcome {
        let answer =
            tokio::time::timeout(self.cancel_timeout, self.transport.cancel_job(node, job_id)).await;

        match answer {
            Ok(Ok(NodeCancelOutcome::NotFound)) => {
                let outcome = self
                    .store
                    .mark_terminal(
                        &job_id,
                        JobStatus::Canceled,
                        &JobStatus::Canceled.to_string(),
                        Some("Node was not running the job"),
                        None,
                    )
                    .await;
                match outcome {
                    Ok(TransitionOutcome::Applied) => {
                        self.publish_status(job_id, JobStatus::Canceled);
                        self.trigger.notify();
                        CancelOutcome::Canceled
                    }
                    _ => CancelOutcome::Canceling,
                }
            }
            Ok(Ok(outcome)) => {
                tracing::debug!(job_id = %job_id, node, outcome = ?outcome, "Cancel sent to node");
                CancelOutcome::Canceling
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, node, error = %e, "Cancel request failed");
                CancelOutcome::Canceling
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, node, "Cancel request timed out");
                CancelOutcome::Canceling
            }
        }
    }

    /// A node (re)started. Jobs it held in a previous life are released.
    pub async fn node_initialized(&self, url: &str) -> Result<Uuid> {
        let url = normalize_base_url(url)?;
        let registered = self.registry.register(&url).await?;
        if !registered.created {
            let freed = self.store.free_node(&url).await;
            self.publish_freed(&url, &freed);
        }
        self.events.publish(ManagerEvent::NodeRegistered { node: url });
        self.trigger.notify();
        Ok(registered.id)
    }

    /// Returns false if the node is unknown and should register.
    pub async fn heartbeat(&self, url: &str) -> bool {
        let known = self.registry.record_heartbeat(url).await;
        if known {
            self.trigger.notify();
        }
        known
    }

    /// Forget a node and release whatever it held.
    pub async fn decommission(&self, url: &str) -> Result<bool> {
        let url = normalize_base_url(url)?;
        if !self.registry.remove(&url).await {
            return Ok(false);
        }
        let freed = self.store.free_node(&url).await;
        self.publish_freed(&url, &freed);
        self.trigger.notify();
        Ok(true)
    }

    pub async fn job_done(
        &self,
        job_id: Uuid,
        result: Option<&str>,
        reporter: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.finish(job_id, JobStatus::Done, "Success", result, reporter)
            .await
    }

    pub async fn job_failed(
        &self,
        job_id: Uuid,
        error: &str,
        reporter: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.finish(job_id, JobStatus::Failed, "Failed", Some(error), reporter)
            .await
    }

    pub async fn job_canceled(
        &self,
        job_id: Uuid,
        reporter: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let result = JobStatus::Canceled.to_string();
        self.finish(job_id, JobStatus::Canceled, &result, None, reporter)
            .await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: &str,
        note: Option<&str>,
        reporter: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let reporter = reporter.map(canonical_reporter);
        let outcome = self
            .store
            .mark_terminal(&job_id, status, result, note, reporter.as_deref())
            .await?;

        if outcome == TransitionOutcome::Applied {
            self.publish_status(job_id, status);
            self.trigger.notify();
        } else {
            tracing::debug!(job_id = %job_id, status = %status, outcome = ?outcome, "Status callback had no effect");
        }
        Ok(outcome)
    }

    pub async fn progress(&self, job_id: Uuid, text: &str) -> TransitionOutcome {
        if self.store.report_progress(&job_id, text).await {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::NotFound
        }
    }

    pub async fn history(&self, job_id: Uuid) -> Option<JobHistory> {
        self.store.history(&job_id).await
    }

    pub async fn history_list(&self) -> Vec<JobHistory> {
        self.store.history_list().await
    }

    pub async fn details(&self, job_id: Uuid) -> Vec<JobHistoryDetail> {
        self.store.details(&job_id).await
    }

    pub async fn jobs(&self) -> Vec<JobDefinition> {
        self.store.list_all().await
    }

    pub async fn nodes(&self) -> Vec<WorkerNode> {
        self.registry.list_all().await
    }

    fn publish_status(&self, job_id: Uuid, status: JobStatus) {
        self.events
            .publish(ManagerEvent::JobStatusChanged { job_id, status });
    }

    fn publish_freed(&self, node: &str, freed: &FreedJobs) {
        for job_id in &freed.requeued {
            self.events.publish(ManagerEvent::JobRequeued {
                job_id: *job_id,
                node: node.to_string(),
            });
        }
        for job_id in &freed.canceled {
            self.publish_status(*job_id, JobStatus::Canceled);
        }
    }
}

/// Reporter urls are compared in normalized form. An unparseable reporter is
/// kept verbatim and so never matches an assigned node.
fn canonical_reporter(reporter: &str) -> String {
    normalize_base_url(reporter).unwrap_or_else(|_| reporter.to_string())
}
