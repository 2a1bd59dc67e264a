use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ForemanError, Result};
use crate::scheduler::job::{JobDefinition, JobHistory, JobHistoryDetail, JobSpec, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;
const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(60);

/// Exclusive reservation of one queued job for a dispatch attempt.
///
/// Only the holder of a live claim can record an assignment for the job.
/// A claim dies when it is released, when it expires, or when the job is
/// removed (for example canceled) while the dispatch is in flight.
#[derive(Debug, Clone)]
pub struct Claim {
    claim_id: Uuid,
    job: JobDefinition,
    expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn job(&self) -> &JobDefinition {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Result of the first, synchronous half of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelStep {
    /// Unknown or already terminal.
    NotFound,
    /// Job was still queued and has been deleted.
    Deleted,
    /// Job is now `Canceling`; the owning node must be told.
    Canceling { node: String },
    /// A cancel for this job is already in flight.
    AlreadyCanceling { node: String },
}

/// Outcome of a status transition requested by a node callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    /// Unknown job or already terminal; repeated callbacks land here.
    NotFound,
    /// The reporting node no longer owns the job.
    Stale,
    /// The job exists but is not in a status that allows this transition.
    Ignored,
}

/// Jobs released by [`JobStore::free_node`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreedJobs {
    /// Jobs returned to the unassigned pool.
    pub requeued: Vec<Uuid>,
    /// Jobs that were being canceled and are now terminal.
    pub canceled: Vec<Uuid>,
}

#[derive(Debug)]
struct ClaimEntry {
    claim_id: Uuid,
    expires_at: DateTime<Utc>,
    node: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, JobDefinition>,
    /// Submission sequence -> job id. Iteration order is FIFO.
    order: BTreeMap<u64, Uuid>,
    seq_of: HashMap<Uuid, u64>,
    next_seq: u64,
    claims: HashMap<Uuid, ClaimEntry>,
    /// Node url -> job whose dispatch currently holds the node.
    reservations: HashMap<String, Uuid>,
    /// Claim id -> node that finished the claimed job before the dispatcher
    /// confirmed the push.
    finished_early: HashMap<Uuid, String>,
}

impl QueueState {
    fn remove_job(&mut self, job_id: &Uuid) -> Option<JobDefinition> {
        let job = self.jobs.remove(job_id)?;
        if let Some(seq) = self.seq_of.remove(job_id) {
            self.order.remove(&seq);
        }
        self.drop_claim(job_id);
        Some(job)
    }

    fn drop_claim(&mut self, job_id: &Uuid) {
        if let Some(entry) = self.claims.remove(job_id) {
            if let Some(node) = entry.node {
                self.unreserve(&node, job_id);
            }
        }
    }

    fn unreserve(&mut self, node: &str, job_id: &Uuid) {
        if self.reservations.get(node) == Some(job_id) {
            self.reservations.remove(node);
        }
    }

    fn is_live(&self, claim: &Claim, now: DateTime<Utc>) -> bool {
        self.claims
            .get(&claim.job.id)
            .is_some_and(|entry| entry.claim_id == claim.claim_id && entry.expires_at > now)
    }

    fn is_node_busy(&self, node: &str) -> bool {
        self.reservations.contains_key(node)
            || self
                .jobs
                .values()
                .any(|job| job.assigned_node.as_deref() == Some(node) && !job.status.is_terminal())
    }

    fn is_assignable(&self, job_id: &Uuid, now: DateTime<Utc>) -> bool {
        let unassigned = self
            .jobs
            .get(job_id)
            .is_some_and(|job| job.status == JobStatus::Queued && job.assigned_node.is_none());
        let claimed = self
            .claims
            .get(job_id)
            .is_some_and(|entry| entry.expires_at > now);
        unassigned && !claimed
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    entries: HashMap<Uuid, JobHistory>,
    order: Vec<Uuid>,
    details: HashMap<Uuid, Vec<JobHistoryDetail>>,
}

impl HistoryState {
    fn append_detail(&mut self, job_id: Uuid, created: DateTime<Utc>, text: impl Into<String>) {
        self.details
            .entry(job_id)
            .or_default()
            .push(JobHistoryDetail {
                job_id,
                created,
                text: text.into(),
            });
    }

    fn finish(&mut self, job_id: Uuid, now: DateTime<Utc>, result: &str) {
        if let Some(entry) = self.entries.get_mut(&job_id) {
            entry.result = Some(result.to_string());
            entry.ended = Some(now);
        }
        self.append_detail(job_id, now, result);
    }
}

/// Authoritative store of the job queue and job history.
///
/// The working queue and the history are guarded by separate locks. Any
/// operation touching both takes the queue lock first, then the history
/// lock, and holds both for the whole operation, so every multi-row change
/// is atomic to other callers.
#[derive(Debug)]
pub struct JobStore {
    queue: Mutex<QueueState>,
    history: RwLock<HistoryState>,
    clock: Arc<dyn Clock>,
    max_jobs: usize,
    claim_ttl: chrono::Duration,
}

impl JobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(clock, DEFAULT_MAX_JOBS, DEFAULT_CLAIM_TTL)
    }

    pub fn with_limits(clock: Arc<dyn Clock>, max_jobs: usize, claim_ttl: Duration) -> Self {
        Self {
            queue: Mutex::new(QueueState::default()),
            history: RwLock::new(HistoryState::default()),
            clock,
            max_jobs,
            claim_ttl: chrono::Duration::from_std(claim_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Insert a new queued job together with its history row.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()
            .map_err(|e| ForemanError::Store(e.to_string()))?;

        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        if queue.jobs.len() >= self.max_jobs {
            return Err(ForemanError::QueueFull(self.max_jobs));
        }
        let mut history = self.history.write().await;

        // History rows are never deleted, so checking them rules out reuse.
        let mut id = Uuid::new_v4();
        while history.entries.contains_key(&id) {
            id = Uuid::new_v4();
        }

        history.entries.insert(
            id,
            JobHistory {
                id,
                name: spec.name.clone(),
                created_by: spec.created_by.clone(),
                created: now,
                started: None,
                ended: None,
                sent_to: None,
                result: None,
            },
        );
        history.order.push(id);
        history.append_detail(id, now, "Added");

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.order.insert(seq, id);
        queue.seq_of.insert(id, seq);
        queue.jobs.insert(id, JobDefinition::from_spec(id, spec, now));

        tracing::debug!(job_id = %id, seq, "Job queued");
        Ok(id)
    }

    /// Get a job from the working queue.
    pub async fn get(&self, job_id: &Uuid) -> Option<JobDefinition> {
        self.queue.lock().await.jobs.get(job_id).cloned()
    }

    /// All jobs in the working queue, in submission order.
    pub async fn list_all(&self) -> Vec<JobDefinition> {
        let queue = self.queue.lock().await;
        queue
            .order
            .values()
            .filter_map(|id| queue.jobs.get(id).cloned())
            .collect()
    }

    /// Jobs waiting for a node, in submission order.
    pub async fn list_unassigned(&self) -> Vec<JobDefinition> {
        let queue = self.queue.lock().await;
        queue
            .order
            .values()
            .filter_map(|id| queue.jobs.get(id))
            .filter(|job| job.assigned_node.is_none())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.jobs.is_empty()
    }

    /// Nodes that hold a non-terminal job or are reserved by an in-flight
    /// dispatch.
    pub async fn busy_nodes(&self) -> HashSet<String> {
        let queue = self.queue.lock().await;
        queue
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .filter_map(|job| job.assigned_node.clone())
            .chain(queue.reservations.keys().cloned())
            .collect()
    }

    /// Claim the oldest unassigned job that no other dispatch holds.
    ///
    /// Expired claims are treated as released.
    pub async fn claim_for_assignment(&self) -> Option<Claim> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;

        let job_id = queue
            .order
            .values()
            .copied()
            .find(|id| queue.is_assignable(id, now))?;

        queue.drop_claim(&job_id);
        let claim_id = Uuid::new_v4();
        let expires_at = now + self.claim_ttl;
        queue.claims.insert(
            job_id,
            ClaimEntry {
                claim_id,
                expires_at,
                node: None,
            },
        );

        let job = queue.jobs.get(&job_id)?.clone();
        tracing::debug!(job_id = %job_id, claim_id = %claim_id, "Job claimed");
        Some(Claim {
            claim_id,
            job,
            expires_at,
        })
    }

    /// Reserve `node` for the claimed job. Returns false if the claim is no
    /// longer live or the node is busy with another job.
    ///
    /// A claim holds at most one node; reserving a new one releases the old.
    pub async fn reserve_node(&self, claim: &Claim, node: &str) -> bool {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let job_id = claim.job.id;

        if !queue.is_live(claim, now) {
            return false;
        }
        if queue.reservations.get(node) == Some(&job_id) {
            return true;
        }
        if queue.is_node_busy(node) {
            return false;
        }

        let previous = queue
            .claims
            .get_mut(&job_id)
            .and_then(|entry| entry.node.replace(node.to_string()));
        if let Some(previous) = previous {
            queue.unreserve(&previous, &job_id);
        }
        queue.reservations.insert(node.to_string(), job_id);
        true
    }

    /// Release the node reserved by `claim`, keeping the claim itself.
    pub async fn release_node(&self, claim: &Claim) {
        let mut queue = self.queue.lock().await;
        let job_id = claim.job.id;
        let node = match queue.claims.get_mut(&job_id) {
            Some(entry) if entry.claim_id == claim.claim_id => entry.node.take(),
            _ => None,
        };
        if let Some(node) = node {
            queue.unreserve(&node, &job_id);
        }
    }

    /// Give the claimed job back to the unassigned pool.
    pub async fn release_claim(&self, claim: &Claim) {
        let mut queue = self.queue.lock().await;
        queue.finished_early.remove(&claim.claim_id);
        let owned = queue
            .claims
            .get(&claim.job.id)
            .is_some_and(|entry| entry.claim_id == claim.claim_id);
        if owned {
            queue.drop_claim(&claim.job.id);
        }
    }

    /// Drop every claim whose TTL has passed. Returns how many were dropped.
    pub async fn release_expired_claims(&self) -> usize {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let expired: Vec<Uuid> = queue
            .claims
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in &expired {
            tracing::warn!(job_id = %job_id, "Dispatch claim expired");
            queue.drop_claim(job_id);
        }
        expired.len()
    }

    /// Confirm that `node` accepted the claimed job.
    ///
    /// Succeeds without change if `node` already finished the job under this
    /// very claim. Fails with [`ForemanError::ClaimLost`] if the claim is no
    /// longer live, the node reservation was revoked, or the job left the
    /// queue for any other reason.
    pub async fn record_assignment(&self, claim: &Claim, node: &str) -> Result<()> {
        let now = self.clock.now();
        let job_id = claim.job.id;
        let mut queue = self.queue.lock().await;

        if let Some(finisher) = queue.finished_early.remove(&claim.claim_id) {
            if finisher == node {
                tracing::debug!(job_id = %job_id, node, "Job finished before its push was confirmed");
                return Ok(());
            }
            return Err(ForemanError::ClaimLost(job_id));
        }
        if !queue.jobs.contains_key(&job_id) {
            return Err(ForemanError::ClaimLost(job_id));
        }

        if !queue.is_live(claim, now) || queue.reservations.get(node) != Some(&job_id) {
            return Err(ForemanError::ClaimLost(job_id));
        }
        let job = queue
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status == JobStatus::Queued && job.assigned_node.is_none())
            .ok_or(ForemanError::ClaimLost(job_id))?;

        job.assigned_node = Some(node.to_string());
        job.status = JobStatus::Started;
        queue.drop_claim(&job_id);

        let mut history = self.history.write().await;
        if let Some(entry) = history.entries.get_mut(&job_id) {
            entry.started = Some(now);
            entry.sent_to = Some(node.to_string());
        }
        history.append_detail(job_id, now, "Started");

        tracing::info!(job_id = %job_id, node, "Job assigned");
        Ok(())
    }

    /// Remove a job a node reported as permanently unprocessable.
    pub async fn reject_and_remove(
        &self,
        job_id: &Uuid,
        sent_to: Option<&str>,
        reason: &str,
    ) -> bool {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        if queue.remove_job(job_id).is_none() {
            return false;
        }

        let mut history = self.history.write().await;
        if let Some(entry) = history.entries.get_mut(job_id) {
            if let Some(node) = sent_to {
                entry.sent_to = Some(node.to_string());
            }
        }
        history.finish(*job_id, now, reason);

        tracing::warn!(job_id = %job_id, node = ?sent_to, reason, "Job rejected and removed");
        true
    }

    /// Delete a queued job, or mark an assigned job `Canceling`.
    pub async fn begin_cancel(&self, job_id: &Uuid) -> CancelStep {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let Some(job) = queue.jobs.get_mut(job_id) else {
            return CancelStep::NotFound;
        };

        match (job.status, job.assigned_node.clone()) {
            (JobStatus::Queued, _) | (_, None) => {
                queue.remove_job(job_id);
                let mut history = self.history.write().await;
                history.finish(*job_id, now, &JobStatus::Deleted.to_string());
                tracing::info!(job_id = %job_id, "Queued job deleted");
                CancelStep::Deleted
            }
            (JobStatus::Canceling, Some(node)) => CancelStep::AlreadyCanceling { node },
            (_, Some(node)) => {
                job.status = JobStatus::Canceling;
                let mut history = self.history.write().await;
                history.append_detail(*job_id, now, JobStatus::Canceling.to_string());
                tracing::info!(job_id = %job_id, node = %node, "Job canceling");
                CancelStep::Canceling { node }
            }
        }
    }

    /// Move a `Started` job to `Canceling`. Returns false for any other status.
    pub async fn mark_canceling(&self, job_id: &Uuid) -> bool {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        match queue.jobs.get_mut(job_id) {
            Some(job) if job.status.can_transition_to(JobStatus::Canceling) => {
                job.status = JobStatus::Canceling;
                let mut history = self.history.write().await;
                history.append_detail(*job_id, now, JobStatus::Canceling.to_string());
                true
            }
            _ => false,
        }
    }

    /// Move a job to a terminal status and out of the working queue.
    ///
    /// `result` becomes the history result and a detail row; `note`, when
    /// given, is appended as a second detail row. If `reporter` is given it
    /// must be the node the job is assigned to, otherwise the call is
    /// treated as stale and changes nothing.
    pub async fn mark_terminal(
        &self,
        job_id: &Uuid,
        status: JobStatus,
        result: &str,
        note: Option<&str>,
        reporter: Option<&str>,
    ) -> Result<TransitionOutcome> {
        if !status.is_terminal() {
            return Err(ForemanError::InvalidTransition {
                job_id: *job_id,
                from: "any".to_string(),
                to: status.to_string(),
            });
        }

        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let Some(job) = queue.jobs.get(job_id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        // A node can finish a job before the dispatcher has confirmed the
        // push. The reservation identifies it as the owner.
        let early_claim = reporter.and_then(|reporter| {
            if job.status != JobStatus::Queued || job.assigned_node.is_some() {
                return None;
            }
            queue
                .claims
                .get(job_id)
                .filter(|entry| entry.node.as_deref() == Some(reporter))
                .map(|entry| entry.claim_id)
        });
        let early = early_claim.is_some();
        let from = if early { JobStatus::Started } else { job.status };

        if let Some(reporter) = reporter {
            if !early && job.assigned_node.as_deref() != Some(reporter) {
                tracing::warn!(
                    job_id = %job_id,
                    reporter,
                    assigned = ?job.assigned_node,
                    "Ignoring status from node that does not own the job"
                );
                return Ok(TransitionOutcome::Stale);
            }
        }
        if !from.can_transition_to(status) {
            tracing::debug!(job_id = %job_id, from = %from, to = %status, "Transition ignored");
            return Ok(TransitionOutcome::Ignored);
        }

        queue.remove_job(job_id);
        if let (Some(claim_id), Some(reporter)) = (early_claim, reporter) {
            queue.finished_early.insert(claim_id, reporter.to_string());
        }
        let mut history = self.history.write().await;
        if early {
            if let Some(entry) = history.entries.get_mut(job_id) {
                entry.started = Some(now);
                entry.sent_to = reporter.map(str::to_string);
            }
            history.append_detail(*job_id, now, JobStatus::Started.to_string());
        }
        history.finish(*job_id, now, result);
        if let Some(note) = note {
            history.append_detail(*job_id, now, note);
        }

        tracing::info!(job_id = %job_id, status = %status, "Job finished");
        Ok(TransitionOutcome::Applied)
    }

    /// Release every job assigned to `node` after it was declared dead.
    pub async fn free_node(&self, node: &str) -> FreedJobs {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let mut history = self.history.write().await;
        let mut freed = FreedJobs::default();

        if let Some(job_id) = queue.reservations.remove(node) {
            if let Some(entry) = queue.claims.get_mut(&job_id) {
                entry.node = None;
            }
        }

        let owned: Vec<Uuid> = queue
            .order
            .values()
            .filter(|id| {
                queue
                    .jobs
                    .get(id)
                    .is_some_and(|job| job.assigned_node.as_deref() == Some(node))
            })
            .copied()
            .collect();

        for job_id in owned {
            let Some(job) = queue.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status == JobStatus::Canceling {
                queue.remove_job(&job_id);
                history.finish(job_id, now, &JobStatus::Canceled.to_string());
                history.append_detail(job_id, now, format!("Node {} stopped responding", node));
                freed.canceled.push(job_id);
            } else {
                job.assigned_node = None;
                job.status = JobStatus::Queued;
                history.append_detail(
                    job_id,
                    now,
                    format!("Requeued: node {} stopped responding", node),
                );
                freed.requeued.push(job_id);
            }
        }

        if !freed.requeued.is_empty() || !freed.canceled.is_empty() {
            tracing::info!(
                node,
                requeued = freed.requeued.len(),
                canceled = freed.canceled.len(),
                "Released jobs of dead node"
            );
        }
        freed
    }

    /// Append a progress note. Returns false for unknown jobs.
    pub async fn report_progress(&self, job_id: &Uuid, text: &str) -> bool {
        let now = self.clock.now();
        let mut history = self.history.write().await;
        if !history.entries.contains_key(job_id) {
            return false;
        }
        history.append_detail(*job_id, now, text);
        true
    }

    pub async fn history(&self, job_id: &Uuid) -> Option<JobHistory> {
        self.history.read().await.entries.get(job_id).cloned()
    }

    /// Every history row, in submission order.
    pub async fn history_list(&self) -> Vec<JobHistory> {
        let history = self.history.read().await;
        history
            .order
            .iter()
            .filter_map(|id| history.entries.get(id).cloned())
            .collect()
    }

    /// Progress notes of a job, oldest first.
    pub async fn details(&self, job_id: &Uuid) -> Vec<JobHistoryDetail> {
        self.details_since(job_id, 0).await
    }

    /// Progress notes starting at index `offset`, so a poller can resume
    /// where it left off.
    pub async fn details_since(&self, job_id: &Uuid, offset: usize) -> Vec<JobHistoryDetail> {
        self.history
            .read()
            .await
            .details
            .get(job_id)
            .map(|details| details.iter().skip(offset).cloned().collect())
            .unwrap_or_default()
    }
}
