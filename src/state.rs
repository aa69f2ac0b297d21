//! The queue document and its transitions.
//!
//! Every function here is pure: it takes a state by value and returns the next
//! one. None of them fail; unknown ids, foreign leases and empty queues are
//! ordinary no-op outcomes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::job::{ClaimedJob, Job, JobId, JobSpec, JobStatus, Lease, WorkerId};

/// The single persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// Address of the current leader, if any.
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub broker_heartbeat: i64,
    /// FIFO by insertion.
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub completed_total: u64,
}

impl QueueState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fresh document naming `address` as leader.
    pub fn with_broker(address: &str, now_ms: i64) -> Self {
        register_broker(Self::empty(), address, now_ms)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn stats(&self) -> QueueStats {
        let unclaimed = self.jobs.iter().filter(|j| j.is_unclaimed()).count();
        QueueStats {
            total: self.jobs.len(),
            unclaimed,
            in_progress: self.jobs.len() - unclaimed,
            completed_total: self.completed_total,
            broker: self.broker.clone(),
        }
    }
}

/// Read-only summary served from the engine's cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub unclaimed: usize,
    pub in_progress: usize,
    pub completed_total: u64,
    pub broker: Option<String>,
}

/// A state transition request. The set is closed; [`apply_mutation`] matches
/// it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Mutation {
    Enqueue {
        jobs: Vec<JobSpec>,
    },
    Claim {
        worker_id: WorkerId,
        /// Empty means any type.
        #[serde(default)]
        job_types: Vec<String>,
    },
    Heartbeat {
        job_id: JobId,
        worker_id: WorkerId,
    },
    Complete {
        job_id: JobId,
        worker_id: WorkerId,
    },
    RegisterBroker {
        broker_address: String,
        timestamp: i64,
    },
    /// Refresh the leader heartbeat only while `broker_address` is still the
    /// named leader. Safe to replay after a conflict.
    RenewBroker {
        broker_address: String,
        timestamp: i64,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Enqueue { .. } => "enqueue",
            Mutation::Claim { .. } => "claim",
            Mutation::Heartbeat { .. } => "heartbeat",
            Mutation::Complete { .. } => "complete",
            Mutation::RegisterBroker { .. } => "register_broker",
            Mutation::RenewBroker { .. } => "renew_broker",
        }
    }
}

/// Per-mutation outcome handed back to the submitter.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    Enqueued(Vec<JobId>),
    Claimed(Option<ClaimedJob>),
    /// Whether a [`Mutation::RenewBroker`] found its broker still in charge.
    Renewed(bool),
    Applied,
}

impl MutationResult {
    pub fn into_enqueued(self) -> Option<Vec<JobId>> {
        match self {
            MutationResult::Enqueued(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn into_claimed(self) -> Option<ClaimedJob> {
        match self {
            MutationResult::Claimed(job) => job,
            _ => None,
        }
    }

    pub fn is_renewed(&self) -> bool {
        matches!(self, MutationResult::Renewed(true))
    }
}

/// Append one unclaimed job per spec. Ids come back in spec order.
pub fn enqueue_jobs(
    mut state: QueueState,
    specs: Vec<JobSpec>,
    now_ms: i64,
) -> (QueueState, Vec<JobId>) {
    let mut ids = Vec::with_capacity(specs.len());
    for spec in specs {
        let job = Job::new(spec, now_ms);
        ids.push(job.id.clone());
        state.jobs.push(job);
    }
    (state, ids)
}

/// Hand the first eligible unclaimed job to `worker_id`.
pub fn claim_job(
    mut state: QueueState,
    worker_id: &WorkerId,
    now_ms: i64,
    job_types: &[String],
) -> (QueueState, Option<ClaimedJob>) {
    let Some(job) = state
        .jobs
        .iter_mut()
        .find(|j| j.is_unclaimed() && j.matches_types(job_types))
    else {
        return (state, None);
    };

    job.status = JobStatus::InProgress(Lease {
        worker_id: worker_id.clone(),
        heartbeat_ms: now_ms,
    });
    job.attempts += 1;
    let claimed = ClaimedJob {
        id: job.id.clone(),
        payload: job.payload.clone(),
        job_type: job.job_type.clone(),
    };
    (state, Some(claimed))
}

/// Refresh the lease on `job_id` if `worker_id` still holds it.
pub fn heartbeat_job(
    mut state: QueueState,
    job_id: &JobId,
    worker_id: &WorkerId,
    now_ms: i64,
) -> QueueState {
    if let Some(job) = state.jobs.iter_mut().find(|j| &j.id == job_id)
        && let JobStatus::InProgress(lease) = &mut job.status
        && &lease.worker_id == worker_id
    {
        lease.heartbeat_ms = now_ms;
    }
    state
}

/// Remove `job_id` and count it as completed if `worker_id` holds its lease.
pub fn complete_job(mut state: QueueState, job_id: &JobId, worker_id: &WorkerId) -> QueueState {
    if let Some(pos) = state
        .jobs
        .iter()
        .position(|j| &j.id == job_id && j.is_held_by(worker_id))
    {
        state.jobs.remove(pos);
        state.completed_total += 1;
    }
    state
}

/// Reclaim leases whose holder has been silent for more than `timeout_ms`.
///
/// A stale job that has used up its attempts is dropped; otherwise it goes
/// back to unclaimed with its attempt count intact.
pub fn expire_heartbeats(mut state: QueueState, now_ms: i64, timeout_ms: i64) -> QueueState {
    state.jobs.retain_mut(|job| {
        let stale = job
            .lease()
            .is_some_and(|l| now_ms - l.heartbeat_ms > timeout_ms);
        if !stale {
            return true;
        }
        if job.attempts >= job.effective_max_attempts() {
            return false;
        }
        job.status = JobStatus::Unclaimed;
        true
    });
    state
}

/// Record `address` as leader with a fresh heartbeat. Jobs are untouched.
pub fn register_broker(mut state: QueueState, address: &str, now_ms: i64) -> QueueState {
    state.broker = Some(address.to_string());
    state.broker_heartbeat = now_ms;
    state
}

/// Bump the heartbeat if `address` is the recorded leader; otherwise leave
/// the document alone and report false.
pub fn renew_broker(mut state: QueueState, address: &str, now_ms: i64) -> (QueueState, bool) {
    if state.broker.as_deref() != Some(address) {
        return (state, false);
    }
    state.broker_heartbeat = now_ms;
    (state, true)
}

pub fn apply_mutation(
    state: QueueState,
    mutation: &Mutation,
    now_ms: i64,
) -> (QueueState, MutationResult) {
    match mutation {
        Mutation::Enqueue { jobs } => {
            let (state, ids) = enqueue_jobs(state, jobs.clone(), now_ms);
            (state, MutationResult::Enqueued(ids))
        }
        Mutation::Claim {
            worker_id,
            job_types,
        } => {
            let (state, claimed) = claim_job(state, worker_id, now_ms, job_types);
            (state, MutationResult::Claimed(claimed))
        }
        Mutation::Heartbeat { job_id, worker_id } => (
            heartbeat_job(state, job_id, worker_id, now_ms),
            MutationResult::Applied,
        ),
        Mutation::Complete { job_id, worker_id } => (
            complete_job(state, job_id, worker_id),
            MutationResult::Applied,
        ),
        Mutation::RegisterBroker {
            broker_address,
            timestamp,
        } => (
            register_broker(state, broker_address, *timestamp),
            MutationResult::Applied,
        ),
        Mutation::RenewBroker {
            broker_address,
            timestamp,
        } => {
            let (state, renewed) = renew_broker(state, broker_address, *timestamp);
            (state, MutationResult::Renewed(renewed))
        }
    }
}
