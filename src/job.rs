//! Job records as they live inside the queue document.
//!
//! The wire form is the flat camelCase object shared with every other client
//! of `queue.json`; in memory the lease fields are folded into
//! [`JobStatus::InProgress`] so a job cannot be in progress without both a
//! holder and a heartbeat.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cap on claims applied to jobs that do not set their own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Job lease timeout used when none is configured.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: i64 = 30_000;
/// Broker liveness timeout used by election when none is configured.
pub const DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS: i64 = 10_000;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Globally unique job identifier, assigned at enqueue time.
    JobId
);
string_id!(
    /// Identity of a worker holding job leases.
    WorkerId
);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Ownership of an in-progress job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub heartbeat_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Unclaimed,
    InProgress(Lease),
}

/// Discriminant for job status, as written to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusKind {
    Unclaimed,
    InProgress,
}

impl JobStatus {
    pub fn kind(&self) -> JobStatusKind {
        match self {
            JobStatus::Unclaimed => JobStatusKind::Unclaimed,
            JobStatus::InProgress(_) => JobStatusKind::InProgress,
        }
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            JobStatus::Unclaimed => None,
            JobStatus::InProgress(lease) => Some(lease),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobRecord", into = "JobRecord")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Opaque application data.
    pub payload: Value,
    pub job_type: Option<String>,
    pub created_at_ms: i64,
    /// Number of claims so far. Never decremented.
    pub attempts: u32,
    pub max_attempts: Option<u32>,
}

impl Job {
    pub fn new(spec: JobSpec, now_ms: i64) -> Self {
        Self {
            id: JobId::generate(),
            status: JobStatus::Unclaimed,
            payload: spec.payload,
            job_type: spec.job_type,
            created_at_ms: now_ms,
            attempts: 0,
            max_attempts: spec.max_attempts,
        }
    }

    pub fn is_unclaimed(&self) -> bool {
        matches!(self.status, JobStatus::Unclaimed)
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.status.lease()
    }

    /// True when `worker_id` currently holds this job's lease.
    pub fn is_held_by(&self, worker_id: &WorkerId) -> bool {
        self.lease().is_some_and(|l| &l.worker_id == worker_id)
    }

    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// An empty filter accepts every job; otherwise the job's type must be listed.
    pub fn matches_types(&self, job_types: &[String]) -> bool {
        if job_types.is_empty() {
            return true;
        }
        match &self.job_type {
            Some(t) => job_types.iter().any(|want| want == t),
            None => false,
        }
    }
}

/// Flat document form of a [`Job`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRecord {
    id: JobId,
    status: JobStatusKind,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    heartbeat: Option<i64>,
    created_at: i64,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
}

impl TryFrom<JobRecord> for Job {
    type Error = String;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        let status = match (r.status, r.worker_id, r.heartbeat) {
            (JobStatusKind::Unclaimed, _, _) => JobStatus::Unclaimed,
            (JobStatusKind::InProgress, Some(worker_id), Some(heartbeat_ms)) => {
                JobStatus::InProgress(Lease {
                    worker_id,
                    heartbeat_ms,
                })
            }
            (JobStatusKind::InProgress, _, _) => {
                return Err(format!(
                    "job {} is in_progress without both workerId and heartbeat",
                    r.id
                ));
            }
        };
        Ok(Job {
            id: r.id,
            status,
            payload: r.payload,
            job_type: r.job_type,
            created_at_ms: r.created_at,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
        })
    }
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        let kind = job.status.kind();
        let (worker_id, heartbeat) = match job.status {
            JobStatus::Unclaimed => (None, None),
            JobStatus::InProgress(lease) => (Some(lease.worker_id), Some(lease.heartbeat_ms)),
        };
        JobRecord {
            id: job.id,
            status: kind,
            payload: job.payload,
            job_type: job.job_type,
            worker_id,
            heartbeat,
            created_at: job.created_at_ms,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
        }
    }
}

/// What a producer asks to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            payload: payload.into(),
            job_type: None,
            max_attempts: None,
        }
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Returned to the worker that won a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: JobId,
    pub payload: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_progress_job_uses_flat_document_fields() {
        let job = Job {
            id: JobId::new("j1"),
            status: JobStatus::InProgress(Lease {
                worker_id: WorkerId::new("w1"),
                heartbeat_ms: 42,
            }),
            payload: json!({"n": 1}),
            job_type: Some("email".to_string()),
            created_at_ms: 7,
            attempts: 1,
            max_attempts: None,
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(
            v,
            json!({
                "id": "j1",
                "status": "in_progress",
                "payload": {"n": 1},
                "type": "email",
                "workerId": "w1",
                "heartbeat": 42,
                "createdAt": 7,
                "attempts": 1
            })
        );
        let back: Job = serde_json::from_value(v).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn unclaimed_job_omits_lease_fields() {
        let job = Job::new(JobSpec::new("x").with_max_attempts(5), 100);
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["status"], "unclaimed");
        assert_eq!(v["maxAttempts"], 5);
        assert!(v.get("workerId").is_none());
        assert!(v.get("heartbeat").is_none());
        assert!(v.get("type").is_none());
    }

    #[test]
    fn in_progress_without_lease_is_rejected() {
        let err = serde_json::from_value::<Job>(json!({
            "id": "j1",
            "status": "in_progress",
            "payload": null,
            "workerId": "w1",
            "createdAt": 0,
            "attempts": 1
        }))
        .unwrap_err();
        assert!(err.to_string().contains("without both workerId and heartbeat"));
    }

    #[test]
    fn type_filter_matching() {
        let typed = Job::new(JobSpec::new(1).with_type("a"), 0);
        let untyped = Job::new(JobSpec::new(2), 0);
        let any: Vec<String> = vec![];
        let only_a = vec!["a".to_string()];
        let only_b = vec!["b".to_string()];
        assert!(typed.matches_types(&any));
        assert!(untyped.matches_types(&any));
        assert!(typed.matches_types(&only_a));
        assert!(!typed.matches_types(&only_b));
        assert!(!untyped.matches_types(&only_a));
    }
}
