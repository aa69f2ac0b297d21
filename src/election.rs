//! Leader election over the queue document.
//!
//! The leader is whoever the document names in `broker`, for as long as its
//! `brokerHeartbeat` stays within the timeout. Claiming leadership is a CAS
//! write (or create, for an empty store), so when several processes race for
//! a stale or missing leader exactly one of them wins and the rest see
//! [`ElectionResult::Conflict`].

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::job::DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS;
use crate::keys::QUEUE_STATE_KEY;
use crate::state::{QueueState, register_broker};
use crate::storage::{SharedStorage, StorageError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("queue state codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ElectionError {
    fn from(e: serde_json::Error) -> Self {
        ElectionError::Codec(e.to_string())
    }
}

/// Outcome of one election attempt. Losing is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionResult {
    Elected,
    AlreadyLeader,
    /// Another broker holds a fresh heartbeat.
    OtherLeader { leader: String },
    /// A concurrent challenger's write landed first.
    Conflict,
}

impl ElectionResult {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionResult::Elected | ElectionResult::AlreadyLeader)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionResult::Elected => "elected",
            ElectionResult::AlreadyLeader => "already_leader",
            ElectionResult::OtherLeader { .. } => "other_leader",
            ElectionResult::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElectionOptions {
    /// This broker's address, as recorded in the document.
    pub address: String,
    pub state_key: String,
    pub heartbeat_timeout_ms: i64,
}

impl ElectionOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state_key: QUEUE_STATE_KEY.to_string(),
            heartbeat_timeout_ms: DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

pub struct BrokerElection {
    storage: SharedStorage,
    options: ElectionOptions,
}

impl BrokerElection {
    pub fn new(storage: SharedStorage, options: ElectionOptions) -> Self {
        Self { storage, options }
    }

    pub fn address(&self) -> &str {
        &self.options.address
    }

    fn is_fresh(&self, state: &QueueState, now_ms: i64) -> bool {
        now_ms - state.broker_heartbeat <= self.options.heartbeat_timeout_ms
    }

    /// Try to become (or confirm being) the leader as of `now_ms`.
    #[instrument(skip(self), fields(address = %self.options.address))]
    pub async fn try_elect(&self, now_ms: i64) -> Result<ElectionResult, ElectionError> {
        let key = &self.options.state_key;
        let address = self.options.address.as_str();

        let Some(current) = self.storage.read(key).await? else {
            let state = QueueState::with_broker(address, now_ms);
            let result = match self.storage.create_if_not_exists(key, state.to_bytes()?).await {
                Ok(_) => ElectionResult::Elected,
                Err(e) if e.is_cas_conflict() => ElectionResult::Conflict,
                Err(e) => return Err(e.into()),
            };
            info!(result = result.as_str(), "election on empty store");
            return Ok(result);
        };

        let state = QueueState::from_slice(&current.data)?;
        let fresh = self.is_fresh(&state, now_ms);
        match state.broker.as_deref() {
            Some(leader) if leader == address && fresh => {
                return Ok(ElectionResult::AlreadyLeader);
            }
            Some(leader) if leader != address && fresh => {
                debug!(leader, heartbeat = state.broker_heartbeat, "live leader present");
                return Ok(ElectionResult::OtherLeader {
                    leader: leader.to_string(),
                });
            }
            _ => {}
        }

        // Missing or stale leader (possibly ourselves): take over, keeping jobs.
        let previous = state.broker.clone();
        let next = register_broker(state, address, now_ms);
        let result = match self
            .storage
            .write(key, next.to_bytes()?, &current.version)
            .await
        {
            Ok(_) => ElectionResult::Elected,
            Err(e) if e.is_cas_conflict() => ElectionResult::Conflict,
            Err(e) => return Err(e.into()),
        };
        info!(?previous, result = result.as_str(), "takeover attempt");
        Ok(result)
    }

    /// Whether the document still names this broker. A leader that sees
    /// `false` must stop writing.
    #[instrument(level = "debug", skip(self), fields(address = %self.options.address))]
    pub async fn check_leadership(&self) -> Result<bool, ElectionError> {
        let Some(current) = self.storage.read(&self.options.state_key).await? else {
            return Ok(false);
        };
        let state = QueueState::from_slice(&current.data)?;
        Ok(state.broker.as_deref() == Some(self.options.address.as_str()))
    }
}
