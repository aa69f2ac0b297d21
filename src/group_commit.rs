//! Group commit engine.
//!
//! Callers submit [`Mutation`]s from any number of tasks. A single loop drains
//! the buffer into a batch, expires stale leases, folds every mutation of the
//! batch over the cached document, and persists the result with one CAS write.
//! Each submitter gets back the result computed for its own mutation once the
//! write lands, or the batch's error if it does not.
//!
//! Phases: `Stopped -> Starting -> Running -> Stopped`. The engine can be
//! started again after a stop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::clock::{SharedClock, system_clock};
use crate::helpers::lock;
use crate::job::{ClaimedJob, DEFAULT_HEARTBEAT_TIMEOUT_MS, JobId, JobSpec, WorkerId};
use crate::keys::QUEUE_STATE_KEY;
use crate::state::{
    Mutation, MutationResult, QueueState, QueueStats, apply_mutation, expire_heartbeats,
};
use crate::storage::{SharedStorage, StorageError, StorageVersion};

/// Errors delivered to every submitter of a failed batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("group commit engine stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("gave up after {attempts} conflicting writes")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("failed to read queue state: {0}")]
    StateMissing(String),

    #[error("queue state codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Codec(e.to_string())
    }
}

#[derive(Clone)]
pub struct EngineOptions {
    pub state_key: String,
    /// Period of the write loop when nobody kicks it.
    pub interval: Duration,
    /// Job lease timeout applied by the expiry sweep of every pass.
    pub heartbeat_timeout_ms: i64,
    /// Base of the linear backoff after a CAS conflict.
    pub conflict_backoff: Duration,
    /// Retries after the first conflicting write before the batch fails.
    pub max_retries: u32,
    pub clock: SharedClock,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            state_key: QUEUE_STATE_KEY.to_string(),
            interval: Duration::from_millis(50),
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            conflict_backoff: Duration::from_millis(50),
            max_retries: 5,
            clock: system_clock(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Stopped,
    Starting,
    Running,
}

type ResultSender = oneshot::Sender<Result<MutationResult, EngineError>>;

/// A mutation waiting for the next write pass.
struct PendingMutation {
    mutation: Mutation,
    tx: ResultSender,
}

struct Control {
    phase: EnginePhase,
    /// Bumped on every start and stop; a loop exits once it no longer matches.
    epoch: u64,
    buffer: Vec<PendingMutation>,
}

/// Last committed document together with the version it was written at.
#[derive(Clone)]
struct Cached {
    state: QueueState,
    version: StorageVersion,
}

/// Resolves with the committed result of one submitted mutation.
pub struct MutationHandle {
    rx: oneshot::Receiver<Result<MutationResult, EngineError>>,
}

impl MutationHandle {
    fn rejected(err: EngineError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for MutationHandle {
    type Output = Result<MutationResult, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(EngineError::Stopped)))
    }
}

pub struct GroupCommitEngine {
    storage: SharedStorage,
    options: EngineOptions,
    control: Mutex<Control>,
    cache: Mutex<Option<Cached>>,
    notify: Notify,
}

impl GroupCommitEngine {
    pub fn new(storage: SharedStorage, options: EngineOptions) -> Arc<Self> {
        Arc::new(Self {
            storage,
            options,
            control: Mutex::new(Control {
                phase: EnginePhase::Stopped,
                epoch: 0,
                buffer: Vec::new(),
            }),
            cache: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    pub fn phase(&self) -> EnginePhase {
        lock(&self.control).phase
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Snapshot of the last committed document. May lag an in-flight write.
    pub fn cached_state(&self) -> Option<QueueState> {
        lock(&self.cache).as_ref().map(|c| c.state.clone())
    }

    pub fn stats(&self) -> Option<QueueStats> {
        lock(&self.cache).as_ref().map(|c| c.state.stats())
    }

    /// Buffer `mutation` for the next pass. A stopped engine rejects it
    /// immediately.
    pub fn submit(&self, mutation: Mutation) -> MutationHandle {
        let (tx, rx) = oneshot::channel();
        let kick = {
            let mut control = lock(&self.control);
            if control.phase == EnginePhase::Stopped {
                return MutationHandle::rejected(EngineError::Stopped);
            }
            control.buffer.push(PendingMutation { mutation, tx });
            control.phase == EnginePhase::Running && control.buffer.len() == 1
        };
        if kick {
            self.notify.notify_one();
        }
        MutationHandle { rx }
    }

    /// Make sure the queue document exists, then run the write loop.
    /// Calling `start` on a running engine is a no-op.
    #[instrument(skip(self), fields(key = %self.options.state_key))]
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let epoch = {
            let mut control = lock(&self.control);
            if control.phase != EnginePhase::Stopped {
                return Ok(());
            }
            control.phase = EnginePhase::Starting;
            control.epoch += 1;
            control.epoch
        };

        if let Err(e) = self.ensure_state().await {
            let mut control = lock(&self.control);
            if control.epoch == epoch {
                control.phase = EnginePhase::Stopped;
            }
            return Err(e);
        }

        let pending = {
            let mut control = lock(&self.control);
            if control.epoch != epoch {
                // Stopped (and possibly restarted) while starting.
                return Err(EngineError::Stopped);
            }
            control.phase = EnginePhase::Running;
            !control.buffer.is_empty()
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(epoch).await });
        if pending {
            self.notify.notify_one();
        }
        info!("group commit engine running");
        Ok(())
    }

    /// Halt the loop and reject everything still buffered. Mutations already
    /// committed stay committed; an in-flight write is not cancelled.
    pub fn stop(&self) {
        let drained = {
            let mut control = lock(&self.control);
            if control.phase == EnginePhase::Stopped && control.buffer.is_empty() {
                return;
            }
            control.phase = EnginePhase::Stopped;
            control.epoch += 1;
            std::mem::take(&mut control.buffer)
        };
        debug!(rejected = drained.len(), "group commit engine stopping");
        for pending in drained {
            let _ = pending.tx.send(Err(EngineError::Stopped));
        }
        self.notify.notify_waiters();
    }

    pub async fn enqueue(&self, jobs: Vec<JobSpec>) -> Result<Vec<JobId>, EngineError> {
        let result = self.submit(Mutation::Enqueue { jobs }).await?;
        Ok(result.into_enqueued().unwrap_or_default())
    }

    pub async fn claim(
        &self,
        worker_id: WorkerId,
        job_types: Vec<String>,
    ) -> Result<Option<ClaimedJob>, EngineError> {
        let result = self
            .submit(Mutation::Claim {
                worker_id,
                job_types,
            })
            .await?;
        Ok(result.into_claimed())
    }

    pub async fn heartbeat(&self, job_id: JobId, worker_id: WorkerId) -> Result<(), EngineError> {
        self.submit(Mutation::Heartbeat { job_id, worker_id })
            .await
            .map(|_| ())
    }

    pub async fn complete(&self, job_id: JobId, worker_id: WorkerId) -> Result<(), EngineError> {
        self.submit(Mutation::Complete { job_id, worker_id })
            .await
            .map(|_| ())
    }

    pub async fn register_broker(&self, address: &str, now_ms: i64) -> Result<(), EngineError> {
        self.submit(Mutation::RegisterBroker {
            broker_address: address.to_string(),
            timestamp: now_ms,
        })
        .await
        .map(|_| ())
    }

    /// Refresh the leader heartbeat for `address`. Resolves to false when the
    /// committed document names someone else.
    pub async fn renew_broker(&self, address: &str, now_ms: i64) -> Result<bool, EngineError> {
        let result = self
            .submit(Mutation::RenewBroker {
                broker_address: address.to_string(),
                timestamp: now_ms,
            })
            .await?;
        Ok(result.is_renewed())
    }

    fn is_current(&self, epoch: u64) -> bool {
        let control = lock(&self.control);
        control.phase == EnginePhase::Running && control.epoch == epoch
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        loop {
            if !self.is_current(epoch) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.interval) => {}
                _ = self.notify.notified() => {}
            }
            if !self.is_current(epoch) {
                break;
            }
            // Let submitters that were woken alongside us land in this batch.
            tokio::task::yield_now().await;
            self.process_buffer().await;
        }
        debug!(epoch, "group commit loop exited");
    }

    /// Commit everything buffered right now as one batch.
    async fn process_buffer(&self) {
        let batch = std::mem::take(&mut lock(&self.control).buffer);
        if batch.is_empty() {
            return;
        }

        let mutations: Vec<&Mutation> = batch.iter().map(|p| &p.mutation).collect();
        match self.commit(&mutations).await {
            Ok(results) => {
                for (pending, result) in batch.into_iter().zip(results) {
                    let _ = pending.tx.send(Ok(result));
                }
            }
            Err(err) => {
                warn!(error = %err, batch = batch.len(), "write pass failed");
                for pending in batch {
                    let _ = pending.tx.send(Err(err.clone()));
                }
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(batch = mutations.len()))]
    async fn commit(&self, mutations: &[&Mutation]) -> Result<Vec<MutationResult>, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            let cached = match self.cache_snapshot() {
                Some(c) => c,
                None => self.refresh().await?,
            };

            let now = self.options.clock.now_ms();
            let mut state = expire_heartbeats(cached.state, now, self.options.heartbeat_timeout_ms);
            let mut results = Vec::with_capacity(mutations.len());
            for mutation in mutations {
                let (next, result) = apply_mutation(state, mutation, now);
                state = next;
                results.push(result);
            }

            let data = state.to_bytes()?;
            match self
                .storage
                .write(&self.options.state_key, data, &cached.version)
                .await
            {
                Ok(version) => {
                    debug!(attempt, %version, jobs = state.jobs.len(), "batch committed");
                    *lock(&self.cache) = Some(Cached { state, version });
                    return Ok(results);
                }
                Err(e) if e.is_cas_conflict() => {
                    *lock(&self.cache) = None;
                    if attempt >= self.options.max_retries {
                        return Err(EngineError::ConflictRetriesExhausted {
                            attempts: attempt + 1,
                        });
                    }
                    attempt += 1;
                    let backoff = self.options.conflict_backoff * attempt;
                    debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "write conflicted, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn cache_snapshot(&self) -> Option<Cached> {
        lock(&self.cache).clone()
    }

    /// Re-read the document into the cache.
    async fn refresh(&self) -> Result<Cached, EngineError> {
        let Some(obj) = self.storage.read(&self.options.state_key).await? else {
            return Err(EngineError::StateMissing(self.options.state_key.clone()));
        };
        let cached = Cached {
            state: QueueState::from_slice(&obj.data)?,
            version: obj.version,
        };
        *lock(&self.cache) = Some(cached.clone());
        Ok(cached)
    }

    async fn ensure_state(&self) -> Result<(), EngineError> {
        let empty = QueueState::empty();
        match self
            .storage
            .create_if_not_exists(&self.options.state_key, empty.to_bytes()?)
            .await
        {
            Ok(version) => {
                debug!(%version, "created queue state");
                *lock(&self.cache) = Some(Cached {
                    state: empty,
                    version,
                });
                Ok(())
            }
            Err(e) if e.is_cas_conflict() => self.refresh().await.map(|_| ()),
            Err(e) => Err(e.into()),
        }
    }
}
