
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use osqueue::clock::ManualClock;
use osqueue::group_commit::{EngineError, EngineOptions, EnginePhase, GroupCommitEngine};
use osqueue::job::{DEFAULT_HEARTBEAT_TIMEOUT_MS, JobSpec, JobStatus, WorkerId};
use osqueue::keys::QUEUE_STATE_KEY;
use osqueue::state::{Mutation, MutationResult, QueueState, enqueue_jobs};
use osqueue::storage::{
    MemoryBackend, SharedStorage, StorageBackend, StorageError, StorageVersion, StoredObject,
};
use test_helpers::*;

fn worker(id: &str) -> WorkerId {
    WorkerId::new(id)
}

#[osqueue::test]
async fn enqueue_claim_complete_round_trip() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;
        assert_eq!(engine.phase(), EnginePhase::Running);

        let ids = engine.enqueue(vec![JobSpec::new("x")]).await.unwrap();
        assert_eq!(ids.len(), 1);
        let state = stored_state(backend.as_ref()).await;
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.jobs[0].status, JobStatus::Unclaimed);

        let claimed = engine.claim(worker("worker-1"), vec![]).await.unwrap().unwrap();
        assert_eq!(claimed.id, ids[0]);
        assert_eq!(claimed.payload, json!("x"));
        let state = stored_state(backend.as_ref()).await;
        assert!(state.jobs[0].is_held_by(&worker("worker-1")));
        assert_eq!(state.jobs[0].attempts, 1);

        engine.complete(ids[0].clone(), worker("worker-1")).await.unwrap();
        let state = stored_state(backend.as_ref()).await;
        assert!(state.jobs.is_empty());
        assert_eq!(state.completed_total, 1);

        assert_eq!(engine.cached_state().unwrap(), state);
        engine.stop();
    })
}

#[osqueue::test]
async fn concurrent_submissions_share_one_write() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;
        assert_eq!(backend.writes(), 0);

        let a = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(1)] });
        let b = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(2)] });
        let c = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(3)] });
        let (a, b, c) = tokio::join!(a, b, c);

        let ids: Vec<_> = [a, b, c]
            .into_iter()
            .flat_map(|r| r.unwrap().into_enqueued().unwrap())
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(backend.writes(), 1);

        let state = stored_state(backend.as_ref()).await;
        let stored: Vec<_> = state.jobs.iter().map(|j| j.id.clone()).collect();
        assert_eq!(stored, ids);
        engine.stop();
    })
}

#[osqueue::test]
async fn mutations_in_a_batch_see_earlier_ones() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;

        let enqueue = engine.submit(Mutation::Enqueue {
            jobs: vec![JobSpec::new("first")],
        });
        let claim = engine.submit(Mutation::Claim {
            worker_id: worker("w1"),
            job_types: vec![],
        });
        let empty_claim = engine.submit(Mutation::Claim {
            worker_id: worker("w2"),
            job_types: vec![],
        });
        let (enqueue, claim, empty_claim) = tokio::join!(enqueue, claim, empty_claim);

        let ids = enqueue.unwrap().into_enqueued().unwrap();
        assert_eq!(claim.unwrap().into_claimed().unwrap().id, ids[0]);
        assert_eq!(empty_claim.unwrap(), MutationResult::Claimed(None));
        assert_eq!(backend.writes(), 1);
        engine.stop();
    })
}

#[osqueue::test]
async fn recovers_from_a_foreign_write() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;

        // Someone else updates the document behind the engine's back.
        let current = backend.read(QUEUE_STATE_KEY).await.unwrap().unwrap();
        let (foreign, foreign_ids) = enqueue_jobs(
            QueueState::from_slice(&current.data).unwrap(),
            vec![JobSpec::new("foreign")],
            T0,
        );
        backend
            .write(QUEUE_STATE_KEY, foreign.to_bytes().unwrap(), &current.version)
            .await
            .unwrap();
        let writes_before = backend.writes();

        let ids = engine.enqueue(vec![JobSpec::new("ours")]).await.unwrap();

        // One conflicting write, one successful replay.
        assert_eq!(backend.writes() - writes_before, 2);
        let state = stored_state(backend.as_ref()).await;
        let stored: Vec<_> = state.jobs.iter().map(|j| j.id.clone()).collect();
        assert_eq!(stored, vec![foreign_ids[0].clone(), ids[0].clone()]);
        engine.stop();
    })
}

/// Delegates to memory but fails every versioned write with a conflict.
struct AlwaysConflicts {
    inner: MemoryBackend,
    writes: AtomicU64,
}

#[async_trait]
impl StorageBackend for AlwaysConflicts {
    async fn read(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &str,
        _data: Bytes,
        _expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::CasConflict(key.to_string()))
    }

    async fn create_if_not_exists(
        &self,
        key: &str,
        data: Bytes,
    ) -> Result<StorageVersion, StorageError> {
        self.inner.create_if_not_exists(key, data).await
    }
}

#[osqueue::test]
async fn exhausted_conflict_retries_fail_the_whole_batch() {
    with_timeout!(5_000, {
        let backend = Arc::new(AlwaysConflicts {
            inner: MemoryBackend::new(),
            writes: AtomicU64::new(0),
        });
        let engine = GroupCommitEngine::new(
            Arc::clone(&backend) as SharedStorage,
            EngineOptions {
                max_retries: 2,
                ..fast_options(ManualClock::new(T0))
            },
        );
        engine.start().await.unwrap();

        let a = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(1)] });
        let b = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(2)] });
        let (a, b) = tokio::join!(a, b);

        let expected = EngineError::ConflictRetriesExhausted { attempts: 3 };
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 3);
        assert!(engine.cached_state().is_none());
        engine.stop();
    })
}

#[osqueue::test(start_paused = true)]
async fn conflict_backoff_grows_linearly_per_attempt() {
    let backend = Arc::new(AlwaysConflicts {
        inner: MemoryBackend::new(),
        writes: AtomicU64::new(0),
    });
    let engine = GroupCommitEngine::new(
        Arc::clone(&backend) as SharedStorage,
        EngineOptions {
            conflict_backoff: Duration::from_millis(100),
            max_retries: 3,
            ..fast_options(ManualClock::new(T0))
        },
    );
    engine.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(1)] }),
    )
    .await
    .expect("batch settles")
    .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err, EngineError::ConflictRetriesExhausted { attempts: 4 });
    assert_eq!(backend.writes.load(Ordering::SeqCst), 4);
    // 100 + 200 + 300 ms of backoff between the four writes.
    assert!(elapsed >= Duration::from_millis(600), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "gave up after {elapsed:?}");
    engine.stop();
}

#[osqueue::test]
async fn backend_failure_rejects_batch_without_retry() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;
        let boom = StorageError::backend("memory", "write", "disk on fire");
        backend.set_fail_with(Some(boom.clone()));

        let err = engine.enqueue(vec![JobSpec::new(1)]).await.unwrap_err();
        assert_eq!(err, EngineError::Storage(boom));
        assert_eq!(backend.writes(), 1);

        // The engine keeps running once the store recovers.
        backend.set_fail_with(None);
        engine.enqueue(vec![JobSpec::new(2)]).await.unwrap();
        assert_eq!(stored_state(backend.as_ref()).await.jobs.len(), 1);
        engine.stop();
    })
}

#[osqueue::test(start_paused = true)]
async fn stop_rejects_buffered_but_not_in_flight_mutations() {
    let backend = memory();
    let (engine, _clock) = started_engine(&backend).await;
    backend.set_latency(Duration::from_millis(200));

    let in_flight = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(1)] });
    // Let the loop drain it and block on the slow write.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let buffered = engine.submit(Mutation::Enqueue { jobs: vec![JobSpec::new(2)] });

    engine.stop();
    assert_eq!(engine.phase(), EnginePhase::Stopped);
    assert_eq!(buffered.await.unwrap_err(), EngineError::Stopped);
    assert_eq!(in_flight.await.unwrap().into_enqueued().unwrap().len(), 1);

    let state = stored_state(backend.as_ref()).await;
    assert_eq!(state.jobs.len(), 1);
}

#[osqueue::test]
async fn submit_to_stopped_engine_is_rejected() {
    let backend = memory();
    let engine = GroupCommitEngine::new(shared(&backend), fast_options(ManualClock::new(T0)));
    assert_eq!(engine.phase(), EnginePhase::Stopped);
    let err = engine.enqueue(vec![JobSpec::new(1)]).await.unwrap_err();
    assert_eq!(err, EngineError::Stopped);
    assert_eq!(backend.creates() + backend.writes(), 0);
}

#[osqueue::test]
async fn start_adopts_an_existing_document() {
    with_timeout!(5_000, {
        let backend = memory();
        let (existing, ids) = enqueue_jobs(QueueState::empty(), vec![JobSpec::new("old")], T0);
        backend
            .create_if_not_exists(QUEUE_STATE_KEY, existing.to_bytes().unwrap())
            .await
            .unwrap();

        let (engine, _clock) = started_engine(&backend).await;
        assert_eq!(engine.cached_state().unwrap(), existing);
        assert_eq!(engine.stats().unwrap().unclaimed, 1);

        let claimed = engine.claim(worker("w1"), vec![]).await.unwrap().unwrap();
        assert_eq!(claimed.id, ids[0]);
        engine.stop();
    })
}

/// Claims the key exists but never returns it.
struct Vanishing;

#[async_trait]
impl StorageBackend for Vanishing {
    async fn read(&self, _key: &str) -> Result<Option<StoredObject>, StorageError> {
        Ok(None)
    }

    async fn write(
        &self,
        key: &str,
        _data: Bytes,
        _expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError> {
        Err(StorageError::CasConflict(key.to_string()))
    }

    async fn create_if_not_exists(
        &self,
        key: &str,
        _data: Bytes,
    ) -> Result<StorageVersion, StorageError> {
        Err(StorageError::CasConflict(key.to_string()))
    }
}

#[osqueue::test]
async fn start_fails_when_state_cannot_be_read() {
    let engine = GroupCommitEngine::new(Arc::new(Vanishing), EngineOptions::default());
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::StateMissing(_)), "{err}");
    assert_eq!(engine.phase(), EnginePhase::Stopped);
}

#[osqueue::test]
async fn write_pass_expires_stale_leases() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, clock) = started_engine(&backend).await;

        let ids = engine.enqueue(vec![JobSpec::new("slow")]).await.unwrap();
        engine.claim(worker("w1"), vec![]).await.unwrap().unwrap();

        // The holder goes silent past the lease timeout; any pass reclaims it.
        clock.advance(DEFAULT_HEARTBEAT_TIMEOUT_MS + 1);
        engine.heartbeat(ids[0].clone(), worker("w1")).await.unwrap();

        let state = stored_state(backend.as_ref()).await;
        let job = state.job(&ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Unclaimed);
        assert_eq!(job.attempts, 1);

        // A different worker can now take it.
        let claimed = engine.claim(worker("w2"), vec![]).await.unwrap().unwrap();
        assert_eq!(claimed.id, ids[0]);
        engine.stop();
    })
}

#[osqueue::test]
async fn heartbeat_keeps_lease_alive() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, clock) = started_engine(&backend).await;

        let ids = engine.enqueue(vec![JobSpec::new("long")]).await.unwrap();
        engine.claim(worker("w1"), vec![]).await.unwrap().unwrap();

        for _ in 0..3 {
            clock.advance(DEFAULT_HEARTBEAT_TIMEOUT_MS - 1);
            engine.heartbeat(ids[0].clone(), worker("w1")).await.unwrap();
        }
        let state = engine.cached_state().unwrap();
        assert!(state.job(&ids[0]).unwrap().is_held_by(&worker("w1")));
        engine.stop();
    })
}

#[osqueue::test]
async fn engine_can_restart_after_stop() {
    with_timeout!(5_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;
        engine.enqueue(vec![JobSpec::new(1)]).await.unwrap();
        engine.stop();
        assert_eq!(
            engine.enqueue(vec![JobSpec::new(2)]).await.unwrap_err(),
            EngineError::Stopped
        );

        engine.start().await.unwrap();
        engine.enqueue(vec![JobSpec::new(3)]).await.unwrap();
        assert_eq!(stored_state(backend.as_ref()).await.jobs.len(), 2);
        engine.stop();
    })
}

#[osqueue::test]
async fn independent_engines_do_not_share_caches() {
    with_timeout!(5_000, {
        let a_backend = memory();
        let b_backend = memory();
        let (a, _) = started_engine(&a_backend).await;
        let (b, _) = started_engine(&b_backend).await;

        a.enqueue(vec![JobSpec::new("a")]).await.unwrap();
        assert_eq!(a.cached_state().unwrap().jobs.len(), 1);
        assert!(b.cached_state().unwrap().jobs.is_empty());
        a.stop();
        b.stop();
    })
}

#[osqueue::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_workers_each_job_exactly_once() {
    with_timeout!(10_000, {
        let backend = memory();
        let (engine, _clock) = started_engine(&backend).await;
        let specs = (0..20).map(|i| JobSpec::new(json!({ "n": i }))).collect();
        let mut expected = engine.enqueue(specs).await.unwrap();

        let mut workers = Vec::new();
        for w in 0..4 {
            let engine = Arc::clone(&engine);
            workers.push(tokio::spawn(async move {
                let me = worker(&format!("w{w}"));
                let mut done = Vec::new();
                while let Some(job) = engine.claim(me.clone(), vec![]).await.unwrap() {
                    engine.complete(job.id.clone(), me.clone()).await.unwrap();
                    done.push(job.id);
                }
                done
            }));
        }

        let mut seen = Vec::new();
        for handle in workers {
            seen.extend(handle.await.unwrap());
        }
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);

        let state = stored_state(backend.as_ref()).await;
        assert!(state.jobs.is_empty());
        assert_eq!(state.completed_total, 20);
        engine.stop();
    })
}
