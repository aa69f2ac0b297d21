//! A job queue whose only durable state is one JSON document in an object
//! store, coordinated entirely through conditional writes.

pub mod broker;
pub mod clock;
pub mod election;
pub mod group_commit;
pub mod job;
pub mod keys;
pub mod settings;
pub mod state;
pub mod storage;
pub mod trace;

mod helpers;

pub use osqueue_macros::test;

pub use broker::{Broker, BrokerError, BrokerOptions};
pub use election::{BrokerElection, ElectionError, ElectionOptions, ElectionResult};
pub use group_commit::{EngineError, EngineOptions, EnginePhase, GroupCommitEngine, MutationHandle};
pub use job::{ClaimedJob, Job, JobId, JobSpec, JobStatus, WorkerId};
pub use state::{Mutation, MutationResult, QueueState, QueueStats};
pub use storage::{StorageBackend, StorageError, StorageVersion, StoredObject};
