//! Broker runtime: win the election, drive the group commit engine, and keep
//! the leadership heartbeat going until stopped or superseded.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::election::{BrokerElection, ElectionError, ElectionOptions, ElectionResult};
use crate::group_commit::{EngineError, EngineOptions, GroupCommitEngine};
use crate::job::DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS;
use crate::storage::SharedStorage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("another broker is active: {leader}")]
    LeadershipDenied { leader: String },

    #[error("lost an election race, retry later")]
    ElectionConflict,

    #[error("election failed: {0}")]
    Election(#[from] ElectionError),

    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Clone)]
pub struct BrokerOptions {
    pub address: String,
    pub heartbeat_interval: Duration,
    /// Staleness threshold for the leader heartbeat.
    pub heartbeat_timeout_ms: i64,
    /// The engine's state key and clock are shared with the election.
    pub engine: EngineOptions,
}

impl BrokerOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            heartbeat_interval: Duration::from_millis(3_000),
            heartbeat_timeout_ms: DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS,
            engine: EngineOptions::default(),
        }
    }
}

pub struct Broker {
    engine: Arc<GroupCommitEngine>,
    election: BrokerElection,
    options: BrokerOptions,
    leader: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl Broker {
    /// Elect, start the engine, record the first heartbeat and spawn the
    /// heartbeat loop. Fails without touching the engine if another broker
    /// is live or the election race was lost.
    pub async fn start(
        storage: SharedStorage,
        options: BrokerOptions,
    ) -> Result<Arc<Self>, BrokerError> {
        let election = BrokerElection::new(
            Arc::clone(&storage),
            ElectionOptions {
                address: options.address.clone(),
                state_key: options.engine.state_key.clone(),
                heartbeat_timeout_ms: options.heartbeat_timeout_ms,
            },
        );

        let now = options.engine.clock.now_ms();
        match election.try_elect(now).await? {
            ElectionResult::Elected | ElectionResult::AlreadyLeader => {}
            ElectionResult::OtherLeader { leader } => {
                return Err(BrokerError::LeadershipDenied { leader });
            }
            ElectionResult::Conflict => return Err(BrokerError::ElectionConflict),
        }

        let engine = GroupCommitEngine::new(storage, options.engine.clone());
        engine.start().await?;
        if let Err(e) = engine.register_broker(&options.address, now).await {
            engine.stop();
            return Err(e.into());
        }

        let (stopped, _) = watch::channel(false);
        let broker = Arc::new(Self {
            engine,
            election,
            options,
            leader: AtomicBool::new(true),
            stopped,
        });
        info!(address = %broker.options.address, "broker elected and running");

        tokio::spawn(heartbeat_loop(
            Arc::downgrade(&broker),
            broker.options.heartbeat_interval,
            broker.stopped.subscribe(),
        ));
        Ok(broker)
    }

    pub fn engine(&self) -> &Arc<GroupCommitEngine> {
        &self.engine
    }

    pub fn address(&self) -> &str {
        &self.options.address
    }

    /// False once the broker has been stopped or has seen another leader.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.leader.store(false, Ordering::SeqCst);
        self.engine.stop();
        self.stopped.send_replace(true);
    }

    /// Resolves once the broker stops, whether via [`Broker::stop`] or
    /// self-demotion.
    pub async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// One heartbeat: confirm the document still names us, then refresh our
    /// liveness. Returns whether we are still leader.
    ///
    /// The refresh only applies while the committed document names this
    /// broker, so a conflicting write replayed over a challenger's takeover
    /// leaves the challenger in place and reports false.
    pub async fn heartbeat(&self) -> Result<bool, BrokerError> {
        if !self.election.check_leadership().await? {
            return Ok(false);
        }
        let now = self.options.engine.clock.now_ms();
        Ok(self.engine.renew_broker(&self.options.address, now).await?)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs until the broker stops, demotes itself or is dropped.
async fn heartbeat_loop(
    broker: Weak<Broker>,
    period: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped.changed() => break,
        }
        let Some(broker) = broker.upgrade() else {
            break;
        };
        if !broker.is_leader() {
            break;
        }
        match broker.heartbeat().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    address = %broker.options.address,
                    "superseded by another broker, demoting"
                );
                broker.stop();
                break;
            }
            // The next tick retries.
            Err(e) => warn!(error = %e, "broker heartbeat failed"),
        }
    }
}
