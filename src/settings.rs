use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::broker::BrokerOptions;
use crate::clock::SharedClock;
use crate::group_commit::EngineOptions;
use crate::job::{DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS};
use crate::keys::QUEUE_STATE_KEY;
use crate::storage::ThrottleOptions;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-minute and daily limits on storage calls. Absent or zero means unlimited.
    #[serde(default)]
    pub throttle: ThrottleOptions,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Address this broker advertises in the queue document, e.g. 127.0.0.1:8080
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default = "default_broker_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_broker_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            heartbeat_interval_ms: default_broker_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_broker_heartbeat_timeout_ms(),
        }
    }
}

fn default_broker_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_broker_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_broker_heartbeat_timeout_ms() -> i64 {
    DEFAULT_BROKER_HEARTBEAT_TIMEOUT_MS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_group_commit_interval_ms")]
    pub group_commit_interval_ms: u64,
    /// Job lease timeout.
    #[serde(default = "default_job_heartbeat_timeout_ms")]
    pub job_heartbeat_timeout_ms: i64,
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_commit_interval_ms: default_group_commit_interval_ms(),
            job_heartbeat_timeout_ms: default_job_heartbeat_timeout_ms(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_group_commit_interval_ms() -> u64 {
    50
}

fn default_job_heartbeat_timeout_ms() -> i64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}

fn default_conflict_backoff_ms() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,
    pub bucket: Option<String>,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
    /// S3 only.
    pub region: Option<String>,
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            bucket: None,
            prefix: None,
            region: None,
            state_key: default_state_key(),
        }
    }
}

fn default_state_key() -> String {
    QUEUE_STATE_KEY.to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    S3,
    Gcs,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn engine_options(&self, clock: SharedClock) -> EngineOptions {
        EngineOptions {
            state_key: self.storage.state_key.clone(),
            interval: Duration::from_millis(self.engine.group_commit_interval_ms),
            heartbeat_timeout_ms: self.engine.job_heartbeat_timeout_ms,
            conflict_backoff: Duration::from_millis(self.engine.conflict_backoff_ms),
            max_retries: self.engine.max_retries,
            clock,
        }
    }

    pub fn broker_options(&self, clock: SharedClock) -> BrokerOptions {
        BrokerOptions {
            address: self.broker.address.clone(),
            heartbeat_interval: Duration::from_millis(self.broker.heartbeat_interval_ms),
            heartbeat_timeout_ms: self.broker.heartbeat_timeout_ms,
            engine: self.engine_options(clock),
        }
    }
}
