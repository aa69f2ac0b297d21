//! Storage capability used by the engine and by election: read with version,
//! CAS write and CAS create against a single key.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::settings::{Backend, StorageConfig};

pub mod memory;
pub mod remote;
pub mod throttled;

pub use memory::{MemoryBackend, MemoryOptions};
pub use remote::{ObjectStoreBackend, VersionField};
pub use throttled::{ThrottleOptions, ThrottleStats, ThrottledBackend};

/// Closed set of failures at the storage boundary. Callers branch on
/// [`StorageError::CasConflict`] instead of inspecting messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("CAS conflict on {0}")]
    CasConflict(String),

    #[error("{backend} {operation} failed: {message}")]
    Backend {
        backend: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("storage misconfigured: {0}")]
    Misconfigured(String),
}

impl StorageError {
    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, StorageError::CasConflict(_))
    }

    pub fn backend(
        backend: &'static str,
        operation: &'static str,
        message: impl fmt::Display,
    ) -> Self {
        StorageError::Backend {
            backend,
            operation,
            message: message.to_string(),
        }
    }
}

/// The store's native revision marker. Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageVersion(String);

impl StorageVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub version: StorageVersion,
}

/// All three operations must be safe under concurrent callers in many
/// processes; the store is the serialization authority.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn read(&self, key: &str) -> Result<Option<StoredObject>, StorageError>;

    /// Replace `key` only if its current version is `expected`. A missing key
    /// is a conflict.
    async fn write(
        &self,
        key: &str,
        data: Bytes,
        expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError>;

    /// Create `key` only if it does not exist yet.
    async fn create_if_not_exists(
        &self,
        key: &str,
        data: Bytes,
    ) -> Result<StorageVersion, StorageError>;
}

pub type SharedStorage = Arc<dyn StorageBackend>;

/// Build the configured backend, wrapped in a [`ThrottledBackend`] when any
/// limit is set.
pub fn open_backend(
    cfg: &StorageConfig,
    throttle: ThrottleOptions,
) -> Result<SharedStorage, StorageError> {
    let inner: SharedStorage = match cfg.backend {
        Backend::Memory => Arc::new(MemoryBackend::new()),
        Backend::S3 => {
            let bucket = required(cfg.bucket.as_deref(), "s3 backend requires a bucket")?;
            Arc::new(ObjectStoreBackend::s3(
                bucket,
                cfg.region.as_deref(),
                cfg.prefix.clone(),
            )?)
        }
        Backend::Gcs => {
            let bucket = required(cfg.bucket.as_deref(), "gcs backend requires a bucket")?;
            Arc::new(ObjectStoreBackend::gcs(bucket, cfg.prefix.clone())?)
        }
    };

    if throttle.is_unlimited() {
        Ok(inner)
    } else {
        Ok(Arc::new(ThrottledBackend::new(inner, throttle)))
    }
}

fn required<'a>(value: Option<&'a str>, msg: &str) -> Result<&'a str, StorageError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(StorageError::Misconfigured(msg.to_string())),
    }
}
