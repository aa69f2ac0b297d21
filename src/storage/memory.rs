//! In-process backend for tests and local runs.
//!
//! Latency is applied before the CAS check so that concurrent callers holding
//! the same stale version overlap in flight and then race on the lock, the way
//! they would against a remote store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{StorageBackend, StorageError, StorageVersion, StoredObject};
use crate::helpers::lock;

#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Delay applied to every operation.
    pub latency: Duration,
    /// When set, every operation fails with this error after the delay.
    pub fail_with: Option<StorageError>,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    version: u64,
}

#[derive(Debug, Default)]
struct Objects {
    entries: HashMap<String, Entry>,
    last_version: u64,
}

impl Objects {
    fn bump(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<Objects>,
    options: Mutex<MemoryOptions>,
    reads: AtomicU64,
    writes: AtomicU64,
    creates: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            options: Mutex::new(options),
            ..Self::default()
        }
    }

    pub fn set_options(&self, options: MemoryOptions) {
        *lock(&self.options) = options;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.options).latency = latency;
    }

    pub fn set_fail_with(&self, err: Option<StorageError>) {
        lock(&self.options).fail_with = err;
    }

    /// Calls to `read`, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Calls to `write`, including conflicts.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Calls to `create_if_not_exists`, including conflicts.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Current contents of `key`, bypassing latency and fault injection.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).entries.get(key).map(|e| e.data.clone())
    }

    async fn before_op(&self) -> Result<(), StorageError> {
        let (latency, fail_with) = {
            let opts = lock(&self.options);
            (opts.latency, opts.fail_with.clone())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fail_with {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn parse_version(v: &StorageVersion) -> Option<u64> {
    v.as_str().parse().ok()
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.before_op().await?;
        let objects = lock(&self.objects);
        Ok(objects.entries.get(key).map(|e| StoredObject {
            data: e.data.clone(),
            version: StorageVersion::new(e.version.to_string()),
        }))
    }

    async fn write(
        &self,
        key: &str,
        data: Bytes,
        expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.before_op().await?;
        let mut objects = lock(&self.objects);
        let current = objects.entries.get(key).map(|e| e.version);
        if current.is_none() || current != parse_version(expected) {
            debug!(key, expected = %expected, ?current, "memory write version mismatch");
            return Err(StorageError::CasConflict(key.to_string()));
        }
        let version = objects.bump();
        objects.entries.insert(key.to_string(), Entry { data, version });
        Ok(StorageVersion::new(version.to_string()))
    }

    async fn create_if_not_exists(
        &self,
        key: &str,
        data: Bytes,
    ) -> Result<StorageVersion, StorageError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.before_op().await?;
        let mut objects = lock(&self.objects);
        if objects.entries.contains_key(key) {
            return Err(StorageError::CasConflict(key.to_string()));
        }
        let version = objects.bump();
        objects.entries.insert(key.to_string(), Entry { data, version });
        Ok(StorageVersion::new(version.to_string()))
    }
}
