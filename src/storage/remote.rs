//! Object-store adapters built on the `object_store` crate.
//!
//! S3 compares ETags (`If-Match` / `If-None-Match: *`); GCS compares object
//! generations (`ifGenerationMatch`, `0` for create). Both surface failed
//! preconditions as [`StorageError::CasConflict`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{
    Error as ObjectStoreError, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};
use tracing::{debug, instrument};

use super::{StorageBackend, StorageError, StorageVersion, StoredObject};
use crate::keys::prefixed_key;

/// Which piece of object metadata serves as the CAS token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionField {
    ETag,
    Generation,
}

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    field: VersionField,
    name: &'static str,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("field", &self.field)
            .finish()
    }
}

impl ObjectStoreBackend {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: Option<String>,
        field: VersionField,
        name: &'static str,
    ) -> Self {
        Self {
            store,
            prefix,
            field,
            name,
        }
    }

    /// S3 (or an S3-compatible store). Credentials and endpoint come from the
    /// usual `AWS_*` environment variables.
    pub fn s3(
        bucket: &str,
        region: Option<&str>,
        prefix: Option<String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_conditional_put(S3ConditionalPut::ETagMatch);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Misconfigured(format!("s3: {e}")))?;
        Ok(Self::new(Arc::new(store), prefix, VersionField::ETag, "s3"))
    }

    /// Google Cloud Storage. Credentials come from `GOOGLE_*` environment
    /// variables or application default credentials.
    pub fn gcs(bucket: &str, prefix: Option<String>) -> Result<Self, StorageError> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| StorageError::Misconfigured(format!("gcs: {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            prefix,
            VersionField::Generation,
            "gcs",
        ))
    }

    fn path(&self, key: &str) -> Path {
        Path::from(prefixed_key(self.prefix.as_deref(), key))
    }

    fn token(
        &self,
        operation: &'static str,
        e_tag: Option<String>,
        version: Option<String>,
    ) -> Result<StorageVersion, StorageError> {
        let token = match self.field {
            VersionField::ETag => e_tag,
            VersionField::Generation => version,
        };
        token.map(StorageVersion::new).ok_or_else(|| {
            StorageError::backend(self.name, operation, "store returned no version token")
        })
    }

    fn update_version(&self, expected: &StorageVersion) -> UpdateVersion {
        let token = Some(expected.as_str().to_string());
        match self.field {
            VersionField::ETag => UpdateVersion {
                e_tag: token,
                version: None,
            },
            VersionField::Generation => UpdateVersion {
                e_tag: None,
                version: token,
            },
        }
    }

    fn map_put_error(
        &self,
        key: &str,
        operation: &'static str,
        err: ObjectStoreError,
    ) -> StorageError {
        match err {
            ObjectStoreError::Precondition { .. }
            | ObjectStoreError::AlreadyExists { .. }
            | ObjectStoreError::NotFound { .. } => {
                debug!(backend = self.name, key, operation, error = %err, "precondition failed");
                StorageError::CasConflict(key.to_string())
            }
            other => StorageError::backend(self.name, operation, other),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    #[instrument(level = "debug", skip(self), fields(backend = self.name))]
    async fn read(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        let result = match self.store.get(&self.path(key)).await {
            Ok(result) => result,
            Err(ObjectStoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::backend(self.name, "read", e)),
        };
        let meta = result.meta.clone();
        let data = result
            .bytes()
            .await
            .map_err(|e| StorageError::backend(self.name, "read", e))?;
        let version = self.token("read", meta.e_tag, meta.version)?;
        Ok(Some(StoredObject { data, version }))
    }

    #[instrument(level = "debug", skip(self, data), fields(backend = self.name, len = data.len()))]
    async fn write(
        &self,
        key: &str,
        data: Bytes,
        expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError> {
        let opts = PutOptions::from(PutMode::Update(self.update_version(expected)));
        let put = self
            .store
            .put_opts(&self.path(key), PutPayload::from(data), opts)
            .await
            .map_err(|e| self.map_put_error(key, "write", e))?;
        self.token("write", put.e_tag, put.version)
    }

    #[instrument(level = "debug", skip(self, data), fields(backend = self.name, len = data.len()))]
    async fn create_if_not_exists(
        &self,
        key: &str,
        data: Bytes,
    ) -> Result<StorageVersion, StorageError> {
        let opts = PutOptions::from(PutMode::Create);
        let put = self
            .store
            .put_opts(&self.path(key), PutPayload::from(data), opts)
            .await
            .map_err(|e| self.map_put_error(key, "create", e))?;
        self.token("create", put.e_tag, put.version)
    }
}
