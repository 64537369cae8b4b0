use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use crate::models::event::normalize_etag;
use crate::services::retry::Retryable;

/// Version identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub version_id: Option<String>,
    pub e_tag: Option<String>,
}

impl ObjectVersion {
    /// The most specific identifier available: version id, then the ETag
    /// without its header quotes.
    pub fn identity(&self) -> Option<String> {
        self.version_id
            .clone()
            .filter(|v| !v.is_empty() && v != "null")
            .or_else(|| self.e_tag.as_deref().and_then(normalize_etag))
    }
}

/// Read-only view of the object store, used to resolve object versions
/// when an upload event does not carry one.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the object does not exist.
    async fn head(&self, bucket: &str, object_key: &str) -> Result<Option<ObjectVersion>, StorageError>;
}

/// S3-compatible object store client.
pub struct S3ObjectStore {
    region: Region,
    credentials: Credentials,
}

impl S3ObjectStore {
    pub fn new(
        endpoint: Option<&str>,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let endpoint = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        let region = Region::Custom {
            region: region.to_string(),
            endpoint,
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head(&self, bucket: &str, object_key: &str) -> Result<Option<ObjectVersion>, StorageError> {
        let bucket = self.bucket(bucket)?;
        match bucket.head_object(object_key).await {
            Ok((_, 404)) => Ok(None),
            Ok((head, code)) if (200..300).contains(&code) => Ok(Some(ObjectVersion {
                version_id: head.version_id,
                e_tag: head.e_tag,
            })),
            Ok((_, code)) => Err(StorageError::Status(code)),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(StorageError::S3(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("S3 returned status {0}")]
    Status(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        let retryable_status = |code: u16| code == 429 || code >= 500;
        match self {
            StorageError::S3(S3Error::HttpFailWithBody(code, _)) => retryable_status(*code),
            StorageError::S3(_) => true,
            StorageError::Status(code) => retryable_status(*code),
            StorageError::Config(_) => false,
            StorageError::Timeout(_) => true,
        }
    }

    fn timed_out(after: Duration) -> Self {
        StorageError::Timeout(after)
    }
}
