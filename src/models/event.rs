use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An object landed in a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UploadEvent {
    #[garde(length(min = 1, max = 255))]
    pub bucket: String,

    #[garde(length(min = 1, max = 1024))]
    pub object_key: String,

    #[garde(skip)]
    #[serde(default = "Utc::now")]
    pub event_time: DateTime<Utc>,

    /// Object version id or ETag, when the producer knows it.
    #[garde(skip)]
    #[serde(default)]
    pub version: Option<String>,
}

impl UploadEvent {
    pub fn new(bucket: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
            event_time: Utc::now(),
            version: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }
}

/// Derive the idempotency key for an upload.
///
/// Fields are length-prefixed before hashing so `("a/b", "c")` and
/// `("a", "b/c")` never collide. A missing version hashes differently from
/// an empty one.
pub fn idempotency_key(bucket: &str, object_key: &str, version: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for field in [bucket, object_key] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    match version {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update((v.len() as u64).to_be_bytes());
            hasher.update(v.as_bytes());
        }
        None => hasher.update([0u8]),
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Strip the quotes HTTP `ETag` headers carry so header and notification
/// values hash the same. Empty tags are dropped.
pub fn normalize_etag(tag: &str) -> Option<String> {
    let tag = tag.trim_matches('"');
    (!tag.is_empty()).then(|| tag.to_string())
}

/// S3-style bucket notification, as delivered by the storage service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3Notification {
    #[serde(default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    #[serde(default)]
    pub event_name: Option<String>,
    pub event_time: DateTime<Utc>,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default, rename = "eTag")]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("object key is not valid URL encoding: {0}")]
    KeyEncoding(String),
}

impl S3EventRecord {
    /// Only creations trigger labeling. Records without a name are treated
    /// as creations.
    pub fn is_object_created(&self) -> bool {
        self.event_name
            .as_deref()
            .map_or(true, |name| name.starts_with("ObjectCreated:"))
    }

    pub fn to_upload_event(&self) -> Result<UploadEvent, EventError> {
        // Notification keys are form-encoded: spaces arrive as '+'
        let raw = self.s3.object.key.replace('+', " ");
        let object_key = urlencoding::decode(&raw)
            .map_err(|e| EventError::KeyEncoding(e.to_string()))?
            .into_owned();

        let version = self
            .s3
            .object
            .version_id
            .clone()
            .filter(|v| !v.is_empty() && v != "null")
            .or_else(|| self.s3.object.e_tag.as_deref().and_then(normalize_etag));

        Ok(UploadEvent {
            bucket: self.s3.bucket.name.clone(),
            object_key,
            event_time: self.event_time,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"{
        "Records": [
            {
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "eventTime": "2024-05-01T12:00:00.000Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": {
                        "key": "trips/car+man%281%29.jpg",
                        "size": 1024,
                        "eTag": "d41d8cd98f00b204e9800998ecf8427e",
                        "versionId": "3HL4kqtJlcpXroDTDmJ"
                    }
                }
            },
            {
                "eventTime": "2024-05-01T12:01:00.000Z",
                "eventName": "ObjectRemoved:Delete",
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": { "key": "old.jpg" }
                }
            }
        ]
    }"#;

    #[test]
    fn parses_notification_records() {
        let notification: S3Notification = serde_json::from_str(NOTIFICATION).unwrap();
        assert_eq!(notification.records.len(), 2);

        let created = &notification.records[0];
        assert!(created.is_object_created());
        assert!(!notification.records[1].is_object_created());

        let event = created.to_upload_event().unwrap();
        assert_eq!(event.bucket, "photos");
        assert_eq!(event.object_key, "trips/car man(1).jpg");
        assert_eq!(event.version.as_deref(), Some("3HL4kqtJlcpXroDTDmJ"));
    }

    #[test]
    fn falls_back_to_etag_for_unversioned_buckets() {
        let json = r#"{
            "eventTime": "2024-05-01T12:00:00Z",
            "s3": {
                "bucket": { "name": "photos" },
                "object": { "key": "a.jpg", "versionId": "null", "eTag": "abc" }
            }
        }"#;
        let record: S3EventRecord = serde_json::from_str(json).unwrap();
        let event = record.to_upload_event().unwrap();
        assert_eq!(event.version.as_deref(), Some("abc"));
    }

    #[test]
    fn quoted_and_bare_etags_normalize_alike() {
        assert_eq!(normalize_etag("\"abc123\"").as_deref(), Some("abc123"));
        assert_eq!(normalize_etag("abc123").as_deref(), Some("abc123"));
        assert_eq!(normalize_etag("\"\""), None);
    }

    #[test]
    fn idempotency_key_is_stable_and_version_sensitive() {
        let a = idempotency_key("photos", "car_man.jpg", None);
        assert_eq!(a, idempotency_key("photos", "car_man.jpg", None));
        assert_eq!(a.len(), 64);

        assert_ne!(a, idempotency_key("photos", "car_man.jpg", Some("v2")));
        assert_ne!(a, idempotency_key("photos", "car_man.jpg", Some("")));
        assert_ne!(
            idempotency_key("a/b", "c", None),
            idempotency_key("a", "b/c", None)
        );
    }

    #[test]
    fn rejects_empty_bucket_or_key() {
        assert!(UploadEvent::new("", "car.jpg").validate().is_err());
        assert!(UploadEvent::new("photos", "").validate().is_err());
        assert!(UploadEvent::new("photos", "car.jpg").validate().is_ok());
    }
}
