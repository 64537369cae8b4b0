use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::job::Job;

/// One label returned by the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DetectedLabel {
    #[garde(length(min = 1, max = 256))]
    pub name: String,

    #[garde(range(min = 0.0, max = 100.0))]
    pub confidence: f64,
}

impl DetectedLabel {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Why a classifier response cannot produce a result row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LabelError {
    #[error("classifier returned no labels")]
    Empty,

    #[error("classifier returned a malformed label: {0}")]
    Malformed(String),
}

impl LabelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabelError::Empty => ErrorKind::ClassificationEmpty,
            LabelError::Malformed(_) => ErrorKind::PermanentInput,
        }
    }
}

/// Pick the highest-confidence label. Ties keep the earlier label, which
/// preserves the service's own ordering.
///
/// Every label is validated first: a single malformed entry rejects the
/// whole response rather than silently skewing the pick.
pub fn top_label(labels: &[DetectedLabel]) -> Result<&DetectedLabel, LabelError> {
    for label in labels {
        // garde's range check lets NaN through
        if !label.confidence.is_finite() {
            return Err(LabelError::Malformed(format!(
                "{:?} has non-finite confidence",
                label.name
            )));
        }
        label
            .validate()
            .map_err(|report| LabelError::Malformed(report.to_string()))?;
    }

    labels
        .iter()
        .reduce(|best, next| {
            if next.confidence > best.confidence {
                next
            } else {
                best
            }
        })
        .ok_or(LabelError::Empty)
}

/// A row of the result table, keyed by `(bucket, object_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub bucket: String,
    pub object_key: String,
    pub label_name: String,
    pub confidence: f64,
    /// Job that wrote the row.
    pub idempotency_key: String,
    /// Upload time of the object version that was classified.
    pub source_event_time: DateTime<Utc>,
    pub written_at: DateTime<Utc>,
}

impl LabelResult {
    pub fn for_job(job: &Job, label: &DetectedLabel) -> Self {
        Self {
            bucket: job.bucket.clone(),
            object_key: job.object_key.clone(),
            label_name: label.name.clone(),
            confidence: label.confidence,
            idempotency_key: job.idempotency_key.clone(),
            source_event_time: job.event_time,
            written_at: Utc::now(),
        }
    }

    /// Conditional-put rule: may `self` replace `existing`?
    ///
    /// Same job overwrites itself on retry; otherwise only a strictly newer
    /// object version wins.
    pub fn supersedes(&self, existing: &LabelResult) -> bool {
        self.idempotency_key == existing.idempotency_key
            || existing.source_event_time < self.source_event_time
    }
}
