use serde::Serialize;
use strum::{AsRefStr, Display};

/// Failure classes shared by the dispatcher and the worker.
///
/// Duplicate submissions are not represented here: the dispatcher absorbs
/// them and hands back the existing [`JobHandle`](crate::models::job::JobHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure, throttling or timeout. Retried with backoff.
    TransientInfra,
    /// Missing or invalid bucket/object, or a response that cannot be used.
    PermanentInput,
    /// The classifier answered with no labels.
    ClassificationEmpty,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientInfra)
    }
}
