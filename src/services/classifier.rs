use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::label::DetectedLabel;
use crate::services::retry::Retryable;

/// External image-recognition service.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Labels for the object, in the order the service returned them.
    /// An empty vector is a valid answer.
    async fn detect_labels(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<Vec<DetectedLabel>, ClassifierError>;
}

/// HTTP client for a DetectLabels-compatible recognition endpoint.
pub struct HttpClassifier {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
    max_labels: u32,
    min_confidence: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DetectLabelsRequest<'a> {
    image: ImageRef<'a>,
    max_labels: u32,
    min_confidence: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ImageRef<'a> {
    s3_object: S3ObjectRef<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct S3ObjectRef<'a> {
    bucket: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DetectLabelsResponse {
    labels: Option<Vec<WireLabel>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireLabel {
    name: String,
    confidence: f64,
}

impl HttpClassifier {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
        max_labels: u32,
        min_confidence: f64,
    ) -> Result<Self, ClassifierError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(ClassifierError::Http)?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_token,
            max_labels,
            min_confidence,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[tracing::instrument(skip(self))]
    async fn detect_labels(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<Vec<DetectedLabel>, ClassifierError> {
        let body = DetectLabelsRequest {
            image: ImageRef {
                s3_object: S3ObjectRef {
                    bucket,
                    name: object_key,
                },
            },
            max_labels: self.max_labels,
            min_confidence: self.min_confidence,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(ClassifierError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::from_status(status, body));
        }

        let text = response.text().await.map_err(ClassifierError::Http)?;
        let parsed: DetectLabelsResponse = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        Ok(parsed
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| DetectedLabel::new(label.name, label.confidence))
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Classifier throttled the request (status {status})")]
    Throttled { status: u16 },

    #[error("Classifier unavailable (status {status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Classifier rejected the request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Classifier response could not be decoded: {0}")]
    Malformed(String),

    #[error("Classifier call timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifierError {
    fn from_status(status: StatusCode, body: String) -> Self {
        let code = status.as_u16();
        if status == StatusCode::TOO_MANY_REQUESTS {
            ClassifierError::Throttled { status: code }
        } else if status.is_server_error() {
            ClassifierError::Unavailable { status: code, body }
        } else {
            ClassifierError::Rejected { status: code, body }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassifierError::Http(e) if e.is_decode() => ErrorKind::PermanentInput,
            ClassifierError::Http(_)
            | ClassifierError::Throttled { .. }
            | ClassifierError::Unavailable { .. }
            | ClassifierError::Timeout(_) => ErrorKind::TransientInfra,
            ClassifierError::Rejected { .. } | ClassifierError::Malformed(_) => {
                ErrorKind::PermanentInput
            }
        }
    }
}

impl Retryable for ClassifierError {
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    fn timed_out(after: Duration) -> Self {
        ClassifierError::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_transient_and_permanent() {
        let throttled = ClassifierError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        assert_eq!(throttled.kind(), ErrorKind::TransientInfra);

        let unavailable =
            ClassifierError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new());
        assert_eq!(unavailable.kind(), ErrorKind::TransientInfra);

        let missing = ClassifierError::from_status(StatusCode::NOT_FOUND, "no such key".into());
        assert_eq!(missing.kind(), ErrorKind::PermanentInput);
        assert!(!missing.is_retryable());
    }

    #[test]
    fn request_uses_detect_labels_shape() {
        let body = DetectLabelsRequest {
            image: ImageRef {
                s3_object: S3ObjectRef {
                    bucket: "photos",
                    name: "car_man.jpg",
                },
            },
            max_labels: 10,
            min_confidence: 55.0,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Image"]["S3Object"]["Bucket"], "photos");
        assert_eq!(json["Image"]["S3Object"]["Name"], "car_man.jpg");
        assert_eq!(json["MaxLabels"], 10);
    }

    #[test]
    fn response_without_labels_is_empty_not_malformed() {
        let parsed: DetectLabelsResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.labels.is_none());

        let parsed: DetectLabelsResponse =
            serde_json::from_str(r#"{"Labels":[{"Name":"Car","Confidence":98.2,"Parents":[]}]}"#)
                .unwrap();
        let labels = parsed.labels.unwrap();
        assert_eq!(labels[0].name, "Car");
        assert_eq!(labels[0].confidence, 98.2);
    }
}
