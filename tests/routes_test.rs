//! HTTP contract of the dispatcher API, driven through the router over the
//! in-memory backends.
//!
//! Run with: cargo test --test routes_test

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;

use image_label_pipeline::app_state::AppState;
use image_label_pipeline::db::memory::{InMemoryJobStore, InMemoryResultTable};
use image_label_pipeline::db::store::{JobStore, ResultTable};
use image_label_pipeline::models::job::{JobMessage, JobStatus};
use image_label_pipeline::models::label::LabelResult;
use image_label_pipeline::routes;
use image_label_pipeline::services::dispatcher::DispatcherConfig;
use image_label_pipeline::services::queue::{Delivery, InMemoryJobQueue, JobQueue, QueueError};
use image_label_pipeline::services::retry::{Backoff, RetryPolicy};
use image_label_pipeline::services::storage::{ObjectStore, ObjectVersion, StorageError};

/// Object store answering every HEAD with the same version, or 404.
struct FixedObjects(Option<ObjectVersion>);

#[async_trait]
impl ObjectStore for FixedObjects {
    async fn head(&self, _bucket: &str, _key: &str) -> Result<Option<ObjectVersion>, StorageError> {
        Ok(self.0.clone())
    }
}

/// Queue that either refuses connections or never answers.
struct BrokenQueue {
    hang: bool,
}

impl BrokenQueue {
    async fn fail<T: Send>(&self) -> Result<T, QueueError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
    }
}

#[async_trait]
impl JobQueue for BrokenQueue {
    async fn enqueue(&self, _message: &JobMessage) -> Result<(), QueueError> {
        self.fail().await
    }

    async fn enqueue_delayed(&self, _message: &JobMessage, _delay: Duration) -> Result<(), QueueError> {
        self.fail().await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        self.fail().await
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        self.fail().await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.fail().await
    }

    async fn unacked(&self, _limit: usize) -> Result<Vec<Delivery>, QueueError> {
        self.fail().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.fail().await
    }
}

struct Harness {
    jobs: Arc<InMemoryJobStore>,
    results: Arc<InMemoryResultTable>,
    app: Router,
}

impl Harness {
    fn new(queue: Arc<dyn JobQueue>, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        let jobs = Arc::new(InMemoryJobStore::new());
        let results = Arc::new(InMemoryResultTable::new());
        let once = RetryPolicy::once(Duration::from_secs(1));
        let state = AppState::new(
            jobs.clone(),
            results.clone(),
            queue,
            objects,
            DispatcherConfig {
                store_retry: once,
                enqueue_retry: once,
                storage_retry: once,
            },
            RetryPolicy::new(2, Backoff::none(), Duration::from_millis(50)),
        );
        Self {
            jobs,
            results,
            app: routes::api_router(state),
        }
    }

    fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryJobQueue::new()), None)
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = assert_ok!(self.app.clone().oneshot(request).await);
        let status = response.status();
        let bytes = assert_ok!(axum::body::to_bytes(response.into_body(), usize::MAX).await);
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Submit `car_man.jpg` at version `v1` and return its key.
    async fn submit_car_man(&self) -> String {
        let (status, body) = self
            .send(Method::POST, "/api/v1/jobs", Some(car_man_upload()))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        body["idempotency_key"].as_str().unwrap().to_string()
    }
}

fn car_man_upload() -> Value {
    json!({ "bucket": "photos", "object_key": "car_man.jpg", "version": "v1" })
}

fn created_notification(object_key: &str) -> Value {
    json!({
        "Records": [
            {
                "eventTime": "2024-05-01T12:00:00Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": { "key": object_key, "eTag": "abc123" }
                }
            },
            {
                "eventTime": "2024-05-01T12:00:01Z",
                "eventName": "ObjectRemoved:Delete",
                "s3": {
                    "bucket": { "name": "photos" },
                    "object": { "key": "old.jpg" }
                }
            }
        ]
    })
}

#[tokio::test]
async fn test_new_upload_is_accepted_and_repeat_is_ok() {
    let harness = Harness::in_memory();

    let (status, first) = harness
        .send(Method::POST, "/api/v1/jobs", Some(car_man_upload()))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["duplicate"], false);
    assert_eq!(first["status"], "pending");

    let (status, second) = harness
        .send(Method::POST, "/api/v1/jobs", Some(car_man_upload()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["idempotency_key"], first["idempotency_key"]);
    assert_eq!(harness.jobs.len(), 1);
}

#[tokio::test]
async fn test_invalid_upload_is_unprocessable() {
    let harness = Harness::in_memory();

    let (status, body) = harness
        .send(
            Method::POST,
            "/api/v1/jobs",
            Some(json!({ "bucket": "", "object_key": "car_man.jpg" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "permanent_input");
    assert!(harness.jobs.is_empty());
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let objects: Arc<dyn ObjectStore> = Arc::new(FixedObjects(None));
    let harness = Harness::new(Arc::new(InMemoryJobQueue::new()), Some(objects));

    let (status, body) = harness
        .send(
            Method::POST,
            "/api/v1/jobs",
            Some(json!({ "bucket": "photos", "object_key": "gone.jpg" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "permanent_input");
    assert!(harness.jobs.is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_is_service_unavailable() {
    let harness = Harness::new(Arc::new(BrokenQueue { hang: false }), None);

    let (status, body) = harness
        .send(Method::POST, "/api/v1/jobs", Some(car_man_upload()))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "transient_infra");

    // The undispatched job is failed so a redelivery can resubmit it
    let job = harness.jobs.all().pop().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_notification_reports_each_record() {
    let harness = Harness::in_memory();

    let (status, body) = harness
        .send(Method::POST, "/api/v1/events", Some(created_notification("car+man.jpg")))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["outcome"], "submitted");
    assert_eq!(records[0]["job"]["object_key"], "car man.jpg");
    assert_eq!(records[1]["outcome"], "skipped");
    assert_eq!(records[1]["event_name"], "ObjectRemoved:Delete");
}

#[tokio::test]
async fn test_notification_with_transient_failure_asks_for_redelivery() {
    let harness = Harness::new(Arc::new(BrokenQueue { hang: false }), None);

    let (status, body) = harness
        .send(Method::POST, "/api/v1/events", Some(created_notification("car_man.jpg")))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body[0]["outcome"], "rejected");
    assert_eq!(body[0]["kind"], "transient_infra");
    assert_eq!(body[1]["outcome"], "skipped");
}

#[tokio::test]
async fn test_job_lookup_includes_result() {
    let harness = Harness::in_memory();
    let key = harness.submit_car_man().await;

    let (status, body) = harness
        .send(Method::GET, &format!("/api/v1/jobs/{key}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["status"], "pending");
    assert!(body["result"].is_null());

    let row = LabelResult {
        bucket: "photos".to_string(),
        object_key: "car_man.jpg".to_string(),
        label_name: "Car".to_string(),
        confidence: 98.2,
        idempotency_key: key.clone(),
        source_event_time: Utc::now(),
        written_at: Utc::now(),
    };
    assert_ok!(harness.results.put_conditional(&row).await);

    let (_, body) = harness
        .send(Method::GET, &format!("/api/v1/jobs/{key}"), None)
        .await;
    assert_eq!(body["result"]["label_name"], "Car");

    let (status, rows) = harness
        .send(
            Method::GET,
            "/api/v1/results?bucket=photos&object_key=car_man.jpg",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 1);

    let (_, rows) = harness
        .send(Method::GET, "/api/v1/results?bucket=other", None)
        .await;
    assert_eq!(rows, json!([]));

    let (status, _) = harness
        .send(Method::GET, "/api/v1/jobs/unknown", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_and_archive_conflict_in_wrong_state() {
    let harness = Harness::in_memory();
    let key = harness.submit_car_man().await;

    // PENDING cannot be archived
    let (status, body) = harness
        .send(Method::POST, &format!("/api/v1/jobs/{key}/archive"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["changed"], false);
    assert_eq!(body["status"], "pending");

    // DONE cannot be cancelled
    let owner = uuid::Uuid::new_v4();
    assert_ok!(harness.jobs.claim(&key, owner).await);
    assert!(assert_ok!(harness.jobs.complete(&key, owner).await));
    let (status, body) = harness
        .send(Method::POST, &format!("/api/v1/jobs/{key}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "done");

    let (status, body) = harness
        .send(Method::POST, &format!("/api/v1/jobs/{key}/archive"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);

    let (status, _) = harness
        .send(Method::POST, "/api/v1/jobs/unknown/cancel", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_pending_job_with_reason() {
    let harness = Harness::in_memory();
    let key = harness.submit_car_man().await;

    let (status, body) = harness
        .send(
            Method::POST,
            &format!("/api/v1/jobs/{key}/cancel?reason=wrong%20bucket"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");

    let job = assert_ok!(harness.jobs.get(&key).await).unwrap();
    assert_eq!(job.last_error.as_deref(), Some("wrong bucket"));
}

#[tokio::test]
async fn test_health_reports_backends() {
    let harness = Harness::in_memory();
    let (status, body) = harness.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");

    let harness = Harness::new(Arc::new(BrokenQueue { hang: false }), None);
    let (status, body) = harness.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["job_store"]["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "error");
}

#[tokio::test]
async fn test_health_answers_when_queue_hangs() {
    let harness = Harness::new(Arc::new(BrokenQueue { hang: true }), None);

    let start = Instant::now();
    let (status, body) = harness.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["queue"]["status"], "error");
    assert!(start.elapsed() < Duration::from_secs(5));
}
