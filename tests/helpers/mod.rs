//! Test helper utilities for E2E testing

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Response from POST /api/v1/jobs
#[derive(Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub idempotency_key: String,
    pub bucket: String,
    pub object_key: String,
    pub status: String,
    pub attempts: i32,
    pub duplicate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub idempotency_key: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LabelResult {
    pub bucket: String,
    pub object_key: String,
    pub label_name: String,
    pub confidence: f64,
    pub idempotency_key: String,
}

/// Response from GET /api/v1/jobs/{key}
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job: Job,
    pub result: Option<LabelResult>,
}

/// Submit an upload event directly
pub async fn submit_upload(
    client: &reqwest::Client,
    base_url: &str,
    bucket: &str,
    object_key: &str,
    version: Option<&str>,
) -> Result<JobHandle, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&serde_json::json!({
            "bucket": bucket,
            "object_key": object_key,
            "version": version,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<JobHandle>().await?)
}

/// Poll job status until DONE or FAILED (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    key: &str,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, key))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;

        match status_response.job.status.as_str() {
            "done" | "failed" => return Ok(status_response),
            "pending" | "running" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => {
                return Err(format!("Unknown job status: {}", other).into());
            }
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}

/// Wait for a worker to finish the job (with timeout)
pub async fn wait_for_job_completion(
    client: &reqwest::Client,
    base_url: &str,
    key: &str,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    poll_job_status(client, base_url, key, 120).await
}

/// Build a single-record object-created notification
pub fn created_notification(bucket: &str, object_key: &str, e_tag: &str) -> serde_json::Value {
    serde_json::json!({
        "Records": [{
            "eventTime": chrono::Utc::now().to_rfc3339(),
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": { "name": bucket },
                "object": {
                    "key": urlencoding::encode(object_key).replace("%20", "+"),
                    "eTag": e_tag,
                }
            }
        }]
    })
}
