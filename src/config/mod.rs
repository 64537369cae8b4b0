use std::time::Duration;

use serde::Deserialize;

use crate::services::dispatcher::DispatcherConfig;
use crate::services::reaper::ReaperConfig;
use crate::services::retry::{Backoff, RetryPolicy};
use crate::services::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Worker-only address for the `/metrics` scrape endpoint; disabled when unset
    #[serde(default)]
    pub worker_metrics_addr: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// DetectLabels-compatible recognition endpoint
    pub classifier_endpoint: String,

    /// Bearer token for the recognition endpoint
    #[serde(default)]
    pub classifier_api_token: Option<String>,

    #[serde(default = "default_classifier_timeout_secs")]
    pub classifier_timeout_secs: u64,

    #[serde(default = "default_classifier_max_labels")]
    pub classifier_max_labels: u32,

    #[serde(default = "default_classifier_min_confidence")]
    pub classifier_min_confidence: f64,

    /// S3-compatible endpoint; AWS regional endpoint when unset
    #[serde(default)]
    pub s3_endpoint: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// Object version lookups are enabled only when both keys are set
    #[serde(default)]
    pub s3_access_key: Option<String>,

    #[serde(default)]
    pub s3_secret_key: Option<String>,

    /// Claims per job before it is failed
    #[serde(default = "default_job_max_attempts")]
    pub job_max_attempts: i32,

    /// Attempts for a single store, queue or storage call
    #[serde(default = "default_call_max_attempts")]
    pub call_max_attempts: u32,

    /// Attempts for queue submission before the dispatcher gives up
    #[serde(default = "default_dispatch_max_attempts")]
    pub dispatch_max_attempts: u32,

    /// Attempts for one classifier call before the job is re-queued
    #[serde(default = "default_classifier_max_attempts")]
    pub classifier_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Fraction of each backoff delay randomized, 0.0 - 1.0
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Deadline for one store, queue or storage call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_requeue_base_delay_ms")]
    pub requeue_base_delay_ms: u64,

    #[serde(default = "default_requeue_max_delay_ms")]
    pub requeue_max_delay_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_running_lease_secs")]
    pub running_lease_secs: u64,

    #[serde(default = "default_pending_max_age_secs")]
    pub pending_max_age_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    30
}

fn default_classifier_max_labels() -> u32 {
    10
}

fn default_classifier_min_confidence() -> f64 {
    55.0
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_job_max_attempts() -> i32 {
    5
}

fn default_call_max_attempts() -> u32 {
    3
}

fn default_dispatch_max_attempts() -> u32 {
    5
}

fn default_classifier_max_attempts() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_requeue_base_delay_ms() -> u64 {
    5_000
}

fn default_requeue_max_delay_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_running_lease_secs() -> u64 {
    900
}

fn default_pending_max_age_secs() -> u64 {
    300
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            self.retry_jitter,
        )
    }

    /// Policy for job store, result table, queue and object store calls.
    pub fn call_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.call_max_attempts,
            self.backoff(),
            Duration::from_secs(self.call_timeout_secs),
        )
    }

    pub fn classifier_retry(&self) -> RetryPolicy {
        // The HTTP client enforces its own timeout; leave it room to fire first
        RetryPolicy::new(
            self.classifier_max_attempts,
            self.backoff(),
            Duration::from_secs(self.classifier_timeout_secs + 5),
        )
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }

    pub fn s3_credentials(&self) -> Option<(&str, &str)> {
        match (&self.s3_access_key, &self.s3_secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            store_retry: self.call_retry(),
            enqueue_retry: RetryPolicy::new(
                self.dispatch_max_attempts,
                self.backoff(),
                Duration::from_secs(self.call_timeout_secs),
            ),
            storage_retry: self.call_retry(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_attempts: self.job_max_attempts,
            store_retry: self.call_retry(),
            classifier_retry: self.classifier_retry(),
            queue_retry: self.call_retry(),
            requeue_backoff: Backoff::new(
                Duration::from_millis(self.requeue_base_delay_ms),
                Duration::from_millis(self.requeue_max_delay_ms),
                self.retry_jitter,
            ),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            running_lease: Duration::from_secs(self.running_lease_secs),
            pending_max_age: Duration::from_secs(self.pending_max_age_secs),
            batch_limit: 500,
            max_attempts: self.job_max_attempts,
            store_retry: self.call_retry(),
            queue_retry: self.call_retry(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}
