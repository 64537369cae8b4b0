//! In-process implementations of the storage seams.
//!
//! Each call takes the mutex once and releases it before returning, so the
//! compare-and-set semantics match the SQL versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::store::{
    ClaimOutcome, InsertOutcome, JobStore, PutOutcome, ResultTable, StoreError,
};
use crate::models::job::{Job, JobStatus};
use crate::models::label::LabelResult;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Job> {
        lock(&self.jobs).values().cloned().collect()
    }

    /// Apply `update` if `guard` holds for the current row.
    fn transition<G, U>(&self, key: &str, guard: G, update: U) -> bool
    where
        G: FnOnce(&Job) -> bool,
        U: FnOnce(&mut Job),
    {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(key) {
            Some(job) if guard(job) => {
                update(job);
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_if_absent(&self, job: &Job) -> Result<InsertOutcome, StoreError> {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs.get(&job.idempotency_key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let mut created = job.clone();
        created.status = JobStatus::Pending;
        created.attempts = 0;
        created.owner = None;
        jobs.insert(created.idempotency_key.clone(), created.clone());
        Ok(InsertOutcome::Created(created))
    }

    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.jobs).get(key).cloned())
    }

    async fn resubmit(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(key) {
            Some(job) if job.status == JobStatus::Failed => {
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.owner = None;
                job.last_error = None;
                job.archived_at = None;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim(&self, key: &str, worker: Uuid) -> Result<ClaimOutcome, StoreError> {
        let mut jobs = lock(&self.jobs);
        Ok(match jobs.get_mut(key) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.owner = Some(worker);
                job.updated_at = Utc::now();
                ClaimOutcome::Claimed(job.clone())
            }
            Some(job) => ClaimOutcome::Conflict(job.status),
            None => ClaimOutcome::Missing,
        })
    }

    async fn release(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| job.is_owned_by(worker),
            |job| {
                job.status = JobStatus::Pending;
                job.owner = None;
                job.last_error = Some(error.to_string());
            },
        ))
    }

    async fn complete(&self, key: &str, worker: Uuid) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| job.is_owned_by(worker),
            |job| {
                job.status = JobStatus::Done;
                job.last_error = None;
            },
        ))
    }

    async fn fail(&self, key: &str, worker: Uuid, error: &str) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| job.is_owned_by(worker),
            |job| {
                job.status = JobStatus::Failed;
                job.last_error = Some(error.to_string());
            },
        ))
    }

    async fn fail_pending(&self, key: &str, error: &str) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| job.status == JobStatus::Pending,
            |job| {
                job.status = JobStatus::Failed;
                job.last_error = Some(error.to_string());
            },
        ))
    }

    async fn cancel(&self, key: &str, reason: &str) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| matches!(job.status, JobStatus::Pending | JobStatus::Running),
            |job| {
                job.status = JobStatus::Failed;
                job.last_error = Some(reason.to_string());
            },
        ))
    }

    async fn archive(&self, key: &str) -> Result<bool, StoreError> {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(key) {
            Some(job) if job.status.is_terminal() && job.archived_at.is_none() => {
                job.archived_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_pending(&self, key: &str, seen: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.transition(
            key,
            |job| job.status == JobStatus::Pending && job.updated_at == seen,
            |_| {},
        ))
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut stale: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|job| {
                job.status == status && job.updated_at < older_than && job.archived_at.is_none()
            })
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.updated_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryResultTable {
    rows: Mutex<BTreeMap<(String, String), LabelResult>>,
}

impl InMemoryResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultTable for InMemoryResultTable {
    async fn put_conditional(&self, result: &LabelResult) -> Result<PutOutcome, StoreError> {
        let mut rows = lock(&self.rows);
        let key = (result.bucket.clone(), result.object_key.clone());
        if let Some(current) = rows.get(&key) {
            if !result.supersedes(current) {
                return Ok(PutOutcome::Superseded {
                    current: current.clone(),
                });
            }
        }
        rows.insert(key, result.clone());
        Ok(PutOutcome::Written(result.clone()))
    }

    async fn get(&self, bucket: &str, object_key: &str) -> Result<Option<LabelResult>, StoreError> {
        Ok(lock(&self.rows)
            .get(&(bucket.to_string(), object_key.to_string()))
            .cloned())
    }

    async fn delete(&self, bucket: &str, object_key: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.rows)
            .remove(&(bucket.to_string(), object_key.to_string()))
            .is_some())
    }

    async fn scan(&self, bucket: Option<&str>, limit: i64) -> Result<Vec<LabelResult>, StoreError> {
        Ok(lock(&self.rows)
            .values()
            .filter(|row| bucket.map_or(true, |b| row.bucket == b))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
