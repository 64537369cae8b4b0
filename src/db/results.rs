use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::db::store::{PutOutcome, ResultTable, StoreError};
use crate::models::label::LabelResult;

const RESULT_COLUMNS: &str =
    "bucket, object_key, label_name, confidence, idempotency_key, source_event_time, written_at";

/// Result table backed by `image_labels`.
#[derive(Clone)]
pub struct PgResultTable {
    pool: PgPool,
}

impl PgResultTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn result_from_row(row: &PgRow) -> Result<LabelResult, StoreError> {
    Ok(LabelResult {
        bucket: row.try_get("bucket")?,
        object_key: row.try_get("object_key")?,
        label_name: row.try_get("label_name")?,
        confidence: row.try_get("confidence")?,
        idempotency_key: row.try_get("idempotency_key")?,
        source_event_time: row.try_get("source_event_time")?,
        written_at: row.try_get("written_at")?,
    })
}

#[async_trait]
impl ResultTable for PgResultTable {
    async fn put_conditional(&self, result: &LabelResult) -> Result<PutOutcome, StoreError> {
        // The WHERE clause mirrors LabelResult::supersedes
        let written = sqlx::query(&format!(
            r#"
            INSERT INTO image_labels
                (bucket, object_key, label_name, confidence, idempotency_key, source_event_time, written_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (bucket, object_key) DO UPDATE
            SET label_name = EXCLUDED.label_name,
                confidence = EXCLUDED.confidence,
                idempotency_key = EXCLUDED.idempotency_key,
                source_event_time = EXCLUDED.source_event_time,
                written_at = EXCLUDED.written_at
            WHERE image_labels.idempotency_key = EXCLUDED.idempotency_key
               OR image_labels.source_event_time < EXCLUDED.source_event_time
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(&result.bucket)
        .bind(&result.object_key)
        .bind(&result.label_name)
        .bind(result.confidence)
        .bind(&result.idempotency_key)
        .bind(result.source_event_time)
        .bind(result.written_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = written {
            return Ok(PutOutcome::Written(result_from_row(&row)?));
        }

        match self.get(&result.bucket, &result.object_key).await? {
            Some(current) => Ok(PutOutcome::Superseded { current }),
            None => Err(StoreError::Corrupt(format!(
                "conditional put on {}/{} rejected but no row exists",
                result.bucket, result.object_key
            ))),
        }
    }

    async fn get(&self, bucket: &str, object_key: &str) -> Result<Option<LabelResult>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM image_labels WHERE bucket = $1 AND object_key = $2"
        ))
        .bind(bucket)
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(result_from_row).transpose()
    }

    async fn delete(&self, bucket: &str, object_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM image_labels WHERE bucket = $1 AND object_key = $2")
            .bind(bucket)
            .bind(object_key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn scan(&self, bucket: Option<&str>, limit: i64) -> Result<Vec<LabelResult>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM image_labels
            WHERE $1::TEXT IS NULL OR bucket = $1
            ORDER BY bucket, object_key
            LIMIT $2
            "#
        ))
        .bind(bucket)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }
}
