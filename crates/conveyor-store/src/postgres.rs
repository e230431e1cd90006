//! Relational state store: one row per job, status as a constrained TEXT
//! domain, payload/result as JSONB. Claims are conditional UPDATEs so
//! concurrent workers race safely on the WHERE guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use conveyor_core::{
    JobFilter, JobId, JobRecord, JobStatus, NewJob, QueueError, StateStore,
};

const COLUMNS: &str = "id, queue, job_type, status, payload, attempts, max_attempts, \
     available_at, started_at, completed_at, locked_by, locked_at, \
     error_message, error_trace, progress, progress_message, result, \
     request_id, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> QueueError {
    QueueError::Database(e.to_string())
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<JobRecord, QueueError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;

    Ok(JobRecord {
        id: row.try_get::<i64, _>("id").map_err(db_err)?,
        queue: row.try_get::<String, _>("queue").map_err(db_err)?,
        job_type: row.try_get::<String, _>("job_type").map_err(db_err)?,
        status: JobStatus::parse(&status_str)?,
        payload: row.try_get::<Value, _>("payload").map_err(db_err)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(db_err)?,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)?,
        available_at: row
            .try_get::<Option<DateTime<Utc>>, _>("available_at")
            .map_err(db_err)?,
        started_at: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .map_err(db_err)?,
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .map_err(db_err)?,
        locked_by: row
            .try_get::<Option<String>, _>("locked_by")
            .map_err(db_err)?,
        locked_at: row
            .try_get::<Option<DateTime<Utc>>, _>("locked_at")
            .map_err(db_err)?,
        error_message: row
            .try_get::<Option<String>, _>("error_message")
            .map_err(db_err)?,
        error_trace: row
            .try_get::<Option<String>, _>("error_trace")
            .map_err(db_err)?,
        progress: row.try_get::<Option<i32>, _>("progress").map_err(db_err)?,
        progress_message: row
            .try_get::<Option<String>, _>("progress_message")
            .map_err(db_err)?,
        result: row.try_get::<Option<Value>, _>("result").map_err(db_err)?,
        request_id: row
            .try_get::<Option<String>, _>("request_id")
            .map_err(db_err)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(db_err)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId, QueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (queue, job_type, payload, max_attempts, request_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(job.queue)
        .bind(job.job_type)
        .bind(job.payload)
        .bind(job.max_attempts)
        .bind(job.request_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get("id").map_err(db_err)
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_active_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<JobRecord>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE request_id = $1 AND status IN ('pending', 'running') \
             LIMIT 1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn next_pending_job_id(&self, queue: &str) -> Result<Option<JobId>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE queue = $1
              AND status = 'pending'
              AND (available_at IS NULL OR available_at <= now())
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| r.try_get("id").map_err(db_err)).transpose()
    }

    async fn claim_job(&self, id: JobId, worker_id: &str) -> Result<bool, QueueError> {
        // The WHERE guard makes concurrent claims race on rows_affected:
        // exactly one UPDATE matches the pending row.
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                locked_at = now(),
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $1
              AND status = 'pending'
              AND (available_at IS NULL OR available_at <= now())
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: Option<Value>,
    ) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                completed_at = now(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn mark_failed(
        &self,
        id: JobId,
        error_message: &str,
        error_trace: Option<&str>,
    ) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempts = LEAST(attempts + 1, max_attempts),
                error_message = $2,
                error_trace = $3,
                completed_at = now(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(error_trace)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn update_progress(
        &self,
        id: JobId,
        progress: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = COALESCE($2, progress),
                progress_message = COALESCE($3, progress_message),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        delay_seconds: u64,
        error_message: Option<&str>,
    ) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = $2,
                available_at = now() + ($3::bigint * interval '1 second'),
                locked_by = NULL,
                locked_at = NULL,
                error_message = COALESCE($4, error_message),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(delay_seconds as i64)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn recover_stale_jobs(&self, ttl_seconds: u64) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                available_at = NULL,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE status = 'running'
              AND locked_at < now() - ($1::bigint * interval '1 second')
            "#,
        )
        .bind(ttl_seconds as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected)
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM jobs WHERE 1=1"));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(queue) = &filter.queue {
            qb.push(" AND queue = ").push_bind(queue.clone());
        }
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(filter.limit.clamp(1, 500))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn count(
        &self,
        status: Option<JobStatus>,
        queue: Option<&str>,
    ) -> Result<u64, QueueError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM jobs WHERE 1=1");
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(queue) = queue {
            qb.push(" AND queue = ").push_bind(queue.to_string());
        }

        let row = qb.build().fetch_one(&self.pool).await.map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    async fn prune_completed(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status = 'completed'
              AND completed_at < now() - ($1::bigint * interval '1 day')
            "#,
        )
        .bind(older_than_days as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(affected)
    }
}
