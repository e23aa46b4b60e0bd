//! SQLite backend for the toil job queue.
//!
//! This crate provides a durable, relational storage backend. All jobs live
//! in a single table; claiming a job is one conditional `UPDATE ...
//! RETURNING` whose subquery selects the best visible candidate, serialized
//! by SQLite's writer lock, so two concurrent reservers can never win the
//! same row. Before each claim, reservations whose lease expired are
//! recovered back to waiting with their attempt counter incremented.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toil_sqlite::SqliteBackend;
//! use toil_core::Engine;
//!
//! #[tokio::main]
//! async fn main() -> toil_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db", "myapp").await?;
//!     let engine = Engine::builder().backend(backend).build()?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::Duration;
use toil_core::{unix_now, Backend, JobId, JobMeta, JobRecord, JobStatus, Result, ToilError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// SQLite backend for job storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite`
    /// or `sqlite::memory:`.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single connection for writes
            .connect(database_url)
            .await
            .map_err(|e| ToilError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let backend = Self {
            pool,
            namespace: namespace.to_string(),
        };

        backend.init_tables().await?;

        Ok(backend)
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    /// Initialize the jobs table and indexes.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                body BLOB NOT NULL,
                ttr INTEGER NOT NULL,
                delay_seconds INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                push_time INTEGER NOT NULL,
                delay_time INTEGER NOT NULL,
                reserve_time INTEGER,
                expire_time INTEGER,
                done_time INTEGER,
                attempt INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'waiting',
                error_message TEXT
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to create jobs table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_ready ON {} (status, delay_time, priority DESC, id ASC)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_expire ON {} (status, expire_time)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    /// Return expired reservations to waiting, incrementing their attempt.
    async fn recover_expired(&self, now: i64) -> Result<()> {
        let recovered = sqlx::query(&format!(
            r#"
            UPDATE {} SET status = 'waiting', attempt = attempt + 1,
                          reserve_time = NULL, expire_time = NULL
            WHERE status = 'reserved' AND expire_time <= ?
            "#,
            self.jobs_table()
        ))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to recover expired leases: {}", e)))?
        .rows_affected();

        if recovered > 0 {
            tracing::debug!(count = recovered, "expired leases recovered");
        }
        Ok(())
    }

    /// Claim the best visible waiting row in a single conditional update.
    async fn try_claim(&self, now: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE {t} SET status = 'reserved', reserve_time = ?1,
                           expire_time = ?1 + ttr
            WHERE id = (
                SELECT id FROM {t}
                WHERE status = 'waiting' AND delay_time <= ?1
                ORDER BY priority DESC, id ASC
                LIMIT 1
            )
            RETURNING id, name, body, ttr, delay_seconds, priority,
                      push_time, reserve_time, attempt
            "#,
            t = self.jobs_table()
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to claim job: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| ToilError::Backend(format!("Failed to read claimed row: {}", e)))?;
        let record = JobRecord {
            id: JobId::new(id.to_string()),
            name: row
                .try_get("name")
                .map_err(|e| ToilError::Backend(format!("Failed to read claimed row: {}", e)))?,
            body: row
                .try_get("body")
                .map_err(|e| ToilError::Backend(format!("Failed to read claimed row: {}", e)))?,
            meta: JobMeta {
                ttr_secs: row.try_get::<i64, _>("ttr").unwrap_or_default() as u64,
                delay_secs: row.try_get::<i64, _>("delay_seconds").unwrap_or_default() as u64,
                priority: row.try_get("priority").unwrap_or_default(),
                pushed_at: row.try_get("push_time").unwrap_or_default(),
                reserved_at: row.try_get("reserve_time").ok(),
                done_at: None,
                attempt: row.try_get::<i64, _>("attempt").unwrap_or(1) as u32,
                receipt: None,
            },
        };
        Ok(Some(record))
    }

    fn parse_id(id: &JobId) -> Result<i64> {
        id.as_str()
            .parse()
            .map_err(|_| ToilError::Backend(format!("Invalid job id: {}", id)))
    }

    /// Move a reserved row to a terminal status. The attempt counter fences
    /// the update: a claim whose lease was recovered (attempt bumped) no
    /// longer matches and its resolution is dropped.
    async fn finish(&self, job: &JobRecord, status: &str, error: Option<&str>) -> Result<()> {
        let id = Self::parse_id(&job.id)?;
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {} SET status = ?, done_time = ?, error_message = ?
            WHERE id = ? AND status = 'reserved' AND attempt = ?
            "#,
            self.jobs_table()
        ))
        .bind(status)
        .bind(unix_now())
        .bind(error)
        .bind(id)
        .bind(job.meta.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to finish job: {}", e)))?
        .rows_affected();

        if updated == 0 {
            tracing::debug!(job_id = %job.id, "resolution for a lost lease ignored");
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn insert(&self, name: &str, body: &[u8], meta: JobMeta) -> Result<JobId> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, body, ttr, delay_seconds, priority,
                            push_time, delay_time, attempt, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'waiting')
            RETURNING id
            "#,
            self.jobs_table()
        ))
        .bind(name)
        .bind(body)
        .bind(meta.ttr_secs as i64)
        .bind(meta.delay_secs as i64)
        .bind(meta.priority)
        .bind(meta.pushed_at)
        .bind(meta.visible_at())
        .bind(meta.attempt as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to insert job: {}", e)))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| ToilError::Backend(format!("Failed to read inserted id: {}", e)))?;
        Ok(JobId::new(id.to_string()))
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let now = unix_now();
            self.recover_expired(now).await?;

            if let Some(record) = self.try_claim(now).await? {
                return Ok(Some(record));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn complete(&self, job: &JobRecord) -> Result<()> {
        self.finish(job, "done", None).await
    }

    async fn fail(&self, job: &JobRecord, error: &str) -> Result<()> {
        self.finish(job, "failed", Some(error)).await
    }

    async fn status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        let id = Self::parse_id(id)?;
        let row = sqlx::query(&format!(
            "SELECT status, delay_time FROM {} WHERE id = ?",
            self.jobs_table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ToilError::Backend(format!("Failed to query status: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row
            .try_get("status")
            .map_err(|e| ToilError::Backend(format!("Failed to read status: {}", e)))?;
        let delay_time: i64 = row.try_get("delay_time").unwrap_or_default();

        let status = match status.as_str() {
            // A waiting row whose delay has not elapsed reports as delayed.
            "waiting" if delay_time > unix_now() => JobStatus::Delayed,
            "waiting" => JobStatus::Waiting,
            "reserved" => JobStatus::Reserved,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            other => {
                return Err(ToilError::Backend(format!(
                    "Unknown job status in store: {}",
                    other
                )))
            }
        };
        Ok(Some(status))
    }
}
