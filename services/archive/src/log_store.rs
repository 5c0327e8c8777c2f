use crate::config::DatabaseConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A request/application log row awaiting archival
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Service that emitted the log
    pub service: String,
    /// Outcome label, e.g. `success` or `error`
    pub status: String,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<i32>,
    pub duration_ms: Option<i64>,
    /// Schema-free attachment, stored and archived as-is
    pub payload: serde_json::Value,
}

/// Outcome of an archive job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Bookkeeping row for one archival run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveJobRecord {
    pub id: Uuid,
    /// First instant of the archived hour
    pub hour_start: DateTime<Utc>,
    pub status: JobStatus,
    pub files_written: i32,
    pub records_archived: i64,
    pub bytes_written: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ArchiveJobRecord {
    pub fn start(hour_start: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hour_start,
            status: JobStatus::Running,
            files_written: 0,
            records_archived: 0,
            bytes_written: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Tables the retention sweep ages out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    RequestLog,
    ArchiveJob,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::RequestLog, RecordKind::ArchiveJob];

    fn table(&self) -> &'static str {
        match self {
            RecordKind::RequestLog => "request_logs",
            RecordKind::ArchiveJob => "archive_jobs",
        }
    }

    fn timestamp_column(&self) -> &'static str {
        match self {
            RecordKind::RequestLog => "timestamp",
            RecordKind::ArchiveJob => "started_at",
        }
    }
}

/// Database collaborator used by the archive job and the retention sweep
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Logs with `from <= timestamp < to`, oldest first
    async fn logs_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LogRecord>>;

    /// Ids of rows older than `cutoff`, ordered by id, after `after` when given
    async fn record_ids_before(
        &self,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    /// Delete rows by id; ids that no longer exist are ignored
    async fn delete_records(&self, kind: RecordKind, ids: &[Uuid]) -> Result<u64>;

    async fn insert_job(&self, job: &ArchiveJobRecord) -> Result<()>;

    async fn finish_job(&self, job: &ArchiveJobRecord) -> Result<()>;
}

/// PostgreSQL-backed log store
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    /// Create a new log store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::ArchiveError::Database(e.to_string()))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    #[instrument(skip(self))]
    async fn logs_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LogRecord>> {
        let logs = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT id, timestamp, service, status, method, path,
                   status_code, duration_ms, payload
            FROM request_logs
            WHERE timestamp >= $1 AND timestamp < $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = logs.len(), "Loaded logs for archival");
        Ok(logs)
    }

    async fn record_ids_before(
        &self,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        // Table and column names come from RecordKind, never from input
        let sql = format!(
            "SELECT id FROM {table} WHERE {column} < $1 AND ($2::uuid IS NULL OR id > $2) ORDER BY id LIMIT $3",
            table = kind.table(),
            column = kind.timestamp_column(),
        );

        let ids: Vec<(Uuid,)> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_records(&self, kind: RecordKind, ids: &[Uuid]) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", kind.table());
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_job(&self, job: &ArchiveJobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archive_jobs (
                id, hour_start, status, files_written, records_archived,
                bytes_written, error, started_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(job.hour_start)
        .bind(job.status.as_str())
        .bind(job.files_written)
        .bind(job.records_archived)
        .bind(job.bytes_written)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_job(&self, job: &ArchiveJobRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE archive_jobs
            SET status = $2, files_written = $3, records_archived = $4,
                bytes_written = $5, error = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.files_written)
        .bind(job.records_archived)
        .bind(job.bytes_written)
        .bind(&job.error)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
