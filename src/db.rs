use crate::{Error, JobRecord, Result, Status};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const COLUMNS: &str = "id, status, progress, url, input_location, backend, preset, \
    output_path, output_url, error_detail, created_at, updated_at";

/// Durable job records, keyed by id.
///
/// Every write is a single statement, so readers see either the previous
/// record or the new one, never a mix.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<SqlitePool>,
}

impl DbHandle {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    #[instrument(name = "db.put", skip_all, fields(job_id = %record.id, status = %record.status))]
    pub async fn put(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs \
                (id, status, progress, url, input_location, backend, preset, \
                 output_path, output_url, error_detail, created_at, updated_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
            ON CONFLICT(id) DO UPDATE SET \
                status = excluded.status, \
                progress = excluded.progress, \
                url = excluded.url, \
                input_location = excluded.input_location, \
                backend = excluded.backend, \
                preset = excluded.preset, \
                output_path = excluded.output_path, \
                output_url = excluded.output_url, \
                error_detail = excluded.error_detail, \
                created_at = excluded.created_at, \
                updated_at = excluded.updated_at",
        )
        .bind(record.id)
        .bind(record.status)
        .bind(record.progress)
        .bind(&record.url)
        .bind(&record.input_location)
        .bind(&record.backend)
        .bind(&record.preset)
        .bind(&record.output_path)
        .bind(&record.output_url)
        .bind(&record.error_detail)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<JobRecord> {
        sqlx::query_as::<_, JobRecord>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or(Error::NotFound(id))
    }

    #[instrument(name = "db.delete", skip_all, fields(job_id = %id))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    /// Records in `status`, oldest first.
    pub async fn list_by_status(&self, status: Status) -> Result<Vec<JobRecord>> {
        debug!("Getting {} jobs", status);
        Ok(sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&*self.pool)
        .await?)
    }
}
