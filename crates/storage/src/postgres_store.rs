use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use docklite_backup_core::{
    Backup, BackupDestination, BackupFilter, BackupJob, BackupOutcome, BackupStatus,
    ConcreteTarget, DestinationKind, JobTarget, NewBackup, NewDestination, NewJob,
    DEFAULT_LOCAL_PATH,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::store::{BackupStore, DatabaseInfo, DatabaseRegistry, SiteInfo, SiteRegistry};

const DESTINATION_COLUMNS: &str = "id, name, type, config, enabled, created_at";
const JOB_COLUMNS: &str = "id, destination_id, target_type, target_id, frequency, retention_days,
     enabled, last_run_at, next_run_at, created_at";
const BACKUP_COLUMNS: &str = "id, job_id, destination_id, target_type, target_id, backup_path,
     size_bytes, status, error_message, created_at";

/// Postgres-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let exists: bool = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables
             WHERE table_schema = current_schema() AND table_name = 'backup_destinations')",
        )
        .fetch_one(&self.pool)
        .await
        .context("check for backup_destinations table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sites (
                id BIGSERIAL PRIMARY KEY,
                domain TEXT NOT NULL,
                code_path TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create sites table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS databases (
                id BIGSERIAL PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                container_id TEXT UNIQUE NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create databases table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_destinations (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL CHECK(type IN ('local', 'sftp', 's3', 'gdrive', 'backblaze')),
                config TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_destinations table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_jobs (
                id BIGSERIAL PRIMARY KEY,
                destination_id BIGINT NOT NULL REFERENCES backup_destinations(id) ON DELETE CASCADE,
                target_type TEXT NOT NULL CHECK(target_type IN ('site', 'database', 'all-sites', 'all-databases')),
                target_id BIGINT,
                frequency TEXT NOT NULL,
                retention_days BIGINT NOT NULL DEFAULT 30,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_run_at TIMESTAMPTZ,
                next_run_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_jobs table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backups (
                id BIGSERIAL PRIMARY KEY,
                job_id BIGINT REFERENCES backup_jobs(id) ON DELETE SET NULL,
                destination_id BIGINT NOT NULL REFERENCES backup_destinations(id) ON DELETE CASCADE,
                target_type TEXT NOT NULL CHECK(target_type IN ('site', 'database')),
                target_id BIGINT NOT NULL,
                backup_path TEXT NOT NULL,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'in_progress'
                    CHECK(status IN ('success', 'failed', 'in_progress')),
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backups table")?;

        if !exists {
            sqlx::query(
                "INSERT INTO backup_destinations (name, type, config, enabled)
                 VALUES ('Local Server', 'local', $1, TRUE)",
            )
            .bind(serde_json::json!({ "path": DEFAULT_LOCAL_PATH }).to_string())
            .execute(&self.pool)
            .await
            .context("seed default local destination")?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl BackupStore for PostgresStore {
    async fn list_destinations(&self) -> Result<Vec<BackupDestination>> {
        let rows = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM backup_destinations ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_destination).collect()
    }

    async fn get_destination(&self, id: i64) -> Result<Option<BackupDestination>> {
        let row = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM backup_destinations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pg_row_to_destination).transpose()
    }

    async fn create_destination(&self, new: &NewDestination) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO backup_destinations (name, type, config, enabled)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(new.config.to_string())
        .bind(new.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn set_destination_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE backup_destinations SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_destination(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_destinations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_jobs(&self, destination_id: Option<i64>) -> Result<Vec<BackupJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs
             WHERE ($1::BIGINT IS NULL OR destination_id = $1) ORDER BY id"
        ))
        .bind(destination_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_job).collect()
    }

    async fn get_enabled_jobs(&self) -> Result<Vec<BackupJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE enabled ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match pg_row_to_job(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let job_id = row.try_get::<i64, _>("id").ok();
                    warn!(?job_id, error = %format!("{e:#}"), "skipping malformed job row");
                }
            }
        }
        Ok(jobs)
    }

    async fn get_job(&self, id: i64) -> Result<Option<BackupJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM backup_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pg_row_to_job).transpose()
    }

    async fn create_job(&self, new: &NewJob) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO backup_jobs (destination_id, target_type, target_id, frequency,
             retention_days, enabled)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(new.destination_id)
        .bind(new.target.type_str())
        .bind(new.target.id())
        .bind(&new.frequency)
        .bind(new.retention_days)
        .bind(new.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_job(&self, job: &BackupJob) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET destination_id = $1, target_type = $2, target_id = $3,
             frequency = $4, retention_days = $5, enabled = $6 WHERE id = $7",
        )
        .bind(job.destination_id)
        .bind(job.target.type_str())
        .bind(job.target.id())
        .bind(&job.frequency)
        .bind(job.retention_days)
        .bind(job.enabled)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_job(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_job_run_times(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE backup_jobs SET last_run_at = $1, next_run_at = $2 WHERE id = $3")
            .bind(last_run)
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_backup(&self, new: &NewBackup) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO backups (job_id, destination_id, target_type, target_id, backup_path,
             size_bytes, status, created_at)
             VALUES ($1, $2, $3, $4, '', 0, 'in_progress', $5) RETURNING id",
        )
        .bind(new.job_id)
        .bind(new.destination_id)
        .bind(new.target.type_str())
        .bind(new.target.id())
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn finish_backup(&self, id: i64, outcome: &BackupOutcome) -> Result<bool> {
        let result = match outcome {
            BackupOutcome::Success { path, size_bytes } => {
                sqlx::query(
                    "UPDATE backups SET status = 'success', backup_path = $1, size_bytes = $2
                     WHERE id = $3 AND status = 'in_progress'",
                )
                .bind(path)
                .bind(*size_bytes)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            BackupOutcome::Failed { error } => {
                sqlx::query(
                    "UPDATE backups SET status = 'failed', error_message = $1
                     WHERE id = $2 AND status = 'in_progress'",
                )
                .bind(error)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE ($1::BIGINT IS NULL OR job_id = $1)
               AND ($2::TEXT IS NULL OR target_type = $2)
               AND ($3::BIGINT IS NULL OR target_id = $3)
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(filter.job_id)
        .bind(filter.target.map(|t| t.type_str()))
        .bind(filter.target.map(|t| t.id()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pg_row_to_backup).transpose()
    }
}

#[async_trait::async_trait]
impl SiteRegistry for PostgresStore {
    async fn resolve_site(&self, id: i64) -> Result<Option<SiteInfo>> {
        let row = sqlx::query("SELECT id, domain, code_path FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| SiteInfo {
            id: r.get("id"),
            domain: r.get("domain"),
            code_path: PathBuf::from(r.get::<String, _>("code_path")),
        }))
    }

    async fn list_site_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM sites ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl DatabaseRegistry for PostgresStore {
    async fn resolve_database(&self, id: i64) -> Result<Option<DatabaseInfo>> {
        let row = sqlx::query("SELECT id, name, container_id FROM databases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| DatabaseInfo {
            id: r.get("id"),
            name: r.get("name"),
            container_id: r.get("container_id"),
        }))
    }

    async fn list_database_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM databases ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

fn pg_row_to_destination(row: &sqlx::postgres::PgRow) -> Result<BackupDestination> {
    let kind: String = row.get("type");
    let config: String = row.get("config");
    Ok(BackupDestination {
        id: row.get("id"),
        name: row.get("name"),
        kind: kind.parse::<DestinationKind>().map_err(|e| anyhow!(e))?,
        config: serde_json::from_str(&config).context("parse destination config")?,
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
    })
}

fn pg_row_to_job(row: &sqlx::postgres::PgRow) -> Result<BackupJob> {
    let target_type: String = row.get("target_type");
    let id: i64 = row.get("id");
    Ok(BackupJob {
        id,
        destination_id: row.get("destination_id"),
        target: JobTarget::from_parts(&target_type, row.get("target_id"))
            .map_err(|e| anyhow!("backup job {id}: {e}"))?,
        frequency: row.get("frequency"),
        retention_days: row.get("retention_days"),
        enabled: row.get("enabled"),
        last_run_at: row.get("last_run_at"),
        next_run_at: row.get("next_run_at"),
        created_at: row.get("created_at"),
    })
}

fn pg_row_to_backup(row: &sqlx::postgres::PgRow) -> Result<Backup> {
    let target_type: String = row.get("target_type");
    let status: String = row.get("status");
    Ok(Backup {
        id: row.get("id"),
        job_id: row.get("job_id"),
        destination_id: row.get("destination_id"),
        target: ConcreteTarget::from_parts(&target_type, row.get("target_id"))
            .map_err(|e| anyhow!(e))?,
        backup_path: row.get("backup_path"),
        size_bytes: row.get("size_bytes"),
        status: BackupStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown backup status: {status}"))?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}
