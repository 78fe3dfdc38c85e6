use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use docklite_backup_core::{
    Backup, BackupDestination, BackupFilter, BackupJob, BackupOutcome, BackupStatus,
    ConcreteTarget, DestinationKind, JobTarget, NewBackup, NewDestination, NewJob,
    DEFAULT_LOCAL_PATH,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::store::{BackupStore, DatabaseInfo, DatabaseRegistry, SiteInfo, SiteRegistry};

const DESTINATION_COLUMNS: &str = "id, name, type, config, enabled, created_at";
const JOB_COLUMNS: &str = "id, destination_id, target_type, target_id, frequency, retention_days,
     enabled, last_run_at, next_run_at, created_at";
const BACKUP_COLUMNS: &str = "id, job_id, destination_id, target_type, target_id, backup_path,
     size_bytes, status, error_message, created_at";

/// SQLite-backed store. Each call opens a fresh connection on a blocking
/// thread; the registries read the dashboard's own `sites` and `databases`
/// tables from the same file.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state directory {}", parent.display()))?;
        }
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_db(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)?;
        let fresh: bool = conn.query_row(
            "SELECT NOT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'backup_destinations')",
            [],
            |row| row.get(0),
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                code_path TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS databases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                container_id TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL CHECK(type IN ('local', 'sftp', 's3', 'gdrive', 'backblaze')),
                config TEXT NOT NULL,
                enabled INTEGER DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                destination_id INTEGER NOT NULL,
                target_type TEXT NOT NULL CHECK(target_type IN ('site', 'database', 'all-sites', 'all-databases')),
                target_id INTEGER,
                frequency TEXT NOT NULL,
                retention_days INTEGER DEFAULT 30,
                enabled INTEGER DEFAULT 1,
                last_run_at TEXT,
                next_run_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (destination_id) REFERENCES backup_destinations(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER,
                destination_id INTEGER NOT NULL,
                target_type TEXT NOT NULL CHECK(target_type IN ('site', 'database')),
                target_id INTEGER NOT NULL,
                backup_path TEXT NOT NULL,
                size_bytes INTEGER DEFAULT 0,
                status TEXT NOT NULL CHECK(status IN ('success', 'failed', 'in_progress')) DEFAULT 'in_progress',
                error_message TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES backup_jobs(id) ON DELETE SET NULL,
                FOREIGN KEY (destination_id) REFERENCES backup_destinations(id) ON DELETE CASCADE
            );",
        )?;
        if fresh {
            conn.execute(
                "INSERT INTO backup_destinations (name, type, config, enabled, created_at)
                 VALUES ('Local Server', 'local', ?1, 1, ?2)",
                params![
                    serde_json::json!({ "path": DEFAULT_LOCAL_PATH }).to_string(),
                    ts_str(Utc::now())
                ],
            )?;
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            f(&conn)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("open backup db")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

#[async_trait::async_trait]
impl BackupStore for SqliteStore {
    async fn list_destinations(&self) -> Result<Vec<BackupDestination>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DESTINATION_COLUMNS} FROM backup_destinations ORDER BY id"
            ))?;
            let rows = stmt.query_map([], row_to_destination)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    async fn get_destination(&self, id: i64) -> Result<Option<BackupDestination>> {
        self.blocking(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {DESTINATION_COLUMNS} FROM backup_destinations WHERE id = ?1"),
                    [id],
                    row_to_destination,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn create_destination(&self, new: &NewDestination) -> Result<i64> {
        let new = new.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO backup_destinations (name, type, config, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.name,
                    new.kind.as_str(),
                    new.config.to_string(),
                    new.enabled,
                    ts_str(Utc::now())
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn set_destination_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE backup_destinations SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_destination(&self, id: i64) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute("DELETE FROM backup_destinations WHERE id = ?1", [id])?;
            Ok(changed == 1)
        })
        .await
    }

    async fn list_jobs(&self, destination_id: Option<i64>) -> Result<Vec<BackupJob>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM backup_jobs
                 WHERE (?1 IS NULL OR destination_id = ?1) ORDER BY id"
            ))?;
            let rows = stmt.query_map([destination_id], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    async fn get_enabled_jobs(&self) -> Result<Vec<BackupJob>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE enabled = 1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row_to_job(row))))?;
            let mut jobs = Vec::new();
            for row in rows {
                match row? {
                    (_, Ok(job)) => jobs.push(job),
                    (job_id, Err(e)) => warn!(job_id, error = %e, "skipping malformed job row"),
                }
            }
            Ok(jobs)
        })
        .await
    }

    async fn get_job(&self, id: i64) -> Result<Option<BackupJob>> {
        self.blocking(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM backup_jobs WHERE id = ?1"),
                    [id],
                    row_to_job,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn create_job(&self, new: &NewJob) -> Result<i64> {
        let new = new.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO backup_jobs (destination_id, target_type, target_id, frequency,
                 retention_days, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.destination_id,
                    new.target.type_str(),
                    new.target.id(),
                    new.frequency,
                    new.retention_days,
                    new.enabled,
                    ts_str(Utc::now())
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn update_job(&self, job: &BackupJob) -> Result<bool> {
        let job = job.clone();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE backup_jobs SET destination_id = ?1, target_type = ?2, target_id = ?3,
                 frequency = ?4, retention_days = ?5, enabled = ?6 WHERE id = ?7",
                params![
                    job.destination_id,
                    job.target.type_str(),
                    job.target.id(),
                    job.frequency,
                    job.retention_days,
                    job.enabled,
                    job.id
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete_job(&self, id: i64) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute("DELETE FROM backup_jobs WHERE id = ?1", [id])?;
            Ok(changed == 1)
        })
        .await
    }

    async fn update_job_run_times(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE backup_jobs SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                params![ts_str(last_run), ts_str(next_run), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_backup(&self, new: &NewBackup) -> Result<i64> {
        let new = new.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO backups (job_id, destination_id, target_type, target_id, backup_path,
                 size_bytes, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, '', 0, 'in_progress', ?5)",
                params![
                    new.job_id,
                    new.destination_id,
                    new.target.type_str(),
                    new.target.id(),
                    ts_str(new.created_at)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn finish_backup(&self, id: i64, outcome: &BackupOutcome) -> Result<bool> {
        let outcome = outcome.clone();
        self.blocking(move |conn| {
            let changed = match &outcome {
                BackupOutcome::Success { path, size_bytes } => conn.execute(
                    "UPDATE backups SET status = 'success', backup_path = ?1, size_bytes = ?2
                     WHERE id = ?3 AND status = 'in_progress'",
                    params![path, size_bytes, id],
                )?,
                BackupOutcome::Failed { error } => conn.execute(
                    "UPDATE backups SET status = 'failed', error_message = ?1
                     WHERE id = ?2 AND status = 'in_progress'",
                    params![error, id],
                )?,
            };
            Ok(changed == 1)
        })
        .await
    }

    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let job_id = filter.job_id;
        let target_type = filter.target.map(|t| t.type_str());
        let target_id = filter.target.map(|t| t.id());
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups
                 WHERE (?1 IS NULL OR job_id = ?1)
                   AND (?2 IS NULL OR target_type = ?2)
                   AND (?3 IS NULL OR target_id = ?3)
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![job_id, target_type, target_id], row_to_backup)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>> {
        self.blocking(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                    [id],
                    row_to_backup,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }
}

#[async_trait::async_trait]
impl SiteRegistry for SqliteStore {
    async fn resolve_site(&self, id: i64) -> Result<Option<SiteInfo>> {
        self.blocking(move |conn| {
            let found = conn
                .query_row(
                    "SELECT id, domain, code_path FROM sites WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(SiteInfo {
                            id: row.get(0)?,
                            domain: row.get(1)?,
                            code_path: PathBuf::from(row.get::<_, String>(2)?),
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn list_site_ids(&self) -> Result<Vec<i64>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM sites ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Into::into)
        })
        .await
    }
}

#[async_trait::async_trait]
impl DatabaseRegistry for SqliteStore {
    async fn resolve_database(&self, id: i64) -> Result<Option<DatabaseInfo>> {
        self.blocking(move |conn| {
            let found = conn
                .query_row(
                    "SELECT id, name, container_id FROM databases WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(DatabaseInfo {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            container_id: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn list_database_ids(&self) -> Result<Vec<i64>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM databases ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Into::into)
        })
        .await
    }
}

fn row_to_destination(row: &rusqlite::Row) -> rusqlite::Result<BackupDestination> {
    let kind: String = row.get(2)?;
    let config: String = row.get(3)?;
    Ok(BackupDestination {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind
            .parse::<DestinationKind>()
            .map_err(|e| conversion_err(2, e))?,
        config: serde_json::from_str(&config).map_err(|e| conversion_err(3, e.to_string()))?,
        enabled: row.get::<_, Option<bool>>(4)?.unwrap_or(true),
        created_at: parse_ts(5, row.get(5)?)?,
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<BackupJob> {
    let target_type: String = row.get(2)?;
    Ok(BackupJob {
        id: row.get(0)?,
        destination_id: row.get(1)?,
        target: JobTarget::from_parts(&target_type, row.get(3)?).map_err(|e| conversion_err(2, e))?,
        frequency: row.get(4)?,
        retention_days: row.get::<_, Option<i64>>(5)?.unwrap_or(30),
        enabled: row.get::<_, Option<bool>>(6)?.unwrap_or(true),
        last_run_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(7, raw))
            .transpose()?,
        next_run_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_ts(8, raw))
            .transpose()?,
        created_at: parse_ts(9, row.get(9)?)?,
    })
}

fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<Backup> {
    let target_type: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(Backup {
        id: row.get(0)?,
        job_id: row.get(1)?,
        destination_id: row.get(2)?,
        target: ConcreteTarget::from_parts(&target_type, row.get(4)?)
            .map_err(|e| conversion_err(3, e))?,
        backup_path: row.get(5)?,
        size_bytes: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        status: BackupStatus::parse(&status)
            .ok_or_else(|| conversion_err(7, format!("unknown backup status: {status}")))?,
        error_message: row.get(8)?,
        created_at: parse_ts(9, row.get(9)?)?,
    })
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 as written by this store and SQLite's
/// `CURRENT_TIMESTAMP` format as written by the dashboard.
fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| conversion_err(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}
