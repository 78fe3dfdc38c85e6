use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use docklite_backup_core::{
    Backup, BackupDestination, BackupFilter, BackupJob, BackupOutcome, NewBackup, NewDestination,
    NewJob,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub id: i64,
    pub domain: String,
    pub code_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub id: i64,
    pub name: String,
    pub container_id: String,
}

/// Read-only view of the dashboard's sites. Lookups are unscoped (admin
/// resolution) because background jobs do not act for a requesting user.
#[async_trait::async_trait]
pub trait SiteRegistry: Send + Sync {
    async fn resolve_site(&self, id: i64) -> Result<Option<SiteInfo>>;

    async fn list_site_ids(&self) -> Result<Vec<i64>>;
}

/// Read-only view of the dashboard's Postgres containers.
#[async_trait::async_trait]
pub trait DatabaseRegistry: Send + Sync {
    async fn resolve_database(&self, id: i64) -> Result<Option<DatabaseInfo>>;

    async fn list_database_ids(&self) -> Result<Vec<i64>>;
}

/// Destinations, jobs and backup history, implemented by both SQLite and
/// Postgres backends.
#[async_trait::async_trait]
pub trait BackupStore: Send + Sync {
    async fn list_destinations(&self) -> Result<Vec<BackupDestination>>;

    async fn get_destination(&self, id: i64) -> Result<Option<BackupDestination>>;

    async fn create_destination(&self, new: &NewDestination) -> Result<i64>;

    /// Returns false when no destination has this id.
    async fn set_destination_enabled(&self, id: i64, enabled: bool) -> Result<bool>;

    /// Deleting a destination also removes its jobs.
    async fn delete_destination(&self, id: i64) -> Result<bool>;

    /// All jobs, optionally narrowed to one destination.
    async fn list_jobs(&self, destination_id: Option<i64>) -> Result<Vec<BackupJob>>;

    async fn get_enabled_jobs(&self) -> Result<Vec<BackupJob>>;

    async fn get_job(&self, id: i64) -> Result<Option<BackupJob>>;

    async fn create_job(&self, new: &NewJob) -> Result<i64>;

    /// Persist the editable columns of `job` (destination, target, frequency,
    /// retention, enabled). Run times are only written by
    /// `update_job_run_times`.
    async fn update_job(&self, job: &BackupJob) -> Result<bool>;

    async fn delete_job(&self, id: i64) -> Result<bool>;

    async fn update_job_run_times(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert an `in_progress` history record with an empty path.
    async fn create_backup(&self, new: &NewBackup) -> Result<i64>;

    /// Move an `in_progress` record to its terminal state. Returns false
    /// (and writes nothing) if the record is missing or already terminal.
    async fn finish_backup(&self, id: i64, outcome: &BackupOutcome) -> Result<bool>;

    /// History ordered by created_at DESC.
    async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>>;

    async fn get_backup(&self, id: i64) -> Result<Option<Backup>>;
}
