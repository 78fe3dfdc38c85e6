//! Runs one backup job end to end: destination lookup, target expansion,
//! per-target archive and upload, history records, and run-time bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docklite_backup_core::{
    compute_next_run, BackupError, BackupJob, BackupOutcome, ConcreteTarget, JobTarget, NewBackup,
};
use docklite_backup_storage::{BackupStore, DatabaseRegistry, SiteRegistry, Stores};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::Archiver;
use crate::clock::Clock;
use crate::destination::{Destination, DestinationAdapter};
use crate::runtime::ContainerRuntime;

pub const DEFAULT_STAGING_DIR: &str = "/tmp/docklite-backups";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunSummary {
    pub job_id: i64,
    /// The destination was missing or disabled, so nothing ran.
    pub skipped: bool,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobRunSummary {
    fn skipped(job_id: i64) -> Self {
        Self {
            job_id,
            skipped: true,
            ..Self::default()
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn BackupStore>,
    sites: Arc<dyn SiteRegistry>,
    databases: Arc<dyn DatabaseRegistry>,
    archiver: Archiver,
    clock: Arc<dyn Clock>,
    staging_dir: PathBuf,
    target_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(stores: &Stores, runtime: Arc<dyn ContainerRuntime>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: stores.store.clone(),
            sites: stores.sites.clone(),
            databases: stores.databases.clone(),
            archiver: Archiver::new(stores.sites.clone(), stores.databases.clone(), runtime),
            clock,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            target_timeout: None,
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_target_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.target_timeout = timeout;
        self
    }

    pub fn with_pg_user(mut self, pg_user: impl Into<String>) -> Self {
        self.archiver = self.archiver.with_pg_user(pg_user);
        self
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn trigger_job(&self, job_id: i64) -> Result<JobRunSummary, BackupError> {
        let job = self
            .store
            .get_job(job_id)
            .await
            .map_err(BackupError::store)?
            .ok_or(BackupError::JobNotFound(job_id))?;
        Ok(self.execute_job(&job).await)
    }

    /// Per-target failures end up in history rows, never in the return value.
    pub async fn execute_job(&self, job: &BackupJob) -> JobRunSummary {
        let span = info_span!("backup_job", job_id = job.id, run_id = %Uuid::new_v4());
        self.execute_job_inner(job).instrument(span).await
    }

    async fn execute_job_inner(&self, job: &BackupJob) -> JobRunSummary {
        let record = match self.store.get_destination(job.destination_id).await {
            Ok(Some(record)) if record.enabled => record,
            Ok(Some(_)) => {
                info!(destination_id = job.destination_id, "destination disabled, skipping job");
                return JobRunSummary::skipped(job.id);
            }
            Ok(None) => {
                info!(destination_id = job.destination_id, "destination not found, skipping job");
                return JobRunSummary::skipped(job.id);
            }
            Err(e) => {
                error!(destination_id = job.destination_id, error = %format!("{e:#}"), "failed to load destination");
                return JobRunSummary::skipped(job.id);
            }
        };
        let destination = Destination::from_record(&record);
        if let Err(e) = &destination {
            warn!(destination_id = record.id, error = %e, "destination config unusable");
        }

        let targets = self.expand_targets(&job.target).await;
        info!(targets = targets.len(), destination = %record.name, "starting backup job");

        let mut summary = JobRunSummary {
            job_id: job.id,
            ..JobRunSummary::default()
        };
        for target in targets {
            if self.backup_target(job, &target, &destination).await {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        let now = self.clock.now();
        let next = compute_next_run(&job.frequency, now);
        if let Err(e) = self.store.update_job_run_times(job.id, now, next).await {
            error!(error = %format!("{e:#}"), "failed to record job run times");
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            next_run_at = %next,
            "backup job finished"
        );
        summary
    }

    /// Resolve the job's target against the live registries. Listing errors
    /// count as an empty registry.
    pub async fn expand_targets(&self, target: &JobTarget) -> Vec<ConcreteTarget> {
        match target {
            JobTarget::Site(id) => vec![ConcreteTarget::Site(*id)],
            JobTarget::Database(id) => vec![ConcreteTarget::Database(*id)],
            JobTarget::AllSites => match self.sites.list_site_ids().await {
                Ok(ids) => ids.into_iter().map(ConcreteTarget::Site).collect(),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "failed to list sites");
                    Vec::new()
                }
            },
            JobTarget::AllDatabases => match self.databases.list_database_ids().await {
                Ok(ids) => ids.into_iter().map(ConcreteTarget::Database).collect(),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "failed to list databases");
                    Vec::new()
                }
            },
        }
    }

    /// Returns whether the target ended in `success`.
    async fn backup_target(
        &self,
        job: &BackupJob,
        target: &ConcreteTarget,
        destination: &Result<Destination, BackupError>,
    ) -> bool {
        let new = NewBackup {
            job_id: Some(job.id),
            destination_id: job.destination_id,
            target: *target,
            created_at: self.clock.now(),
        };
        let backup_id = match self.store.create_backup(&new).await {
            Ok(id) => id,
            Err(e) => {
                error!(%target, error = %format!("{e:#}"), "failed to create backup record");
                return false;
            }
        };

        let result = match destination {
            Ok(destination) => self.run_target(target, destination).await,
            Err(e) => Err(e.clone()),
        };

        let outcome = match &result {
            Ok((path, size_bytes)) => {
                info!(backup_id, %target, path = %path, size_bytes, "backup succeeded");
                BackupOutcome::Success {
                    path: path.clone(),
                    size_bytes: *size_bytes,
                }
            }
            Err(e) => {
                warn!(backup_id, %target, error = %e, "backup failed");
                BackupOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        match self.store.finish_backup(backup_id, &outcome).await {
            Ok(true) => {}
            Ok(false) => warn!(backup_id, "backup record was already finished"),
            Err(e) => error!(backup_id, error = %format!("{e:#}"), "failed to finish backup record"),
        }
        result.is_ok()
    }

    async fn run_target(
        &self,
        target: &ConcreteTarget,
        destination: &Destination,
    ) -> Result<(String, i64), BackupError> {
        let staging = destination.staging_dir(&self.staging_dir);
        let work = self.archive_and_persist(target, destination, &staging);
        match self.target_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| BackupError::Timeout(limit.as_secs()))?,
            None => work.await,
        }
    }

    async fn archive_and_persist(
        &self,
        target: &ConcreteTarget,
        destination: &Destination,
        staging: &Path,
    ) -> Result<(String, i64), BackupError> {
        let artifact = self
            .archiver
            .archive(target, staging, self.clock.now())
            .await?;
        debug!(path = %artifact.path.display(), size = artifact.size_bytes, "archive ready");
        let location = destination.persist(&artifact).await?;
        let size_bytes = i64::try_from(artifact.size_bytes).unwrap_or(i64::MAX);
        Ok((location, size_bytes))
    }
}
