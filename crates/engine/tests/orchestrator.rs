use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use docklite_backup_core::{
    BackupError, BackupFilter, BackupStatus, ConcreteTarget, DestinationKind, JobTarget,
    NewDestination, NewJob,
};
use docklite_backup_engine::{
    ContainerRuntime, ExecOutput, ManualClock, Orchestrator, RuntimeError, Scheduler,
    SchedulerHandle,
};
use docklite_backup_storage::sqlite_store::SqliteStore;
use docklite_backup_storage::{
    BackupStore, DatabaseInfo, DatabaseRegistry, SiteInfo, SiteRegistry, Stores,
};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tempfile::TempDir;

/// Lists `listed` but only resolves what is in `sites`, so a listed id can
/// disappear between expansion and archiving.
#[derive(Default)]
struct FakeRegistry {
    sites: HashMap<i64, SiteInfo>,
    listed_sites: Vec<i64>,
    databases: HashMap<i64, DatabaseInfo>,
    panicking_site: Option<i64>,
}

#[async_trait::async_trait]
impl SiteRegistry for FakeRegistry {
    async fn resolve_site(&self, id: i64) -> Result<Option<SiteInfo>> {
        if self.panicking_site == Some(id) {
            panic!("registry blew up resolving site {id}");
        }
        Ok(self.sites.get(&id).cloned())
    }

    async fn list_site_ids(&self) -> Result<Vec<i64>> {
        Ok(self.listed_sites.clone())
    }
}

#[async_trait::async_trait]
impl DatabaseRegistry for FakeRegistry {
    async fn resolve_database(&self, id: i64) -> Result<Option<DatabaseInfo>> {
        Ok(self.databases.get(&id).cloned())
    }

    async fn list_database_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.databases.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Clone, Copy)]
enum Dump {
    Succeeds(&'static [u8]),
    Fails(&'static str),
    Hangs,
}

struct FakeRuntime {
    dump: Dump,
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_in_container(
        &self,
        _container_id: &str,
        _command: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let stdout = match self.dump {
            Dump::Succeeds(sql) => stream::iter(vec![Ok(sql.to_vec())]).boxed(),
            Dump::Fails(msg) => stream::iter(vec![
                Ok(b"-- partial\n".to_vec()),
                Err(RuntimeError::ExecFailed(msg.to_owned())),
            ])
            .boxed(),
            Dump::Hangs => stream::pending::<Result<Vec<u8>, RuntimeError>>().boxed(),
        };
        Ok(ExecOutput { stdout })
    }
}

struct Fixture {
    tmp: TempDir,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    orchestrator: Arc<Orchestrator>,
    destination_id: i64,
}

impl Fixture {
    fn local_dir(&self) -> PathBuf {
        self.tmp.path().join("local")
    }

    async fn job(&self, target: JobTarget) -> i64 {
        self.store
            .create_job(&NewJob {
                destination_id: self.destination_id,
                target,
                frequency: "daily".into(),
                retention_days: 30,
                enabled: true,
            })
            .await
            .unwrap()
    }

    async fn records(&self, job_id: i64) -> Vec<docklite_backup_core::Backup> {
        self.store
            .list_backups(&BackupFilter {
                job_id: Some(job_id),
                target: None,
            })
            .await
            .unwrap()
    }
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
}

fn code_dir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join("sites").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("index.php"), format!("<?php echo '{name}';")).unwrap();
    dir
}

async fn fixture(dump: Dump, timeout: Option<Duration>) -> Fixture {
    fixture_with(dump, timeout, None).await
}

async fn fixture_with(dump: Dump, timeout: Option<Duration>, panicking_site: Option<i64>) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(tmp.path().join("state").join("docklite.db")).unwrap());

    let mut registry = FakeRegistry::default();
    for (id, name) in [(1, "alpha"), (2, "beta")] {
        registry.sites.insert(
            id,
            SiteInfo {
                id,
                domain: format!("{name}.test"),
                code_path: code_dir(tmp.path(), name),
            },
        );
    }
    registry.listed_sites = vec![1, 2, 3];
    registry.panicking_site = panicking_site;
    registry.databases.insert(
        4,
        DatabaseInfo {
            id: 4,
            name: "shop".into(),
            container_id: "pg-shop".into(),
        },
    );
    let registry = Arc::new(registry);

    let destination_id = store
        .create_destination(&NewDestination {
            name: "scratch".into(),
            kind: DestinationKind::Local,
            config: json!({ "path": tmp.path().join("local") }),
            enabled: true,
        })
        .await
        .unwrap();

    let stores = Stores {
        store: store.clone(),
        sites: registry.clone(),
        databases: registry,
    };
    let clock = Arc::new(ManualClock::new(start_time()));
    let orchestrator = Orchestrator::new(&stores, Arc::new(FakeRuntime { dump }), clock.clone())
        .with_staging_dir(tmp.path().join("staging"))
        .with_target_timeout(timeout);

    Fixture {
        tmp,
        store,
        clock,
        orchestrator: Arc::new(orchestrator),
        destination_id,
    }
}

#[tokio::test]
async fn wildcard_job_records_every_target_and_updates_run_times_once() {
    let fx = fixture(Dump::Succeeds(b""), None).await;
    let job_id = fx.job(JobTarget::AllSites).await;

    let summary = fx.orchestrator.trigger_job(job_id).await.unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let records = fx.records(job_id).await;
    assert_eq!(records.len(), 3);
    let by_target: HashMap<ConcreteTarget, _> =
        records.iter().map(|r| (r.target, r)).collect();

    for id in [1, 2] {
        let record = by_target[&ConcreteTarget::Site(id)];
        assert_eq!(record.status, BackupStatus::Success);
        assert!(record.size_bytes > 0);
        assert!(Path::new(&record.backup_path).exists());
        assert!(record.backup_path.starts_with(&fx.local_dir().display().to_string()));
    }
    let missing = by_target[&ConcreteTarget::Site(3)];
    assert_eq!(missing.status, BackupStatus::Failed);
    assert!(missing
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("not found"));

    let job = fx.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.last_run_at, Some(start_time()));
    assert_eq!(job.next_run_at, Some(start_time() + chrono::Duration::days(1)));
}

#[tokio::test]
async fn trigger_unknown_job_creates_nothing() {
    let fx = fixture(Dump::Succeeds(b""), None).await;
    let err = fx.orchestrator.trigger_job(999).await.unwrap_err();
    assert_eq!(err, BackupError::JobNotFound(999));
    assert!(fx
        .store
        .list_backups(&BackupFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn disabled_destination_skips_without_touching_the_job() {
    let fx = fixture(Dump::Succeeds(b""), None).await;
    let job_id = fx.job(JobTarget::Site(1)).await;
    assert!(fx
        .store
        .set_destination_enabled(fx.destination_id, false)
        .await
        .unwrap());

    let summary = fx.orchestrator.trigger_job(job_id).await.unwrap();
    assert!(summary.skipped);
    assert!(fx.records(job_id).await.is_empty());
    let job = fx.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.last_run_at, None);
    assert_eq!(job.next_run_at, None);
}

#[tokio::test]
async fn database_dump_lands_in_local_destination() {
    let fx = fixture(Dump::Succeeds(b"CREATE TABLE orders ();\n"), None).await;
    let job_id = fx.job(JobTarget::Database(4)).await;

    let summary = fx.orchestrator.trigger_job(job_id).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let records = fx.records(job_id).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Success);
    assert!(records[0].backup_path.ends_with(".sql.gz"));
    assert!(records[0].backup_path.contains("database-shop-"));
}

#[tokio::test]
async fn failed_dump_is_recorded_and_job_still_advances() {
    let fx = fixture(Dump::Fails("command exited with status 1: FATAL: role missing"), None).await;
    let job_id = fx.job(JobTarget::Database(4)).await;

    let summary = fx.orchestrator.trigger_job(job_id).await.unwrap();
    assert_eq!(summary.failed, 1);

    let records = fx.records(job_id).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("role missing"));
    assert_eq!(std::fs::read_dir(fx.local_dir()).unwrap().count(), 0);

    let job = fx.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.last_run_at, Some(start_time()));
}

#[tokio::test]
async fn hung_target_times_out() {
    let fx = fixture(Dump::Hangs, Some(Duration::from_millis(100))).await;
    let job_id = fx.job(JobTarget::Database(4)).await;

    let summary = fx.orchestrator.trigger_job(job_id).await.unwrap();
    assert_eq!(summary.failed, 1);

    let records = fx.records(job_id).await;
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));

    // The abandoned dump writer finishes on the blocking pool and must not
    // leave a truncated archive behind.
    let mut leftovers = Vec::new();
    for _ in 0..50 {
        leftovers = std::fs::read_dir(fx.local_dir())
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.file_name()).collect())
            .unwrap_or_default();
        if leftovers.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
}

#[tokio::test]
async fn tick_dispatches_only_due_jobs() {
    let fx = fixture(Dump::Succeeds(b"--\n"), None).await;
    let due = fx.job(JobTarget::Site(1)).await;
    let not_due = fx.job(JobTarget::Site(2)).await;
    fx.store
        .update_job_run_times(
            not_due,
            start_time() - chrono::Duration::hours(1),
            start_time() + chrono::Duration::hours(23),
        )
        .await
        .unwrap();
    let disabled = fx.job(JobTarget::Database(4)).await;
    let mut job = fx.store.get_job(disabled).await.unwrap().unwrap();
    job.enabled = false;
    fx.store.update_job(&job).await.unwrap();

    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let report = scheduler.tick().await;
    assert_eq!(report.dispatched(), 1);
    let summaries = report.join().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].job_id, due);

    // The job that just ran is not due again until a day has passed.
    assert_eq!(scheduler.tick().await.dispatched(), 0);
    fx.clock.advance(chrono::Duration::hours(24));
    assert_eq!(scheduler.tick().await.join().await.len(), 2);
}

#[tokio::test]
async fn scheduler_loop_runs_until_shutdown() {
    let fx = fixture(Dump::Succeeds(b"--\n"), None).await;
    let job_id = fx.job(JobTarget::Site(1)).await;

    let handle = SchedulerHandle::spawn(
        Scheduler::new(fx.orchestrator.clone())
            .with_initial_delay(Duration::from_millis(10))
            .with_interval(Duration::from_secs(60)),
    );

    let mut finished = false;
    for _ in 0..100 {
        let records = fx.records(job_id).await;
        if records.iter().any(|r| r.status == BackupStatus::Success) {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;
    assert!(finished, "scheduler never ran the due job");

    assert_eq!(fx.records(job_id).await.len(), 1);
}

#[tokio::test]
async fn panicking_job_does_not_stop_the_others() {
    let fx = fixture_with(Dump::Succeeds(b"--\n"), None, Some(1)).await;
    let panics = fx.job(JobTarget::Site(1)).await;
    let healthy = fx.job(JobTarget::Site(2)).await;

    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let report = scheduler.tick().await;
    assert_eq!(report.dispatched(), 2);
    let summaries = report.join().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].job_id, healthy);
    assert_eq!(summaries[0].succeeded, 1);

    // The panicked run never recorded its run times, so it is due again.
    let job = fx.store.get_job(panics).await.unwrap().unwrap();
    assert_eq!(job.last_run_at, None);
    let report = scheduler.tick().await;
    assert_eq!(report.dispatched(), 1);
    assert!(report.join().await.is_empty());
}

#[tokio::test]
async fn store_error_skips_the_tick_only() {
    let fx = fixture(Dump::Succeeds(b"--\n"), None).await;
    let job_id = fx.job(JobTarget::Site(1)).await;
    let scheduler = Scheduler::new(fx.orchestrator.clone());

    let conn = rusqlite::Connection::open(fx.store.db_path()).unwrap();
    conn.execute_batch("ALTER TABLE backup_jobs RENAME TO backup_jobs_away")
        .unwrap();
    assert_eq!(scheduler.tick().await.dispatched(), 0);

    conn.execute_batch("ALTER TABLE backup_jobs_away RENAME TO backup_jobs")
        .unwrap();
    drop(conn);
    let summaries = scheduler.tick().await.join().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].job_id, job_id);
}

#[tokio::test]
async fn running_job_is_not_dispatched_twice() {
    let fx = fixture(Dump::Hangs, None).await;
    let job_id = fx.job(JobTarget::Database(4)).await;
    let scheduler = Scheduler::new(fx.orchestrator.clone());

    let first = scheduler.tick().await;
    assert_eq!(first.dispatched(), 1);
    fx.clock.advance(chrono::Duration::hours(1));
    assert_eq!(scheduler.tick().await.dispatched(), 0);

    let mut records = Vec::new();
    for _ in 0..50 {
        records = fx.records(job_id).await;
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::InProgress);
}
