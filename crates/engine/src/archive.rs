//! Site and database archive executors. They write a single compressed file
//! into a staging directory and never touch history records.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use docklite_backup_core::{BackupError, ConcreteTarget};
use docklite_backup_storage::{DatabaseRegistry, SiteRegistry};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::runtime::ContainerRuntime;

const DEFAULT_PG_USER: &str = "docklite";

/// A finished archive waiting to be handed to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct Archiver {
    sites: Arc<dyn SiteRegistry>,
    databases: Arc<dyn DatabaseRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    pg_user: String,
}

impl Archiver {
    pub fn new(
        sites: Arc<dyn SiteRegistry>,
        databases: Arc<dyn DatabaseRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            sites,
            databases,
            runtime,
            pg_user: DEFAULT_PG_USER.to_owned(),
        }
    }

    pub fn with_pg_user(mut self, pg_user: impl Into<String>) -> Self {
        self.pg_user = pg_user.into();
        self
    }

    pub async fn archive(
        &self,
        target: &ConcreteTarget,
        staging_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<Artifact, BackupError> {
        match target {
            ConcreteTarget::Site(id) => self.archive_site(*id, staging_dir, now).await,
            ConcreteTarget::Database(id) => self.archive_database(*id, staging_dir, now).await,
        }
    }

    pub async fn archive_site(
        &self,
        site_id: i64,
        staging_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<Artifact, BackupError> {
        let site = self
            .sites
            .resolve_site(site_id)
            .await
            .map_err(BackupError::store)?
            .ok_or_else(|| BackupError::TargetNotFound(format!("site {site_id}")))?;

        ensure_staging_dir(staging_dir).await?;
        let partial = PartialArchive::new(staging_dir.join(format!(
            "site-{}-{}.tar.gz",
            sanitize(&site.domain),
            archive_timestamp(now)
        )));
        let root_name = site
            .code_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| sanitize(&site.domain).into());

        debug!(site_id, code_path = %site.code_path.display(), "archiving site");
        let code_path = site.code_path.clone();
        let written = spawn_writer(partial.part.clone(), move |out| {
            if !code_path.is_dir() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("code path {} is not a directory", code_path.display()),
                ));
            }
            let file = File::create(out)?;
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.follow_symlinks(false);
            builder.append_dir_all(&root_name, &code_path)?;
            builder.into_inner()?.finish()?.sync_all()?;
            Ok(std::fs::metadata(out)?.len())
        })
        .await;

        match written {
            Ok(Ok(size_bytes)) => partial.commit(size_bytes),
            Ok(Err(e)) => Err(BackupError::ArchiveFailed(format!(
                "archive site {}: {e}",
                site.domain
            ))),
            Err(_) => Err(BackupError::ArchiveFailed("archive task failed".to_owned())),
        }
    }

    pub async fn archive_database(
        &self,
        database_id: i64,
        staging_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<Artifact, BackupError> {
        let database = self
            .databases
            .resolve_database(database_id)
            .await
            .map_err(BackupError::store)?
            .ok_or_else(|| BackupError::TargetNotFound(format!("database {database_id}")))?;

        ensure_staging_dir(staging_dir).await?;
        let partial = PartialArchive::new(staging_dir.join(format!(
            "database-{}-{}.sql.gz",
            sanitize(&database.name),
            archive_timestamp(now)
        )));

        let command = vec![
            "pg_dump".to_owned(),
            "-U".to_owned(),
            self.pg_user.clone(),
            database.name.clone(),
        ];
        debug!(database_id, container = %database.container_id, "dumping database");
        let mut output = self
            .runtime
            .run_in_container(&database.container_id, &command)
            .await
            .map_err(|e| BackupError::ArchiveFailed(format!("pg_dump {}: {e}", database.name)))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        let writer = spawn_writer(partial.part.clone(), move |out| {
            let file = File::create(out)?;
            let mut gz = GzEncoder::new(file, Compression::default());
            while let Some(chunk) = rx.blocking_recv() {
                gz.write_all(&chunk)?;
            }
            gz.finish()?.sync_all()?;
            Ok(std::fs::metadata(out)?.len())
        });

        let mut dump_error = None;
        while let Some(item) = output.stdout.next().await {
            match item {
                Ok(chunk) => {
                    // The writer only hangs up after an IO error, reported below.
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    dump_error = Some(e);
                    break;
                }
            }
        }
        drop(tx);
        let written = writer.await;

        let failure = match (dump_error, written) {
            (None, Ok(Ok(size_bytes))) => return partial.commit(size_bytes),
            (Some(e), _) => format!("pg_dump {}: {e}", database.name),
            (None, Ok(Err(e))) => format!("write dump of {}: {e}", database.name),
            (None, Err(_)) => "dump writer task failed".to_owned(),
        };
        Err(BackupError::ArchiveFailed(failure))
    }
}

/// An archive being written under a `.part` name next to its final path.
/// Dropping it without `commit` removes the partial file, which covers
/// executors abandoned by a timeout as well as failed ones.
struct PartialArchive {
    path: PathBuf,
    part: PathBuf,
    committed: bool,
}

impl PartialArchive {
    fn new(path: PathBuf) -> Self {
        let mut part = path.clone().into_os_string();
        part.push(".part");
        Self {
            path,
            part: PathBuf::from(part),
            committed: false,
        }
    }

    fn commit(mut self, size_bytes: u64) -> Result<Artifact, BackupError> {
        std::fs::rename(&self.part, &self.path).map_err(|e| {
            BackupError::ArchiveFailed(format!("finalize {}: {e}", self.path.display()))
        })?;
        self.committed = true;
        Ok(Artifact {
            path: self.path.clone(),
            size_bytes,
        })
    }
}

impl Drop for PartialArchive {
    fn drop(&mut self) {
        if !self.committed {
            remove_partial(&self.part);
        }
    }
}

/// Runs `write` on the blocking pool. If nobody is waiting for the result
/// by the time it finishes, the file it wrote is removed.
fn spawn_writer<F>(out: PathBuf, write: F) -> oneshot::Receiver<std::io::Result<u64>>
where
    F: FnOnce(&Path) -> std::io::Result<u64> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = write(&out);
        if done_tx.send(result).is_err() {
            remove_partial(&out);
        }
    });
    done_rx
}

async fn ensure_staging_dir(dir: &Path) -> Result<(), BackupError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        BackupError::ArchiveFailed(format!("create staging dir {}: {e}", dir.display()))
    })
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial archive"),
    }
}

/// RFC 3339 with milliseconds, made filename-safe.
fn archive_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "unnamed".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;

    use anyhow::Result;
    use chrono::TimeZone;
    use docklite_backup_storage::{DatabaseInfo, SiteInfo};
    use flate2::read::GzDecoder;
    use futures::stream;

    use crate::runtime::{ExecOutput, RuntimeError};

    #[derive(Default)]
    struct Registry {
        sites: HashMap<i64, SiteInfo>,
        databases: HashMap<i64, DatabaseInfo>,
    }

    #[async_trait::async_trait]
    impl SiteRegistry for Registry {
        async fn resolve_site(&self, id: i64) -> Result<Option<SiteInfo>> {
            Ok(self.sites.get(&id).cloned())
        }

        async fn list_site_ids(&self) -> Result<Vec<i64>> {
            Ok(self.sites.keys().copied().collect())
        }
    }

    #[async_trait::async_trait]
    impl DatabaseRegistry for Registry {
        async fn resolve_database(&self, id: i64) -> Result<Option<DatabaseInfo>> {
            Ok(self.databases.get(&id).cloned())
        }

        async fn list_database_ids(&self) -> Result<Vec<i64>> {
            Ok(self.databases.keys().copied().collect())
        }
    }

    struct ScriptedRuntime {
        chunks: Vec<&'static [u8]>,
        exit_error: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn run_in_container(
            &self,
            _container_id: &str,
            command: &[String],
        ) -> Result<ExecOutput, RuntimeError> {
            assert_eq!(command[0], "pg_dump");
            let mut items: Vec<Result<Vec<u8>, RuntimeError>> =
                self.chunks.iter().map(|c| Ok(c.to_vec())).collect();
            if let Some(msg) = self.exit_error {
                items.push(Err(RuntimeError::ExecFailed(msg.to_owned())));
            }
            Ok(ExecOutput {
                stdout: stream::iter(items).boxed(),
            })
        }
    }

    fn archiver(registry: Registry, runtime: ScriptedRuntime) -> Archiver {
        let registry = Arc::new(registry);
        Archiver::new(registry.clone(), registry, Arc::new(runtime))
    }

    fn no_dump() -> ScriptedRuntime {
        ScriptedRuntime {
            chunks: Vec::new(),
            exit_error: None,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 30).unwrap() + chrono::Duration::milliseconds(123)
    }

    #[test]
    fn timestamp_is_filename_safe() {
        assert_eq!(archive_timestamp(at()), "2024-05-01T10-20-30-123Z");
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("example.com"), "example.com");
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize(".."), "unnamed");
    }

    #[tokio::test]
    async fn site_archive_is_rooted_at_code_dir_name() {
        let tmp = tempfile::tempdir().unwrap();
        let code = tmp.path().join("example");
        std::fs::create_dir_all(code.join("public")).unwrap();
        std::fs::write(code.join("public/index.html"), "<h1>hi</h1>").unwrap();

        let mut registry = Registry::default();
        registry.sites.insert(
            3,
            SiteInfo {
                id: 3,
                domain: "example.com".into(),
                code_path: code,
            },
        );
        let staging = tmp.path().join("staging");
        let artifact = archiver(registry, no_dump())
            .archive(&ConcreteTarget::Site(3), &staging, at())
            .await
            .unwrap();

        assert_eq!(
            artifact.file_name(),
            "site-example.com-2024-05-01T10-20-30-123Z.tar.gz"
        );
        assert_eq!(
            artifact.size_bytes,
            std::fs::metadata(&artifact.path).unwrap().len()
        );

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&artifact.path).unwrap()));
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() == Path::new("example/public/index.html") {
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                assert_eq!(body, "<h1>hi</h1>");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn uncommitted_archive_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let partial = PartialArchive::new(tmp.path().join("site-a.tar.gz"));
        assert!(partial.part.ends_with("site-a.tar.gz.part"));
        std::fs::write(&partial.part, b"half an archive").unwrap();
        drop(partial);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_site_is_target_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = archiver(Registry::default(), no_dump())
            .archive_site(9, tmp.path(), at())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn missing_code_path_leaves_no_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        registry.sites.insert(
            1,
            SiteInfo {
                id: 1,
                domain: "gone.test".into(),
                code_path: tmp.path().join("does-not-exist"),
            },
        );
        let staging = tmp.path().join("staging");
        let err = archiver(registry, no_dump())
            .archive_site(1, &staging, at())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ArchiveFailed(_)));
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    fn db_registry() -> Registry {
        let mut registry = Registry::default();
        registry.databases.insert(
            4,
            DatabaseInfo {
                id: 4,
                name: "shop".into(),
                container_id: "pg-shop".into(),
            },
        );
        registry
    }

    #[tokio::test]
    async fn database_dump_is_gzipped() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = ScriptedRuntime {
            chunks: vec![b"CREATE TABLE a();\n", b"INSERT INTO a VALUES ();\n"],
            exit_error: None,
        };
        let artifact = archiver(db_registry(), runtime)
            .archive(&ConcreteTarget::Database(4), tmp.path(), at())
            .await
            .unwrap();
        assert_eq!(
            artifact.file_name(),
            "database-shop-2024-05-01T10-20-30-123Z.sql.gz"
        );

        let mut sql = String::new();
        GzDecoder::new(File::open(&artifact.path).unwrap())
            .read_to_string(&mut sql)
            .unwrap();
        assert_eq!(sql, "CREATE TABLE a();\nINSERT INTO a VALUES ();\n");
    }

    #[tokio::test]
    async fn failed_dump_removes_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = ScriptedRuntime {
            chunks: vec![b"CREATE TABLE a();\n"],
            exit_error: Some("command exited with status 1: role does not exist"),
        };
        let err = archiver(db_registry(), runtime)
            .archive_database(4, tmp.path(), at())
            .await
            .unwrap_err();
        match err {
            BackupError::ArchiveFailed(msg) => assert!(msg.contains("role does not exist")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
