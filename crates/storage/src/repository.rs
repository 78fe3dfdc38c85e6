use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::postgres_store::PostgresStore;
use crate::sqlite_store::SqliteStore;
use crate::store::{BackupStore, DatabaseRegistry, SiteRegistry};

/// The three views the engine needs, all backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub store: Arc<dyn BackupStore>,
    pub sites: Arc<dyn SiteRegistry>,
    pub databases: Arc<dyn DatabaseRegistry>,
}

impl Stores {
    fn from_backend<T>(backend: T) -> Self
    where
        T: BackupStore + SiteRegistry + DatabaseRegistry + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            store: backend.clone(),
            sites: backend.clone(),
            databases: backend,
        }
    }
}

/// Postgres when `database_url` is set, otherwise SQLite at
/// `{root}/state/docklite.db`.
pub async fn open_store(root: impl Into<PathBuf>, database_url: Option<&str>) -> Result<Stores> {
    match database_url {
        Some(url) => Ok(Stores::from_backend(PostgresStore::new(url).await?)),
        None => {
            let db_path = root.into().join("state").join("docklite.db");
            Ok(Stores::from_backend(SqliteStore::new(db_path)?))
        }
    }
}
