use std::path::{Path, PathBuf};

use docklite_backup_core::{BackupError, LocalConfig};

use super::DestinationAdapter;
use crate::archive::Artifact;

/// A directory on the dashboard host.
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            root: PathBuf::from(config.path_or_default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for LocalDestination {
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError> {
        tokio::fs::metadata(&artifact.path).await.map_err(|e| {
            BackupError::UploadFailed(format!(
                "archive {} missing: {e}",
                artifact.path.display()
            ))
        })?;

        if artifact.path.parent() == Some(self.root.as_path()) {
            return Ok(artifact.path.display().to_string());
        }

        // Staged elsewhere; bring it under the destination root.
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            BackupError::UploadFailed(format!("create {}: {e}", self.root.display()))
        })?;
        let target = self.root.join(artifact.file_name());
        tokio::fs::copy(&artifact.path, &target).await.map_err(|e| {
            BackupError::UploadFailed(format!("copy into {}: {e}", self.root.display()))
        })?;
        Ok(target.display().to_string())
    }
}
