//! Storage destinations that take a staged artifact and keep it.

mod gdrive;
mod local;
mod s3;
mod sftp;

use std::path::{Path, PathBuf};

use docklite_backup_core::{BackupDestination, BackupError, DestinationKind, S3Config};
use tracing::warn;

use crate::archive::Artifact;

pub use gdrive::GDriveDestination;
pub use local::LocalDestination;
pub use s3::S3Destination;
pub use sftp::SftpDestination;

#[async_trait::async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Store the artifact and return its final location, which is what the
    /// history record keeps as the backup path.
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError>;
}

pub enum Destination {
    Local(LocalDestination),
    Sftp(SftpDestination),
    S3(S3Destination),
    GDrive(GDriveDestination),
}

impl Destination {
    pub fn from_record(record: &BackupDestination) -> Result<Self, BackupError> {
        match record.kind {
            DestinationKind::Local => Ok(Destination::Local(LocalDestination::new(
                record.parse_config()?,
            ))),
            DestinationKind::Sftp => Ok(Destination::Sftp(SftpDestination::new(
                record.parse_config()?,
            )?)),
            DestinationKind::S3 => Ok(Destination::S3(S3Destination::new(record.parse_config()?))),
            DestinationKind::Backblaze => {
                let config: S3Config = record.parse_config()?;
                if config.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
                    return Err(BackupError::DestinationUnavailable(format!(
                        "backblaze destination {} has no endpoint",
                        record.id
                    )));
                }
                Ok(Destination::S3(S3Destination::new(config)))
            }
            DestinationKind::Gdrive => Ok(Destination::GDrive(GDriveDestination::new(
                record.parse_config()?,
            ))),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Destination::Local(_))
    }

    /// Where executors should write artifacts for this destination. Local
    /// destinations receive them directly in their own directory.
    pub fn staging_dir(&self, default: &Path) -> PathBuf {
        match self {
            Destination::Local(local) => local.root().to_path_buf(),
            _ => default.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for Destination {
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError> {
        let result = match self {
            Destination::Local(d) => d.persist(artifact).await,
            Destination::Sftp(d) => d.persist(artifact).await,
            Destination::S3(d) => d.persist(artifact).await,
            Destination::GDrive(d) => d.persist(artifact).await,
        };
        // Staged copies of remote uploads go whether or not the upload worked.
        if self.is_remote() {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "failed to remove staged artifact")
                }
            }
        }
        result
    }
}
