pub mod error;
pub mod model;
pub mod schedule;

pub use error::BackupError;
pub use model::{
    Backup, BackupDestination, BackupFilter, BackupJob, BackupOutcome, BackupStatus,
    ConcreteTarget, DestinationKind, DestinationUpdate, Frequency, GDriveConfig, JobTarget,
    JobUpdate, LocalConfig, NewBackup, NewDestination, NewJob, S3Config, SftpConfig,
    DEFAULT_LOCAL_PATH,
};
pub use schedule::{compute_next_run, should_run};
