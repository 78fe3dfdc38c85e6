use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BackupError;

pub const DEFAULT_LOCAL_PATH: &str = "/var/backups/docklite";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    Sftp,
    S3,
    Gdrive,
    Backblaze,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::Sftp => "sftp",
            DestinationKind::S3 => "s3",
            DestinationKind::Gdrive => "gdrive",
            DestinationKind::Backblaze => "backblaze",
        }
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "local" => Ok(DestinationKind::Local),
            "sftp" => Ok(DestinationKind::Sftp),
            "s3" => Ok(DestinationKind::S3),
            "gdrive" => Ok(DestinationKind::Gdrive),
            "backblaze" => Ok(DestinationKind::Backblaze),
            other => Err(format!("unknown destination type: {other}")),
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupDestination {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    /// Type-specific settings, kept opaque until an adapter parses them.
    pub config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl BackupDestination {
    /// Parse the opaque config blob into the typed view for this destination.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, BackupError> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            BackupError::DestinationUnavailable(format!(
                "invalid {} config for destination {}: {e}",
                self.kind, self.id
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDestination {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    pub config: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Destinations are immutable apart from their enabled flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationUpdate {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub path: Option<String>,
}

impl LocalConfig {
    pub fn path_or_default(&self) -> &str {
        self.path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_LOCAL_PATH)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GDriveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub folder_id: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_sftp_port() -> u16 {
    22
}

fn default_remote_path() -> String {
    ".".to_owned()
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_retention_days() -> i64 {
    30
}

/// Wire shape shared by job and history targets: `target_type` + `target_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetParts {
    target_type: String,
    target_id: Option<i64>,
}

/// What a job backs up. Wildcards are expanded at execution time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "TargetParts", into = "TargetParts")]
pub enum JobTarget {
    Site(i64),
    Database(i64),
    AllSites,
    AllDatabases,
}

impl JobTarget {
    pub fn from_parts(target_type: &str, target_id: Option<i64>) -> Result<Self, String> {
        match (target_type, target_id) {
            ("site", Some(id)) => Ok(JobTarget::Site(id)),
            ("database", Some(id)) => Ok(JobTarget::Database(id)),
            ("site" | "database", None) => Err(format!("target_type {target_type} requires a target_id")),
            ("all-sites", _) => Ok(JobTarget::AllSites),
            ("all-databases", _) => Ok(JobTarget::AllDatabases),
            (other, _) => Err(format!("unknown target_type: {other}")),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            JobTarget::Site(_) => "site",
            JobTarget::Database(_) => "database",
            JobTarget::AllSites => "all-sites",
            JobTarget::AllDatabases => "all-databases",
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            JobTarget::Site(id) | JobTarget::Database(id) => Some(*id),
            JobTarget::AllSites | JobTarget::AllDatabases => None,
        }
    }
}

impl TryFrom<TargetParts> for JobTarget {
    type Error = String;

    fn try_from(parts: TargetParts) -> Result<Self, Self::Error> {
        JobTarget::from_parts(&parts.target_type, parts.target_id)
    }
}

impl From<JobTarget> for TargetParts {
    fn from(target: JobTarget) -> Self {
        TargetParts {
            target_type: target.type_str().to_owned(),
            target_id: target.id(),
        }
    }
}

/// A single site or database; the only target shape stored in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "TargetParts", into = "TargetParts")]
pub enum ConcreteTarget {
    Site(i64),
    Database(i64),
}

impl ConcreteTarget {
    pub fn from_parts(target_type: &str, target_id: i64) -> Result<Self, String> {
        match target_type {
            "site" => Ok(ConcreteTarget::Site(target_id)),
            "database" => Ok(ConcreteTarget::Database(target_id)),
            other => Err(format!("unknown concrete target_type: {other}")),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            ConcreteTarget::Site(_) => "site",
            ConcreteTarget::Database(_) => "database",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            ConcreteTarget::Site(id) | ConcreteTarget::Database(id) => *id,
        }
    }
}

impl fmt::Display for ConcreteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_str(), self.id())
    }
}

impl TryFrom<TargetParts> for ConcreteTarget {
    type Error = String;

    fn try_from(parts: TargetParts) -> Result<Self, Self::Error> {
        let id = parts
            .target_id
            .ok_or_else(|| format!("target_type {} requires a target_id", parts.target_type))?;
        ConcreteTarget::from_parts(&parts.target_type, id)
    }
}

impl From<ConcreteTarget> for TargetParts {
    fn from(target: ConcreteTarget) -> Self {
        TargetParts {
            target_type: target.type_str().to_owned(),
            target_id: Some(target.id()),
        }
    }
}

/// Job cadence. Jobs keep the raw string; this is the parsed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Every6Hours,
    Every12Hours,
    Daily,
    Every3Days,
    Weekly,
    Monthly,
    Hours(u32),
}

impl Frequency {
    /// Largest accepted hour count (a century).
    pub const MAX_HOURS: u32 = 876_000;

    /// Returns `None` for anything that is neither a named cadence nor an
    /// hour count in `1..=MAX_HOURS`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "hourly" => Some(Frequency::Hourly),
            "every-6-hours" => Some(Frequency::Every6Hours),
            "every-12-hours" => Some(Frequency::Every12Hours),
            "daily" => Some(Frequency::Daily),
            "every-3-days" => Some(Frequency::Every3Days),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            other => other
                .parse::<u32>()
                .ok()
                .filter(|hours| (1..=Self::MAX_HOURS).contains(hours))
                .map(Frequency::Hours),
        }
    }

    /// Elapsed-hours threshold used when a job has no `next_run_at`.
    /// Monthly is approximated as 30 days here.
    pub fn threshold_hours(&self) -> f64 {
        match self {
            Frequency::Hourly => 1.0,
            Frequency::Every6Hours => 6.0,
            Frequency::Every12Hours => 12.0,
            Frequency::Daily => 24.0,
            Frequency::Every3Days => 72.0,
            Frequency::Weekly => 168.0,
            Frequency::Monthly => 720.0,
            Frequency::Hours(hours) => f64::from(*hours),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupJob {
    pub id: i64,
    pub destination_id: i64,
    #[serde(flatten)]
    pub target: JobTarget,
    pub frequency: String,
    pub retention_days: i64,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub destination_id: i64,
    #[serde(flatten)]
    pub target: JobTarget,
    pub frequency: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl NewJob {
    pub fn validate(&self) -> Result<(), String> {
        validate_frequency(&self.frequency)?;
        validate_retention(self.retention_days)
    }
}

/// Partial job update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub destination_id: Option<i64>,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub frequency: Option<String>,
    pub retention_days: Option<i64>,
    pub enabled: Option<bool>,
}

impl JobUpdate {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(freq) = &self.frequency {
            validate_frequency(freq)?;
        }
        if let Some(days) = self.retention_days {
            validate_retention(days)?;
        }
        if self.target_id.is_some() && self.target_type.is_none() {
            return Err("target_id requires target_type".to_owned());
        }
        self.target().map(|_| ())
    }

    pub fn target(&self) -> Result<Option<JobTarget>, String> {
        self.target_type
            .as_deref()
            .map(|t| JobTarget::from_parts(t, self.target_id))
            .transpose()
    }

    /// Produce the job as it would look after this update.
    pub fn apply(&self, job: &BackupJob) -> Result<BackupJob, String> {
        let mut next = job.clone();
        if let Some(target) = self.target()? {
            next.target = target;
        }
        if let Some(id) = self.destination_id {
            next.destination_id = id;
        }
        if let Some(freq) = &self.frequency {
            next.frequency = freq.clone();
        }
        if let Some(days) = self.retention_days {
            next.retention_days = days;
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        Ok(next)
    }
}

fn validate_frequency(raw: &str) -> Result<(), String> {
    Frequency::parse(raw)
        .map(|_| ())
        .ok_or_else(|| format!("invalid frequency: {raw:?}"))
}

fn validate_retention(days: i64) -> Result<(), String> {
    if days < 1 {
        return Err(format!("retention_days must be positive, got {days}"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    Failed,
    InProgress,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
            BackupStatus::InProgress => "in_progress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(BackupStatus::Success),
            "failed" => Some(BackupStatus::Failed),
            "in_progress" => Some(BackupStatus::InProgress),
            _ => None,
        }
    }
}

/// History record for one target of one job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    pub id: i64,
    pub job_id: Option<i64>,
    pub destination_id: i64,
    #[serde(flatten)]
    pub target: ConcreteTarget,
    pub backup_path: String,
    pub size_bytes: i64,
    pub status: BackupStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a fresh history record. It starts `in_progress` with an empty
/// path and zero size.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub job_id: Option<i64>,
    pub destination_id: i64,
    pub target: ConcreteTarget,
    pub created_at: DateTime<Utc>,
}

/// Terminal state written once over an `in_progress` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Success { path: String, size_bytes: i64 },
    Failed { error: String },
}

impl BackupOutcome {
    pub fn status(&self) -> BackupStatus {
        match self {
            BackupOutcome::Success { .. } => BackupStatus::Success,
            BackupOutcome::Failed { .. } => BackupStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub job_id: Option<i64>,
    pub target: Option<ConcreteTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frequency_parses_named_and_numeric() {
        assert_eq!(Frequency::parse("daily"), Some(Frequency::Daily));
        assert_eq!(Frequency::parse("every-6-hours"), Some(Frequency::Every6Hours));
        assert_eq!(Frequency::parse(" 4 "), Some(Frequency::Hours(4)));
        assert_eq!(Frequency::parse("0"), None);
        assert_eq!(Frequency::parse("-3"), None);
        assert_eq!(Frequency::parse("fortnightly"), None);
        assert_eq!(Frequency::parse("876000"), Some(Frequency::Hours(Frequency::MAX_HOURS)));
        assert_eq!(Frequency::parse("876001"), None);
        assert_eq!(Frequency::parse("4294967295"), None);
    }

    #[test]
    fn job_target_wire_shape() {
        let job: NewJob = serde_json::from_value(json!({
            "destination_id": 1,
            "target_type": "all-sites",
            "target_id": null,
            "frequency": "daily"
        }))
        .unwrap();
        assert_eq!(job.target, JobTarget::AllSites);
        assert_eq!(job.retention_days, 30);
        assert!(job.enabled);

        let value = serde_json::to_value(JobTarget::Database(7)).unwrap();
        assert_eq!(value, json!({"target_type": "database", "target_id": 7}));
    }

    #[test]
    fn concrete_job_target_requires_id() {
        let err = serde_json::from_value::<NewJob>(json!({
            "destination_id": 1,
            "target_type": "site",
            "frequency": "daily"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn new_job_rejects_bad_frequency() {
        let job = NewJob {
            destination_id: 1,
            target: JobTarget::Site(2),
            frequency: "sometimes".into(),
            retention_days: 30,
            enabled: true,
        };
        assert!(job.validate().unwrap_err().contains("frequency"));
    }

    #[test]
    fn job_update_applies_partial_fields() {
        let job = BackupJob {
            id: 1,
            destination_id: 1,
            target: JobTarget::Site(3),
            frequency: "daily".into(),
            retention_days: 30,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            created_at: Utc::now(),
        };
        let update = JobUpdate {
            target_type: Some("all-databases".into()),
            enabled: Some(false),
            ..Default::default()
        };
        update.validate().unwrap();
        let next = update.apply(&job).unwrap();
        assert_eq!(next.target, JobTarget::AllDatabases);
        assert!(!next.enabled);
        assert_eq!(next.frequency, "daily");
    }

    #[test]
    fn local_config_defaults_path() {
        assert_eq!(LocalConfig::default().path_or_default(), DEFAULT_LOCAL_PATH);
        let cfg = LocalConfig {
            path: Some("/srv/backups".into()),
        };
        assert_eq!(cfg.path_or_default(), "/srv/backups");
    }

    #[test]
    fn destination_config_parse_error_is_unavailable() {
        let dest = BackupDestination {
            id: 4,
            name: "offsite".into(),
            kind: DestinationKind::S3,
            config: json!({"bucket": "b"}),
            enabled: true,
            created_at: Utc::now(),
        };
        let err = dest.parse_config::<S3Config>().unwrap_err();
        assert!(matches!(err, BackupError::DestinationUnavailable(_)));
    }

    #[test]
    fn sftp_config_uses_dashboard_keys() {
        let cfg: SftpConfig = serde_json::from_value(json!({
            "host": "sftp.example.com",
            "username": "backup",
            "password": "pw",
            "remotePath": "/backups"
        }))
        .unwrap();
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.remote_path, "/backups");
    }
}
