use std::path::PathBuf;
use std::process::Stdio;

use docklite_backup_core::{BackupError, SftpConfig};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use super::DestinationAdapter;
use crate::archive::Artifact;

/// Uploads through the OpenSSH `sftp` client in batch mode. Only key-based
/// auth works non-interactively.
pub struct SftpDestination {
    config: SftpConfig,
    key_path: PathBuf,
    program: PathBuf,
}

impl SftpDestination {
    pub fn new(config: SftpConfig) -> Result<Self, BackupError> {
        let key_path = match config.private_key_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let reason = if config.password.is_some() {
                    "password authentication is not supported, configure privateKeyPath"
                } else {
                    "no privateKeyPath configured"
                };
                return Err(BackupError::DestinationUnavailable(format!(
                    "sftp {}@{}: {reason}",
                    config.username, config.host
                )));
            }
        };
        Ok(Self {
            config,
            key_path,
            program: PathBuf::from("sftp"),
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn remote_file(&self, file_name: &str) -> String {
        let dir = self.config.remote_path.trim();
        if dir.is_empty() || dir == "." {
            file_name.to_owned()
        } else {
            format!("{}/{file_name}", dir.trim_end_matches('/'))
        }
    }

    /// `-mkdir` tolerates an existing directory.
    fn batch_script(&self, artifact: &Artifact) -> String {
        let remote = self.remote_file(&artifact.file_name());
        let dir = self.config.remote_path.trim();
        let mut script = String::new();
        if !dir.is_empty() && dir != "." {
            script.push_str(&format!("-mkdir \"{}\"\n", dir.trim_end_matches('/')));
        }
        script.push_str(&format!(
            "put \"{}\" \"{remote}\"\n",
            artifact.path.display()
        ));
        script
    }

    fn location(&self, remote: &str) -> String {
        let sep = if remote.starts_with('/') { "" } else { "/" };
        format!(
            "sftp://{}@{}:{}{sep}{remote}",
            self.config.username, self.config.host, self.config.port
        )
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for SftpDestination {
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError> {
        let mut child = Command::new(&self.program)
            .arg("-b")
            .arg("-")
            .arg("-P")
            .arg(self.config.port.to_string())
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .arg("-i")
            .arg(&self.key_path)
            .arg(format!("{}@{}", self.config.username, self.config.host))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackupError::DestinationUnavailable(format!(
                    "sftp client {} not found",
                    self.program.display()
                )),
                _ => BackupError::UploadFailed(format!("spawn sftp: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.batch_script(artifact).as_bytes())
                .await
                .map_err(|e| BackupError::UploadFailed(format!("write sftp batch: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("wait for sftp: {e}")))?;
        if !output.status.success() {
            return Err(BackupError::UploadFailed(format!(
                "sftp exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let remote = self.remote_file(&artifact.file_name());
        info!(host = %self.config.host, %remote, "uploaded over sftp");
        Ok(self.location(&remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(remote_path: &str) -> SftpConfig {
        SftpConfig {
            host: "backup.example.net".into(),
            port: 2222,
            username: "deploy".into(),
            password: None,
            private_key_path: Some("/root/.ssh/id_ed25519".into()),
            remote_path: remote_path.into(),
        }
    }

    fn artifact() -> Artifact {
        Artifact {
            path: PathBuf::from("/tmp/staging/site-a.tar.gz"),
            size_bytes: 10,
        }
    }

    #[test]
    fn password_only_is_unavailable() {
        let mut cfg = config(".");
        cfg.private_key_path = None;
        cfg.password = Some("hunter2".into());
        let err = SftpDestination::new(cfg).err().unwrap();
        match err {
            BackupError::DestinationUnavailable(msg) => assert!(msg.contains("password")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn batch_script_creates_remote_dir() {
        let dest = SftpDestination::new(config("/srv/backups/")).unwrap();
        assert_eq!(
            dest.batch_script(&artifact()),
            "-mkdir \"/srv/backups\"\nput \"/tmp/staging/site-a.tar.gz\" \"/srv/backups/site-a.tar.gz\"\n"
        );
        assert_eq!(
            dest.location("/srv/backups/site-a.tar.gz"),
            "sftp://deploy@backup.example.net:2222/srv/backups/site-a.tar.gz"
        );
    }

    #[test]
    fn default_remote_path_is_home() {
        let dest = SftpDestination::new(config(".")).unwrap();
        assert_eq!(
            dest.batch_script(&artifact()),
            "put \"/tmp/staging/site-a.tar.gz\" \"site-a.tar.gz\"\n"
        );
        assert_eq!(
            dest.location("site-a.tar.gz"),
            "sftp://deploy@backup.example.net:2222/site-a.tar.gz"
        );
    }

    #[tokio::test]
    async fn missing_client_is_unavailable() {
        let dest = SftpDestination::new(config("."))
            .unwrap()
            .with_program("/nonexistent/bin/sftp");
        let err = dest.persist(&artifact()).await.unwrap_err();
        assert!(matches!(err, BackupError::DestinationUnavailable(_)));
    }
}
