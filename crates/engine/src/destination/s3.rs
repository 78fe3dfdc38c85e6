use aws_sdk_s3 as s3;
use docklite_backup_core::{BackupError, S3Config};
use s3::config::{Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tracing::info;

use super::DestinationAdapter;
use crate::archive::Artifact;

/// S3 or any S3-compatible store (Backblaze B2, MinIO, Spaces).
pub struct S3Destination {
    config: S3Config,
}

impl S3Destination {
    pub fn new(config: S3Config) -> Self {
        Self { config }
    }

    fn object_key(&self, file_name: &str) -> String {
        match self.config.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{file_name}"),
            _ => file_name.to_owned(),
        }
    }

    async fn client(&self) -> s3::Client {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(Credentials::new(
                &self.config.access_key,
                &self.config.secret_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &self.config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(self.config.endpoint.is_some())
            .build();
        s3::Client::from_conf(s3_config)
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for S3Destination {
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError> {
        let key = self.object_key(&artifact.file_name());
        let body = ByteStream::from_path(&artifact.path).await.map_err(|e| {
            BackupError::UploadFailed(format!("read {}: {e}", artifact.path.display()))
        })?;

        self.client()
            .await
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::UploadFailed(format!(
                    "put s3://{}/{key}: {}",
                    self.config.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(bucket = %self.config.bucket, %key, size = artifact.size_bytes, "uploaded to s3");
        Ok(format!("s3://{}/{key}", self.config.bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix: Option<&str>) -> S3Config {
        S3Config {
            bucket: "backups".into(),
            region: "us-east-1".into(),
            access_key: "AKIA".into(),
            secret_key: "secret".into(),
            endpoint: None,
            prefix: prefix.map(str::to_owned),
        }
    }

    #[test]
    fn key_joins_prefix() {
        assert_eq!(
            S3Destination::new(config(None)).object_key("a.tar.gz"),
            "a.tar.gz"
        );
        assert_eq!(
            S3Destination::new(config(Some("docklite/"))).object_key("a.tar.gz"),
            "docklite/a.tar.gz"
        );
        assert_eq!(
            S3Destination::new(config(Some("/"))).object_key("a.tar.gz"),
            "a.tar.gz"
        );
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let tmp = tempfile::tempdir().unwrap();
        let err = S3Destination::new(config(None))
            .persist(&Artifact {
                path: tmp.path().join("missing.tar.gz"),
                size_bytes: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UploadFailed(_)));
    }
}
