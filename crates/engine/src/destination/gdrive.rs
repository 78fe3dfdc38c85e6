use docklite_backup_core::{BackupError, GDriveConfig};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::DestinationAdapter;
use crate::archive::Artifact;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

/// Google Drive through the v3 resumable upload protocol, authorised with a
/// long-lived refresh token.
pub struct GDriveDestination {
    config: GDriveConfig,
    client: reqwest::Client,
    token_url: String,
    upload_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UploadedFile {
    id: String,
}

impl GDriveDestination {
    pub fn new(config: GDriveConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            token_url: TOKEN_URL.to_owned(),
            upload_url: UPLOAD_URL.to_owned(),
        }
    }

    pub fn with_endpoints(mut self, token_url: impl Into<String>, upload_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self.upload_url = upload_url.into();
        self
    }

    async fn access_token(&self) -> Result<String, BackupError> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("gdrive token request: {e}")))?;
        let resp = check_status(resp, "gdrive token request").await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("gdrive token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn start_session(&self, token: &str, artifact: &Artifact) -> Result<String, BackupError> {
        let mut metadata = json!({ "name": artifact.file_name() });
        if let Some(folder) = self.config.folder_id.as_deref().filter(|f| !f.is_empty()) {
            metadata["parents"] = json!([folder]);
        }
        let resp = self
            .client
            .post(&self.upload_url)
            .query(&[("uploadType", "resumable")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "application/gzip")
            .header("X-Upload-Content-Length", artifact.size_bytes)
            .json(&metadata)
            .send()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("gdrive upload session: {e}")))?;
        let resp = check_status(resp, "gdrive upload session").await?;
        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                BackupError::UploadFailed("gdrive upload session returned no location".to_owned())
            })
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for GDriveDestination {
    async fn persist(&self, artifact: &Artifact) -> Result<String, BackupError> {
        let file = tokio::fs::File::open(&artifact.path).await.map_err(|e| {
            BackupError::UploadFailed(format!("open {}: {e}", artifact.path.display()))
        })?;
        let token = self.access_token().await?;
        let session = self.start_session(&token, artifact).await?;

        let resp = self
            .client
            .put(&session)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "application/gzip")
            .header(CONTENT_LENGTH, artifact.size_bytes)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("gdrive upload: {e}")))?;
        let resp = check_status(resp, "gdrive upload").await?;
        let uploaded: UploadedFile = resp
            .json()
            .await
            .map_err(|e| BackupError::UploadFailed(format!("gdrive upload response: {e}")))?;

        info!(file_id = %uploaded.id, size = artifact.size_bytes, "uploaded to google drive");
        Ok(format!("gdrive://{}", uploaded.id))
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, BackupError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackupError::UploadFailed(format!(
        "{what} returned {status}: {}",
        body.trim()
    )))
}
