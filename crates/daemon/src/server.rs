use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use docklite_backup_core::{
    Backup, BackupDestination, BackupFilter, BackupJob, ConcreteTarget, DestinationKind,
    DestinationUpdate, JobUpdate, LocalConfig, NewDestination, NewJob, DEFAULT_LOCAL_PATH,
};
use docklite_backup_engine::Orchestrator;
use docklite_backup_storage::BackupStore;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BackupStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub api_token: Option<String>,
    /// Fixed directory for the local listing and download endpoints. When
    /// unset it is looked up per request from the enabled local destinations.
    pub local_root: Option<PathBuf>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route(
            "/api/v1/backups/destinations",
            get(list_destinations).post(create_destination),
        )
        .route(
            "/api/v1/backups/destinations/{id}",
            put(update_destination).delete(delete_destination),
        )
        .route("/api/v1/backups/jobs", get(list_jobs).post(create_job))
        .route(
            "/api/v1/backups/jobs/{id}",
            put(update_job).delete(delete_job),
        )
        .route("/api/v1/backups/trigger", post(trigger_backup))
        .route("/api/v1/backups/local", get(list_local_files))
        .route("/api/v1/backups/local/download", get(download_local_file))
        .route("/api/v1/backups", get(list_backups))
        .route("/api/v1/backups/{id}", get(get_backup))
        .with_state(state)
}

/// JSON error body: `{"error": "..."}`.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_owned(),
        }
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self {
            status,
            message: status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_lowercase(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

// --- destinations ---

async fn list_destinations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<BackupDestination>>> {
    require_api_auth(&state, &headers)?;
    let destinations = state
        .store
        .list_destinations()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(destinations))
}

async fn create_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewDestination>,
) -> ApiResult<(StatusCode, Json<BackupDestination>)> {
    require_api_auth(&state, &headers)?;
    if new.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    if !new.config.is_object() {
        return Err(ApiError::bad_request("config must be a JSON object"));
    }
    let id = state
        .store
        .create_destination(&new)
        .await
        .map_err(ApiError::internal)?;
    let created = state
        .store
        .get_destination(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal(anyhow::anyhow!("destination {id} vanished")))?;
    info!(destination_id = id, kind = %created.kind, "destination created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_destination(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<DestinationUpdate>,
) -> ApiResult<Json<BackupDestination>> {
    require_api_auth(&state, &headers)?;
    let found = state
        .store
        .set_destination_enabled(id, update.enabled)
        .await
        .map_err(ApiError::internal)?;
    if !found {
        return Err(ApiError::not_found(format!("destination {id} not found")));
    }
    let destination = state
        .store
        .get_destination(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("destination {id} not found")))?;
    Ok(Json(destination))
}

async fn delete_destination(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_api_auth(&state, &headers)?;
    if !state
        .store
        .delete_destination(id)
        .await
        .map_err(ApiError::internal)?
    {
        return Err(ApiError::not_found(format!("destination {id} not found")));
    }
    info!(destination_id = id, "destination deleted");
    Ok(StatusCode::NO_CONTENT)
}

// --- jobs ---

#[derive(Debug, Deserialize)]
struct JobListQuery {
    destination_id: Option<i64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<BackupJob>>> {
    require_api_auth(&state, &headers)?;
    let jobs = state
        .store
        .list_jobs(query.destination_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(jobs))
}

async fn ensure_destination_exists(state: &AppState, id: i64) -> ApiResult<()> {
    match state
        .store
        .get_destination(id)
        .await
        .map_err(ApiError::internal)?
    {
        Some(_) => Ok(()),
        None => Err(ApiError::bad_request(format!("destination {id} does not exist"))),
    }
}

async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<BackupJob>)> {
    require_api_auth(&state, &headers)?;
    new.validate().map_err(ApiError::bad_request)?;
    ensure_destination_exists(&state, new.destination_id).await?;

    let id = state
        .store
        .create_job(&new)
        .await
        .map_err(ApiError::internal)?;
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal(anyhow::anyhow!("job {id} vanished")))?;
    info!(
        job_id = id,
        target_type = job.target.type_str(),
        frequency = %job.frequency,
        "backup job created"
    );
    Ok((StatusCode::CREATED, Json(job)))
}

async fn update_job(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<JobUpdate>,
) -> ApiResult<Json<BackupJob>> {
    require_api_auth(&state, &headers)?;
    update.validate().map_err(ApiError::bad_request)?;
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("backup job {id} not found")))?;
    let updated = update.apply(&job).map_err(ApiError::bad_request)?;
    if updated.destination_id != job.destination_id {
        ensure_destination_exists(&state, updated.destination_id).await?;
    }
    if !state
        .store
        .update_job(&updated)
        .await
        .map_err(ApiError::internal)?
    {
        return Err(ApiError::not_found(format!("backup job {id} not found")));
    }
    Ok(Json(updated))
}

async fn delete_job(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_api_auth(&state, &headers)?;
    if !state.store.delete_job(id).await.map_err(ApiError::internal)? {
        return Err(ApiError::not_found(format!("backup job {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- trigger & history ---

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    job_id: i64,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: i64,
    status: &'static str,
}

/// Answers once the job is known to exist; the run itself happens in the
/// background and reports only through history records.
async fn trigger_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerResponse>> {
    require_api_auth(&state, &headers)?;
    let job = state
        .store
        .get_job(req.job_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("backup job {} not found", req.job_id)))?;

    info!(job_id = job.id, "manual backup triggered");
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.execute_job(&job).await;
    });
    Ok(Json(TriggerResponse {
        job_id: req.job_id,
        status: "started",
    }))
}

#[derive(Debug, Deserialize)]
struct BackupListQuery {
    job_id: Option<i64>,
    target_type: Option<String>,
    target_id: Option<i64>,
}

impl BackupListQuery {
    fn into_filter(self) -> Result<BackupFilter, String> {
        let target = match (self.target_type, self.target_id) {
            (Some(kind), Some(id)) => Some(ConcreteTarget::from_parts(&kind, id)?),
            (None, None) => None,
            _ => return Err("target_type and target_id must be given together".to_owned()),
        };
        Ok(BackupFilter {
            job_id: self.job_id,
            target,
        })
    }
}

async fn list_backups(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<BackupListQuery>,
) -> ApiResult<Json<Vec<Backup>>> {
    require_api_auth(&state, &headers)?;
    let filter = query.into_filter().map_err(ApiError::bad_request)?;
    let backups = state
        .store
        .list_backups(&filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(backups))
}

async fn get_backup(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Backup>> {
    require_api_auth(&state, &headers)?;
    let backup = state
        .store
        .get_backup(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("backup {id} not found")))?;
    Ok(Json(backup))
}

// --- local files ---

/// The configured root, or else the first enabled local destination's path,
/// or the default one.
async fn local_root(state: &AppState) -> ApiResult<PathBuf> {
    if let Some(root) = &state.local_root {
        return Ok(root.clone());
    }
    let destinations = state
        .store
        .list_destinations()
        .await
        .map_err(ApiError::internal)?;
    Ok(destinations
        .iter()
        .filter(|d| d.enabled && d.kind == DestinationKind::Local)
        .find_map(|d| d.parse_config::<LocalConfig>().ok())
        .map(|c| PathBuf::from(c.path_or_default()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_PATH)))
}

#[derive(Debug, Serialize)]
struct LocalFile {
    name: String,
    size_bytes: u64,
    modified_at: Option<DateTime<Utc>>,
}

async fn list_local_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<LocalFile>>> {
    require_api_auth(&state, &headers)?;
    let root = local_root(&state).await?;
    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Json(Vec::new())),
        Err(e) => return Err(ApiError::internal(e.into())),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::internal(e.into()))?
    {
        let meta = entry
            .metadata()
            .await
            .map_err(|e| ApiError::internal(e.into()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Archives still being written carry a `.part` suffix.
        if !meta.is_file() || name.ends_with(".part") {
            continue;
        }
        files.push(LocalFile {
            name,
            size_bytes: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    Ok(Json(files))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    file: String,
}

/// A bare file name inside the root; anything with separators or `..` is
/// refused.
fn local_file_path(root: &FsPath, name: &str) -> Result<PathBuf, StatusCode> {
    let mut components = FsPath::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(root.join(name)),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

async fn download_local_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    require_api_auth(&state, &headers)?;
    let local_root = local_root(&state).await?;
    let path = local_file_path(&local_root, &query.file)?;

    // Symlinks pointing out of the root are refused too.
    let canonical = tokio::fs::canonicalize(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("{} not found", query.file)))?;
    let root = tokio::fs::canonicalize(&local_root)
        .await
        .map_err(|_| ApiError::not_found(format!("{} not found", query.file)))?;
    if !canonical.starts_with(&root) {
        return Err(StatusCode::FORBIDDEN.into());
    }

    let file = tokio::fs::File::open(&canonical)
        .await
        .map_err(|_| ApiError::not_found(format!("{} not found", query.file)))?;
    let meta = file.metadata().await.map_err(|e| ApiError::internal(e.into()))?;
    if !meta.is_file() {
        return Err(ApiError::not_found(format!("{} not found", query.file)));
    }
    let disposition = format!("attachment; filename=\"{}\"", query.file.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, meta.len().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
