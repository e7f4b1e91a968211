//! HTTP sync surface.
//!
//! Read endpoints project over the content and identity stores without
//! taking the vault writer lock. Write endpoints run under it, then fan
//! out mirrored CRDT updates to the vault's connected devices.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use scion_core::{
    sha256_hex, BatchCoordinator, ErrorKind, IdentityRecord, RenameDetector, ScionError,
    SyncOutcome, WireOp, MAX_CONTENT_BYTES,
};

use crate::registry::{VaultHandle, VaultWriter};
use crate::sync::{ChannelMessage, MessageKind, SERVER_DEVICE_ID};
use crate::AppState;

/// API error that converts to a proper HTTP response.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ScionError> for ApiError {
    fn from(err: ScionError) -> Self {
        match err.kind() {
            ErrorKind::Validation | ErrorKind::Conflict => Self::bad_request(err.to_string()),
            ErrorKind::NotFound => Self::not_found(err.to_string()),
            ErrorKind::Backend => {
                // Backend failures may carry filesystem paths; log the
                // detail, return a generic message.
                error!("backend failure: {err}");
                Self::internal("internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn decode_content(content: &str) -> Result<Vec<u8>, ApiError> {
    let bytes = BASE64
        .decode(content)
        .map_err(|_| ApiError::bad_request("content is not valid base64"))?;
    if bytes.len() > MAX_CONTENT_BYTES {
        return Err(ApiError::bad_request(format!(
            "decoded content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(bytes)
}

// ==================== DTOs ====================

#[derive(Debug, Serialize)]
pub struct ManifestRow {
    pub file_id: String,
    pub path: String,
    pub hash: String,
    pub commit: String,
    pub updated_at: i64,
}

impl From<IdentityRecord> for ManifestRow {
    fn from(record: IdentityRecord) -> Self {
        Self {
            file_id: record.file_id,
            path: record.current_path,
            hash: record.content_hash.unwrap_or_default(),
            commit: record.last_commit.unwrap_or_default(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ManifestResponse {
    pub files: Vec<ManifestRow>,
    pub head_commit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    /// Read the file at a historical commit instead of HEAD.
    pub commit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub path: String,
    pub commits: Vec<scion_core::CommitInfo>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub head_commit: Option<String>,
    pub changed_files: Vec<String>,
    pub has_changes: bool,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub path: String,
    /// Base64 of the raw bytes.
    pub content: String,
    #[serde(default)]
    pub base_commit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub file_id: String,
    pub commit: String,
    pub hash: String,
    pub merged: bool,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
}

impl From<SyncOutcome> for SyncResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            success: true,
            file_id: outcome.file_id,
            commit: outcome.commit,
            hash: outcome.hash,
            merged: outcome.merged,
            has_conflicts: outcome.has_conflicts,
            merged_content: outcome.merged_content.map(|b| BASE64.encode(b)),
        }
    }
}

fn default_atomic() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<WireOp>,
    #[serde(default = "default_atomic")]
    pub atomic: bool,
}

#[derive(Debug, Deserialize)]
pub struct DetectRenameRequest {
    pub missing_path: String,
    pub missing_hash: String,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub file_id: String,
    pub old_path: String,
    pub new_path: String,
    /// Base64 of new bytes written at the new path in the same commit.
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RenameResponse {
    pub success: bool,
    pub file_id: String,
    pub commit: String,
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub commit: String,
}

// ==================== CRDT mirroring ====================

/// Mirror a committed write into the vault CRDTs, collecting the frames to
/// fan out. Mirroring failures are logged, never surfaced: the commit is
/// already durable.
fn mirror_write(
    writer: &mut VaultWriter,
    vault: &str,
    file_id: &str,
    path: &str,
    hash: Option<&str>,
    bytes: Option<&[u8]>,
    deleted: bool,
) -> Vec<ChannelMessage> {
    let mut frames = Vec::new();
    match writer.crdt.record_structure(file_id, path, hash, deleted) {
        Ok(Some(update)) => frames.push(ChannelMessage::update(
            MessageKind::StructureUpdate,
            vault,
            SERVER_DEVICE_ID,
            None,
            &update,
        )),
        Ok(None) => {}
        Err(err) => warn!(vault, file_id, "structure mirror failed: {err}"),
    }
    if let Some(text) = bytes.and_then(|b| std::str::from_utf8(b).ok()) {
        match writer.crdt.record_content(file_id, text) {
            Ok(Some(update)) => frames.push(ChannelMessage::update(
                MessageKind::YjsUpdate,
                vault,
                SERVER_DEVICE_ID,
                Some(file_id.to_string()),
                &update,
            )),
            Ok(None) => {}
            Err(err) => warn!(vault, file_id, "content mirror failed: {err}"),
        }
    }
    frames
}

async fn fan_out(state: &AppState, vault: &str, frames: Vec<ChannelMessage>) {
    for frame in frames {
        state.hub.broadcast(vault, SERVER_DEVICE_ID, &frame).await;
    }
}

// ==================== Handlers ====================

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /ws/status
pub async fn ws_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.status().await)
}

/// GET /vault/:v/manifest
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(vault): Path<String>,
) -> Result<Json<ManifestResponse>, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let store = handle.read_store()?;
    let head_commit = store.head()?;
    let files = handle
        .identity
        .active_records()?
        .into_iter()
        .map(ManifestRow::from)
        .collect();
    Ok(Json(ManifestResponse { files, head_commit }))
}

/// GET /vault/:v/status?since=<commit>
pub async fn get_status(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let store = handle.read_store()?;
    let (head_commit, changed_files) = store.changed_since(query.since.as_deref())?;
    let has_changes = !changed_files.is_empty();
    Ok(Json(StatusResponse {
        head_commit,
        changed_files,
        has_changes,
    }))
}

fn file_response(
    bytes: Vec<u8>,
    headers: &[(&'static str, &str)],
) -> Result<Response, ApiError> {
    let mut response = (StatusCode::OK, bytes).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(*name, value);
        }
    }
    Ok(response)
}

/// GET /vault/:v/file/*path
pub async fn get_file(
    State(state): State<AppState>,
    Path((vault, path)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    if scion_core::is_reserved_path(&path) {
        return Err(ApiError::not_found(format!("file: '{path}'")));
    }
    let store = handle.read_store()?;

    let (bytes, commit) = match &query.commit {
        Some(at) => {
            let Some(bytes) = store.read_at(at, &path)? else {
                return Err(ApiError::not_found(format!("file '{path}' at '{at}'")));
            };
            (bytes, at.clone())
        }
        None => {
            let Some(bytes) = store.read_current(&path)? else {
                return Err(ApiError::not_found(format!("file: '{path}'")));
            };
            let commit = match handle.identity.get_by_path(&path)? {
                Some(record) => record.last_commit,
                None => None,
            }
            .or(store.head()?)
            .unwrap_or_default();
            (bytes, commit)
        }
    };
    let hash = sha256_hex(&bytes);

    file_response(
        bytes,
        &[("x-file-commit", &commit), ("x-file-hash", &hash)],
    )
}

/// GET /vault/:v/history/*path
pub async fn get_history(
    State(state): State<AppState>,
    Path((vault, path)): Path<(String, String)>,
) -> Result<Json<HistoryResponse>, ApiError> {
    const HISTORY_LIMIT: usize = 100;

    let handle = state.registry.get_or_create(&vault).await?;
    if scion_core::is_reserved_path(&path) {
        return Err(ApiError::not_found(format!("file: '{path}'")));
    }
    let store = handle.read_store()?;
    let commits = store.history(&path, HISTORY_LIMIT)?;
    if commits.is_empty() {
        return Err(ApiError::not_found(format!("history: '{path}'")));
    }
    Ok(Json(HistoryResponse { path, commits }))
}

/// GET /vault/:v/file-by-id/:id
pub async fn get_file_by_id(
    State(state): State<AppState>,
    Path((vault, file_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let Some(record) = handle.identity.get_by_id(&file_id)? else {
        return Err(ApiError::not_found(format!("file_id: '{file_id}'")));
    };
    let store = handle.read_store()?;
    let Some(bytes) = store.read_current(&record.current_path)? else {
        return Err(ApiError::not_found(format!(
            "file_id '{file_id}' at '{}'",
            record.current_path
        )));
    };
    let hash = sha256_hex(&bytes);
    let commit = record.last_commit.clone().or(store.head()?).unwrap_or_default();

    file_response(
        bytes,
        &[
            ("x-file-id", &record.file_id),
            ("x-file-path", &record.current_path),
            ("x-file-commit", &commit),
            ("x-file-hash", &hash),
        ],
    )
}

/// POST /vault/:v/sync
pub async fn post_sync(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let bytes = decode_content(&request.content)?;

    let (outcome, frames) = {
        let mut writer = handle.writer.lock().await;
        let outcome =
            writer
                .engine
                .sync_file(&request.path, &bytes, request.base_commit.as_deref())?;
        let frames = if outcome.has_conflicts {
            Vec::new()
        } else {
            // Mirror what was committed: for a merge that is the merge
            // result, not the client's upload.
            let committed = if outcome.merged {
                writer
                    .engine
                    .store()
                    .read_current(&request.path)
                    .ok()
                    .flatten()
            } else {
                Some(bytes.clone())
            };
            mirror_write(
                &mut writer,
                &vault,
                &outcome.file_id,
                &request.path,
                Some(&outcome.hash),
                committed.as_deref(),
                false,
            )
        };
        (outcome, frames)
    };
    fan_out(&state, &vault, frames).await;

    Ok(Json(SyncResponse::from(outcome)))
}

/// POST /vault/:v/sync/v2
pub async fn post_sync_v2(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    if request.operations.is_empty() {
        return Err(ApiError::bad_request("sync/v2: empty operation set"));
    }

    let (report, frames) = {
        let mut writer = handle.writer.lock().await;
        let report =
            BatchCoordinator::execute(&writer.engine, &request.operations, request.atomic);
        let frames = mirror_batch(&mut writer, &vault, &handle, &report.results);
        (report, frames)
    };
    fan_out(&state, &vault, frames).await;

    let status = if request.atomic && !report.success {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

/// Mirror every committed batch operation into the CRDTs by re-reading
/// the identity rows the batch touched.
fn mirror_batch(
    writer: &mut VaultWriter,
    vault: &str,
    handle: &VaultHandle,
    results: &[scion_core::OpResult],
) -> Vec<ChannelMessage> {
    let mut frames = Vec::new();
    for result in results.iter().filter(|r| r.success) {
        let Some(file_id) = &result.file_id else {
            continue;
        };
        let record = match handle.identity.get_by_id(file_id) {
            Ok(record) => record,
            Err(err) => {
                warn!(vault, file_id, "batch mirror lookup failed: {err}");
                continue;
            }
        };
        match record {
            Some(record) => {
                let bytes = writer
                    .engine
                    .store()
                    .read_current(&record.current_path)
                    .ok()
                    .flatten();
                frames.extend(mirror_write(
                    writer,
                    vault,
                    file_id,
                    &record.current_path,
                    record.content_hash.as_deref(),
                    bytes.as_deref(),
                    false,
                ));
            }
            None => {
                // Deleted by this batch: tombstone whatever entry exists.
                if let Ok(Some(tombstoned)) = handle.identity.get_by_id_any(file_id) {
                    frames.extend(mirror_write(
                        writer,
                        vault,
                        file_id,
                        &tombstoned.current_path,
                        None,
                        None,
                        true,
                    ));
                }
            }
        }
    }
    frames
}

/// POST /vault/:v/detect-rename
pub async fn post_detect_rename(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Json(request): Json<DetectRenameRequest>,
) -> Result<Response, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let detector = RenameDetector::new(&handle.identity);
    let detection =
        detector.detect(&request.missing_path, &request.missing_hash, request.file_id.as_deref())?;
    Ok(Json(detection).into_response())
}

/// POST /vault/:v/rename
pub async fn post_rename(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<RenameResponse>, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    let bytes = match &request.content {
        Some(content) => Some(decode_content(content)?),
        None => None,
    };

    let (outcome, frames) = {
        let mut writer = handle.writer.lock().await;
        let outcome = writer.engine.rename(
            &request.file_id,
            &request.old_path,
            &request.new_path,
            bytes.as_deref(),
        )?;
        let frames = mirror_write(
            &mut writer,
            &vault,
            &outcome.file_id,
            &request.new_path,
            Some(&outcome.hash),
            bytes.as_deref(),
            false,
        );
        (outcome, frames)
    };
    fan_out(&state, &vault, frames).await;

    Ok(Json(RenameResponse {
        success: true,
        file_id: outcome.file_id,
        commit: outcome.commit,
        hash: outcome.hash,
    }))
}

/// DELETE /vault/:v/file/*path
pub async fn delete_file(
    State(state): State<AppState>,
    Path((vault, path)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let handle = state.registry.get_or_create(&vault).await?;
    if scion_core::is_reserved_path(&path) {
        return Err(ApiError::not_found(format!("file: '{path}'")));
    }
    let Some(record) = handle.identity.get_by_path(&path)? else {
        return Err(ApiError::not_found(format!("file: '{path}'")));
    };

    let (outcome, frames) = {
        let mut writer = handle.writer.lock().await;
        let outcome = writer.engine.delete(&record.file_id)?;
        let frames = mirror_write(
            &mut writer,
            &vault,
            &outcome.file_id,
            &path,
            None,
            None,
            true,
        );
        (outcome, frames)
    };
    fan_out(&state, &vault, frames).await;

    Ok(Json(DeleteResponse {
        success: true,
        commit: outcome.commit,
    }))
}
