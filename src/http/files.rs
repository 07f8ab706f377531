//! File CRUD for a workspace.
//!
//! Creating or deleting a file also updates the hub and notifies every live
//! connection with a lifecycle event.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::auth::AuthWorkspace;
use crate::storage::{content_hash, FileRecord, NewFile};
use crate::sync::protocol::FileEvent;
use crate::sync::{FileId, WorkspaceId};

#[derive(Debug, Serialize)]
pub struct FileResponse {
    id: FileId,
    path: String,
    mime_type: String,
    hash: String,
    version: u64,
    created_at: i64,
    updated_at: i64,
}

impl From<FileRecord> for FileResponse {
    fn from(file: FileRecord) -> Self {
        Self {
            id: file.id,
            path: file.workspace_path,
            mime_type: file.mime_type,
            hash: file.hash,
            version: file.version,
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileContentResponse {
    #[serde(flatten)]
    file: FileResponse,
    /// Base64 of the current content
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFileRequest {
    path: String,
    /// Base64 of the initial content
    #[serde(default)]
    content: String,
}

fn mime_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "md" || ext == "markdown" => "text/markdown; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    }
}

/// Fetch a file, hiding files of other workspaces
async fn owned_file(
    state: &AppState,
    workspace_id: WorkspaceId,
    id: FileId,
) -> Result<FileRecord, ApiError> {
    match state.repo.fetch_file(id).await? {
        Some(file) if file.workspace_id == workspace_id => Ok(file),
        _ => Err(ApiError::NotFound(format!("File {}", id))),
    }
}

/// List the caller's files
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Extension(AuthWorkspace(workspace_id)): Extension<AuthWorkspace>,
) -> Result<Json<Vec<FileResponse>>, ApiError> {
    let files = state.repo.fetch_files(workspace_id).await?;
    Ok(Json(files.into_iter().map(FileResponse::from).collect()))
}

/// Get one file with its current content
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Extension(AuthWorkspace(workspace_id)): Extension<AuthWorkspace>,
    Path(id): Path<FileId>,
) -> Result<Json<FileContentResponse>, ApiError> {
    let file = owned_file(&state, workspace_id, id).await?;

    let content = match state.hub.file_content(id).await {
        Some(text) => text.into_bytes(),
        None => state.storage.read_object(&file.disk_path).await?,
    };

    Ok(Json(FileContentResponse {
        file: file.into(),
        content: STANDARD.encode(content),
    }))
}

/// Create a file and announce it
pub async fn create_file(
    State(state): State<Arc<AppState>>,
    Extension(AuthWorkspace(workspace_id)): Extension<AuthWorkspace>,
    Json(payload): Json<CreateFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path must not be empty".to_string()));
    }
    let bytes = STANDARD
        .decode(payload.content.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("content is not valid base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ApiError::BadRequest("content must be UTF-8 text".to_string()))?;

    let disk_path = state.storage.create_object(text.as_bytes()).await?;
    let new_file = NewFile {
        disk_path: disk_path.clone(),
        workspace_path: payload.path.clone(),
        mime_type: mime_type_for(&payload.path).to_string(),
        hash: content_hash(text.as_bytes()),
        workspace_id,
    };

    let file = match state.repo.add_file(new_file).await {
        Ok(file) => file,
        Err(e) => {
            if let Err(cleanup) = state.storage.delete_object(&disk_path).await {
                warn!("Failed to remove orphaned object {}: {}", disk_path, cleanup);
            }
            return Err(e.into());
        }
    };

    state.hub.track_file(file.id, text).await;
    state
        .hub
        .process_event(None, file.id, FileEvent::Create)
        .await;

    info!(file_id = file.id, workspace_id, "Created file {}", file.workspace_path);
    Ok((StatusCode::CREATED, Json(FileResponse::from(file))))
}

/// Delete a file and announce it
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(AuthWorkspace(workspace_id)): Extension<AuthWorkspace>,
    Path(id): Path<FileId>,
) -> Result<StatusCode, ApiError> {
    let file = owned_file(&state, workspace_id, id).await?;

    state.storage.delete_object(&file.disk_path).await?;
    state.repo.delete_file(id).await?;
    state.hub.forget_file(id).await;
    state.hub.process_event(None, id, FileEvent::Delete).await;

    info!(file_id = id, workspace_id, "Deleted file {}", file.workspace_path);
    Ok(StatusCode::NO_CONTENT)
}
