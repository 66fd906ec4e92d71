//! File listing, download, version and delete handlers, plus single-request upload.

use crate::auth::CallerIdentity;
use crate::error::{ApiError, ApiResult};
use crate::metrics::{OBJECTS_STORED, record_upload_error};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use filevault_core::file::{
    FileVersionsResponse, ListFilesResponse, UploadFilesResponse, UploadedFile,
};
use filevault_core::{DEFAULT_CONTENT_TYPE, FileId, VersionId};
use filevault_metadata::{FileRecordRow, FileRepo, NewFileRecord};
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// RFC 5987 `attr-char`: everything but these is percent-encoded.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Every record the caller holds for a file, oldest first, or 404.
///
/// Object versions are only reachable through these records, so versions
/// written by anyone else under the same ID stay hidden.
async fn owned_history(
    state: &AppState,
    owner_id: &str,
    file_id: &FileId,
) -> ApiResult<Vec<FileRecordRow>> {
    let history = state.metadata.list_history(owner_id, file_id).await?;
    if history.is_empty() {
        return Err(ApiError::NotFound(format!("file {file_id}")));
    }
    Ok(history)
}

/// `attachment` disposition carrying both an ASCII fallback and the UTF-8 name.
fn content_disposition(file_name: &str) -> ApiResult<HeaderValue> {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(file_name, FILENAME_ENCODE_SET);
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .map_err(|e| ApiError::Internal(format!("invalid content disposition: {e}")))
}

/// GET /api/v1/files/list - Latest version of each of the caller's files.
pub async fn list_files(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> ApiResult<Json<ListFilesResponse>> {
    let rows = state.metadata.list_by_owner(&caller.user_id).await?;
    let files = rows
        .into_iter()
        .map(FileRecordRow::into_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ListFilesResponse { files }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
}

/// GET /api/v1/files/download/{file_id} - Stream the latest or a chosen version.
#[tracing::instrument(skip(state, caller, query), fields(owner_id = %caller.user_id))]
pub async fn download_file(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(file_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let file_id = FileId::parse(&file_id)?;
    let mut history = owned_history(&state, &caller.user_id, &file_id).await?;
    let requested = query.version_id.as_deref().filter(|v| !v.is_empty());
    let position = match requested {
        Some(version) => {
            let version = VersionId::parse(version)?;
            history
                .iter()
                .rposition(|row| row.version_id == version.as_str())
                .ok_or_else(|| ApiError::NotFound(format!("file {file_id} version {version}")))?
        }
        None => history.len() - 1,
    };
    let record = history.swap_remove(position).into_record()?;

    let (stored, stream) = state
        .gateway
        .get_object(&file_id, Some(&record.version_id))
        .await?;
    let (content_type, file_name) = (record.content_type, record.file_name);
    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    tracing::debug!(
        file_id = %file_id,
        version_id = %stored.version_id,
        size = stored.size,
        "Streaming download"
    );

    let body = Body::from_stream(stream.map(|chunk| {
        chunk.map_err(|e| {
            tracing::error!(error = %e, "Download failed mid-transfer");
            std::io::Error::other(e.to_string())
        })
    }));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_LENGTH, HeaderValue::from(stored.size)),
            (CONTENT_DISPOSITION, content_disposition(&file_name)?),
        ],
        body,
    )
        .into_response())
}

/// GET /api/v1/files/{file_id}/versions - The caller's stored versions, oldest first.
pub async fn list_versions(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(file_id): Path<String>,
) -> ApiResult<Json<FileVersionsResponse>> {
    let file_id = FileId::parse(&file_id)?;
    let history = owned_history(&state, &caller.user_id, &file_id).await?;
    let versions = state
        .gateway
        .list_versions(&file_id)
        .await?
        .into_iter()
        .filter(|v| history.iter().any(|row| row.version_id == v.version_id.as_str()))
        .collect();
    Ok(Json(FileVersionsResponse { file_id, versions }))
}

/// DELETE /api/v1/files/{file_id} - Drop the latest record of a file.
///
/// Succeeds whether or not the caller had such a file.
#[tracing::instrument(skip(state, caller), fields(owner_id = %caller.user_id))]
pub async fn delete_file(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(file_id): Path<String>,
) -> ApiResult<StatusCode> {
    let file_id = FileId::parse(&file_id)?;
    let removed = state
        .metadata
        .delete_latest(&caller.user_id, &file_id)
        .await?;
    tracing::info!(file_id = %file_id, removed, "File delete requested");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/files/upload - Store each `files` part as a new file.
#[tracing::instrument(skip(state, caller, req), fields(owner_id = %caller.user_id))]
pub async fn upload_files(
    State(state): State<AppState>,
    caller: CallerIdentity,
    req: Request,
) -> ApiResult<Json<UploadFilesResponse>> {
    let mut multipart = Multipart::from_request(req, &state)
        .await
        .map_err(|e| ApiError::BadRequest(format!("expected multipart form: {e}")))?;
    let max_size = state.config.server.max_single_upload_size;
    let max_files = state.config.server.max_batch_size;

    let mut uploaded = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("files") {
            continue;
        }
        if uploaded.len() >= max_files {
            return Err(ApiError::BadRequest(format!(
                "at most {max_files} files per request"
            )));
        }
        let file_name = field
            .file_name()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("each file needs a file name".to_string()))?;
        let content_type = field
            .content_type()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let received = AtomicU64::new(0);
        let body = field.map(|chunk| {
            let bytes = chunk.map_err(|e| std::io::Error::other(e.to_string()))?;
            let total = received.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
            if total > max_size {
                return Err(std::io::Error::other("file exceeds maximum upload size"));
            }
            Ok(bytes)
        });

        let stored = match state
            .gateway
            .upload(body, None, &file_name, &content_type)
            .await
        {
            Ok(stored) => stored,
            Err(_) if received.load(Ordering::Relaxed) > max_size => {
                record_upload_error("invalid_request");
                return Err(ApiError::BadRequest(format!(
                    "{file_name} exceeds maximum upload size of {max_size} bytes"
                )));
            }
            Err(e) => {
                record_upload_error(e.kind());
                return Err(e.into());
            }
        };
        OBJECTS_STORED.inc();

        state
            .metadata
            .record_version(&NewFileRecord {
                file_id: stored.object_id,
                owner_id: caller.user_id.clone(),
                parent_file_id: None,
                version_id: stored.version_id.clone(),
                file_name: file_name.clone(),
                size: stored.size,
                content_type: stored.content_type.clone(),
                created_at: stored.created_at,
            })
            .await?;

        tracing::info!(
            file_id = %stored.object_id,
            version_id = %stored.version_id,
            size = stored.size,
            "File uploaded"
        );
        uploaded.push(UploadedFile {
            file_id: stored.object_id,
            file_name,
            version_id: stored.version_id,
        });
    }

    if uploaded.is_empty() {
        return Err(ApiError::BadRequest(
            "no files part in request".to_string(),
        ));
    }

    Ok(Json(UploadFilesResponse {
        message: "Files uploaded successfully".to_string(),
        uploaded_files: uploaded,
    }))
}
