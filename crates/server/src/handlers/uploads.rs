//! Chunked upload handlers.

use crate::auth::CallerIdentity;
use crate::error::{ApiError, ApiResult};
use crate::metrics::record_upload_error;
use crate::receipt::{AbortOutcome, IncomingChunk};
use crate::state::AppState;
use axum::Json;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::StatusCode;
use bytes::Bytes;
use filevault_core::upload::{
    ChunkAck, SessionCreated, SessionRejected, StartUploadEntry, StartUploadRequest,
    StartUploadResponse, UploadStatusResponse,
};
use filevault_core::{ChunkHints, FileId, UploadId};

/// Maximum request body size for start-upload requests (1 MiB).
const MAX_START_BODY_SIZE: usize = 1024 * 1024;

/// POST /api/v1/files/start-upload - Open one session per file.
///
/// Items are validated independently. The call fails only when every item
/// is rejected; otherwise each entry carries its own session or error.
#[tracing::instrument(skip(state, caller, req), fields(owner_id = %caller.user_id))]
pub async fn start_upload(
    State(state): State<AppState>,
    caller: CallerIdentity,
    req: Request,
) -> ApiResult<Json<StartUploadResponse>> {
    let body: StartUploadRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_START_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let items = body.into_items();
    if items.is_empty() {
        return Err(ApiError::BadRequest("no files to upload".to_string()));
    }
    let max_batch = state.config.server.max_batch_size;
    if items.len() > max_batch {
        return Err(ApiError::BadRequest(format!(
            "{} files requested, at most {max_batch} per call",
            items.len()
        )));
    }

    let results = state.sessions.create_sessions(&caller.user_id, &items).await;

    let mut entries = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (item, result) in items.iter().zip(results) {
        match result {
            Ok(session) => entries.push(StartUploadEntry::Created(SessionCreated::from(&session))),
            Err(e) => {
                record_upload_error(e.kind());
                entries.push(StartUploadEntry::Rejected(SessionRejected {
                    file_name: item.file_name.clone(),
                    error: e.to_string(),
                }));
                first_error.get_or_insert(e);
            }
        }
    }

    let any_created = entries
        .iter()
        .any(|e| matches!(e, StartUploadEntry::Created(_)));
    if !any_created && let Some(err) = first_error {
        return Err(err.into());
    }

    Ok(Json(StartUploadResponse {
        upload_sessions: entries,
    }))
}

/// Parsed multipart fields of an upload-chunk request.
#[derive(Default)]
struct ChunkForm {
    upload_session_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_id: Option<String>,
    parent_file_id: Option<String>,
    content_type: Option<String>,
    data: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                form.content_type = field
                    .content_type()
                    .map(str::to_string)
                    .filter(|ct| !ct.is_empty());
                form.data = Some(field.bytes().await.map_err(|e| {
                    ApiError::BadRequest(format!("failed to read chunk payload: {e}"))
                })?);
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read field {name}: {e}")))?;
            let slot = match name.as_str() {
                "uploadSessionId" => &mut form.upload_session_id,
                "chunkIndex" => &mut form.chunk_index,
                "totalChunks" => &mut form.total_chunks,
                "fileID" => &mut form.file_id,
                "parentFileID" => &mut form.parent_file_id,
                _ => continue,
            };
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                *slot = Some(trimmed.to_string());
            }
        }
        Ok(form)
    }

    fn into_chunk(self) -> ApiResult<IncomingChunk> {
        let upload_id = self
            .upload_session_id
            .ok_or_else(|| ApiError::BadRequest("uploadSessionId is required".to_string()))?;
        let upload_id = UploadId::parse(&upload_id)?;
        let chunk_index = parse_count("chunkIndex", self.chunk_index)?;
        let total_chunks = parse_count("totalChunks", self.total_chunks)?;
        let data = self
            .data
            .ok_or_else(|| ApiError::BadRequest("file part is required".to_string()))?;

        let hints = ChunkHints {
            file_id: self.file_id.as_deref().map(FileId::parse).transpose()?,
            parent_file_id: self
                .parent_file_id
                .as_deref()
                .map(FileId::parse)
                .transpose()?,
            content_type: self.content_type,
        };

        Ok(IncomingChunk {
            upload_id,
            chunk_index,
            total_chunks,
            hints,
            data,
        })
    }
}

fn parse_count(field: &str, value: Option<String>) -> ApiResult<u64> {
    let value = value.ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))?;
    value
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be a non-negative integer")))
}

/// POST /api/v1/files/upload-chunk - Receive one chunk of a session.
#[tracing::instrument(skip(state, caller, req), fields(owner_id = %caller.user_id))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    caller: CallerIdentity,
    req: Request,
) -> ApiResult<Json<ChunkAck>> {
    let multipart = Multipart::from_request(req, &state)
        .await
        .map_err(|e| ApiError::BadRequest(format!("expected multipart form: {e}")))?;
    let form = ChunkForm::read(multipart).await?;
    let chunk = form.into_chunk()?;

    match state.receiver.receive_chunk(&caller.user_id, chunk).await {
        Ok(ack) => Ok(Json(ack)),
        Err(e) => {
            record_upload_error(e.kind());
            Err(e.into())
        }
    }
}

/// GET /api/v1/files/uploads/{upload_id} - Progress of a session, for resuming.
pub async fn get_upload_status(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let upload_id = UploadId::parse(&upload_id)?;
    let session = state
        .receiver
        .session_for(&caller.user_id, &upload_id)
        .await?;
    Ok(Json(UploadStatusResponse::from(&session)))
}

/// POST /api/v1/files/uploads/{upload_id}/complete - Retry the storage step.
#[tracing::instrument(skip(state, caller), fields(owner_id = %caller.user_id))]
pub async fn retry_completion(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<ChunkAck>> {
    let upload_id = UploadId::parse(&upload_id)?;
    match state
        .receiver
        .retry_completion(&caller.user_id, &upload_id)
        .await
    {
        Ok(ack) => Ok(Json(ack)),
        Err(e) => {
            record_upload_error(e.kind());
            Err(e.into())
        }
    }
}

/// DELETE /api/v1/files/uploads/{upload_id} - Abandon a session.
#[tracing::instrument(skip(state, caller), fields(owner_id = %caller.user_id))]
pub async fn cancel_upload(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    // A malformed ID cannot name a live session.
    let Ok(upload_id) = UploadId::parse(&upload_id) else {
        return Ok(StatusCode::NO_CONTENT);
    };
    match state.receiver.abort(&caller.user_id, &upload_id).await {
        AbortOutcome::Aborted | AbortOutcome::NotFound => Ok(StatusCode::NO_CONTENT),
        AbortOutcome::Busy => Err(ApiError::Conflict(
            "upload is being reassembled".to_string(),
        )),
    }
}
