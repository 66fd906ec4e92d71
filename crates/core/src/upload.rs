//! Upload session types and the chunk completion state machine.

use crate::file::FileId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
///
/// Backed by a random (v4) UUID and rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string. Accepts both the simple and hyphenated forms.
    ///
    /// A malformed identifier can never name a live session, so it is
    /// reported as an unknown session rather than a bad request.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| crate::Error::UnknownSession(s.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0.simple())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for UploadId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

/// Completion state of an upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    /// Chunks are still arriving.
    Open,
    /// Every chunk arrived and exactly one task is merging them.
    Reassembling,
    /// The merged file is on scratch but the object store was unreachable.
    AwaitingStore,
    /// Stored and recorded.
    Done,
    /// Terminal failure. Scratch is purged and the session is evicted.
    Failed,
}

impl CompletionState {
    /// Whether new chunks still change the session.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Reassembling => "reassembling",
            Self::AwaitingStore => "awaiting_store",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-chunk details the client may attach to any chunk request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkHints {
    /// Existing logical file this upload adds a version to.
    pub file_id: Option<FileId>,
    pub parent_file_id: Option<FileId>,
    pub content_type: Option<String>,
}

/// One in-flight chunked upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier. Also names the scratch area.
    pub id: UploadId,
    /// Caller identity that created the session.
    pub owner_id: String,
    pub file_name: String,
    /// Total file size in bytes, as declared at session start.
    pub declared_size: u64,
    pub chunk_size: u64,
    /// `ceil(declared_size / chunk_size)`.
    pub total_chunks: u64,
    /// Indices received so far. Only ever grows.
    pub received: BTreeSet<u64>,
    pub state: CompletionState,
    /// Logical file to append a version to, if the client named one.
    pub target_file_id: Option<FileId>,
    pub parent_file_id: Option<FileId>,
    pub content_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last time a chunk was accepted. Drives TTL expiry.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new open session. Callers validate sizes beforehand.
    pub fn new(
        owner_id: impl Into<String>,
        file_name: impl Into<String>,
        declared_size: u64,
        chunk_size: u64,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: UploadId::new(),
            owner_id: owner_id.into(),
            file_name: file_name.into(),
            declared_size,
            chunk_size,
            total_chunks: declared_size.div_ceil(chunk_size.max(1)),
            received: BTreeSet::new(),
            state: CompletionState::Open,
            target_file_id: None,
            parent_file_id: None,
            content_type: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether every index in `[0, total_chunks)` has arrived.
    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks
    }

    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Exact byte length chunk `index` must have.
    pub fn expected_chunk_len(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.declared_size - self.chunk_size * (self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }

    /// Check a chunk request against the session's fixed geometry.
    pub fn validate_chunk(&self, index: u64, claimed_total: u64, len: u64) -> crate::Result<()> {
        if claimed_total != self.total_chunks {
            return Err(crate::Error::InvalidRequest(format!(
                "totalChunks {claimed_total} does not match session ({})",
                self.total_chunks
            )));
        }
        if index >= self.total_chunks {
            return Err(crate::Error::InvalidRequest(format!(
                "chunkIndex {index} out of range [0, {})",
                self.total_chunks
            )));
        }
        let expected = self.expected_chunk_len(index);
        if len != expected {
            return Err(crate::Error::InvalidRequest(format!(
                "chunk {index} is {len} bytes, expected {expected}"
            )));
        }
        Ok(())
    }

    /// Record hints. The first non-empty value of each hint wins.
    pub fn apply_hints(&mut self, hints: &ChunkHints) {
        if self.target_file_id.is_none() {
            self.target_file_id = hints.file_id;
        }
        if self.parent_file_id.is_none() {
            self.parent_file_id = hints.parent_file_id;
        }
        if self.content_type.is_none() {
            self.content_type.clone_from(&hints.content_type);
        }
    }

    /// Content type to store the object under.
    pub fn effective_content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or(crate::DEFAULT_CONTENT_TYPE)
    }
}

/// One file in a start-upload request.
///
/// Fields default so that missing values surface as validation errors
/// rather than body decoding failures.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadItem {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<i64>,
}

/// Start-upload body: one item or an array of items.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartUploadRequest {
    Many(Vec<StartUploadItem>),
    One(StartUploadItem),
}

impl StartUploadRequest {
    pub fn into_items(self) -> Vec<StartUploadItem> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

/// A session that was created for one batch item.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub upload_session_id: String,
    pub file_name: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl From<&UploadSession> for SessionCreated {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_session_id: session.id.to_string(),
            file_name: session.file_name.clone(),
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
        }
    }
}

/// A batch item that failed validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRejected {
    pub file_name: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartUploadEntry {
    Created(SessionCreated),
    Rejected(SessionRejected),
}

/// Response from start-upload, one entry per requested file in request order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub upload_sessions: Vec<StartUploadEntry>,
}

/// Acknowledgement for one accepted chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkAck {
    Complete {
        message: String,
        #[serde(rename = "fileID")]
        file_id: FileId,
    },
    Partial {
        message: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u64,
    },
}

impl ChunkAck {
    pub fn partial(chunk_index: u64) -> Self {
        Self::Partial {
            message: "Chunk uploaded successfully".to_string(),
            chunk_index,
        }
    }

    pub fn complete(file_id: FileId) -> Self {
        Self::Complete {
            message: "File upload complete".to_string(),
            file_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Response from querying upload state. Lets clients resume after a disconnect.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_session_id: String,
    pub file_name: String,
    pub state: CompletionState,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub received_chunks: Vec<u64>,
    pub missing_chunks: Vec<u64>,
}

impl From<&UploadSession> for UploadStatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_session_id: session.id.to_string(),
            file_name: session.file_name.clone(),
            state: session.state,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received_chunks: session.received.iter().copied().collect(),
            missing_chunks: session.missing_chunks(),
        }
    }
}
