//! Logical file and object version identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Stable identifier of a logical file across its version history.
///
/// The same value is used as the object store's object ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::InvalidRequest(format!("invalid file ID {s:?}: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum length accepted for a store-assigned version identifier.
const MAX_VERSION_ID_LEN: usize = 1024;

/// Version identifier assigned by the object store on every upload.
///
/// Opaque to the service. Validation only rejects values that could not
/// have come from a backend, so that they are safe to use in paths.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() || s.len() > MAX_VERSION_ID_LEN {
            return Err(crate::Error::InvalidRequest(format!(
                "version ID must be 1..={MAX_VERSION_ID_LEN} characters"
            )));
        }
        if s.contains("..")
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(crate::Error::InvalidRequest(format!(
                "invalid version ID: {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One immutable version produced by an object store upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObjectVersion {
    pub object_id: FileId,
    pub version_id: VersionId,
    pub content_type: String,
    pub size: u64,
    pub file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Entry in an object's version history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "versionID")]
    pub version_id: VersionId,
    pub size: u64,
    #[serde(rename = "lastModified", with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

/// Durable metadata for one stored version, as returned by the API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    #[serde(rename = "parentFileID")]
    pub parent_file_id: Option<FileId>,
    #[serde(rename = "versionID")]
    pub version_id: VersionId,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub size: u64,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub files: Vec<FileRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileVersionsResponse {
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    pub versions: Vec<VersionInfo>,
}

/// One file stored by the single-request upload endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "versionID")]
    pub version_id: VersionId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadFilesResponse {
    pub message: String,
    #[serde(rename = "uploadedFiles")]
    pub uploaded_files: Vec<UploadedFile>,
}
