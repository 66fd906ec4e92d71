//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use filevault_core::{FileId, FileRecord, VersionId};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// One stored version of a logical file.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecordRow {
    /// Insertion order. Later records for a file are newer versions.
    pub record_id: i64,
    pub file_id: Uuid,
    pub owner_id: String,
    pub parent_file_id: Option<Uuid>,
    pub version_id: String,
    pub file_name: String,
    pub size: i64,
    pub content_type: String,
    pub created_at: OffsetDateTime,
}

impl FileRecordRow {
    /// Convert to the API representation.
    pub fn into_record(self) -> MetadataResult<FileRecord> {
        let version_id = VersionId::parse(&self.version_id).map_err(|e| {
            MetadataError::Internal(format!("record {}: {e}", self.record_id))
        })?;
        let size = u64::try_from(self.size).map_err(|_| {
            MetadataError::Internal(format!(
                "record {}: negative size {}",
                self.record_id, self.size
            ))
        })?;
        Ok(FileRecord {
            file_id: FileId::from_uuid(self.file_id),
            owner_id: self.owner_id,
            parent_file_id: self.parent_file_id.map(FileId::from_uuid),
            version_id,
            file_name: self.file_name,
            size,
            content_type: self.content_type,
            created_at: self.created_at,
        })
    }
}

/// Input for appending a record.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub file_id: FileId,
    pub owner_id: String,
    pub parent_file_id: Option<FileId>,
    pub version_id: VersionId,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: OffsetDateTime,
}
