//! File record repository.

use crate::error::MetadataResult;
use crate::models::{FileRecordRow, NewFileRecord};
use async_trait::async_trait;
use filevault_core::FileId;

/// Repository for file version records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Append a record for a newly stored version.
    ///
    /// Fails with `AlreadyExists` if the same (file, version) pair was recorded before.
    async fn record_version(&self, record: &NewFileRecord) -> MetadataResult<FileRecordRow>;

    /// Latest record of every file the owner has, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<FileRecordRow>>;

    /// Latest record for one file, if the owner has it.
    async fn get_latest(
        &self,
        owner_id: &str,
        file_id: &FileId,
    ) -> MetadataResult<Option<FileRecordRow>>;

    /// Every record for one file, oldest first.
    async fn list_history(
        &self,
        owner_id: &str,
        file_id: &FileId,
    ) -> MetadataResult<Vec<FileRecordRow>>;

    /// Remove the most recent record for a file.
    ///
    /// Returns whether a record was removed. Absence is not an error.
    async fn delete_latest(&self, owner_id: &str, file_id: &FileId) -> MetadataResult<bool>;
}
