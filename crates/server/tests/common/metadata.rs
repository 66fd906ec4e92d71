//! Metadata store test doubles.

use async_trait::async_trait;
use filevault_core::FileId;
use filevault_metadata::{
    FileRecordRow, FileRepo, MetadataError, MetadataResult, MetadataStore, NewFileRecord,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Wraps a real store and can be told to reject new version records.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct FlakyMetadata {
    inner: Arc<dyn MetadataStore>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl FlakyMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FileRepo for FlakyMetadata {
    async fn record_version(&self, record: &NewFileRecord) -> MetadataResult<FileRecordRow> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MetadataError::Internal("database is read-only".to_string()));
        }
        self.inner.record_version(record).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<FileRecordRow>> {
        self.inner.list_by_owner(owner_id).await
    }

    async fn get_latest(
        &self,
        owner_id: &str,
        file_id: &FileId,
    ) -> MetadataResult<Option<FileRecordRow>> {
        self.inner.get_latest(owner_id, file_id).await
    }

    async fn list_history(
        &self,
        owner_id: &str,
        file_id: &FileId,
    ) -> MetadataResult<Vec<FileRecordRow>> {
        self.inner.list_history(owner_id, file_id).await
    }

    async fn delete_latest(&self, owner_id: &str, file_id: &FileId) -> MetadataResult<bool> {
        self.inner.delete_latest(owner_id, file_id).await
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }
}
