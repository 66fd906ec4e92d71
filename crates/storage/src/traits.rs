//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use filevault_core::file::VersionInfo;
use filevault_core::{FileId, StoredObjectVersion, VersionId};
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Attributes stored alongside every object version.
#[derive(Clone, Debug)]
pub struct ObjectAttributes {
    pub file_name: String,
    pub content_type: String,
}

/// Versioned object store.
///
/// Every finished upload creates a new version under the object ID. Versions
/// are never overwritten, and a version only becomes visible to readers once
/// the upload has fully finished.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Start a streaming upload of a new version of `object_id`.
    async fn put_stream(
        &self,
        object_id: &FileId,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Stream a version. `None` selects the latest one.
    async fn get_stream(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<(StoredObjectVersion, ByteStream)>;

    /// Describe a version without fetching content. `None` selects the latest one.
    async fn head(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<StoredObjectVersion>;

    /// All versions of an object, oldest first.
    ///
    /// Returns `NotFound` when the object has no versions.
    async fn list_versions(&self, object_id: &FileId) -> StorageResult<Vec<VersionInfo>>;

    /// Check if at least one version of an object exists.
    async fn exists(&self, object_id: &FileId) -> StorageResult<bool>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup and by the health endpoint. The default
    /// implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload, publishing the new version.
    async fn finish(self: Box<Self>) -> StorageResult<StoredObjectVersion>;

    /// Abort the upload. Nothing becomes visible.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
