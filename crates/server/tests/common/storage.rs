//! Object store test doubles.

use async_trait::async_trait;
use filevault_core::file::VersionInfo;
use filevault_core::{FileId, StoredObjectVersion, VersionId};
use filevault_storage::{
    ByteStream, ObjectAttributes, ObjectStore, StorageError, StorageResult, StreamingUpload,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wraps a real store, counting uploads and optionally refusing them, either
/// as if the backend were unreachable or as a permanent rejection.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct CountingStore {
    inner: Arc<dyn ObjectStore>,
    puts: AtomicUsize,
    offline: AtomicBool,
    rejecting: AtomicBool,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
        }
    }

    /// Number of uploads started, successful or not.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every new upload with an error retrying cannot fix.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_stream(
        &self,
        object_id: &FileId,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "object store offline",
            )));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidKey(format!(
                "object key {object_id} rejected"
            )));
        }
        self.inner.put_stream(object_id, attributes).await
    }

    async fn get_stream(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<(StoredObjectVersion, ByteStream)> {
        self.inner.get_stream(object_id, version).await
    }

    async fn head(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<StoredObjectVersion> {
        self.inner.head(object_id, version).await
    }

    async fn list_versions(&self, object_id: &FileId) -> StorageResult<Vec<VersionInfo>> {
        self.inner.list_versions(object_id).await
    }

    async fn exists(&self, object_id: &FileId) -> StorageResult<bool> {
        self.inner.exists(object_id).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
