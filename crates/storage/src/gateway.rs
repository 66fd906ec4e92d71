//! Versioning-aware facade over an [`ObjectStore`].
//!
//! The gateway speaks the core error taxonomy: connectivity problems become
//! `StorageUnavailable`, missing objects become `ObjectNotFound`.

use crate::traits::{ByteStream, ObjectAttributes, ObjectStore};
use bytes::Bytes;
use filevault_core::file::VersionInfo;
use filevault_core::{Error, FileId, Result, StoredObjectVersion, VersionId};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::instrument;

#[derive(Clone)]
pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Upload `body` as a new version.
    ///
    /// With no `logical_id` a fresh object ID is minted; otherwise the store
    /// assigns a new version under the existing one. On any failure the
    /// partial upload is aborted, so nothing half-written becomes visible.
    #[instrument(skip(self, body), fields(backend = self.store.backend_name()))]
    pub async fn upload<S>(
        &self,
        body: S,
        logical_id: Option<FileId>,
        file_name: &str,
        content_type: &str,
    ) -> Result<StoredObjectVersion>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send,
    {
        let object_id = logical_id.unwrap_or_default();
        let attributes = ObjectAttributes {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
        };
        let mut upload = self.store.put_stream(&object_id, attributes).await?;

        let mut body = std::pin::pin!(body);
        while let Some(next) = body.next().await {
            let outcome = match next {
                Ok(bytes) => upload.write(bytes).await.map_err(Error::from),
                Err(e) => Err(Error::IoFailure(format!("reading upload source: {e}"))),
            };
            if let Err(err) = outcome {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(
                        object_id = %object_id,
                        error = %abort_err,
                        "Failed to abort object upload"
                    );
                }
                return Err(err);
            }
        }

        let stored = upload.finish().await?;
        tracing::debug!(
            object_id = %stored.object_id,
            version_id = %stored.version_id,
            size = stored.size,
            "Stored object version"
        );
        Ok(stored)
    }

    /// Stream a version of an object. `None` selects the latest.
    pub async fn get_object(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> Result<(StoredObjectVersion, ByteStream)> {
        Ok(self.store.get_stream(object_id, version).await?)
    }

    /// Version IDs of an object, oldest first.
    pub async fn list_versions(&self, object_id: &FileId) -> Result<Vec<VersionInfo>> {
        Ok(self.store.list_versions(object_id).await?)
    }

    pub async fn health_check(&self) -> Result<()> {
        Ok(self.store.health_check().await?)
    }
}
