//! Session creation and teardown.

use crate::metrics::{
    ACTIVE_UPLOAD_SESSIONS, UPLOAD_SESSIONS_ABORTED, UPLOAD_SESSIONS_COMPLETED,
    UPLOAD_SESSIONS_CREATED, UPLOAD_SESSIONS_EXPIRED, UPLOAD_SESSIONS_FAILED,
};
use crate::registry::SessionRegistry;
use filevault_core::config::ServerConfig;
use filevault_core::upload::StartUploadItem;
use filevault_core::{Error, Result, UploadId, UploadSession};
use filevault_storage::ChunkStore;
use std::sync::Arc;

/// Why a session is being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownReason {
    Completed,
    Failed,
    Expired,
    Aborted,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }
}

/// Creates sessions with their scratch areas and destroys both together.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<dyn SessionRegistry>,
    chunks: ChunkStore,
    default_chunk_size: u64,
    max_chunk_size: u64,
}

impl SessionManager {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        chunks: ChunkStore,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            chunks,
            default_chunk_size: config.default_chunk_size,
            max_chunk_size: config.max_chunk_size,
        }
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Validate one start-upload item, allocate its scratch area and register
    /// it in the `Open` state.
    pub async fn create_session(
        &self,
        owner_id: &str,
        item: &StartUploadItem,
    ) -> Result<UploadSession> {
        let file_name = item.file_name.trim();
        if file_name.is_empty() {
            return Err(Error::InvalidRequest("fileName is required".to_string()));
        }
        if item.file_size <= 0 {
            return Err(Error::InvalidRequest(format!(
                "fileSize must be positive, got {}",
                item.file_size
            )));
        }
        let chunk_size = match item.chunk_size {
            Some(size) if size > 0 => size as u64,
            _ => self.default_chunk_size,
        };
        if chunk_size > self.max_chunk_size {
            return Err(Error::InvalidRequest(format!(
                "chunkSize {chunk_size} exceeds maximum {}",
                self.max_chunk_size
            )));
        }

        let session = UploadSession::new(owner_id, file_name, item.file_size as u64, chunk_size);
        self.chunks
            .create_area(&session.id)
            .await
            .map_err(|e| Error::IoFailure(format!("creating scratch area: {e}")))?;
        self.registry.insert(session.clone()).await;

        UPLOAD_SESSIONS_CREATED.inc();
        ACTIVE_UPLOAD_SESSIONS.inc();
        tracing::info!(
            upload_id = %session.id,
            owner_id = %owner_id,
            file_name = %session.file_name,
            declared_size = session.declared_size,
            chunk_size = session.chunk_size,
            total_chunks = session.total_chunks,
            "Upload session created"
        );
        Ok(session)
    }

    /// Create one session per item. Each item succeeds or fails on its own.
    pub async fn create_sessions(
        &self,
        owner_id: &str,
        items: &[StartUploadItem],
    ) -> Vec<Result<UploadSession>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(self.create_session(owner_id, item).await);
        }
        results
    }

    /// Remove a session from the registry and delete its scratch area.
    ///
    /// Safe to call more than once and for IDs that were never registered.
    /// Returns the removed session, if this call removed it.
    pub async fn teardown(&self, id: &UploadId, reason: TeardownReason) -> Option<UploadSession> {
        let removed = self.registry.remove(id).await;

        if let Err(e) = self.chunks.purge(id).await {
            tracing::warn!(
                upload_id = %id,
                error = %e,
                "Failed to purge scratch area"
            );
        }

        if removed.is_some() {
            ACTIVE_UPLOAD_SESSIONS.dec();
            match reason {
                TeardownReason::Completed => UPLOAD_SESSIONS_COMPLETED.inc(),
                TeardownReason::Failed => UPLOAD_SESSIONS_FAILED.inc(),
                TeardownReason::Expired => UPLOAD_SESSIONS_EXPIRED.inc(),
                TeardownReason::Aborted => UPLOAD_SESSIONS_ABORTED.inc(),
            }
            tracing::info!(
                upload_id = %id,
                reason = reason.as_str(),
                "Upload session torn down"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemorySessionRegistry;
    use filevault_core::CompletionState;

    async fn manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let chunks = ChunkStore::new(dir.path()).await.unwrap();
        let registry: Arc<dyn SessionRegistry> = Arc::new(InMemorySessionRegistry::new());
        let config = ServerConfig {
            default_chunk_size: 8,
            max_chunk_size: 32,
            ..ServerConfig::default()
        };
        (dir, SessionManager::new(registry, chunks, &config))
    }

    fn item(name: &str, size: i64, chunk: Option<i64>) -> StartUploadItem {
        StartUploadItem {
            file_name: name.to_string(),
            file_size: size,
            chunk_size: chunk,
        }
    }

    #[tokio::test]
    async fn test_create_session_allocates_area() {
        let (_dir, manager) = manager().await;
        let session = manager
            .create_session("u1", &item("a.bin", 20, Some(8)))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 3);
        assert_eq!(session.state, CompletionState::Open);
        assert!(manager.chunks().area_exists(&session.id).await.unwrap());
        assert!(manager.registry().get(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_chunk_size_defaults() {
        let (_dir, manager) = manager().await;
        for chunk in [None, Some(0), Some(-5)] {
            let session = manager
                .create_session("u1", &item("a.bin", 20, chunk))
                .await
                .unwrap();
            assert_eq!(session.chunk_size, 8);
        }
    }

    #[tokio::test]
    async fn test_create_session_rejects_bad_input() {
        let (_dir, manager) = manager().await;
        for bad in [
            item("", 10, None),
            item("   ", 10, None),
            item("a.bin", 0, None),
            item("a.bin", -1, None),
            item("a.bin", 100, Some(64)),
        ] {
            assert!(matches!(
                manager.create_session("u1", &bad).await,
                Err(Error::InvalidRequest(_))
            ));
        }
        assert_eq!(manager.registry().len().await, 0);
    }

    #[tokio::test]
    async fn test_create_sessions_is_per_item() {
        let (_dir, manager) = manager().await;
        let results = manager
            .create_sessions("u1", &[item("a.bin", 10, None), item("", 10, None)])
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (_dir, manager) = manager().await;
        let session = manager
            .create_session("u1", &item("a.bin", 10, None))
            .await
            .unwrap();
        manager
            .chunks()
            .write_chunk(&session.id, 0, b"01234567")
            .await
            .unwrap();

        assert!(
            manager
                .teardown(&session.id, TeardownReason::Aborted)
                .await
                .is_some()
        );
        assert!(
            manager
                .teardown(&session.id, TeardownReason::Aborted)
                .await
                .is_none()
        );
        assert!(!manager.chunks().area_exists(&session.id).await.unwrap());
        assert!(manager.registry().get(&session.id).await.is_none());
    }
}
