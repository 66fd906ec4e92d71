//! Application state shared across handlers.

use crate::events::EventSink;
use crate::lifecycle::SessionManager;
use crate::receipt::ChunkReceiver;
use crate::registry::SessionRegistry;
use crate::sweep::SessionSweeper;
use filevault_core::config::AppConfig;
use filevault_metadata::MetadataStore;
use filevault_storage::{ChunkStore, ObjectStore, ObjectStoreGateway};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Versioned object store facade.
    pub gateway: ObjectStoreGateway,
    /// Metadata recorder.
    pub metadata: Arc<dyn MetadataStore>,
    /// Upload outcome subscribers.
    pub events: Arc<dyn EventSink>,
    /// Session creation and teardown.
    pub sessions: SessionManager,
    /// Chunk receipt and completion pipeline.
    pub receiver: ChunkReceiver,
}

impl AppState {
    /// Wire the upload pipeline together over the given collaborators.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        chunks: ChunkStore,
        registry: Arc<dyn SessionRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let gateway = ObjectStoreGateway::new(storage);
        let sessions = SessionManager::new(registry, chunks, &config.server);
        let receiver = ChunkReceiver::new(
            sessions.clone(),
            gateway.clone(),
            metadata.clone(),
            events.clone(),
        );

        Self {
            config: Arc::new(config),
            gateway,
            metadata,
            events,
            sessions,
            receiver,
        }
    }

    /// Build the expiry sweeper for this state's sessions.
    pub fn sweeper(&self) -> SessionSweeper {
        SessionSweeper::new(
            self.sessions.clone(),
            self.events.clone(),
            self.config.upload.session_ttl(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEvents;
    use crate::registry::InMemorySessionRegistry;
    use filevault_metadata::SqliteStore;
    use filevault_storage::FilesystemBackend;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn build_state(config: AppConfig) -> (tempfile::TempDir, AppState) {
        let temp = tempdir().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("objects")).await.unwrap());

        let db_path = temp.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(&db_path, None).await.unwrap());
        let chunks = ChunkStore::new(temp.path().join("scratch")).await.unwrap();

        let state = AppState::new(
            config,
            storage,
            metadata,
            chunks,
            Arc::new(InMemorySessionRegistry::new()),
            Arc::new(BroadcastEvents::default()),
        );
        (temp, state)
    }

    #[tokio::test]
    async fn sweeper_uses_configured_ttl() {
        let mut config = AppConfig::for_testing();
        config.upload.session_ttl_secs = 42;
        let (_temp, state) = build_state(config).await;
        let sweeper = state.sweeper();
        // A session idle for less than the TTL survives a sweep.
        let item = filevault_core::upload::StartUploadItem {
            file_name: "a.bin".into(),
            file_size: 10,
            chunk_size: None,
        };
        state.sessions.create_session("u1", &item).await.unwrap();
        let now = time::OffsetDateTime::now_utc() + Duration::from_secs(30);
        assert_eq!(sweeper.sweep_once(now).await, 0);
        let later = time::OffsetDateTime::now_utc() + Duration::from_secs(43);
        assert_eq!(sweeper.sweep_once(later).await, 1);
    }

    #[tokio::test]
    async fn sessions_share_one_registry() {
        let (_temp, state) = build_state(AppConfig::for_testing()).await;
        let item = filevault_core::upload::StartUploadItem {
            file_name: "a.bin".into(),
            file_size: 10,
            chunk_size: None,
        };
        let session = state.sessions.create_session("u1", &item).await.unwrap();
        assert!(state.receiver.session_for("u1", &session.id).await.is_ok());
        assert!(state.receiver.session_for("u2", &session.id).await.is_err());
    }
}
