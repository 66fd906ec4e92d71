//! Test server setup.

use super::fixtures::{MultipartBody, TEST_USER};
use super::metadata::FlakyMetadata;
use super::storage::CountingStore;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use filevault_core::UploadId;
use filevault_core::config::AppConfig;
use filevault_metadata::{MetadataStore, SqliteStore};
use filevault_server::events::BroadcastEvents;
use filevault_server::registry::InMemorySessionRegistry;
use filevault_server::{AppState, create_router};
use filevault_storage::{ChunkStore, FilesystemBackend, ObjectStore};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Test server wrapper.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    pub events: BroadcastEvents,
    pub store: Arc<CountingStore>,
    pub metadata: Arc<FlakyMetadata>,
    _temp_dir: TempDir,
}

/// Status and raw body of a routed request.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server backed by the filesystem store and SQLite.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with a config modifier.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        let mut config = AppConfig::for_testing();
        config.upload.scratch_dir = temp_dir.path().join("scratch");
        modifier(&mut config);

        let backend: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("objects"))
                .await
                .expect("failed to create object store"),
        );
        let store = Arc::new(CountingStore::new(backend));

        let sqlite: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .expect("failed to create metadata store"),
        );
        let metadata = Arc::new(FlakyMetadata::new(sqlite));
        let chunks = ChunkStore::new(&config.upload.scratch_dir)
            .await
            .expect("failed to create scratch");

        let events = BroadcastEvents::default();
        let state = AppState::new(
            config,
            store.clone(),
            metadata.clone(),
            chunks,
            Arc::new(InMemorySessionRegistry::new()),
            Arc::new(events.clone()),
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            events,
            store,
            metadata,
            _temp_dir: temp_dir,
        }
    }

    /// Route a request and collect the whole response body.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Send a request as the default test user.
    pub async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> TestResponse {
        self.call_as(Some(TEST_USER), method, uri, body).await
    }

    /// Send a JSON (or empty) request as `user`, or anonymously with `None`.
    pub async fn call_as(
        &self,
        user: Option<&str>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    /// POST a multipart form as `user`.
    pub async fn post_form(&self, user: &str, uri: &str, form: MultipartBody) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-user-id", user)
            .header(header::CONTENT_TYPE, MultipartBody::content_type())
            .body(Body::from(form.finish()))
            .unwrap();
        self.send(request).await
    }

    /// Open one session and return its ID.
    pub async fn start_upload(&self, file_name: &str, size: u64, chunk_size: u64) -> String {
        let response = self
            .call(
                "POST",
                "/api/v1/files/start-upload",
                Some(serde_json::json!({
                    "fileName": file_name,
                    "fileSize": size,
                    "chunkSize": chunk_size,
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "start-upload failed");
        response.json()["uploadSessions"][0]["uploadSessionId"]
            .as_str()
            .expect("missing session id")
            .to_string()
    }

    /// Send one chunk as the default test user.
    pub async fn send_chunk(
        &self,
        upload_id: &str,
        index: usize,
        total: usize,
        data: &[u8],
    ) -> TestResponse {
        self.send_chunk_with(upload_id, index, total, data, MultipartBody::new())
            .await
    }

    /// Send one chunk with extra form fields prepended.
    pub async fn send_chunk_with(
        &self,
        upload_id: &str,
        index: usize,
        total: usize,
        data: &[u8],
        form: MultipartBody,
    ) -> TestResponse {
        let form = form
            .text("uploadSessionId", upload_id)
            .text("chunkIndex", &index.to_string())
            .text("totalChunks", &total.to_string())
            .file("file", "blob", "application/octet-stream", data);
        self.post_form(TEST_USER, "/api/v1/files/upload-chunk", form)
            .await
    }

    /// Scratch area of a live session.
    pub fn session_area(&self, upload_id: &str) -> std::path::PathBuf {
        let id = UploadId::parse(upload_id).expect("malformed session id");
        self.state.sessions.chunks().area_path(&id)
    }

    /// Number of entries left in the scratch root.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.state.config.upload.scratch_dir)
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}
