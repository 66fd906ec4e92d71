//! Object storage abstraction, backends and chunk scratch space for filevault.
//!
//! This crate provides:
//! - A versioned object store trait where every upload yields a new version
//! - Backends: local filesystem and S3-compatible (versioned bucket)
//! - The object store gateway used by the upload pipeline
//! - The per-session chunk scratch area

pub mod backends;
pub mod error;
pub mod gateway;
pub mod scratch;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use gateway::ObjectStoreGateway;
pub use scratch::ChunkStore;
pub use traits::{ByteStream, ObjectAttributes, ObjectStore, StreamingUpload};

use filevault_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
