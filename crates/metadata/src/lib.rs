//! Durable file metadata for filevault.
//!
//! Every completed upload appends one record linking a logical file to the
//! object store version it produced. Records are never updated in place.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{FileRecordRow, NewFileRecord};
pub use repos::FileRepo;
pub use store::{MetadataStore, SqliteStore};

use filevault_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
