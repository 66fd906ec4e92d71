//! Core domain types and shared logic for the filevault upload service.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Chunked upload sessions and their completion state machine
//! - Logical file and object version identifiers
//! - HTTP request/response shapes for the upload API
//! - The error taxonomy shared by every layer

pub mod config;
pub mod error;
pub mod file;
pub mod upload;

pub use error::{Error, Result};
pub use file::{FileId, FileRecord, StoredObjectVersion, VersionId};
pub use upload::{ChunkHints, CompletionState, UploadId, UploadSession};

/// Default chunk size when the client does not pick one: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Content type recorded when the client does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
