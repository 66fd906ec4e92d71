//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Chunk size used when a start-upload item omits one or sends a non-positive value.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Largest chunk size a client may request.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum number of files in one start-upload request.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum size of one file sent through the single-request upload endpoint.
    #[serde(default = "default_max_single_upload_size")]
    pub max_single_upload_size: u64,
    /// Header carrying the caller identity set by the upstream authenticator.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// When enabled, keep this endpoint network-restricted to the scraper.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_single_upload_size() -> u64 {
    100 * 1024 * 1024
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_chunk_size: default_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_batch_size: default_max_batch_size(),
            max_single_upload_size: default_max_single_upload_size(),
            identity_header: default_identity_header(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_chunk_size == 0 {
            return Err("server.default_chunk_size must be greater than 0".to_string());
        }
        if self.default_chunk_size > self.max_chunk_size {
            return Err(format!(
                "server.default_chunk_size ({}) exceeds server.max_chunk_size ({})",
                self.default_chunk_size, self.max_chunk_size
            ));
        }
        if self.identity_header.trim().is_empty() {
            return Err("server.identity_header cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Chunked upload scratch and expiry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory holding per-session chunk areas.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Sessions with no progress for this long are torn down.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// How often the expiry sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./data/scratch")
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl UploadConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate upload configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        // tokio::time::interval panics on a zero period
        if self.sweep_interval_secs == 0 {
            return Err("upload.sweep_interval_secs cannot be 0".to_string());
        }
        if self.session_ttl_secs == 0 {
            return Err("upload.session_ttl_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Object store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage. The bucket must have versioning enabled.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/objects"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Metadata recorder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        path: PathBuf,
        /// Advisory query timeout. SQLite has no server-side statement timeout.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    /// Object store backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata recorder configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata
    /// under `./data`; tests normally override the paths with temp dirs.
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Validate every section, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.upload.validate()?;
        self.storage.validate()
    }
}
