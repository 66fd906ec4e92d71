//! S3-compatible storage backend using AWS SDK.
//!
//! Objects live at `<prefix>/objects/<object_id>` in a bucket with versioning
//! enabled; S3 assigns the version ID on every completed upload.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectAttributes, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::types::BucketVersioningStatus;
use bytes::Bytes;
use filevault_core::file::VersionInfo;
use filevault_core::{DEFAULT_CONTENT_TYPE, FileId, StoredObjectVersion, VersionId};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// User metadata key holding the percent-encoded original file name.
const FILE_NAME_METADATA_KEY: &str = "filename";

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

fn to_offset_datetime(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> OffsetDateTime {
    dt.and_then(|dt| OffsetDateTime::from_unix_timestamp(dt.secs()).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
}

fn decode_file_name(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

fn parse_version(raw: Option<&str>, key: &str) -> StorageResult<VersionId> {
    let raw = raw.ok_or_else(|| {
        StorageError::Config(format!(
            "S3 returned no version ID for {key}; enable versioning on the bucket"
        ))
    })?;
    VersionId::parse(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO and some
    ///   S3-compatible services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());

        // Apply credentials: explicit config or ambient AWS credential chain
        let mut s3_config_builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    key_id,
                    secret,
                    None, // session token
                    None, // expiration
                    "filevault-config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(aws_config::Region::new(resolved_region.clone()))
                    .credentials_provider(credentials)
            }
            (None, None) => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(aws_config::Region::new(resolved_region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        if let Some(endpoint_url) = endpoint {
            // Handle bare host:port endpoints (e.g., "minio:9000") by prepending http://
            let lower = endpoint_url.to_ascii_lowercase();
            let endpoint_url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        // Normalize prefix: strip trailing slashes to avoid double-slash keys like "prefix//key"
        let prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// Full object key for an object ID (applies prefix if configured).
    fn object_key(&self, object_id: &FileId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/objects/{object_id}"),
            None => format!("objects/{object_id}"),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping NotFound appropriately.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return StorageError::NotFound(key.to_string());
            }
        }
        map_s3_operation_error(err)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        object_id: &FileId,
        key: &str,
        version_id: Option<&str>,
        content_type: Option<&str>,
        content_length: Option<i64>,
        metadata: Option<&std::collections::HashMap<String, String>>,
        last_modified: Option<&aws_sdk_s3::primitives::DateTime>,
    ) -> StorageResult<StoredObjectVersion> {
        Ok(StoredObjectVersion {
            object_id: *object_id,
            version_id: parse_version(version_id, key)?,
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
            size: content_length.and_then(|n| u64::try_from(n).ok()).unwrap_or(0),
            file_name: metadata
                .and_then(|m| m.get(FILE_NAME_METADATA_KEY))
                .map(|v| decode_file_name(v))
                .unwrap_or_default(),
            created_at: to_offset_datetime(last_modified),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self, attributes), fields(backend = "s3", object_id = %object_id))]
    async fn put_stream(
        &self,
        object_id: &FileId,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let key = self.object_key(object_id);

        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(&attributes.content_type)
            .metadata(FILE_NAME_METADATA_KEY, encode_file_name(&attributes.file_name))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            object_id: *object_id,
            attributes,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
        }))
    }

    #[instrument(skip(self), fields(backend = "s3", object_id = %object_id))]
    async fn get_stream(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<(StoredObjectVersion, ByteStream)> {
        use futures::StreamExt;

        let key = self.object_key(object_id);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .set_version_id(version.map(|v| v.to_string()))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        let record = Self::record(
            object_id,
            &key,
            output.version_id(),
            output.content_type(),
            output.content_length(),
            output.metadata(),
            output.last_modified(),
        )?;

        // Convert AWS ByteStream to AsyncRead, then wrap with ReaderStream for true streaming
        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok((record, Box::pin(stream)))
    }

    #[instrument(skip(self), fields(backend = "s3", object_id = %object_id))]
    async fn head(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<StoredObjectVersion> {
        let key = self.object_key(object_id);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .set_version_id(version.map(|v| v.to_string()))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        Self::record(
            object_id,
            &key,
            output.version_id(),
            output.content_type(),
            output.content_length(),
            output.metadata(),
            output.last_modified(),
        )
    }

    #[instrument(skip(self), fields(backend = "s3", object_id = %object_id))]
    async fn list_versions(&self, object_id: &FileId) -> StorageResult<Vec<VersionInfo>> {
        let key = self.object_key(object_id);
        let mut versions = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(&key)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            // The prefix also matches longer keys; keep exact matches only.
            for v in output.versions() {
                if v.key() != Some(key.as_str()) {
                    continue;
                }
                versions.push(VersionInfo {
                    version_id: parse_version(v.version_id(), &key)?,
                    size: v.size().and_then(|n| u64::try_from(n).ok()).unwrap_or(0),
                    last_modified: to_offset_datetime(v.last_modified()),
                });
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            version_marker = output.next_version_id_marker().map(str::to_string);
            if key_marker.is_none() && version_marker.is_none() {
                break;
            }
        }

        if versions.is_empty() {
            return Err(StorageError::NotFound(key));
        }
        // S3 lists newest first
        versions.reverse();
        Ok(versions)
    }

    #[instrument(skip(self), fields(backend = "s3", object_id = %object_id))]
    async fn exists(&self, object_id: &FileId) -> StorageResult<bool> {
        match self.head(object_id, None).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let check = async {
            let output = self
                .client
                .get_bucket_versioning()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match output.status() {
                Some(BucketVersioningStatus::Enabled) => Ok(()),
                other => Err(StorageError::Config(format!(
                    "bucket {} must have versioning enabled (status: {other:?})",
                    self.bucket
                ))),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// Streaming multipart upload for S3.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    object_id: FileId,
    attributes: ObjectAttributes,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    /// In-memory buffer for accumulating data until we reach MIN_PART_SIZE.
    buffer: Vec<u8>,
}

impl S3Upload {
    /// Upload a single part to S3 and track it.
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let upload_output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let completed_part = aws_sdk_s3::types::CompletedPart::builder()
            .e_tag(upload_output.e_tag().unwrap_or_default())
            .part_number(self.part_number)
            .build();

        self.parts.push(completed_part);
        self.part_number += 1;

        Ok(())
    }

    fn stored(&self, version_id: Option<&str>) -> StorageResult<StoredObjectVersion> {
        Ok(StoredObjectVersion {
            object_id: self.object_id,
            version_id: parse_version(version_id, &self.key)?,
            content_type: self.attributes.content_type.clone(),
            size: self.bytes_written,
            file_name: self.attributes.file_name.clone(),
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= MIN_PART_SIZE {
            let part_data: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            self.upload_part(Bytes::from(part_data)).await?;
        }

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<StoredObjectVersion> {
        // Last part can be any size, including < 5 MB
        if !self.buffer.is_empty() {
            let final_data = std::mem::take(&mut self.buffer);
            self.upload_part(Bytes::from(final_data)).await?;
        }

        // Zero-byte uploads: multipart requires at least one non-empty part,
        // so abort it and use PutObject instead.
        if self.parts.is_empty() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %self.key,
                    upload_id = %self.upload_id,
                    error = %e,
                    "Failed to abort multipart upload for zero-byte file, orphaned parts may remain"
                );
            }

            let output = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .content_type(&self.attributes.content_type)
                .metadata(
                    FILE_NAME_METADATA_KEY,
                    encode_file_name(&self.attributes.file_name),
                )
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            return self.stored(output.version_id());
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.stored(output.version_id())
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }
}
