//! Local filesystem storage backend.
//!
//! Layout: `<root>/objects/<object_id>/<version_id>.data` holds the bytes and
//! `<version_id>.json` holds the [`StoredObjectVersion`] record. The record is
//! written last, so a version is invisible until its upload has finished.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectAttributes, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use filevault_core::file::VersionInfo;
use filevault_core::{FileId, StoredObjectVersion, VersionId};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const DATA_EXT: &str = "data";
const META_EXT: &str = "json";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects")).await?;
        Ok(Self { root })
    }

    /// Directory holding every version of an object, with symlink escape protection.
    ///
    /// Runs on the blocking pool because `canonicalize` and `symlink_metadata`
    /// are synchronous.
    async fn object_dir(&self, object_id: &FileId) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let object_id = *object_id;
        tokio::task::spawn_blocking(move || Self::object_dir_sync(&root, &object_id))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    fn object_dir_sync(root: &Path, object_id: &FileId) -> StorageResult<PathBuf> {
        let path = root.join("objects").join(object_id.to_string());

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // An existing object directory (or a symlink planted in its place)
        // must resolve inside the storage root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {object_id}"
                        ))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {object_id}"
                    )));
                }
                Ok(path)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(path),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn read_record(dir: &Path, version: &VersionId) -> StorageResult<StoredObjectVersion> {
        let meta_path = dir.join(format!("{version}.{META_EXT}"));
        let raw = fs::read(&meta_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("version {version}"))
            } else {
                StorageError::Io(e)
            }
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", meta_path.display())))
    }

    /// Every published version record, oldest first.
    async fn records(&self, object_id: &FileId) -> StorageResult<Vec<StoredObjectVersion>> {
        let dir = self.object_dir(object_id).await?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // Symlinks and in-flight temp files are ignored.
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(&format!(".{META_EXT}")) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let Ok(version) = VersionId::parse(stem) else {
                continue;
            };
            records.push(Self::read_record(&dir, &version).await?);
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        Ok(records)
    }

    async fn resolve(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<(PathBuf, StoredObjectVersion)> {
        let dir = self.object_dir(object_id).await?;
        let record = match version {
            Some(version) => Self::read_record(&dir, version).await?,
            None => self
                .records(object_id)
                .await?
                .pop()
                .ok_or_else(|| StorageError::NotFound(object_id.to_string()))?,
        };
        if record.object_id != *object_id {
            return Err(StorageError::Corrupt(format!(
                "version {} recorded under {} but stored under {object_id}",
                record.version_id, record.object_id
            )));
        }
        Ok((dir, record))
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self, attributes), fields(backend = "filesystem", object_id = %object_id))]
    async fn put_stream(
        &self,
        object_id: &FileId,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let dir = self.object_dir(object_id).await?;
        fs::create_dir_all(&dir).await?;

        // Unique temp name so concurrent uploads of the same object never collide
        let temp_path = dir.join(format!(".tmp.{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            dir,
            temp_path,
            object_id: *object_id,
            attributes,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem", object_id = %object_id))]
    async fn get_stream(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<(StoredObjectVersion, ByteStream)> {
        use tokio::io::AsyncReadExt;

        let (dir, record) = self.resolve(object_id, version).await?;
        let data_path = dir.join(format!("{}.{DATA_EXT}", record.version_id));
        let file = fs::File::open(&data_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("{object_id}@{}", record.version_id))
            } else {
                StorageError::Io(e)
            }
        })?;

        // Stream the file in chunks instead of loading entirely into memory
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok((record, Box::pin(stream)))
    }

    #[instrument(skip(self), fields(backend = "filesystem", object_id = %object_id))]
    async fn head(
        &self,
        object_id: &FileId,
        version: Option<&VersionId>,
    ) -> StorageResult<StoredObjectVersion> {
        self.resolve(object_id, version)
            .await
            .map(|(_, record)| record)
    }

    #[instrument(skip(self), fields(backend = "filesystem", object_id = %object_id))]
    async fn list_versions(&self, object_id: &FileId) -> StorageResult<Vec<VersionInfo>> {
        let records = self.records(object_id).await?;
        if records.is_empty() {
            return Err(StorageError::NotFound(object_id.to_string()));
        }
        Ok(records
            .into_iter()
            .map(|r| VersionInfo {
                version_id: r.version_id,
                size: r.size,
                last_modified: r.created_at,
            })
            .collect())
    }

    #[instrument(skip(self), fields(backend = "filesystem", object_id = %object_id))]
    async fn exists(&self, object_id: &FileId) -> StorageResult<bool> {
        Ok(!self.records(object_id).await?.is_empty())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        // Verify the objects directory exists and is accessible
        let objects = self.root.join("objects");
        let metadata = fs::metadata(&objects).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {objects:?}"),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    dir: PathBuf,
    temp_path: PathBuf,
    object_id: FileId,
    attributes: ObjectAttributes,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<StoredObjectVersion> {
        let version_id = match VersionId::parse(&Uuid::now_v7().simple().to_string()) {
            Ok(id) => id,
            Err(e) => {
                drop(self.file);
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(StorageError::Corrupt(e.to_string()));
            }
        };
        let record = StoredObjectVersion {
            object_id: self.object_id,
            version_id: version_id.clone(),
            content_type: self.attributes.content_type.clone(),
            size: self.bytes_written,
            file_name: self.attributes.file_name.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        let data_path = self.dir.join(format!("{version_id}.{DATA_EXT}"));
        commit_data(self.file, &self.temp_path, &data_path).await?;

        // Publishing the record is what makes the version visible.
        let encoded =
            serde_json::to_vec(&record).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let meta_temp = self.dir.join(format!(".tmp.{}.{META_EXT}", Uuid::new_v4()));
        let publish = async {
            let mut meta = fs::File::create(&meta_temp).await?;
            meta.write_all(&encoded).await?;
            meta.sync_all().await?;
            fs::rename(&meta_temp, self.dir.join(format!("{version_id}.{META_EXT}"))).await
        };
        if let Err(e) = publish.await {
            let _ = fs::remove_file(&meta_temp).await;
            let _ = fs::remove_file(&data_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(record)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

/// Flush, fsync and move a finished temp file into place. The temp file is
/// removed if any step fails.
async fn commit_data(mut file: fs::File, temp_path: &Path, data_path: &Path) -> StorageResult<()> {
    let result = async {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(temp_path, data_path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(temp_path).await;
        return Err(StorageError::Io(e));
    }
    Ok(())
}
