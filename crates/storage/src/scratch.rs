//! Per-session scratch area holding chunk blobs until reassembly.
//!
//! Each upload session owns `<root>/<upload_id>/`. Chunks are stored as
//! `chunk-<index>` and the merged file as `assembled`. The area is created
//! when the session starts; chunk writes never recreate it, so a write that
//! races a teardown fails with `NotFound` instead of leaking blobs.

use crate::error::{StorageError, StorageResult};
use filevault_core::UploadId;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

const CHUNK_PREFIX: &str = "chunk-";
const ASSEMBLED_NAME: &str = "assembled";

/// How often `purge` retries when a concurrent write repopulates the area.
const PURGE_ATTEMPTS: usize = 5;

/// Filesystem-backed chunk scratch store.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) the scratch root.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The isolated area for one session.
    pub fn area_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn chunk_path(&self, id: &UploadId, index: u64) -> PathBuf {
        self.area_path(id).join(format!("{CHUNK_PREFIX}{index}"))
    }

    fn assembled_path(&self, id: &UploadId) -> PathBuf {
        self.area_path(id).join(ASSEMBLED_NAME)
    }

    fn not_found(id: &UploadId, what: &str) -> impl FnOnce(std::io::Error) -> StorageError {
        let label = format!("{id}/{what}");
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(label)
            } else {
                StorageError::Io(e)
            }
        }
    }

    /// Create the area for a new session.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn create_area(&self, id: &UploadId) -> StorageResult<PathBuf> {
        let area = self.area_path(id);
        fs::create_dir(&area).await?;
        Ok(area)
    }

    pub async fn area_exists(&self, id: &UploadId) -> StorageResult<bool> {
        fs::try_exists(self.area_path(id))
            .await
            .map_err(StorageError::Io)
    }

    /// Store chunk `index`, atomically replacing any earlier copy.
    ///
    /// Returns `NotFound` if the session's area no longer exists.
    #[instrument(skip(self, data), fields(upload_id = %id, chunk_index = index, size = data.len()))]
    pub async fn write_chunk(&self, id: &UploadId, index: u64, data: &[u8]) -> StorageResult<()> {
        let final_path = self.chunk_path(id, index);
        let temp_path = self
            .area_path(id)
            .join(format!(".{CHUNK_PREFIX}{index}.tmp.{}", Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::not_found(id, "area")(e));
        }
        Ok(())
    }

    /// Open chunk `index` for reading.
    pub async fn open_chunk(&self, id: &UploadId, index: u64) -> StorageResult<fs::File> {
        fs::File::open(self.chunk_path(id, index))
            .await
            .map_err(Self::not_found(id, &format!("{CHUNK_PREFIX}{index}")))
    }

    /// Delete chunk `index`. Missing chunks are ignored.
    pub async fn delete_chunk(&self, id: &UploadId, index: u64) -> StorageResult<()> {
        match fs::remove_file(self.chunk_path(id, index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Indices of the chunk blobs currently stored, ascending.
    pub async fn list_chunks(&self, id: &UploadId) -> StorageResult<Vec<u64>> {
        let mut entries = match fs::read_dir(self.area_path(id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHUNK_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Create (truncating) the merged file for a session.
    pub async fn create_assembly(&self, id: &UploadId) -> StorageResult<fs::File> {
        fs::File::create(self.assembled_path(id))
            .await
            .map_err(Self::not_found(id, ASSEMBLED_NAME))
    }

    /// Open the merged file for reading, with its length.
    pub async fn open_assembly(&self, id: &UploadId) -> StorageResult<(fs::File, u64)> {
        let file = fs::File::open(self.assembled_path(id))
            .await
            .map_err(Self::not_found(id, ASSEMBLED_NAME))?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Remove a session's area and everything in it.
    ///
    /// Returns `false` when there was nothing to remove, so repeated calls are no-ops.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn purge(&self, id: &UploadId) -> StorageResult<bool> {
        let area = self.area_path(id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::remove_dir_all(&area).await {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                // A chunk write landed between listing and rmdir; try again.
                Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty
                    && attempt < PURGE_ATTEMPTS =>
                {
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    /// Remove every session area. Used at startup, when no session can be live.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn purge_all(&self) -> StorageResult<usize> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            } else {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_chunk(store: &ChunkStore, id: &UploadId, index: u64) -> Vec<u8> {
        let mut file = store.open_chunk(id, index).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_write_and_overwrite_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        let id = UploadId::new();
        store.create_area(&id).await.unwrap();

        store.write_chunk(&id, 1, b"first").await.unwrap();
        store.write_chunk(&id, 1, b"second").await.unwrap();
        store.write_chunk(&id, 0, b"zero").await.unwrap();

        assert_eq!(read_chunk(&store, &id, 1).await, b"second");
        assert_eq!(store.list_chunks(&id).await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_write_without_area_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        let id = UploadId::new();

        let err = store.write_chunk(&id, 0, b"data").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err:?}");
        assert!(!store.area_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        let id = UploadId::new();
        store.create_area(&id).await.unwrap();
        store.write_chunk(&id, 0, b"x").await.unwrap();

        assert!(store.purge(&id).await.unwrap());
        assert!(!store.purge(&id).await.unwrap());
        assert!(store.list_chunks(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_areas_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        let a = UploadId::new();
        let b = UploadId::new();
        store.create_area(&a).await.unwrap();
        store.create_area(&b).await.unwrap();

        store.write_chunk(&a, 0, b"from a").await.unwrap();
        store.write_chunk(&b, 0, b"from b").await.unwrap();
        store.purge(&a).await.unwrap();

        assert_eq!(read_chunk(&store, &b, 0).await, b"from b");
    }

    #[tokio::test]
    async fn test_purge_all_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        for _ in 0..3 {
            let id = UploadId::new();
            store.create_area(&id).await.unwrap();
            store.write_chunk(&id, 0, b"x").await.unwrap();
        }

        assert_eq!(store.purge_all().await.unwrap(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
