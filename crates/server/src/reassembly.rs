//! Merge a session's chunks into one file.

use filevault_core::{Error, Result, UploadSession};
use filevault_storage::ChunkStore;
use tokio::io::AsyncWriteExt;

/// Concatenates chunk blobs in index order into the session's assembled file.
#[derive(Clone)]
pub struct ReassemblyEngine {
    chunks: ChunkStore,
}

impl ReassemblyEngine {
    pub fn new(chunks: ChunkStore) -> Self {
        Self { chunks }
    }

    /// Write chunks `0..total_chunks` in ascending order to the assembled
    /// file, deleting each blob once it has been appended.
    ///
    /// Fails with `ReassemblyFailed` if a chunk is missing or the merged
    /// length differs from the declared size. Chunks already merged are gone
    /// at that point, so a failed session cannot be reassembled again.
    #[tracing::instrument(skip(self, session), fields(upload_id = %session.id, total_chunks = session.total_chunks))]
    pub async fn reassemble(&self, session: &UploadSession) -> Result<u64> {
        let id = &session.id;
        let mut out = self
            .chunks
            .create_assembly(id)
            .await
            .map_err(|e| Error::ReassemblyFailed(format!("creating assembled file: {e}")))?;

        let mut written: u64 = 0;
        for index in 0..session.total_chunks {
            let mut chunk = self.chunks.open_chunk(id, index).await.map_err(|e| {
                Error::ReassemblyFailed(format!("chunk {index} unavailable: {e}"))
            })?;
            written += tokio::io::copy(&mut chunk, &mut out)
                .await
                .map_err(|e| Error::ReassemblyFailed(format!("appending chunk {index}: {e}")))?;
            drop(chunk);

            if let Err(e) = self.chunks.delete_chunk(id, index).await {
                tracing::warn!(
                    upload_id = %id,
                    chunk_index = index,
                    error = %e,
                    "Failed to delete merged chunk"
                );
            }
        }

        out.flush()
            .await
            .map_err(|e| Error::ReassemblyFailed(format!("flushing assembled file: {e}")))?;
        out.sync_all()
            .await
            .map_err(|e| Error::ReassemblyFailed(format!("syncing assembled file: {e}")))?;

        if written != session.declared_size {
            return Err(Error::ReassemblyFailed(format!(
                "assembled {written} bytes, expected {}",
                session.declared_size
            )));
        }

        tracing::debug!(upload_id = %id, size = written, "Chunks reassembled");
        Ok(written)
    }
}
