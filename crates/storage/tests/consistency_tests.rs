// Consistency tests for concurrent writers
// Ensures versions never clobber each other and scratch teardown races stay clean

mod common;

use bytes::Bytes;
use common::{read_stream, seeded_bytes};
use filevault_core::{FileId, UploadId};
use filevault_storage::{ChunkStore, FilesystemBackend, ObjectStoreGateway};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_concurrent_uploads_to_same_object_get_distinct_versions() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let gateway = ObjectStoreGateway::new(Arc::new(backend));
    let object_id = FileId::new();

    let mut handles = Vec::new();
    for seed in 0..16u64 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            let data = seeded_bytes(seed, 100_000);
            let body = futures::stream::iter(
                data.chunks(7_000)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect::<Vec<std::io::Result<Bytes>>>(),
            );
            let stored = gateway
                .upload(body, Some(object_id), "same.bin", "application/octet-stream")
                .await
                .unwrap();
            (stored.version_id, data)
        }));
    }

    let mut written = Vec::new();
    for handle in handles {
        written.push(handle.await.unwrap());
    }

    let unique: HashSet<_> = written.iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(unique.len(), 16, "every upload must get its own version");

    let versions = gateway.list_versions(&object_id).await.unwrap();
    assert_eq!(versions.len(), 16);

    // Every version still holds exactly the bytes its writer sent
    for (version_id, data) in written {
        let (record, stream) = gateway
            .get_object(&object_id, Some(&version_id))
            .await
            .unwrap();
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(read_stream(stream).await, data.as_ref());
    }
}

#[tokio::test]
async fn test_chunk_writes_racing_purge_never_leak() {
    let temp_dir = TempDir::new().unwrap();
    let store = ChunkStore::new(temp_dir.path()).await.unwrap();

    for round in 0..20u64 {
        let id = UploadId::new();
        store.create_area(&id).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for index in 0..8 {
                    // Writes after the purge must fail, never recreate the area
                    let _ = store
                        .write_chunk(&id, index, &seeded_bytes(round + index, 4096))
                        .await;
                }
            })
        };
        let purger = {
            let store = store.clone();
            tokio::spawn(async move { store.purge(&id).await })
        };

        writer.await.unwrap();
        purger.await.unwrap().unwrap();
        // A final purge covers writes that completed before the first one started
        store.purge(&id).await.unwrap();
        assert!(!store.area_exists(&id).await.unwrap());
    }

    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}
