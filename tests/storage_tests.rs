use std::time::Duration;

use bytes::Bytes;

use condor_lite::descriptor::ArtifactRef;
use condor_lite::error::CondorError;
use condor_lite::storage::{ArtifactStore, FsArtifactStore, StoreClient, StoreError};

/// Backend that never answers in time.
struct StalledStore;

impl ArtifactStore for StalledStore {
    async fn fetch(&self, _artifact: &ArtifactRef) -> Result<Bytes, StoreError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Bytes::new())
    }

    async fn push(&self, _artifact: &ArtifactRef, _data: Bytes) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_fs_store_push_then_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path());
    let artifact = ArtifactRef::output(3, 1, "metrics.json");

    store
        .push(&artifact, Bytes::from_static(b"{\"loss\":0.1}"))
        .await
        .unwrap();

    let on_disk = dir.path().join("outputs").join("3").join("1").join("metrics.json");
    assert_eq!(std::fs::read(&on_disk).unwrap(), b"{\"loss\":0.1}");
    // No temp file left behind.
    let siblings: Vec<_> = std::fs::read_dir(on_disk.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(siblings.len(), 1);

    let fetched = store.fetch(&artifact).await.unwrap();
    assert_eq!(&fetched[..], b"{\"loss\":0.1}");
}

#[tokio::test]
async fn test_fs_store_overwrites_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path());
    let artifact = ArtifactRef::new("outputs/1/0/log.txt");

    store.push(&artifact, Bytes::from_static(b"first")).await.unwrap();
    store.push(&artifact, Bytes::from_static(b"second")).await.unwrap();
    assert_eq!(&store.fetch(&artifact).await.unwrap()[..], b"second");
}

#[tokio::test]
async fn test_fs_store_missing_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path());
    let result = store.fetch(&ArtifactRef::new("inputs/nope.tar")).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_fs_store_rejects_escaping_refs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsArtifactStore::new(dir.path().join("root"));

    for bad in ["../secret", "/etc/passwd", "a/../../b"] {
        let artifact = ArtifactRef::new(bad);
        assert!(matches!(
            store.fetch(&artifact).await,
            Err(StoreError::InvalidRef(_))
        ));
        assert!(matches!(
            store.push(&artifact, Bytes::new()).await,
            Err(StoreError::InvalidRef(_))
        ));
    }
}

#[tokio::test]
async fn test_client_maps_backend_errors_to_storage_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let client = StoreClient::new(FsArtifactStore::new(dir.path()), Duration::from_secs(5));

    let err = client
        .fetch_input(&ArtifactRef::new("inputs/missing.tar"))
        .await
        .unwrap_err();
    assert!(matches!(err, CondorError::StorageUnavailable(ref msg) if msg.contains("not found")));
    assert!(!err.is_validation());
}

#[tokio::test]
async fn test_client_times_out_slow_backend() {
    let client = StoreClient::new(StalledStore, Duration::from_millis(50));

    let fetch = client.fetch_input(&ArtifactRef::new("inputs/a.tar")).await;
    assert!(matches!(fetch, Err(CondorError::StorageUnavailable(ref msg)) if msg.contains("timed out")));

    let push = client
        .push_output(&ArtifactRef::new("outputs/1/0/a"), Bytes::from_static(b"x"))
        .await;
    assert!(matches!(push, Err(CondorError::StorageUnavailable(ref msg)) if msg.contains("timed out")));
}
