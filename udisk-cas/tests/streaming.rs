use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use udisk_cas::{CasError, ContentStore, ContentStoreConfig, FsyncPolicy};
use udisk_chunker::{ChunkPlan, ContentHash};

fn test_config() -> ContentStoreConfig {
    ContentStoreConfig {
        fsync_policy: FsyncPolicy::Async,
        enable_recovery: true,
    }
}

/// Chunks streamed through a writer come back out of range reads unchanged
#[tokio::test]
async fn test_chunked_ingest_and_ranged_reads() {
    let temp_dir = tempdir().unwrap();
    let store = ContentStore::new_with_config(temp_dir.path(), test_config())
        .await
        .unwrap();

    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let plan = ChunkPlan::new(data.len() as u64, 64 * 1024).unwrap();

    let mut writer = store.begin_write().await.unwrap();
    for chunk in plan.chunks() {
        writer
            .write(&data[chunk.offset as usize..chunk.end() as usize])
            .await
            .unwrap();
    }
    let obj_ref = store.commit(writer).await.unwrap();

    assert_eq!(obj_ref.hash, ContentHash::of(&data));
    assert_eq!(obj_ref.size, data.len() as u64);

    for chunk in plan.chunks() {
        let bytes = store
            .read_range(&obj_ref.hash, chunk.offset, chunk.length)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &data[chunk.offset as usize..chunk.end() as usize]);
    }
}

/// `open` hands back a stream over the whole object
#[tokio::test]
async fn test_open_streams_object() {
    let temp_dir = tempdir().unwrap();
    let store = ContentStore::new_with_config(temp_dir.path(), test_config())
        .await
        .unwrap();

    let obj_ref = store.write(b"streamed content").await.unwrap();
    let mut file = store.open(&obj_ref.hash).await.unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"streamed content");

    let missing = ContentHash::of(b"missing");
    assert!(matches!(
        store.open(&missing).await,
        Err(CasError::ObjectNotFound(_))
    ));
    assert!(matches!(
        store.size(&missing).await,
        Err(CasError::ObjectNotFound(_))
    ));
}

/// Aborting a streaming write leaves nothing behind
#[tokio::test]
async fn test_abort_streaming_write() {
    let temp_dir = tempdir().unwrap();
    let store = ContentStore::new_with_config(temp_dir.path(), test_config())
        .await
        .unwrap();

    let mut writer = store.begin_write().await.unwrap();
    writer.write(&[42u8; 1024]).await.unwrap();
    writer.abort().await.unwrap();

    assert_eq!(store.stats().await.unwrap().object_count, 0);
    assert!(!store.exists(&ContentHash::of(&[42u8; 1024])).await);
}

/// Concurrent streaming commits of identical bytes converge on one object
#[tokio::test]
async fn test_concurrent_commits_deduplicate() {
    let temp_dir = tempdir().unwrap();
    let store = std::sync::Arc::new(
        ContentStore::new_with_config(temp_dir.path(), test_config())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut writer = store.begin_write().await?;
            writer.write(&[9u8; 10_000]).await?;
            store.commit(writer).await
        }));
    }

    for handle in handles {
        let obj_ref = handle.await.unwrap().unwrap();
        assert_eq!(obj_ref.hash, ContentHash::of(&[9u8; 10_000]));
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.object_count, 1);
    assert_eq!(stats.total_size, 10_000);
}
