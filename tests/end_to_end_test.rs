mod common;

use anyhow::Result;
use bytes::Bytes;

use common::{generate_test_data, init_tracing, TestStack};
use udisk::chunker::ContentHash;
use udisk::namespace::{NamespaceError, NodeStoreKind};
use udisk::transfer::{SizeCategory, TaskStatus, TransferError};

#[tokio::test]
async fn test_upload_then_download_large_object() -> Result<()> {
    init_tracing();
    let stack = TestStack::new(NodeStoreKind::Memory, 64 * 1024).await?;
    stack.registry.tree("alice").await?.make_directory("/videos").await?;

    let data = generate_test_data(300_000);
    let task = stack.upload("alice", "/videos/clip.mp4", &data).await?;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.category, SizeCategory::Large);
    assert_eq!(task.chunk_plan.len(), 5);

    assert_eq!(stack.download("alice", "/videos/clip.mp4").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_identical_content_is_stored_once() -> Result<()> {
    init_tracing();
    let stack = TestStack::new(NodeStoreKind::Memory, 64 * 1024).await?;
    let data = generate_test_data(100_000);

    stack.upload("alice", "/one.bin", &data).await?;
    stack.upload("alice", "/two.bin", &data).await?;
    stack.upload("bob", "/three.bin", &data).await?;

    assert_eq!(stack.store.stats().await?.object_count, 1);

    let alice = stack.registry.tree("alice").await?;
    let expected = Bytes::from(ContentHash::of(&data).to_hex());
    assert_eq!(alice.read("/one.bin").await?, expected);
    assert_eq!(alice.read("/two.bin").await?, expected);
    assert_eq!(stack.registry.tree("bob").await?.read("/three.bin").await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_upload_rejects_existing_path() -> Result<()> {
    let stack = TestStack::new(NodeStoreKind::Memory, 1024).await?;
    stack.upload("alice", "/taken", b"first").await?;

    let err = stack.upload("alice", "/taken", b"second").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::AlreadyExists(_))
    ));
    assert_eq!(stack.transfers.list().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_moved_file_still_downloads() -> Result<()> {
    let stack = TestStack::new(NodeStoreKind::Memory, 1024).await?;
    let tree = stack.registry.tree("alice").await?;
    tree.make_directory("/inbox").await?;

    let data = generate_test_data(5000);
    stack.upload("alice", "/inbox/report.pdf", &data).await?;
    tree.make_directory("/archive/2024").await?;
    tree.move_node("/inbox", "/archive/2024/inbox").await?;

    assert_eq!(stack.download("alice", "/archive/2024/inbox/report.pdf").await?, data);
    assert!(matches!(
        tree.stat("/inbox/report.pdf").await,
        Err(NamespaceError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_namespace_and_payloads_survive_restart() -> Result<()> {
    for node_store in [NodeStoreKind::Memory, NodeStoreKind::Disk("nodes".into())] {
        let temp_dir = tempfile::TempDir::new()?;
        let node_store = match node_store {
            NodeStoreKind::Disk(rel) => NodeStoreKind::Disk(temp_dir.path().join(rel)),
            other => other,
        };

        let data = generate_test_data(4000);
        let stack = TestStack::open_in(temp_dir, node_store.clone(), 1024).await?;
        let before = {
            let tree = stack.registry.tree("alice").await?;
            tree.make_directory("/docs/drafts").await?;
            tree.write("/docs/drafts/todo.txt", b"ship it").await?;
            stack.upload("alice", "/docs/blob.bin", &data).await?;
            tree.directory_map().await
        };

        let reopened = TestStack::open_in(stack.into_temp_dir(), node_store, 1024).await?;
        let tree = reopened.registry.tree("alice").await?;

        assert_eq!(tree.directory_map().await, before);
        assert_eq!(tree.read("/docs/drafts/todo.txt").await?, Bytes::from_static(b"ship it"));
        assert_eq!(reopened.download("alice", "/docs/blob.bin").await?, data);
    }
    Ok(())
}
