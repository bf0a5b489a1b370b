use bytes::Bytes;
use std::sync::Arc;
use tempfile::tempdir;
use udisk_index::DatabasePool;
use udisk_namespace::{MemoryNodeStore, NamespaceError, NamespaceTree, RegistryConfig, UserRegistry};

#[tokio::test]
async fn test_reopen_restores_map_and_payloads() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("index.sqlite");

    let before = {
        let registry = UserRegistry::new(DatabasePool::new(&db_path).unwrap(), RegistryConfig::default());
        let tree = registry.tree("alice").await.unwrap();
        tree.make_directory("/music/live").await.unwrap();
        tree.write("/music/live/set.flac", b"flac bytes").await.unwrap();
        tree.write("/readme", b"hi").await.unwrap();
        tree.move_node("/music", "/audio").await.unwrap();
        tree.directory_map().await
    };

    // A fresh in-memory node store is repopulated from the database
    let registry = UserRegistry::new(DatabasePool::new(&db_path).unwrap(), RegistryConfig::default());
    let tree = registry.tree("alice").await.unwrap();

    assert_eq!(tree.directory_map().await, before);
    assert_eq!(
        tree.read("/audio/live/set.flac").await.unwrap(),
        Bytes::from_static(b"flac bytes")
    );
    assert_eq!(tree.read("/readme").await.unwrap(), Bytes::from_static(b"hi"));
    assert!(matches!(tree.list("/music").await, Err(NamespaceError::NotFound(_))));
}

/// Deterministic pseudo-random operation mix; after every step the in-memory
/// map must match what the repository reloads.
#[tokio::test]
async fn test_operation_mix_stays_consistent() {
    let repo = DatabasePool::new_in_memory().unwrap().repository("mix");
    let tree = NamespaceTree::open(repo, Arc::new(MemoryNodeStore::new()))
        .await
        .unwrap();

    let names = ["a", "b", "c"];
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for step in 0..200 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;

        let depth = 1 + (seed % 3) as usize;
        let target: String = (0..depth)
            .map(|i| format!("/{}", names[((seed >> (8 * i)) % 3) as usize]))
            .collect();
        let other: String = format!("/{}", names[((seed >> 32) % 3) as usize]);

        // Errors are expected for many combinations; only consistency matters.
        let _ = match (seed >> 40) % 5 {
            0 => tree.make_directory(&target).await,
            1 => tree.write(&target, format!("step {}", step).as_bytes()).await,
            2 => tree.remove(&target).await,
            3 => tree.move_node(&target, &format!("{}{}", other, step)).await,
            _ => tree.create_file(&target).await,
        };

        let persisted = tree.repository().load_subtree("/").await.unwrap();
        let map = tree.directory_map().await;
        assert_eq!(map, persisted, "diverged at step {}", step);

        for (dir, children) in &map {
            let listed = tree.list(dir).await.unwrap();
            assert_eq!(listed, children.iter().cloned().collect::<Vec<_>>());
        }
    }
}
