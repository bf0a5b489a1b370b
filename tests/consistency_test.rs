mod common;

use anyhow::Result;

use common::TestStack;
use udisk::namespace::{NamespaceTree, NodeStoreKind};

/// Every directory lists exactly its children, and the repository agrees
async fn assert_consistent(tree: &NamespaceTree) -> Result<()> {
    let map = tree.directory_map().await;
    assert_eq!(map, tree.repository().load_subtree("/").await?);
    for (dir, children) in &map {
        let listed = tree.list(dir).await?;
        assert_eq!(listed.len(), children.len(), "duplicates under {}", dir);
        assert_eq!(listed, children.iter().cloned().collect::<Vec<_>>());
    }
    Ok(())
}

#[tokio::test]
async fn test_move_and_remove_keep_views_in_sync() -> Result<()> {
    let stack = TestStack::new(NodeStoreKind::Memory, 1024).await?;
    let tree = stack.registry.tree("alice").await?;

    tree.make_directory("/a/x").await?;
    tree.write("/a/x/y.txt", b"y").await?;
    tree.make_directory("/ab/c").await?;
    tree.write("/ab/c/keep.txt", b"k").await?;
    assert_consistent(&tree).await?;

    tree.move_node("/a", "/b").await?;
    assert_eq!(tree.list("/").await?, vec!["ab", "b"]);
    assert_eq!(tree.list("/b/x").await?, vec!["y.txt"]);
    assert!(tree.repository().exists("/ab/c/keep.txt").await?);
    assert!(!tree.repository().exists("/a/x").await?);
    assert_consistent(&tree).await?;

    tree.make_directory("/d/e").await?;
    tree.write("/d/e/f.txt", b"f").await?;
    tree.remove("/d").await?;
    assert!(!tree.list("/").await?.contains(&"d".to_string()));
    for gone in ["/d", "/d/e", "/d/e/f.txt"] {
        assert!(!tree.repository().exists(gone).await?);
    }
    assert_consistent(&tree).await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_writers_in_one_tree() -> Result<()> {
    let stack = TestStack::new(NodeStoreKind::Memory, 1024).await?;
    let tree = stack.registry.tree("alice").await?;
    tree.make_directory("/shared").await?;

    let mut handles = Vec::new();
    for i in 0..32 {
        let tree = tree.clone();
        handles.push(tokio::spawn(async move {
            let dir = format!("/shared/d{}", i % 4);
            tree.make_directory(&dir).await?;
            tree.write(&format!("{}/f{}", dir, i), format!("{}", i).as_bytes()).await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(tree.list("/shared").await?, vec!["d0", "d1", "d2", "d3"]);
    assert_eq!(tree.list("/shared/d0").await?.len(), 8);
    assert_consistent(&tree).await?;
    Ok(())
}
