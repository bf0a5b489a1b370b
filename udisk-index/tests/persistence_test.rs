use tempfile::tempdir;
use udisk_index::{DatabasePool, IndexError, NodeRecord};

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("index.sqlite");

    {
        let pool = DatabasePool::new(&db_path).unwrap();
        let repo = pool.repository("carol");
        repo.ensure_root().await.unwrap();
        repo.upsert(NodeRecord::directory("/photos")).await.unwrap();
        repo.upsert(NodeRecord::file("/photos/cat.jpg", b"digest".to_vec()))
            .await
            .unwrap();
    }

    let pool = DatabasePool::new(&db_path).unwrap();
    let repo = pool.repository("carol");
    let map = repo.load_subtree("/").await.unwrap();
    assert!(map["/"].contains("photos"));
    assert!(map["/photos"].contains("cat.jpg"));

    let file = repo.get("/photos/cat.jpg").await.unwrap().unwrap();
    assert_eq!(file.content.as_deref(), Some(&b"digest"[..]));
}

#[tokio::test]
async fn test_failed_rewrite_leaves_rows_untouched() {
    let dir = tempdir().unwrap();
    let pool = DatabasePool::new(dir.path().join("index.sqlite")).unwrap();
    let repo = pool.repository("dave");
    repo.ensure_root().await.unwrap();
    repo.upsert(NodeRecord::directory("/src")).await.unwrap();
    repo.upsert(NodeRecord::file("/src/a", Vec::new())).await.unwrap();

    let err = repo.rewrite_path_prefix("/src", "/nowhere/src").await;
    assert!(matches!(err, Err(IndexError::ParentNotFound(_))));

    let nodes = repo.load_nodes("/").await.unwrap();
    let paths: Vec<_> = nodes.iter().map(|n| n.path.as_str()).collect();
    assert_eq!(paths, vec!["/", "/src", "/src/a"]);
}

#[tokio::test]
async fn test_concurrent_upserts_on_shared_pool() {
    let dir = tempdir().unwrap();
    let pool = DatabasePool::new(dir.path().join("index.sqlite")).unwrap();
    let repo = pool.repository("erin");
    repo.ensure_root().await.unwrap();
    repo.upsert(NodeRecord::directory("/bulk")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.upsert(NodeRecord::file(format!("/bulk/{:02}", i), vec![i as u8]))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let map = repo.load_subtree("/bulk").await.unwrap();
    assert_eq!(map["/bulk"].len(), 16);
}
