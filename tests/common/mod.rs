#![allow(dead_code)]

use anyhow::Result;
use std::sync::{Arc, Once};
use tempfile::TempDir;

use udisk::cas::ContentStore;
use udisk::index::DatabasePool;
use udisk::namespace::{NodeStoreKind, RegistryConfig, UserRegistry};
use udisk::transfer::{Task, TransferConfig, TransferManager};

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once per test process
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("udisk=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Every layer wired together over one temporary directory
pub struct TestStack {
    pub temp_dir: TempDir,
    pub store: Arc<ContentStore>,
    pub registry: UserRegistry,
    pub transfers: TransferManager,
}

impl TestStack {
    pub async fn new(node_store: NodeStoreKind, chunk_size: u64) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        Self::open_in(temp_dir, node_store, chunk_size).await
    }

    /// Open (or reopen) the stack rooted at `temp_dir`
    pub async fn open_in(temp_dir: TempDir, node_store: NodeStoreKind, chunk_size: u64) -> Result<Self> {
        let pool = DatabasePool::new(temp_dir.path().join("index.sqlite"))?;
        let store = Arc::new(ContentStore::new(temp_dir.path().join("cas")).await?);

        let mut config = TransferConfig::new(temp_dir.path().join("staging"));
        config.chunk_size = chunk_size;
        config.small_threshold = chunk_size / 4;
        config.large_threshold = chunk_size;

        Ok(Self {
            registry: UserRegistry::new(pool, RegistryConfig { node_store }),
            transfers: TransferManager::new(config, Arc::clone(&store)),
            store,
            temp_dir,
        })
    }

    /// Close every layer and keep the directory for a reopen
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }

    /// Drive a full upload of `data` to `target`
    pub async fn upload(&self, user: &str, target: &str, data: &[u8]) -> Result<Task> {
        let tree = self.registry.tree(user).await?;
        let digest = udisk::chunker::ContentHash::of(data).to_hex();
        let task = self
            .transfers
            .plan_upload(tree, target, data.len() as u64, &digest)
            .await?;

        for chunk in task.chunk_plan.chunks() {
            let bytes = &data[chunk.offset as usize..chunk.end() as usize];
            let chunk_digest = udisk::chunker::ContentHash::of(bytes).to_hex();
            self.transfers
                .accept_chunk(&task.id, chunk.index, bytes, &chunk_digest)
                .await?;
        }

        Ok(self.transfers.complete(&task.id).await?)
    }

    /// Drive a full download of `target`
    pub async fn download(&self, user: &str, target: &str) -> Result<Vec<u8>> {
        let tree = self.registry.tree(user).await?;
        let task = self.transfers.plan_download(tree, target).await?;

        let mut out = Vec::with_capacity(task.total_size as usize);
        for chunk in task.chunk_plan.chunks() {
            let payload = self.transfers.read_chunk(&task.id, chunk.index).await?;
            out.extend_from_slice(&payload.bytes);
        }
        self.transfers.complete(&task.id).await?;
        Ok(out)
    }
}

/// Deterministic test bytes
pub fn generate_test_data(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x853c_49e6_748f_ea9b;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
