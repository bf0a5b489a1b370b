//! Wiring between the configuration and the storage crates

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info};
use udisk_cas::{ContentStore, ContentStoreConfig};
use udisk_chunker::{ContentHash, ContentHasher};
use udisk_index::DatabasePool;
use udisk_namespace::{NamespaceTree, RegistryConfig, UserRegistry};
use udisk_transfer::{Task, TransferManager};

use crate::config::Config;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

pub struct App {
    pub registry: UserRegistry,
    pub transfers: TransferManager,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let pool = DatabasePool::builder()
            .path(config.database_path())
            .max_size(config.pool_size)
            .build()
            .with_context(|| format!("Failed to open index at {}", config.database_path().display()))?;

        let store = ContentStore::new_with_config(
            config.objects_path(),
            ContentStoreConfig {
                fsync_policy: config.fsync.into(),
                ..ContentStoreConfig::default()
            },
        )
        .await
        .with_context(|| format!("Failed to open content store at {}", config.objects_path().display()))?;

        let registry = UserRegistry::new(
            pool,
            RegistryConfig {
                node_store: config.node_store_kind(),
            },
        );
        let transfers = TransferManager::new(config.transfer_config(), Arc::new(store));

        debug!("Opened storage at {}", config.storage_path.display());
        Ok(Self {
            registry,
            transfers,
        })
    }

    pub async fn tree(&self, user: &str) -> Result<Arc<NamespaceTree>> {
        self.registry
            .tree(user)
            .await
            .with_context(|| format!("Failed to open namespace for {}", user))
    }

    /// Upload a local file chunk by chunk to `remote`
    pub async fn put(&self, user: &str, local: &Path, remote: &str) -> Result<Task> {
        let tree = self.tree(user).await?;
        let mut file = File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;

        let (digest, size) = hash_file(&mut file).await?;
        let task = self
            .transfers
            .plan_upload(tree, remote, size, &digest.to_hex())
            .await?;

        for chunk in task.chunk_plan.chunks() {
            let mut buf = vec![0u8; chunk.length as usize];
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.read_exact(&mut buf)
                .await
                .with_context(|| format!("{} changed while uploading", local.display()))?;

            let chunk_digest = ContentHash::of(&buf).to_hex();
            if let Err(e) = self
                .transfers
                .accept_chunk(&task.id, chunk.index, &buf, &chunk_digest)
                .await
            {
                self.transfers.fail(&task.id, &e.to_string()).await?;
                return Err(e.into());
            }
        }

        let done = self.transfers.complete(&task.id).await?;
        info!("Uploaded {} to {}:{}", local.display(), user, done.target_path);
        Ok(done)
    }

    /// Download `remote` into a local file
    pub async fn get(&self, user: &str, remote: &str, local: &Path) -> Result<Task> {
        let tree = self.tree(user).await?;
        let task = self.transfers.plan_download(tree, remote).await?;

        let partial = partial_path(local)?;
        let mut file = File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;

        let mut hasher = ContentHasher::new();
        for chunk in task.chunk_plan.chunks() {
            let payload = self.transfers.read_chunk(&task.id, chunk.index).await?;
            hasher.update(&payload.bytes);
            file.write_all(&payload.bytes).await?;
        }
        file.sync_all().await?;
        drop(file);

        let actual = hasher.finalize();
        if actual != task.expected_digest {
            let _ = fs::remove_file(&partial).await;
            self.transfers
                .fail(&task.id, "downloaded bytes do not match the stored digest")
                .await?;
            bail!(
                "Digest mismatch for {}: expected {}, got {}",
                task.target_path,
                task.expected_digest,
                actual
            );
        }

        fs::rename(&partial, local)
            .await
            .with_context(|| format!("Failed to move download into {}", local.display()))?;
        let done = self.transfers.complete(&task.id).await?;
        info!("Downloaded {}:{} to {}", user, done.target_path, local.display());
        Ok(done)
    }
}

/// `name.ext` downloads into `name.ext.part` until verified
fn partial_path(local: &Path) -> Result<PathBuf> {
    let mut name = local
        .file_name()
        .with_context(|| format!("{} does not name a file", local.display()))?
        .to_os_string();
    name.push(".part");
    Ok(local.with_file_name(name))
}

async fn hash_file(file: &mut File) -> Result<(ContentHash, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finalize(), hasher.bytes_hashed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let mut config = Config::with_storage(dir.path().join("storage"));
        config.chunk_size = 1000;
        config.small_threshold = 100;
        config.large_threshold = 2000;

        let local = dir.path().join("input.bin");
        let data: Vec<u8> = (0..4500u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&local, &data).unwrap();

        let app = App::open(&config).await.unwrap();
        app.tree("alice").await.unwrap().make_directory("/in").await.unwrap();

        let uploaded = app.put("alice", &local, "/in/data.bin").await.unwrap();
        assert_eq!(uploaded.chunk_plan.len(), 5);
        assert_eq!(uploaded.total_size, 4500);

        let out = dir.path().join("output.bin");
        app.get("alice", "/in/data.bin", &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);
        assert!(!dir.path().join("output.bin.part").exists());
    }

    #[test]
    fn test_partial_path_keeps_extension() {
        let dir = Path::new("/downloads");
        assert_eq!(
            partial_path(&dir.join("a.bin")).unwrap(),
            dir.join("a.bin.part")
        );
        assert_ne!(
            partial_path(&dir.join("a.bin")).unwrap(),
            partial_path(&dir.join("a.txt")).unwrap()
        );
        assert_eq!(partial_path(&dir.join("noext")).unwrap(), dir.join("noext.part"));
        assert!(partial_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_gets_differing_by_extension_do_not_collide() {
        let dir = tempdir().unwrap();
        let config = Config::with_storage(dir.path().join("storage"));
        let local = dir.path().join("src");
        std::fs::write(&local, b"one").unwrap();

        let app = App::open(&config).await.unwrap();
        app.put("erin", &local, "/one").await.unwrap();
        std::fs::write(&local, b"two").unwrap();
        app.put("erin", &local, "/two").await.unwrap();

        let bin = dir.path().join("a.bin");
        let txt = dir.path().join("a.txt");
        let (first, second) = tokio::join!(app.get("erin", "/one", &bin), app.get("erin", "/two", &txt));
        first.unwrap();
        second.unwrap();
        assert_eq!(std::fs::read(&bin).unwrap(), b"one");
        assert_eq!(std::fs::read(&txt).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        let config = Config::with_storage(dir.path().join("storage"));
        let local = dir.path().join("note.txt");
        std::fs::write(&local, b"remember me").unwrap();

        {
            let app = App::open(&config).await.unwrap();
            app.put("bob", &local, "/note.txt").await.unwrap();
        }

        let app = App::open(&config).await.unwrap();
        let tree = app.tree("bob").await.unwrap();
        assert_eq!(tree.list("/").await.unwrap(), vec!["note.txt"]);

        let out = dir.path().join("copy.txt");
        app.get("bob", "/note.txt", &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"remember me");
    }

    #[tokio::test]
    async fn test_put_onto_existing_path_fails() {
        let dir = tempdir().unwrap();
        let config = Config::with_storage(dir.path().join("storage"));
        let local = dir.path().join("f");
        std::fs::write(&local, b"x").unwrap();

        let app = App::open(&config).await.unwrap();
        app.put("carol", &local, "/f").await.unwrap();
        assert!(app.put("carol", &local, "/f").await.is_err());
    }
}
