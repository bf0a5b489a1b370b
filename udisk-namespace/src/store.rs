//! Backing storage for namespace node bodies.
//!
//! The tree keeps the authoritative directory structure in memory and in the
//! metadata repository; a [`NodeStore`] only holds the nodes themselves so
//! that reads can be served without touching the database.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;
use tracing::debug;
use udisk_index::path;

use crate::errors::{NamespaceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes of a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    /// Payload length for files, child count for directories
    pub size: u64,
}

impl NodeStat {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Storage for node bodies addressed by normalized namespace paths.
///
/// Implementations may assume every path has already been normalized and
/// that the parent of a created node exists.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Create a single directory. Creating an existing directory succeeds.
    async fn create_dir(&self, node_path: &str) -> Result<()>;

    /// Create or truncate a file with `data`
    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()>;

    async fn read(&self, node_path: &str) -> Result<Bytes>;

    /// `None` when nothing is stored at `node_path`
    async fn stat(&self, node_path: &str) -> Result<Option<NodeStat>>;

    /// Sorted names of a directory's children
    async fn list(&self, node_path: &str) -> Result<Vec<String>>;

    /// Move a node, and everything below it for directories
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a file or an empty directory. Removing a missing node succeeds.
    async fn remove(&self, node_path: &str) -> Result<()>;
}

/// Which [`NodeStore`] backs each user's namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeStoreKind {
    #[default]
    Memory,
    /// One directory per user below the given root
    Disk(PathBuf),
}

impl NodeStoreKind {
    /// Open the node store for `user_id`
    pub async fn open(&self, user_id: &str) -> Result<Arc<dyn NodeStore>> {
        match self {
            NodeStoreKind::Memory => Ok(Arc::new(MemoryNodeStore::new())),
            NodeStoreKind::Disk(root) => Ok(Arc::new(DiskNodeStore::open(root.join(user_id)).await?)),
        }
    }
}

#[derive(Debug, Clone)]
enum MemoryNode {
    Directory,
    File(Bytes),
}

/// Ordered in-memory node store
#[derive(Debug)]
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<String, MemoryNode>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(path::ROOT.to_string(), MemoryNode::Directory);
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<String, MemoryNode>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_parent(nodes: &BTreeMap<String, MemoryNode>, node_path: &str) -> Result<()> {
        let parent = path::parent(node_path)
            .ok_or_else(|| NamespaceError::InvalidPath(node_path.to_string()))?;
        match nodes.get(parent) {
            Some(MemoryNode::Directory) => Ok(()),
            Some(MemoryNode::File(_)) => Err(NamespaceError::NotADirectory(parent.to_string())),
            None => Err(NamespaceError::NotFound(parent.to_string())),
        }
    }

    /// Paths strictly below `dir`, in order
    fn descendants(nodes: &BTreeMap<String, MemoryNode>, dir: &str) -> Vec<String> {
        nodes
            .range::<str, _>((Bound::Excluded(dir), Bound::Unbounded))
            .map(|(key, _)| key)
            .filter(|key| key.as_str() != dir && path::is_within(key, dir))
            .cloned()
            .collect()
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn create_dir(&self, node_path: &str) -> Result<()> {
        let mut nodes = self.nodes();
        match nodes.get(node_path) {
            Some(MemoryNode::Directory) => Ok(()),
            Some(MemoryNode::File(_)) => Err(NamespaceError::NotADirectory(node_path.to_string())),
            None => {
                Self::check_parent(&nodes, node_path)?;
                nodes.insert(node_path.to_string(), MemoryNode::Directory);
                Ok(())
            }
        }
    }

    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()> {
        let mut nodes = self.nodes();
        if let Some(MemoryNode::Directory) = nodes.get(node_path) {
            return Err(NamespaceError::IsADirectory(node_path.to_string()));
        }
        Self::check_parent(&nodes, node_path)?;
        nodes.insert(
            node_path.to_string(),
            MemoryNode::File(Bytes::copy_from_slice(data)),
        );
        Ok(())
    }

    async fn read(&self, node_path: &str) -> Result<Bytes> {
        match self.nodes().get(node_path) {
            Some(MemoryNode::File(data)) => Ok(data.clone()),
            Some(MemoryNode::Directory) => Err(NamespaceError::IsADirectory(node_path.to_string())),
            None => Err(NamespaceError::NotFound(node_path.to_string())),
        }
    }

    async fn stat(&self, node_path: &str) -> Result<Option<NodeStat>> {
        let nodes = self.nodes();
        let stat = match nodes.get(node_path) {
            None => return Ok(None),
            Some(MemoryNode::File(data)) => NodeStat {
                path: node_path.to_string(),
                name: path::base_name(node_path).to_string(),
                kind: NodeKind::File,
                size: data.len() as u64,
            },
            Some(MemoryNode::Directory) => NodeStat {
                path: node_path.to_string(),
                name: path::base_name(node_path).to_string(),
                kind: NodeKind::Directory,
                size: Self::descendants(&nodes, node_path)
                    .iter()
                    .filter(|key| path::parent(key) == Some(node_path))
                    .count() as u64,
            },
        };
        Ok(Some(stat))
    }

    async fn list(&self, node_path: &str) -> Result<Vec<String>> {
        let nodes = self.nodes();
        match nodes.get(node_path) {
            Some(MemoryNode::Directory) => Ok(Self::descendants(&nodes, node_path)
                .iter()
                .filter(|key| path::parent(key) == Some(node_path))
                .map(|key| path::base_name(key).to_string())
                .collect()),
            Some(MemoryNode::File(_)) => Err(NamespaceError::NotADirectory(node_path.to_string())),
            None => Err(NamespaceError::NotFound(node_path.to_string())),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut nodes = self.nodes();
        if !nodes.contains_key(from) {
            return Err(NamespaceError::NotFound(from.to_string()));
        }
        if nodes.contains_key(to) {
            return Err(NamespaceError::AlreadyExists(to.to_string()));
        }
        Self::check_parent(&nodes, to)?;

        let mut moved = Self::descendants(&nodes, from);
        moved.push(from.to_string());
        for old in moved {
            if let (Some(node), Some(new)) = (nodes.remove(&old), path::rebase(&old, from, to)) {
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn remove(&self, node_path: &str) -> Result<()> {
        let mut nodes = self.nodes();
        if let Some(MemoryNode::Directory) = nodes.get(node_path) {
            if !Self::descendants(&nodes, node_path).is_empty() {
                return Err(NamespaceError::Storage(format!(
                    "directory not empty: {}",
                    node_path
                )));
            }
        }
        nodes.remove(node_path);
        Ok(())
    }
}

/// Node store rooted at a host directory.
///
/// Namespace path `/a/b` maps to `{root}/a/b`.
#[derive(Debug, Clone)]
pub struct DiskNodeStore {
    root: PathBuf,
}

impl DiskNodeStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!("Opened disk node store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, node_path: &str) -> Result<PathBuf> {
        let mut out = self.root.clone();
        for segment in node_path.split(path::SEPARATOR).filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.contains('\0') {
                return Err(NamespaceError::InvalidPath(node_path.to_string()));
            }
            out.push(segment);
        }
        Ok(out)
    }
}

fn map_io(err: io::Error, node_path: &str) -> NamespaceError {
    match err.kind() {
        io::ErrorKind::NotFound => NamespaceError::NotFound(node_path.to_string()),
        io::ErrorKind::AlreadyExists => NamespaceError::AlreadyExists(node_path.to_string()),
        _ => NamespaceError::Io(err),
    }
}

#[async_trait]
impl NodeStore for DiskNodeStore {
    async fn create_dir(&self, node_path: &str) -> Result<()> {
        let host = self.host_path(node_path)?;
        match fs::metadata(&host).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(NamespaceError::NotADirectory(node_path.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&host).await.map_err(|e| map_io(e, node_path))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()> {
        let host = self.host_path(node_path)?;
        if fs::metadata(&host).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(NamespaceError::IsADirectory(node_path.to_string()));
        }
        fs::write(&host, data).await.map_err(|e| map_io(e, node_path))
    }

    async fn read(&self, node_path: &str) -> Result<Bytes> {
        let host = self.host_path(node_path)?;
        let meta = fs::metadata(&host).await.map_err(|e| map_io(e, node_path))?;
        if meta.is_dir() {
            return Err(NamespaceError::IsADirectory(node_path.to_string()));
        }
        let data = fs::read(&host).await.map_err(|e| map_io(e, node_path))?;
        Ok(Bytes::from(data))
    }

    async fn stat(&self, node_path: &str) -> Result<Option<NodeStat>> {
        let host = self.host_path(node_path)?;
        let meta = match fs::metadata(&host).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (kind, size) = if meta.is_dir() {
            (NodeKind::Directory, self.list(node_path).await?.len() as u64)
        } else {
            (NodeKind::File, meta.len())
        };

        Ok(Some(NodeStat {
            path: node_path.to_string(),
            name: path::base_name(node_path).to_string(),
            kind,
            size,
        }))
    }

    async fn list(&self, node_path: &str) -> Result<Vec<String>> {
        let host = self.host_path(node_path)?;
        let meta = fs::metadata(&host).await.map_err(|e| map_io(e, node_path))?;
        if !meta.is_dir() {
            return Err(NamespaceError::NotADirectory(node_path.to_string()));
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&host).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.host_path(from)?;
        let target = self.host_path(to)?;
        if fs::try_exists(&target).await? {
            return Err(NamespaceError::AlreadyExists(to.to_string()));
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| map_io(e, from))
    }

    async fn remove(&self, node_path: &str) -> Result<()> {
        let host = self.host_path(node_path)?;
        let result = match fs::metadata(&host).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&host).await,
            Ok(_) => fs::remove_file(&host).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
