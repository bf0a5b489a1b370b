//! A single user's directory tree.
//!
//! The directory map (directory path to child names) is kept in memory and
//! mirrored into the metadata repository on every mutation. Node bodies
//! live in a [`NodeStore`]. Mutations hold the tree's write lock for their
//! whole duration, persistence included, so the three views never disagree
//! once an operation has returned successfully.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use udisk_index::{path, DirectoryMap, MetadataRepository, NodeRecord};

use crate::errors::{NamespaceError, Result};
use crate::store::{NodeKind, NodeStat, NodeStore};

struct TreeState {
    cwd: String,
    dir_map: DirectoryMap,
}

impl TreeState {
    fn kind(&self, node_path: &str) -> Option<NodeKind> {
        if self.dir_map.contains_key(node_path) {
            return Some(NodeKind::Directory);
        }
        let parent = path::parent(node_path)?;
        self.dir_map
            .get(parent)
            .filter(|children| children.contains(path::base_name(node_path)))
            .map(|_| NodeKind::File)
    }

    fn add_child(&mut self, node_path: &str) {
        if let Some(parent) = path::parent(node_path) {
            self.dir_map
                .entry(parent.to_string())
                .or_default()
                .insert(path::base_name(node_path).to_string());
        }
    }

    fn remove_child(&mut self, node_path: &str) {
        if let Some(children) = path::parent(node_path).and_then(|p| self.dir_map.get_mut(p)) {
            children.remove(path::base_name(node_path));
        }
    }

    /// Parent of `node_path` must be an existing directory
    fn require_parent_dir(&self, node_path: &str) -> Result<()> {
        let parent = path::parent(node_path)
            .ok_or_else(|| NamespaceError::InvalidPath(node_path.to_string()))?;
        match self.kind(parent) {
            Some(NodeKind::Directory) => Ok(()),
            Some(NodeKind::File) => Err(NamespaceError::NotADirectory(parent.to_string())),
            None => Err(NamespaceError::NotFound(parent.to_string())),
        }
    }
}

pub struct NamespaceTree {
    owner: String,
    state: RwLock<TreeState>,
    store: Arc<dyn NodeStore>,
    repo: MetadataRepository,
}

impl NamespaceTree {
    /// Open a tree over `repo`, restoring the directory map from it.
    ///
    /// Any node recorded in the repository but missing from `store` is
    /// recreated there, so a fresh in-memory store comes back populated.
    pub async fn open(repo: MetadataRepository, store: Arc<dyn NodeStore>) -> Result<Self> {
        repo.ensure_root().await?;

        let mut dir_map = repo.load_subtree(path::ROOT).await?;
        dir_map.entry(path::ROOT.to_string()).or_default();

        let mut restored = 0usize;
        for node in repo.load_nodes(path::ROOT).await? {
            if store.stat(&node.path).await?.is_some() {
                continue;
            }
            if node.is_directory {
                store.create_dir(&node.path).await?;
            } else {
                store
                    .write(&node.path, node.content.as_deref().unwrap_or_default())
                    .await?;
            }
            restored += 1;
        }

        info!(
            "Opened namespace for {} ({} directories, {} nodes restored)",
            repo.owner(),
            dir_map.len(),
            restored
        );

        Ok(Self {
            owner: repo.owner().to_string(),
            state: RwLock::new(TreeState {
                cwd: path::ROOT.to_string(),
                dir_map,
            }),
            store,
            repo,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    /// Absolute normalized form of `input` against the current directory
    pub async fn resolve_path(&self, input: &str) -> Result<String> {
        let state = self.state.read().await;
        Self::resolve(&state.cwd, input)
    }

    fn resolve(cwd: &str, input: &str) -> Result<String> {
        if input.contains('\0') {
            return Err(NamespaceError::InvalidPath(input.escape_default().to_string()));
        }
        Ok(path::resolve(cwd, input))
    }

    /// Create a directory and any missing ancestors
    pub async fn make_directory(&self, input: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = Self::resolve(&state.cwd, input)?;

        let mut chain = Vec::new();
        let mut cursor = Some(target.as_str());
        while let Some(current) = cursor {
            chain.push(current.to_string());
            cursor = path::parent(current);
        }

        for dir in chain.into_iter().rev() {
            match state.kind(&dir) {
                Some(NodeKind::Directory) => continue,
                Some(NodeKind::File) => return Err(NamespaceError::NotADirectory(dir)),
                None => {}
            }

            self.store.create_dir(&dir).await?;
            state.dir_map.entry(dir.clone()).or_default();
            state.add_child(&dir);
            self.repo.upsert(NodeRecord::directory(dir.as_str())).await?;
            debug!("{}: created directory {}", self.owner, dir);
        }

        Ok(())
    }

    /// Create an empty file, truncating an existing one
    pub async fn create_file(&self, input: &str) -> Result<()> {
        self.write(input, &[]).await
    }

    /// Create or replace a file's content
    pub async fn write(&self, input: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        let target = Self::resolve(&state.cwd, input)?;
        self.write_locked(&mut state, target, data, false).await
    }

    /// Create a file that must not exist yet.
    ///
    /// The existence check and the write happen under one exclusive lock.
    pub async fn create_new(&self, input: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        let target = Self::resolve(&state.cwd, input)?;
        self.write_locked(&mut state, target, data, true).await
    }

    async fn write_locked(
        &self,
        state: &mut TreeState,
        target: String,
        data: &[u8],
        exclusive: bool,
    ) -> Result<()> {
        match state.kind(&target) {
            Some(NodeKind::Directory) => return Err(NamespaceError::IsADirectory(target)),
            Some(NodeKind::File) if exclusive => return Err(NamespaceError::AlreadyExists(target)),
            _ => {}
        }
        state.require_parent_dir(&target)?;

        self.store.write(&target, data).await?;
        state.add_child(&target);
        self.repo
            .upsert(NodeRecord::file(target.as_str(), data.to_vec()))
            .await?;

        debug!("{}: wrote {} bytes to {}", self.owner, data.len(), target);
        Ok(())
    }

    pub async fn read(&self, input: &str) -> Result<Bytes> {
        let state = self.state.read().await;
        let target = Self::resolve(&state.cwd, input)?;
        match state.kind(&target) {
            Some(NodeKind::File) => self.store.read(&target).await,
            Some(NodeKind::Directory) => Err(NamespaceError::IsADirectory(target)),
            None => Err(NamespaceError::NotFound(target)),
        }
    }

    pub async fn stat(&self, input: &str) -> Result<NodeStat> {
        let state = self.state.read().await;
        let target = Self::resolve(&state.cwd, input)?;
        match state.kind(&target) {
            Some(NodeKind::Directory) => Ok(NodeStat {
                name: path::base_name(&target).to_string(),
                kind: NodeKind::Directory,
                size: state.dir_map.get(&target).map_or(0, |c| c.len() as u64),
                path: target,
            }),
            Some(NodeKind::File) => self
                .store
                .stat(&target)
                .await?
                .ok_or_else(|| NamespaceError::Storage(format!("missing node body: {}", target))),
            None => Err(NamespaceError::NotFound(target)),
        }
    }

    /// Sorted child names of a directory
    pub async fn list(&self, input: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let target = Self::resolve(&state.cwd, input)?;
        match state.dir_map.get(&target) {
            Some(children) => Ok(children.iter().cloned().collect()),
            None if state.kind(&target).is_some() => Err(NamespaceError::NotADirectory(target)),
            None => Err(NamespaceError::NotFound(target)),
        }
    }

    /// Move a file or directory to a path that does not exist yet
    pub async fn move_node(&self, src: &str, dst: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let source = Self::resolve(&state.cwd, src)?;
        let target = Self::resolve(&state.cwd, dst)?;

        if source == path::ROOT || target == path::ROOT {
            return Err(NamespaceError::InvalidPath("cannot move the root".to_string()));
        }
        let kind = state
            .kind(&source)
            .ok_or_else(|| NamespaceError::NotFound(source.clone()))?;
        if state.kind(&target).is_some() {
            return Err(NamespaceError::AlreadyExists(target));
        }
        if kind == NodeKind::Directory && path::is_within(&target, &source) {
            return Err(NamespaceError::InvalidPath(format!(
                "cannot move {} into itself",
                source
            )));
        }
        state.require_parent_dir(&target)?;

        self.store.rename(&source, &target).await?;

        state.remove_child(&source);
        state.add_child(&target);
        if kind == NodeKind::Directory {
            let moved: Vec<String> = state
                .dir_map
                .keys()
                .filter(|key| path::is_within(key, &source))
                .cloned()
                .collect();
            for old in moved {
                if let (Some(children), Some(new)) = (
                    state.dir_map.remove(&old),
                    path::rebase(&old, &source, &target),
                ) {
                    state.dir_map.insert(new, children);
                }
            }
        }

        self.repo.rewrite_path_prefix(&source, &target).await?;

        debug!("{}: moved {} to {}", self.owner, source, target);
        Ok(())
    }

    /// Remove a file, or a directory with everything below it
    pub async fn remove(&self, input: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = Self::resolve(&state.cwd, input)?;

        if target == path::ROOT {
            return Err(NamespaceError::InvalidPath("cannot remove the root".to_string()));
        }
        if state.kind(&target).is_none() {
            return Err(NamespaceError::NotFound(target));
        }

        // Pre-order walk; removal runs in reverse so children go first.
        let mut order = Vec::new();
        let mut stack = vec![target.clone()];
        while let Some(current) = stack.pop() {
            if let Some(children) = state.dir_map.get(&current) {
                stack.extend(children.iter().map(|name| path::join(&current, name)));
            }
            order.push(current);
        }

        for entry in order.iter().rev() {
            self.store.remove(entry).await?;
            state.remove_child(entry);
            state.dir_map.remove(entry);
            self.repo.delete_by_path_or_parent(entry).await?;
        }

        debug!("{}: removed {} ({} nodes)", self.owner, target, order.len());
        Ok(())
    }

    pub async fn change_dir(&self, input: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let target = Self::resolve(&state.cwd, input)?;
        match state.kind(&target) {
            Some(NodeKind::Directory) => {
                state.cwd = target;
                Ok(())
            }
            Some(NodeKind::File) => Err(NamespaceError::NotADirectory(target)),
            None => Err(NamespaceError::NotFound(target)),
        }
    }

    pub async fn current_dir(&self) -> String {
        self.state.read().await.cwd.clone()
    }

    /// Copy of the in-memory directory map
    pub async fn directory_map(&self) -> DirectoryMap {
        self.state.read().await.dir_map.clone()
    }
}
