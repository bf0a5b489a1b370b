use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::database_pool::DatabasePool;
use crate::errors::{IndexError, Result};
use crate::path;

/// Directory path to the ordered names of its immediate children
pub type DirectoryMap = BTreeMap<String, BTreeSet<String>>;

/// One persisted namespace node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: Option<i64>,
    pub path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub is_directory: bool,
    pub content: Option<Vec<u8>>,
}

impl NodeRecord {
    /// Directory record for a normalized path
    pub fn directory(node_path: impl Into<String>) -> Self {
        Self::build(node_path.into(), true, None)
    }

    /// File record for a normalized path with its payload
    pub fn file(node_path: impl Into<String>, content: Vec<u8>) -> Self {
        Self::build(node_path.into(), false, Some(content))
    }

    fn build(node_path: String, is_directory: bool, content: Option<Vec<u8>>) -> Self {
        Self {
            id: None,
            name: path::base_name(&node_path).to_string(),
            parent_path: path::parent(&node_path).map(str::to_string),
            path: node_path,
            is_directory,
            content,
        }
    }
}

/// Durable store of one owner's namespace nodes.
///
/// Rows are keyed by `(owner, path)`. Every row except the root points at
/// its parent directory's row, and deleting a row cascades to everything
/// below it.
#[derive(Clone)]
pub struct MetadataRepository {
    pool: DatabasePool,
    owner: String,
}

impl MetadataRepository {
    pub fn new(pool: DatabasePool, owner: impl Into<String>) -> Self {
        Self {
            pool,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Insert the root directory row if it is missing
    pub async fn ensure_root(&self) -> Result<()> {
        let owner = self.owner.clone();
        self.pool
            .execute_transaction(move |tx| {
                tx.execute(
                    r#"
                    INSERT INTO nodes (owner, name, path, parent_id, is_directory)
                    VALUES (?1, '', ?2, NULL, 1)
                    ON CONFLICT(owner, path) DO NOTHING
                    "#,
                    params![owner, path::ROOT],
                )?;
                Ok(())
            })
            .await
    }

    /// Insert or replace the row at `node.path`.
    ///
    /// The parent directory row must already exist; ancestors are never
    /// created here.
    pub async fn upsert(&self, node: NodeRecord) -> Result<i64> {
        let owner = self.owner.clone();
        self.pool
            .execute_transaction(move |tx| {
                let parent_id = match node.parent_path.as_deref() {
                    None => None,
                    Some(parent) => Some(directory_id(tx, &owner, parent)?),
                };

                let id = tx.query_row(
                    r#"
                    INSERT INTO nodes (owner, name, path, parent_id, is_directory, content)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(owner, path) DO UPDATE SET
                        name = excluded.name,
                        parent_id = excluded.parent_id,
                        is_directory = excluded.is_directory,
                        content = excluded.content,
                        updated_at = CURRENT_TIMESTAMP
                    RETURNING id
                    "#,
                    params![
                        owner,
                        node.name,
                        node.path,
                        parent_id,
                        node.is_directory,
                        node.content,
                    ],
                    |row| row.get(0),
                )?;

                trace!("Upserted {}:{} as row {}", owner, node.path, id);
                Ok(id)
            })
            .await
    }

    /// Fetch the row at `node_path`
    pub async fn get(&self, node_path: &str) -> Result<Option<NodeRecord>> {
        let owner = self.owner.clone();
        let node_path = node_path.to_string();
        self.pool
            .execute_blocking(move |conn| {
                let record = conn
                    .query_row(
                        r#"
                        SELECT n.id, n.path, n.name, p.path, n.is_directory, n.content
                        FROM nodes n LEFT JOIN nodes p ON n.parent_id = p.id
                        WHERE n.owner = ?1 AND n.path = ?2
                        "#,
                        params![owner, node_path],
                        read_record,
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }

    pub async fn exists(&self, node_path: &str) -> Result<bool> {
        let owner = self.owner.clone();
        let node_path = node_path.to_string();
        self.pool
            .execute_blocking(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM nodes WHERE owner = ?1 AND path = ?2",
                    params![owner, node_path],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Delete the row at `node_path` and every row whose parent is that row.
    ///
    /// Returns the number of rows removed directly; rows further down go
    /// with them through the parent cascade. Deleting a missing path is not
    /// an error.
    pub async fn delete_by_path_or_parent(&self, node_path: &str) -> Result<usize> {
        let owner = self.owner.clone();
        let node_path = node_path.to_string();
        self.pool
            .execute_transaction(move |tx| {
                let id: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM nodes WHERE owner = ?1 AND path = ?2",
                        params![owner, node_path],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(id) = id else {
                    return Ok(0);
                };

                let deleted = tx.execute(
                    "DELETE FROM nodes WHERE owner = ?1 AND (id = ?2 OR parent_id = ?2)",
                    params![owner, id],
                )?;

                debug!("Deleted {} rows at {}:{}", deleted, owner, node_path);
                Ok(deleted)
            })
            .await
    }

    /// Move the row at `old` to `new` and rewrite every descendant path.
    ///
    /// Only rows equal to `old` or below it by whole segments are touched;
    /// `/ab/c` is not a descendant of `/a`. The rewrite happens in a single
    /// transaction, so a failure leaves every row as it was. Returns the
    /// number of rows rewritten.
    pub async fn rewrite_path_prefix(&self, old: &str, new: &str) -> Result<usize> {
        if old == path::ROOT || new == path::ROOT {
            return Err(IndexError::InvalidPath("cannot move the root".to_string()));
        }
        if path::is_within(new, old) {
            return Err(IndexError::InvalidPath(format!(
                "cannot move {} below itself to {}",
                old, new
            )));
        }

        let owner = self.owner.clone();
        let old = old.to_string();
        let new = new.to_string();
        self.pool
            .execute_transaction(move |tx| {
                let moved: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM nodes WHERE owner = ?1 AND path = ?2",
                        params![owner, old],
                        |row| row.get(0),
                    )
                    .optional()?;
                if moved.is_none() {
                    return Err(IndexError::NodeNotFound(old));
                }

                let conflicts: i64 = tx.query_row(
                    r#"
                    SELECT COUNT(*) FROM nodes
                    WHERE owner = ?1
                      AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')
                    "#,
                    params![owner, new],
                    |row| row.get(0),
                )?;
                if conflicts > 0 {
                    return Err(IndexError::PathConflict(new));
                }

                let new_parent = path::parent(&new)
                    .ok_or_else(|| IndexError::InvalidPath(new.clone()))?;
                let parent_id = directory_id(tx, &owner, new_parent)?;

                let mut rewritten = tx.execute(
                    r#"
                    UPDATE nodes
                    SET path = ?3, name = ?4, parent_id = ?5, updated_at = CURRENT_TIMESTAMP
                    WHERE owner = ?1 AND path = ?2
                    "#,
                    params![owner, old, new, path::base_name(&new), parent_id],
                )?;

                rewritten += tx.execute(
                    r#"
                    UPDATE nodes
                    SET path = ?3 || substr(path, length(?2) + 1),
                        updated_at = CURRENT_TIMESTAMP
                    WHERE owner = ?1 AND substr(path, 1, length(?2) + 1) = ?2 || '/'
                    "#,
                    params![owner, old, new],
                )?;

                debug!("Rewrote {} rows from {} to {}", rewritten, old, new);
                Ok(rewritten)
            })
            .await
    }

    /// Rebuild the directory map for everything at or below `prefix`.
    ///
    /// Every directory row becomes a key, even when it has no children.
    pub async fn load_subtree(&self, prefix: &str) -> Result<DirectoryMap> {
        let records = self.load_nodes(prefix).await?;

        let mut dir_map = DirectoryMap::new();
        for record in &records {
            if record.is_directory {
                dir_map.entry(record.path.clone()).or_default();
            }
        }
        for record in records {
            if let Some(parent) = record.parent_path {
                if let Some(children) = dir_map.get_mut(&parent) {
                    children.insert(record.name);
                }
            }
        }

        Ok(dir_map)
    }

    /// All rows at or below `prefix`, parents before children.
    pub async fn load_nodes(&self, prefix: &str) -> Result<Vec<NodeRecord>> {
        let owner = self.owner.clone();
        let prefix = prefix.to_string();
        self.pool
            .execute_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT n.id, n.path, n.name, p.path, n.is_directory, n.content
                    FROM nodes n LEFT JOIN nodes p ON n.parent_id = p.id
                    WHERE n.owner = ?1
                      AND (?2 = '/' OR n.path = ?2 OR substr(n.path, 1, length(?2) + 1) = ?2 || '/')
                    ORDER BY n.path
                    "#,
                )?;

                let records = stmt
                    .query_map(params![owner, prefix], read_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
    }

    /// Number of rows owned by this repository's owner
    pub async fn count(&self) -> Result<u64> {
        let owner = self.owner.clone();
        self.pool
            .execute_blocking(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM nodes WHERE owner = ?1",
                    params![owner],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }
}

/// Row id of the directory at `dir_path`
fn directory_id(tx: &Transaction, owner: &str, dir_path: &str) -> Result<i64> {
    let row: Option<(i64, bool)> = tx
        .query_row(
            "SELECT id, is_directory FROM nodes WHERE owner = ?1 AND path = ?2",
            params![owner, dir_path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Err(IndexError::ParentNotFound(dir_path.to_string())),
        Some((_, false)) => Err(IndexError::ParentNotDirectory(dir_path.to_string())),
        Some((id, true)) => Ok(id),
    }
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        id: Some(row.get(0)?),
        path: row.get(1)?,
        name: row.get(2)?,
        parent_path: row.get(3)?,
        is_directory: row.get(4)?,
        content: row.get(5)?,
    })
}
