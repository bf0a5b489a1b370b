use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;
use udisk_index::DatabasePool;

use crate::errors::{NamespaceError, Result};
use crate::store::NodeStoreKind;
use crate::tree::NamespaceTree;

/// Settings shared by every tree the registry opens
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub node_store: NodeStoreKind,
}

/// Lazily opened namespace trees, one per user
pub struct UserRegistry {
    pool: DatabasePool,
    config: RegistryConfig,
    trees: RwLock<HashMap<String, Arc<OnceCell<Arc<NamespaceTree>>>>>,
}

impl UserRegistry {
    pub fn new(pool: DatabasePool, config: RegistryConfig) -> Self {
        Self {
            pool,
            config,
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Get the tree for `user_id`, opening it on first use.
    ///
    /// Concurrent first calls for the same user open the tree only once.
    /// The open runs outside the map lock, so lookups of other users never
    /// wait behind it.
    pub async fn tree(&self, user_id: &str) -> Result<Arc<NamespaceTree>> {
        validate_user_id(user_id)?;

        let cell = {
            let trees = self.trees.read().await;
            trees.get(user_id).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut trees = self.trees.write().await;
                Arc::clone(trees.entry(user_id.to_string()).or_default())
            }
        };

        let tree = cell
            .get_or_try_init(|| async move {
                let store = self.config.node_store.open(user_id).await?;
                let tree = NamespaceTree::open(self.pool.repository(user_id), store).await?;
                info!("Instantiated namespace for user {}", user_id);
                Ok::<_, NamespaceError>(Arc::new(tree))
            })
            .await?;
        Ok(Arc::clone(tree))
    }

    /// Users whose trees have been opened, sorted
    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .trees
            .read()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }
}

/// User ids double as directory names for disk-backed stores.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let invalid = user_id.is_empty()
        || user_id == "."
        || user_id == ".."
        || user_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(NamespaceError::InvalidUser(user_id.to_string()));
    }
    Ok(())
}
