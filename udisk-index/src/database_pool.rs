//! Thread-safe SQLite connection pool backed by r2d2
//!
//! Blocking SQLite work is moved off the async runtime with
//! `spawn_blocking`, so repository calls can be awaited from request
//! handlers without stalling other tasks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, TransactionBehavior};
use tokio::task;
use tracing::debug;

use crate::errors::{IndexError, Result};
use crate::repository::MetadataRepository;
use crate::schema::{PRAGMAS, SCHEMA, SCHEMA_VERSION};

/// Connection pool shared by every user's metadata repository
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabasePool {
    /// Create a new database pool for a file-based database with default settings
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).build()
    }

    /// Create a new in-memory database pool (for testing)
    ///
    /// Every SQLite in-memory connection is its own database, so the pool
    /// holds exactly one connection.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            initialize_schema(conn)
        });

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| IndexError::DatabaseError(format!("Pool creation failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create a builder for configuring the database pool
    pub fn builder() -> DatabasePoolBuilder {
        DatabasePoolBuilder::new()
    }

    /// Metadata repository scoped to a single namespace owner
    pub fn repository(&self, owner: impl Into<String>) -> MetadataRepository {
        MetadataRepository::new(self.clone(), owner)
    }

    /// Execute a database operation on a pooled connection in a blocking context.
    pub(crate) async fn execute_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| {
                IndexError::DatabaseError(format!("Failed to get connection: {}", e))
            })?;

            f(&conn)
        })
        .await
        .map_err(|e| IndexError::DatabaseError(format!("Task join error: {}", e)))?
    }

    /// Execute `f` inside an immediate transaction, committing on success.
    ///
    /// Any error returned by `f` drops the transaction, rolling it back.
    pub(crate) async fn execute_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                IndexError::DatabaseError(format!("Failed to get connection: {}", e))
            })?;

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = f(&tx)?;
            tx.commit()?;

            Ok(result)
        })
        .await
        .map_err(|e| IndexError::DatabaseError(format!("Task join error: {}", e)))?
    }

    /// Get connection pool statistics as `(connections, idle_connections)`
    pub fn pool_stats(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

/// Builder for DatabasePool with configuration options
pub struct DatabasePoolBuilder {
    path: Option<PathBuf>,
    max_size: u32,
    connection_timeout: Duration,
    busy_timeout: Duration,
}

impl DatabasePoolBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            path: None,
            max_size: 8,
            connection_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Set the database file path
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum number of connections in the pool
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the connection checkout timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set how long a connection waits on a locked database
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Build the database pool
    pub fn build(self) -> Result<DatabasePool> {
        let path = self.path.ok_or_else(|| {
            IndexError::DatabaseError(
                "Path is required for file-based databases. Use new_in_memory() for in-memory databases.".to_string(),
            )
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let busy_timeout = self.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(PRAGMAS)?;
            initialize_schema(conn)
        });

        let pool = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .build(manager)
            .map_err(|e| IndexError::DatabaseError(format!("Pool creation failed: {}", e)))?;

        debug!("Opened metadata database at {:?}", path);
        Ok(DatabasePool { pool })
    }
}

impl Default for DatabasePoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Create tables if needed and check the stored schema version
fn initialize_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    let version: u32 = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get(0)
    })?;

    if version != SCHEMA_VERSION {
        let error = IndexError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            actual: version,
        };
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_SCHEMA),
            Some(error.to_string()),
        ));
    }

    Ok(())
}
