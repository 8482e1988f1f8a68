//! Per-thread connection multiplexer (C3).
//!
//! REST worker threads are assigned a small integer `threadId`. Each call
//! into a store passes that id down to [`ConnectionMultiplexer::acquire`],
//! which hands back a fresh, uniquely-owned connection named after the id.
//! A second `acquire` for the same id does not reuse the first connection:
//! the multiplexer drops any bookkeeping for the old name and opens a new
//! one, guaranteeing per-thread isolation without cross-talk between
//! in-flight handlers that happen to share a thread id.
//!
//! This deliberately does not pool-reuse connections. Pooling throughput
//! is not the design goal here; per-thread isolation and open/close
//! hygiene are.

use crate::database::{DatabaseError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::ConnectOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection settings, mutex-protected so `configure` can be called while
/// handlers are in flight; new settings take effect on the next `acquire`.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file, e.g. `"sqlitedbc.db"` or `":memory:"`.
    pub database_name: String,
    /// Busy timeout applied to every opened connection.
    pub busy_timeout: Duration,
    /// Whether to create the database file if it is missing.
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_name: "sentrydbc.db".to_string(),
            busy_timeout: Duration::from_millis(5000),
            create_if_missing: true,
        }
    }
}

/// A single, uniquely-owned connection checked out under a name.
///
/// Dropping the handle without calling [`Handle::release`] still closes
/// the underlying connection (sqlx closes on drop), but `release` makes
/// the close point explicit and clears the multiplexer's bookkeeping for
/// the name immediately instead of waiting on the destructor.
pub struct Handle {
    conn: Option<SqliteConnection>,
    name: String,
    /// Token minted for this specific checkout; only a drop/release that
    /// still owns the registry's current token for `name` may remove it —
    /// a stale handle whose name was reacquired by someone else must not
    /// clear the newer checkout's bookkeeping.
    token: u64,
    registry: Arc<DashMap<String, u64>>,
}

impl Handle {
    /// Borrow the underlying sqlx connection for issuing queries.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        self.conn.as_mut().expect("handle used after release")
    }

    /// The name this connection was checked out under.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn release_registry_entry(&self) {
        self.registry.remove_if(&self.name, |_, current| *current == self.token);
    }

    /// Close the connection and drop the multiplexer's bookkeeping entry,
    /// provided this handle still owns that entry.
    pub async fn release(mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            sqlx::Connection::close(conn)
                .await
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        }
        self.release_registry_entry();
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.release_registry_entry();
    }
}

/// Per-thread connection multiplexer.
pub struct ConnectionMultiplexer {
    config: RwLock<DatabaseConfig>,
    checked_out: Arc<DashMap<String, u64>>,
    unique_counter: AtomicU64,
}

impl ConnectionMultiplexer {
    /// Construct a multiplexer. Does not eagerly open any connection.
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        Ok(Self {
            config: RwLock::new(config),
            checked_out: Arc::new(DashMap::new()),
            unique_counter: AtomicU64::new(0),
        })
    }

    /// Replace the active configuration. Already-checked-out handles keep
    /// using the settings they were opened with; only the next `acquire`
    /// observes the change.
    pub fn configure(&self, config: DatabaseConfig) {
        *self.config.write() = config;
    }

    /// Acquire a connection named after `thread_id`. If a connection was
    /// already checked out under that name, its bookkeeping entry is
    /// replaced (the prior `Handle`, if still held by the caller, remains
    /// valid until dropped or released, but a second acquire for the same
    /// id always yields a brand new physical connection).
    pub async fn acquire(&self, thread_id: u32) -> Result<Handle> {
        self.open_named(thread_id.to_string()).await
    }

    /// Acquire a connection under a monotonically increasing synthetic
    /// name, for callers that are not tied to a worker thread index.
    pub async fn acquire_unique(&self) -> Result<Handle> {
        let id = self.unique_counter.fetch_add(1, Ordering::Relaxed);
        self.open_named(format!("unique-{id}")).await
    }

    async fn open_named(&self, name: String) -> Result<Handle> {
        let config = self.config.read().clone();

        let options = SqliteConnectOptions::new()
            .filename(&config.database_name)
            .create_if_missing(config.create_if_missing)
            .busy_timeout(config.busy_timeout)
            .disable_statement_logging();

        let conn = options
            .connect()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let token = self.unique_counter.fetch_add(1, Ordering::Relaxed);
        self.checked_out.insert(name.clone(), token);

        Ok(Handle {
            conn: Some(conn),
            name,
            token,
            registry: Arc::clone(&self.checked_out),
        })
    }

    /// Number of names currently checked out. Exposed for diagnostics and
    /// tests; not part of the core contract.
    pub fn outstanding(&self) -> usize {
        self.checked_out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> DatabaseConfig {
        DatabaseConfig {
            database_name: ":memory:".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_opens_a_fresh_connection() {
        let mux = ConnectionMultiplexer::new(memory_config()).await.unwrap();
        let mut handle = mux.acquire(1).await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER)")
            .execute(handle.connection())
            .await
            .unwrap();
        assert_eq!(mux.outstanding(), 1);
        handle.release().await.unwrap();
        assert_eq!(mux.outstanding(), 0);
    }

    #[tokio::test]
    async fn reacquiring_the_same_thread_id_replaces_the_name() {
        let mux = ConnectionMultiplexer::new(memory_config()).await.unwrap();
        let first = mux.acquire(7).await.unwrap();
        assert_eq!(mux.outstanding(), 1);
        let second = mux.acquire(7).await.unwrap();
        // Same bookkeeping slot, still exactly one entry for name "7".
        assert_eq!(mux.outstanding(), 1);

        // Dropping the stale first handle must not clear the second
        // handle's still-live bookkeeping entry.
        drop(first);
        assert_eq!(mux.outstanding(), 1);

        drop(second);
        assert_eq!(mux.outstanding(), 0);
    }

    #[tokio::test]
    async fn acquire_unique_mints_distinct_names() {
        let mux = ConnectionMultiplexer::new(memory_config()).await.unwrap();
        let a = mux.acquire_unique().await.unwrap();
        let b = mux.acquire_unique().await.unwrap();
        assert_ne!(a.name(), b.name());
    }
}
