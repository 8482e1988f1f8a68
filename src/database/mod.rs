//! Database layer: a per-thread connection multiplexer (C3) backed by SQLite.
//!
//! Every store (secrets, capabilities, mapping, aggregator) acquires a
//! connection by an opaque `threadId` before doing any work and releases it
//! when done. The multiplexer does not pool-reuse connections: each
//! `acquire` opens a fresh one, matching the behavior of the system this
//! replaces.

use thiserror::Error;

/// Errors surfaced by the database layer.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The pool could not open a new connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A query failed to execute.
    #[error("query execution error: {0}")]
    QueryExecution(String),

    /// I/O error surfaced while touching the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced directly by sqlx.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Result type used throughout the database layer.
pub type Result<T> = std::result::Result<T, DatabaseError>;

pub mod multiplexer;

pub use multiplexer::{ConnectionMultiplexer, DatabaseConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multiplexer_construction() {
        let config = DatabaseConfig::default();
        let mux = ConnectionMultiplexer::new(config).await;
        assert!(mux.is_ok());
    }
}
