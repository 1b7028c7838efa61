//! Magents core - the unified data layer for multi-agent coding sessions.
//!
//! This library lets a GUI process, CLI invocations, and an API layer mutate
//! one shared SQLite store concurrently without lost updates. It provides:
//!
//! - [`storage`]: the schema store, versioned migrations, and repositories
//! - [`engine`]: atomic multi-entity batches, savepoints, backup/restore
//! - [`activity`]: a bounded, queryable log of executed commands
//! - [`conflict`]: pairwise conflict detection and pluggable resolution
//! - [`sync`]: the WebSocket event bus (server, client, manager)
//! - [`core`]: the context object tying the pieces together

pub mod activity;
pub mod cli;
pub mod conflict;
pub mod core;
pub mod engine;
pub mod models;
pub mod storage;
pub mod sync;

use std::sync::Arc;

/// The store handle shared between the engine, the sync layer, and callers.
///
/// All writes serialize through this mutex; `restore` holds it for its whole
/// duration, so concurrent writers queue behind a restore instead of racing it.
pub type SharedStore = Arc<tokio::sync::Mutex<storage::SchemaStore>>;

/// Wrap a store for shared use.
pub fn shared(store: storage::SchemaStore) -> SharedStore {
    Arc::new(tokio::sync::Mutex::new(store))
}

/// Library-level error type for magents operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Fatal at initialization: missing driver, invalid path, bad config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure; retried by the sync client per its backoff policy.
    #[error("Connection error: {0}")]
    Connection(String),

    /// One migration step failed; the whole run was rolled back.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// One batch operation failed; the whole batch was rolled back.
    #[error("Transaction aborted: {0}")]
    Transaction(String),

    /// Restore row-count mismatch or a record that does not fit the schema.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for magents operations.
pub type Result<T> = std::result::Result<T, Error>;
