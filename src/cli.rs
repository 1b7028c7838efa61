//! CLI argument definitions for the magents data layer.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Magents - unified data layer for multi-agent coding sessions.
///
/// All commands operate on one shared SQLite store. Run `magents serve` in
/// the process that owns the store; other processes connect to it over the
/// sync protocol.
#[derive(Parser, Debug)]
#[command(name = "magents")]
#[command(author, version, about = "Unified data layer for multi-agent coding sessions", long_about = None)]
pub struct Cli {
    /// Path to the SQLite store. Defaults to ~/.magents/magents.db.
    /// Can also be set via the MAGENTS_DB environment variable.
    #[arg(long = "db", global = true, env = "MAGENTS_DB")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync server and broadcast store changes to connected clients
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:4500")]
        addr: std::net::SocketAddr,

        /// Maximum number of concurrent client connections
        #[arg(long, default_value_t = 100)]
        max_connections: usize,
    },

    /// Apply pending schema migrations and report the store version
    Migrate,

    /// Import legacy JSON state files into the store
    Import {
        /// Directory holding projects.json and agents.json
        #[arg(long)]
        data_dir: PathBuf,

        /// Report what would be imported without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Compare store counts against the JSON files after importing
        #[arg(long)]
        verify: bool,
    },

    /// Undo a previous import, restoring the JSON files from their backups
    RollbackImport {
        /// Directory holding the JSON files and their backups
        #[arg(long)]
        data_dir: PathBuf,
    },

    /// Create a backup of the store
    Backup {
        /// Free-form note recorded with the backup
        #[arg(long)]
        description: Option<String>,

        /// Directory to place backup files in. Defaults to ~/.magents/backups.
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Restore the store from a backup file
    Restore {
        /// Backup file to restore from
        path: PathBuf,

        /// Allow restoring a backup written by a newer schema version
        #[arg(long)]
        skip_version_check: bool,

        /// Do not snapshot the current store before restoring
        #[arg(long)]
        no_backup: bool,

        /// Validate the backup without touching the store
        #[arg(long)]
        dry_run: bool,
    },

    /// List recorded backups, newest first
    Backups,

    /// Delete old automatic backups per the retention policy
    Cleanup {
        /// Age cutoff in days for automatic backups
        #[arg(long, default_value_t = 30)]
        retention_days: i64,

        /// Hard cap on the number of retained backups
        #[arg(long, default_value_t = 10)]
        max_backups: usize,
    },

    /// Show store statistics
    Status,
}
