//! Storage layer: the schema store owns the single writable SQLite
//! connection, applies durability pragmas, runs versioned migrations, and
//! provides file-level backup/restore.
//!
//! All higher layers (repositories, the consistency engine, the sync
//! server) go through this one connection; SQLite's single-writer journaling
//! serializes writes, and the crate-level [`crate::SharedStore`] mutex
//! serializes access from async tasks.

pub mod import;
pub mod repository;
pub mod schema;

pub use import::{ImportConfig, ImportReport, LegacyImporter};
pub use repository::{
    AgentRepository, ConfigRepository, EventRepository, ProjectRepository, Repository,
    TaskRepository,
};
pub use schema::{Migration, MigrationReport, SCHEMA_VERSION};

use crate::{Error, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

/// How to open the store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Path to the store file; `None` selects the default under `~/.magents/`.
    pub path: Option<PathBuf>,
    /// Keep everything in memory (tests, dry runs). Backup is refused.
    pub in_memory: bool,
    /// Open read-only; write statements are rejected up front.
    pub read_only: bool,
}

impl StoreConfig {
    /// Config for a store at an explicit path.
    pub fn at<P: Into<PathBuf>>(path: P) -> Self {
        StoreConfig {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Config for an in-memory store.
    pub fn in_memory() -> Self {
        StoreConfig {
            in_memory: true,
            ..Default::default()
        }
    }
}

/// Default store path: `~/.magents/magents.db`.
pub fn default_store_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Configuration("could not determine home directory".to_string()))?;
    Ok(home.join(".magents").join("magents.db"))
}

/// Store-level statistics, for inspection by the CLI/GUI layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub version: i64,
    pub path: String,
    pub read_only: bool,
    pub page_count: i64,
    pub page_size: i64,
    pub journal_mode: String,
    pub foreign_keys: bool,
    pub tables: Vec<String>,
}

/// Persistent relational store; sole owner of the connection.
pub struct SchemaStore {
    conn: Connection,
    path: Option<PathBuf>,
    read_only: bool,
    version: i64,
}

impl SchemaStore {
    /// Open (creating if missing) the store described by `config`, apply
    /// pragmas, and run pending migrations unless the store is read-only.
    ///
    /// Fails fatally with [`Error::Configuration`] when the storage location
    /// cannot be created or opened.
    pub fn initialize(config: &StoreConfig) -> Result<Self> {
        let (conn, path) = if config.in_memory {
            (Connection::open_in_memory()?, None)
        } else {
            let path = match &config.path {
                Some(p) => p.clone(),
                None => default_store_path()?,
            };
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::Configuration(format!(
                        "cannot create store directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
            }
            let conn = if config.read_only {
                Connection::open_with_flags(
                    &path,
                    rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
                )
                .map_err(|e| {
                    Error::Configuration(format!("cannot open store {}: {}", path.display(), e))
                })?
            } else {
                Connection::open(&path).map_err(|e| {
                    Error::Configuration(format!("cannot open store {}: {}", path.display(), e))
                })?
            };
            (conn, Some(path))
        };

        Self::apply_pragmas(&conn, config.in_memory)?;

        let mut store = SchemaStore {
            version: schema::current_version(&conn)?,
            conn,
            path,
            read_only: config.read_only,
        };

        if !store.read_only {
            let report = store.run_migrations()?.into_result()?;
            store.version = report.to_version;
        }

        tracing::debug!(
            version = store.version,
            path = %store.describe_path(),
            "store initialized"
        );
        Ok(store)
    }

    /// Durability and performance pragmas: enforced foreign keys,
    /// write-ahead journaling (file-backed stores only), normal sync.
    fn apply_pragmas(conn: &Connection, in_memory: bool) -> Result<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if !in_memory {
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    /// Run pending migrations; no-op success when already at the target.
    pub fn run_migrations(&mut self) -> Result<MigrationReport> {
        if self.read_only {
            return Err(Error::InvalidInput(
                "cannot run migrations on a read-only store".to_string(),
            ));
        }
        let report = schema::run_migrations(&mut self.conn)?;
        if report.success {
            self.version = report.to_version;
        }
        Ok(report)
    }

    /// The recorded schema version.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Whether the store was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The store file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn describe_path(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    /// Borrow the connection for reads and single-statement writes.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Borrow the connection mutably, for transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Execute a raw statement. Writes are rejected up front on a
    /// read-only connection.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        if self.read_only && is_write_statement(sql) {
            return Err(Error::InvalidInput(
                "write operations not allowed on a read-only store".to_string(),
            ));
        }
        Ok(self.conn.execute(sql, params)?)
    }

    /// Repository over agents.
    pub fn agents(&self) -> AgentRepository<'_> {
        AgentRepository::new(&self.conn)
    }

    /// Repository over projects.
    pub fn projects(&self) -> ProjectRepository<'_> {
        ProjectRepository::new(&self.conn)
    }

    /// Repository over tasks.
    pub fn tasks(&self) -> TaskRepository<'_> {
        TaskRepository::new(&self.conn)
    }

    /// Repository over the single config row.
    pub fn config(&self) -> ConfigRepository<'_> {
        ConfigRepository::new(&self.conn)
    }

    /// Repository over the persisted sync-event log.
    pub fn events(&self) -> EventRepository<'_> {
        EventRepository::new(&self.conn)
    }

    /// Snapshot the store file to `target`. Refused for in-memory stores.
    pub fn backup<P: AsRef<Path>>(&self, target: P) -> Result<u64> {
        let source = self.path.as_ref().ok_or_else(|| {
            Error::InvalidInput("cannot back up an in-memory store".to_string())
        })?;
        let target = target.as_ref();

        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }

        // Flush the WAL so the main file alone is a complete snapshot.
        // wal_checkpoint reports a result row, so it cannot go through
        // pragma_update.
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        let bytes = fs::copy(source, target)?;
        tracing::info!(target = %target.display(), bytes, "store backed up");
        Ok(bytes)
    }

    /// Overwrite the store file from `source` and reopen the connection.
    ///
    /// The connection is closed first so the journal is flushed; callers
    /// holding the shared-store mutex therefore get an exclusive window and
    /// concurrent writers queue until the restore completes.
    pub fn restore<P: AsRef<Path>>(&mut self, source: P) -> Result<()> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(Error::NotFound(format!(
                "backup file not found: {}",
                source.display()
            )));
        }
        let dest = self
            .path
            .clone()
            .ok_or_else(|| Error::InvalidInput("cannot restore an in-memory store".to_string()))?;

        // Swap in a placeholder so the old connection can be closed by value.
        let old = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        if let Err((conn, e)) = old.close() {
            self.conn = conn;
            return Err(Error::Connection(format!("failed to close store: {}", e)));
        }

        // The previous bytes stay aside until the restored file proves
        // openable, so a failed restore rolls back to them instead of
        // leaving the store on the placeholder connection.
        let kept = PathBuf::from(format!("{}.restoring", dest.display()));
        match Self::swap_store_file(source, &dest, &kept) {
            Ok((conn, version)) => {
                let _ = fs::remove_file(&kept);
                self.conn = conn;
                self.version = version;
                tracing::info!(source = %source.display(), "store restored");
                Ok(())
            }
            Err(e) => {
                if kept.exists() {
                    let _ = fs::remove_file(&dest);
                    fs::rename(&kept, &dest)?;
                }
                let conn = Connection::open(&dest)?;
                Self::apply_pragmas(&conn, false)?;
                self.version = schema::current_version(&conn)?;
                self.conn = conn;
                tracing::warn!(
                    source = %source.display(),
                    error = %e,
                    "restore failed; previous store reopened"
                );
                Err(e)
            }
        }
    }

    /// Replace `dest` with `source` and open it, parking the old bytes at
    /// `kept`. Any failure leaves `kept` in place for the caller to roll
    /// back from.
    fn swap_store_file(source: &Path, dest: &Path, kept: &Path) -> Result<(Connection, i64)> {
        // WAL/SHM sidecars from the old incarnation must not shadow the
        // restored file.
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{}", dest.display(), suffix));
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
        }
        fs::rename(dest, kept)?;
        fs::copy(source, dest)?;

        let conn = Connection::open(dest)?;
        Self::apply_pragmas(&conn, false)?;
        let version = schema::current_version(&conn)?;
        Ok((conn, version))
    }

    /// Store statistics for inspection.
    pub fn stats(&self) -> Result<StoreStats> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let journal_mode: String = self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let foreign_keys: bool = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            version: self.version,
            path: self.describe_path(),
            read_only: self.read_only,
            page_count,
            page_size,
            journal_mode,
            foreign_keys,
            tables,
        })
    }
}

/// Crude but sufficient write detection for the read-only guard.
fn is_write_statement(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "CREATE" | "DROP" | "ALTER" | "REPLACE"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SchemaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::initialize(&StoreConfig::at(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_initialize_runs_migrations() {
        let (_dir, store) = open_temp();
        assert_eq!(store.version(), SCHEMA_VERSION);
        let stats = store.stats().unwrap();
        assert!(stats.tables.contains(&"agents".to_string()));
        assert!(stats.tables.contains(&"events".to_string()));
        assert!(stats.tables.contains(&"migrations".to_string()));
        assert!(stats.foreign_keys);
        assert_eq!(stats.journal_mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_in_memory_store_refuses_backup() {
        let store = SchemaStore::initialize(&StoreConfig::in_memory()).unwrap();
        let err = store.backup("/tmp/nope.db").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_write_statement_detection() {
        assert!(is_write_statement("INSERT INTO x VALUES (1)"));
        assert!(is_write_statement("  update x set y = 1"));
        assert!(is_write_statement("DROP TABLE x"));
        assert!(!is_write_statement("SELECT * FROM x"));
        assert!(!is_write_statement("PRAGMA page_count"));
    }

    #[test]
    fn test_read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        // Create and migrate first with a writable connection.
        drop(SchemaStore::initialize(&StoreConfig::at(&path)).unwrap());

        let ro = SchemaStore::initialize(&StoreConfig {
            path: Some(path),
            in_memory: false,
            read_only: true,
        })
        .unwrap();
        let err = ro
            .execute("DELETE FROM agents", &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_backup_and_restore_roundtrip() {
        let (dir, mut store) = open_temp();
        let backup_path = dir.path().join("snap.db");

        store
            .execute(
                "INSERT INTO projects (id, name, path, status, agent_ids, max_agents, tags, metadata, created_at, updated_at)
                 VALUES ('proj-1', 'p', '/tmp/p', 'ACTIVE', '[]', 10, '[]', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                &[],
            )
            .unwrap();
        store.backup(&backup_path).unwrap();

        store.execute("DELETE FROM projects", &[]).unwrap();
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        store.restore(&backup_path).unwrap();
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.version(), SCHEMA_VERSION);
    }

    #[test]
    fn test_failed_restore_reopens_previous_store() {
        let (dir, mut store) = open_temp();
        store
            .execute(
                "INSERT INTO projects (id, name, path, status, agent_ids, max_agents, tags, metadata, created_at, updated_at)
                 VALUES ('proj-1', 'p', '/tmp/p', 'ACTIVE', '[]', 10, '[]', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                &[],
            )
            .unwrap();

        let bogus = dir.path().join("bogus.db");
        fs::write(&bogus, b"this is not a database").unwrap();
        store.restore(&bogus).unwrap_err();

        // The store rolled back to the previous file and stays usable.
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.version(), SCHEMA_VERSION);
        let kept = PathBuf::from(format!(
            "{}.restoring",
            store.path().unwrap().display()
        ));
        assert!(!kept.exists());
    }

    #[test]
    fn test_restore_missing_file_is_not_found() {
        let (_dir, mut store) = open_temp();
        let err = store.restore("/definitely/not/here.db").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
