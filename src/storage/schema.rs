//! Schema definitions and the versioned migration runner.
//!
//! Migrations are applied strictly in version order, all inside one
//! transaction: if any step fails the whole run rolls back and the recorded
//! version is unchanged. Re-invoking the runner is always safe; versions at
//! or below the recorded one are skipped.

use crate::{Error, Result};
use rusqlite::{params, Connection};

/// The schema version this build targets.
pub const SCHEMA_VERSION: i64 = 1;

/// One schema migration: forward and reverse statement lists.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: Vec<&'static str>,
    pub down: Vec<&'static str>,
}

const V1_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        path TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        git_repository TEXT, -- JSON object
        agent_ids TEXT NOT NULL, -- JSON array
        max_agents INTEGER NOT NULL DEFAULT 10,
        port_range TEXT, -- JSON object
        description TEXT,
        tags TEXT NOT NULL, -- JSON array
        metadata TEXT NOT NULL, -- JSON object
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_accessed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        project_id TEXT NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        branch TEXT NOT NULL,
        worktree_path TEXT NOT NULL,
        tmux_session TEXT,
        docker_container TEXT,
        docker_image TEXT,
        docker_ports TEXT NOT NULL, -- JSON array
        docker_volumes TEXT NOT NULL, -- JSON array
        auto_accept INTEGER NOT NULL DEFAULT 0,
        environment_vars TEXT NOT NULL, -- JSON object
        current_task_id TEXT,
        assigned_tasks TEXT NOT NULL, -- JSON array
        description TEXT,
        tags TEXT NOT NULL, -- JSON array
        metadata TEXT NOT NULL, -- JSON object
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_accessed_at TEXT,

        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        details TEXT,
        status TEXT NOT NULL,
        priority TEXT NOT NULL,
        assigned_to_agent_id TEXT,
        parent_task_id TEXT,
        subtask_ids TEXT NOT NULL, -- JSON array
        dependencies TEXT NOT NULL, -- JSON array
        tags TEXT NOT NULL, -- JSON array
        metadata TEXT NOT NULL, -- JSON object
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        assigned_at TEXT,
        started_at TEXT,
        completed_at TEXT,

        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
        FOREIGN KEY (assigned_to_agent_id) REFERENCES agents(id) ON DELETE SET NULL,
        FOREIGN KEY (parent_task_id) REFERENCES tasks(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        id TEXT PRIMARY KEY DEFAULT 'global',
        max_agents INTEGER NOT NULL DEFAULT 10,
        default_mode TEXT NOT NULL DEFAULT 'docker',
        auto_accept INTEGER NOT NULL DEFAULT 0,
        default_port_range TEXT, -- JSON object
        reserved_ports TEXT NOT NULL, -- JSON array
        data_dir TEXT,
        backup_history TEXT NOT NULL, -- JSON array, the backup ledger
        version TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action TEXT NOT NULL,
        data TEXT NOT NULL, -- JSON
        previous_data TEXT, -- JSON
        timestamp TEXT NOT NULL,
        source TEXT NOT NULL,
        metadata TEXT NOT NULL -- JSON object
    )
    "#,
];

const V1_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_agents_project_id ON agents(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status)",
    "CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_assigned_to ON tasks(assigned_to_agent_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events(type)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_id)",
];

const V1_DOWN: &[&str] = &[
    "DROP TABLE IF EXISTS events",
    "DROP TABLE IF EXISTS tasks",
    "DROP TABLE IF EXISTS agents",
    "DROP TABLE IF EXISTS projects",
    "DROP TABLE IF EXISTS config",
];

/// The ordered migration list. Versions are monotonic starting at 1.
pub fn migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "initial_schema",
        // Tables first, then indexes.
        up: V1_TABLES.iter().chain(V1_INDEXES).copied().collect(),
        down: V1_DOWN.to_vec(),
    }]
}

/// Outcome of one migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub success: bool,
    pub from_version: i64,
    pub to_version: i64,
    pub migrations_applied: Vec<String>,
    pub errors: Vec<String>,
}

/// Create the ledger table if it does not exist yet.
pub(crate) fn ensure_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            executed_at TEXT NOT NULL
        )
        "#,
    )?;
    Ok(())
}

/// Read the recorded schema version; 0 when the ledger is absent or empty.
pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    let ledger_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'migrations'",
        [],
        |row| row.get(0),
    )?;

    if !ledger_exists {
        return Ok(0);
    }

    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Apply all pending migrations inside one transaction.
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<MigrationReport> {
    let from_version = current_version(conn)?;

    let mut report = MigrationReport {
        success: true,
        from_version,
        to_version: from_version,
        migrations_applied: Vec::new(),
        errors: Vec::new(),
    };

    if from_version >= SCHEMA_VERSION {
        return Ok(report);
    }

    ensure_ledger(conn)?;

    let pending: Vec<Migration> = migrations()
        .into_iter()
        .filter(|m| m.version > from_version)
        .collect();

    let tx = conn.transaction()?;
    for migration in &pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        for statement in &migration.up {
            if let Err(e) = tx.execute_batch(statement) {
                let msg = format!(
                    "migration {} ({}) failed: {}",
                    migration.version, migration.name, e
                );
                tracing::error!(error = %msg, "migration run aborted, rolling back");
                // Dropping the uncommitted transaction rolls the whole run back.
                drop(tx);
                report.success = false;
                report.errors.push(msg);
                report.migrations_applied.clear();
                return Ok(report);
            }
        }
        tx.execute(
            "INSERT INTO migrations (version, name, executed_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        report
            .migrations_applied
            .push(format!("{}: {}", migration.version, migration.name));
    }
    tx.commit()?;

    report.to_version = SCHEMA_VERSION;
    Ok(report)
}

/// Convert a failed report into an error for callers that need hard failure.
impl MigrationReport {
    pub fn into_result(self) -> Result<MigrationReport> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Migration(self.errors.join("; ")))
        }
    }
}
