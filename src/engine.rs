//! The consistency engine: atomic multi-entity batches, savepoints, and
//! store-level backup, restore, and retention.
//!
//! Batches run inside one SQLite transaction. The first failing operation
//! aborts the batch and rolls the whole transaction back; partial
//! application is never visible to other readers because the shared-store
//! mutex is held for the full batch.

use crate::models::{
    generate_id, Agent, BackupMetadata, EntityKind, EventAction, Project, SyncEvent, Task,
};
use crate::storage::repository::{
    self, AgentRepository, ConfigRepository, EventRepository, ProjectRepository, Repository,
    TaskRepository,
};
use crate::storage::SchemaStore;
use crate::{Error, Result, SharedStore};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One entity mutation inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub action: EventAction,
    pub entity_type: EntityKind,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AtomicOperation {
    fn new(
        action: EventAction,
        entity_type: EntityKind,
        entity_id: &str,
        data: Option<serde_json::Value>,
        previous_data: Option<serde_json::Value>,
    ) -> Self {
        AtomicOperation {
            id: generate_id("op"),
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            data,
            previous_data,
            timestamp: Utc::now(),
        }
    }

    pub fn create<T: Serialize>(kind: EntityKind, entity_id: &str, entity: &T) -> Result<Self> {
        Ok(Self::new(
            EventAction::Create,
            kind,
            entity_id,
            Some(serde_json::to_value(entity)?),
            None,
        ))
    }

    pub fn update<T: Serialize>(
        kind: EntityKind,
        entity_id: &str,
        entity: &T,
        previous: Option<serde_json::Value>,
    ) -> Result<Self> {
        Ok(Self::new(
            EventAction::Update,
            kind,
            entity_id,
            Some(serde_json::to_value(entity)?),
            previous,
        ))
    }

    pub fn delete(
        kind: EntityKind,
        entity_id: &str,
        previous: Option<serde_json::Value>,
    ) -> Self {
        Self::new(EventAction::Delete, kind, entity_id, None, previous)
    }
}

/// Per-operation outcome within a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success: bool,
    pub operations_applied: usize,
    pub operations_failed: usize,
    pub errors: Vec<String>,
    pub rollback_performed: bool,
    pub operation_results: Vec<OperationResult>,
}

impl BatchResult {
    fn empty() -> Self {
        BatchResult {
            success: true,
            operations_applied: 0,
            operations_failed: 0,
            errors: Vec::new(),
            rollback_performed: false,
            operation_results: Vec::new(),
        }
    }
}

/// Create/update/delete sets applied as one batch.
#[derive(Debug, Clone)]
pub struct BulkOperations<T> {
    pub create: Vec<T>,
    pub update: Vec<T>,
    pub delete: Vec<String>,
}

impl<T> Default for BulkOperations<T> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// Knobs for [`ConsistencyEngine::restore_from_backup`].
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub validate_before_restore: bool,
    pub create_backup_before_restore: bool,
    pub skip_version_check: bool,
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            validate_before_restore: true,
            create_backup_before_restore: true,
            skip_version_check: false,
            dry_run: false,
        }
    }
}

/// Outcome of a retention pass.
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub removed: usize,
    pub kept: usize,
}

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Coordinates batches, savepoints, and backups over the shared store.
pub struct ConsistencyEngine {
    store: SharedStore,
    backup_dir: PathBuf,
}

impl ConsistencyEngine {
    /// Engine with the default backup directory, `~/.magents/backups`.
    pub fn new(store: SharedStore) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::Configuration("could not determine home directory".to_string())
        })?;
        Ok(Self::with_backup_dir(
            store,
            home.join(".magents").join("backups"),
        ))
    }

    pub fn with_backup_dir<P: Into<PathBuf>>(store: SharedStore, backup_dir: P) -> Self {
        ConsistencyEngine {
            store,
            backup_dir: backup_dir.into(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // --- batches ------------------------------------------------------------

    /// Apply all operations inside one transaction. The first failure aborts
    /// the batch and rolls back every already-applied operation.
    pub async fn execute_batch(&self, operations: &[AtomicOperation]) -> Result<BatchResult> {
        let mut store = self.store.lock().await;
        run_batch(&mut store, operations)
    }

    pub async fn bulk_agent_operations(
        &self,
        bulk: BulkOperations<Agent>,
    ) -> Result<BatchResult> {
        let mut store = self.store.lock().await;
        let ops = {
            let repo = AgentRepository::new(store.conn());
            let mut ops = Vec::new();
            for agent in &bulk.create {
                ops.push(AtomicOperation::create(EntityKind::Agent, &agent.id, agent)?);
            }
            for agent in &bulk.update {
                let previous = previous_json(repo.find_by_id(&agent.id)?)?;
                ops.push(AtomicOperation::update(
                    EntityKind::Agent,
                    &agent.id,
                    agent,
                    previous,
                )?);
            }
            for id in &bulk.delete {
                let previous = previous_json(repo.find_by_id(id)?)?;
                ops.push(AtomicOperation::delete(EntityKind::Agent, id, previous));
            }
            ops
        };
        run_batch(&mut store, &ops)
    }

    pub async fn bulk_project_operations(
        &self,
        bulk: BulkOperations<Project>,
    ) -> Result<BatchResult> {
        let mut store = self.store.lock().await;
        let ops = {
            let repo = ProjectRepository::new(store.conn());
            let mut ops = Vec::new();
            for project in &bulk.create {
                ops.push(AtomicOperation::create(
                    EntityKind::Project,
                    &project.id,
                    project,
                )?);
            }
            for project in &bulk.update {
                let previous = previous_json(repo.find_by_id(&project.id)?)?;
                ops.push(AtomicOperation::update(
                    EntityKind::Project,
                    &project.id,
                    project,
                    previous,
                )?);
            }
            for id in &bulk.delete {
                let previous = previous_json(repo.find_by_id(id)?)?;
                ops.push(AtomicOperation::delete(EntityKind::Project, id, previous));
            }
            ops
        };
        run_batch(&mut store, &ops)
    }

    pub async fn bulk_task_operations(&self, bulk: BulkOperations<Task>) -> Result<BatchResult> {
        let mut store = self.store.lock().await;
        let ops = {
            let repo = TaskRepository::new(store.conn());
            let mut ops = Vec::new();
            for task in &bulk.create {
                ops.push(AtomicOperation::create(EntityKind::Task, &task.id, task)?);
            }
            for task in &bulk.update {
                let previous = previous_json(repo.find_by_id(&task.id)?)?;
                ops.push(AtomicOperation::update(
                    EntityKind::Task,
                    &task.id,
                    task,
                    previous,
                )?);
            }
            for id in &bulk.delete {
                let previous = previous_json(repo.find_by_id(id)?)?;
                ops.push(AtomicOperation::delete(EntityKind::Task, id, previous));
            }
            ops
        };
        run_batch(&mut store, &ops)
    }

    // --- savepoints -----------------------------------------------------------

    pub async fn create_savepoint(&self, name: &str) -> Result<()> {
        let store = self.store.lock().await;
        let name = validate_savepoint_name(name)?;
        store.conn().execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(())
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let store = self.store.lock().await;
        let name = validate_savepoint_name(name)?;
        store
            .conn()
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", name))?;
        Ok(())
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        let store = self.store.lock().await;
        let name = validate_savepoint_name(name)?;
        store
            .conn()
            .execute_batch(&format!("RELEASE SAVEPOINT {}", name))?;
        Ok(())
    }

    // --- backups ---------------------------------------------------------------

    /// Snapshot the store file and append the metadata to the backup ledger
    /// in the config row. A missing description marks the backup as
    /// auto-created, which makes it eligible for retention cleanup.
    pub async fn create_backup(&self, description: Option<String>) -> Result<BackupMetadata> {
        let store = self.store.lock().await;
        create_backup_locked(&store, &self.backup_dir, description)
    }

    /// The backup ledger, oldest first.
    pub async fn backup_history(&self) -> Result<Vec<BackupMetadata>> {
        let store = self.store.lock().await;
        Ok(ConfigRepository::new(store.conn())
            .get_or_default()?
            .backup_history)
    }

    /// Replace the store contents from a backup file.
    ///
    /// Holds the store lock for the whole restore, so concurrent writers
    /// queue behind it rather than observing a half-restored store.
    pub async fn restore_from_backup<P: AsRef<Path>>(
        &self,
        backup_path: P,
        options: RestoreOptions,
    ) -> Result<()> {
        let backup_path = backup_path.as_ref();
        let mut store = self.store.lock().await;

        if options.validate_before_restore {
            validate_backup_file(backup_path)?;
        }
        if !options.skip_version_check {
            let backup_version = read_backup_version(backup_path)?;
            if backup_version > store.version() {
                return Err(Error::Validation(format!(
                    "backup schema version {} is newer than the store's {}",
                    backup_version,
                    store.version()
                )));
            }
        }
        if options.create_backup_before_restore && !options.dry_run {
            create_backup_locked(&store, &self.backup_dir, Some("Pre-restore backup".to_string()))?;
        }
        if options.dry_run {
            tracing::info!(backup = %backup_path.display(), "restore dry run passed validation");
            return Ok(());
        }

        store.restore(backup_path)?;

        // The restored data must at least be readable through the
        // repositories before the store goes back into service.
        let agents = AgentRepository::new(store.conn()).count()?;
        let projects = ProjectRepository::new(store.conn()).count()?;
        tracing::info!(agents, projects, "restore validated");
        Ok(())
    }

    /// Drop auto-created backups past the retention window, then cap the
    /// ledger at `max_backups` newest entries. Manual backups survive the
    /// age cutoff but count against the cap.
    pub async fn cleanup_old_backups(
        &self,
        retention_days: i64,
        max_backups: usize,
    ) -> Result<CleanupReport> {
        let store = self.store.lock().await;
        let config_repo = ConfigRepository::new(store.conn());
        let mut config = config_repo.get_or_default()?;
        let cutoff = Utc::now() - Duration::days(retention_days);

        let mut keep: Vec<BackupMetadata> = config
            .backup_history
            .iter()
            .filter(|b| b.timestamp > cutoff || !b.auto_created)
            .cloned()
            .collect();
        keep.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        keep.truncate(max_backups);

        let mut removed = 0;
        for backup in &config.backup_history {
            if keep.iter().any(|k| k.id == backup.id) {
                continue;
            }
            removed += 1;
            let path = Path::new(&backup.file_path);
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = %backup.file_path, error = %e, "failed to remove backup file");
                }
            }
        }

        // Ledger stays oldest-first.
        keep.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let kept = keep.len();
        config.backup_history = keep;
        config.updated_at = Utc::now();
        config_repo.save(&config)?;

        tracing::info!(removed, kept, "backup cleanup finished");
        Ok(CleanupReport { removed, kept })
    }
}

fn previous_json<T: Serialize>(entity: Option<T>) -> Result<Option<serde_json::Value>> {
    match entity {
        Some(e) => Ok(Some(serde_json::to_value(e)?)),
        None => Ok(None),
    }
}

/// Savepoint names reach SQL unquoted, so only identifier characters pass.
fn validate_savepoint_name(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(Error::InvalidInput(format!(
            "invalid savepoint name: {:?}",
            name
        )));
    }
    Ok(name)
}

fn run_batch(store: &mut SchemaStore, operations: &[AtomicOperation]) -> Result<BatchResult> {
    let mut result = BatchResult::empty();
    if operations.is_empty() {
        return Ok(result);
    }

    let tx = store.conn_mut().transaction()?;
    for operation in operations {
        match apply_operation(&tx, operation) {
            Ok(()) => {
                result.operations_applied += 1;
                result.operation_results.push(OperationResult {
                    operation_id: operation.id.clone(),
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                let msg = format!("Operation {} failed: {}", operation.id, e);
                tracing::error!(operation = %operation.id, error = %e, "batch aborted, rolling back");
                result.operation_results.push(OperationResult {
                    operation_id: operation.id.clone(),
                    success: false,
                    error: Some(msg.clone()),
                });
                result.errors.push(msg);
                result.operations_failed += 1;
                result.operations_applied = 0;
                result.success = false;
                result.rollback_performed = true;
                drop(tx);
                return Ok(result);
            }
        }
    }
    tx.commit()?;
    Ok(result)
}

fn apply_operation(conn: &Connection, operation: &AtomicOperation) -> Result<()> {
    let data = operation
        .data
        .clone()
        .unwrap_or(serde_json::Value::Null);
    match (operation.entity_type, operation.action) {
        // Event rows are append-only; a batch may carry them for audit
        // trails but never mutate them.
        (EntityKind::Event, EventAction::Create) => {
            let event: SyncEvent = serde_json::from_value(data)?;
            EventRepository::new(conn).insert(&event)
        }
        (EntityKind::Event, _) => Err(Error::InvalidInput(
            "event rows cannot be updated or deleted".to_string(),
        )),
        (kind, action) => {
            repository::apply_mutation(conn, kind, action, &operation.entity_id, &data)
        }
    }
}

fn create_backup_locked(
    store: &SchemaStore,
    backup_dir: &Path,
    description: Option<String>,
) -> Result<BackupMetadata> {
    let timestamp = Utc::now();
    let id = generate_id("bak");
    let file_name = format!(
        "backup-{}-{}.db",
        timestamp.format("%Y-%m-%dT%H-%M-%S%.3f"),
        id
    );
    let path = backup_dir.join(file_name);

    let size = store.backup(&path)?;
    let metadata = BackupMetadata {
        id,
        timestamp,
        file_path: path.display().to_string(),
        size,
        auto_created: description.is_none(),
        description,
        data_version: store.version(),
    };

    let config_repo = ConfigRepository::new(store.conn());
    let mut config = config_repo.get_or_default()?;
    config.backup_history.push(metadata.clone());
    config.updated_at = Utc::now();
    config_repo.save(&config)?;

    Ok(metadata)
}

fn validate_backup_file(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|_| Error::NotFound(format!("backup file not found: {}", path.display())))?;
    if meta.len() == 0 {
        return Err(Error::Validation(format!(
            "backup file is empty: {}",
            path.display()
        )));
    }
    let mut header = [0u8; 16];
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    file.read_exact(&mut header)?;
    if &header != SQLITE_HEADER {
        return Err(Error::Validation(format!(
            "not a SQLite database: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Read the recorded schema version out of a backup file without touching
/// the live store.
fn read_backup_version(path: &Path) -> Result<i64> {
    let conn =
        Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    crate::storage::schema::current_version(&conn)
}
