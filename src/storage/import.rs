//! One-shot import of the legacy JSON store layout into SQLite.
//!
//! The legacy layout is `<data_dir>/projects/projects.json` (one document
//! with a `projects` array) plus `<data_dir>/agents/*.json` (one agent per
//! file). Import is per-item: a record that fails conversion is recorded as
//! an error and skipped, and the report comes back with `success = false`
//! while every valid record still lands. Source files are backed up before
//! the import touches anything, so `rollback` can restore the JSON layout
//! and remove the store file.

use crate::models::{
    generate_id, Agent, AgentMode, AgentStatus, GitRepositoryInfo, PortRange, Project,
    ProjectStatus,
};
use crate::storage::repository::{AgentRepository, ProjectRepository, Repository};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Importer settings.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// The legacy data directory, conventionally `~/.magents`.
    pub data_dir: PathBuf,
    /// Where source-file backups are placed before importing.
    pub backup_dir: PathBuf,
    /// Convert and count everything but write nothing.
    pub dry_run: bool,
}

impl ImportConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        let data_dir = data_dir.into();
        let backup_dir = data_dir.join("backups");
        ImportConfig {
            data_dir,
            backup_dir,
            dry_run: false,
        }
    }
}

/// One record that could not be imported.
#[derive(Debug, Clone)]
pub struct ImportError {
    pub item: String,
    pub error: String,
}

/// Outcome of one import run.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub success: bool,
    pub dry_run: bool,
    pub projects_found: usize,
    pub projects_imported: usize,
    pub agents_found: usize,
    pub agents_imported: usize,
    pub errors: Vec<ImportError>,
    pub backup_paths: Vec<PathBuf>,
    pub duration: Duration,
}

impl ImportReport {
    pub fn items_imported(&self) -> usize {
        self.projects_imported + self.agents_imported
    }
}

#[derive(Debug, Clone)]
struct BackupInfo {
    original: PathBuf,
    backup: PathBuf,
}

// --- legacy document shapes -------------------------------------------------

#[derive(Debug, Deserialize)]
struct LegacyProjectsFile {
    #[serde(default)]
    projects: Vec<LegacyProject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyProject {
    id: String,
    name: String,
    path: String,
    status: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    agent_ids: Vec<String>,
    max_agents: Option<u32>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    git_branch: Option<String>,
    git_remote: Option<String>,
    port_range: Option<PortRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAgent {
    id: String,
    name: String,
    #[serde(default)]
    project_id: String,
    status: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    docker_enabled: Option<bool>,
    branch: Option<String>,
    worktree_path: String,
    session_name: Option<String>,
    container_name: Option<String>,
    docker_image: Option<String>,
    #[serde(default)]
    docker_ports: Vec<String>,
    #[serde(default)]
    docker_volumes: Vec<String>,
    #[serde(default)]
    auto_accept: bool,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    current_task_id: Option<String>,
    #[serde(default)]
    tasks_assigned: Vec<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    last_activity: Option<DateTime<Utc>>,
}

// --- conversion ---------------------------------------------------------------

fn convert_project(legacy: LegacyProject) -> Project {
    let now = Utc::now();
    let git_repository = if legacy.git_branch.is_some() || legacy.git_remote.is_some() {
        Some(GitRepositoryInfo {
            branch: legacy.git_branch.unwrap_or_else(|| "main".to_string()),
            remote: legacy.git_remote,
            last_commit: None,
            is_clean: true,
        })
    } else {
        None
    };
    Project {
        id: legacy.id,
        name: legacy.name,
        path: legacy.path,
        status: legacy
            .status
            .as_deref()
            .and_then(parse_project_status)
            .unwrap_or(ProjectStatus::Active),
        git_repository,
        agent_ids: legacy.agent_ids,
        max_agents: legacy.max_agents.unwrap_or(10),
        port_range: legacy.port_range,
        description: legacy.description,
        tags: legacy.tags,
        metadata: legacy.metadata,
        created_at: legacy.created_at.unwrap_or(now),
        updated_at: legacy.updated_at.unwrap_or(now),
        last_accessed_at: None,
    }
}

fn parse_project_status(s: &str) -> Option<ProjectStatus> {
    match s.to_ascii_uppercase().as_str() {
        "ACTIVE" => Some(ProjectStatus::Active),
        "INACTIVE" => Some(ProjectStatus::Inactive),
        "ARCHIVED" => Some(ProjectStatus::Archived),
        "ERROR" => Some(ProjectStatus::Error),
        _ => None,
    }
}

fn parse_agent_status(s: &str) -> AgentStatus {
    match s.to_ascii_lowercase().as_str() {
        "created" => AgentStatus::Created,
        "starting" => AgentStatus::Starting,
        "running" => AgentStatus::Running,
        "stopping" => AgentStatus::Stopping,
        "error" => AgentStatus::Error,
        "suspended" => AgentStatus::Suspended,
        // Anything unknown lands as stopped rather than failing the record.
        _ => AgentStatus::Stopped,
    }
}

fn convert_agent(legacy: LegacyAgent) -> Agent {
    let now = Utc::now();
    Agent {
        id: legacy.id,
        name: legacy.name,
        project_id: legacy.project_id,
        status: legacy
            .status
            .as_deref()
            .map(parse_agent_status)
            .unwrap_or(AgentStatus::Stopped),
        // Legacy agents default to docker; explicitly opting out means the
        // session ran under tmux with docker fallback.
        mode: if legacy.docker_enabled.unwrap_or(true) {
            AgentMode::Docker
        } else {
            AgentMode::Hybrid
        },
        branch: legacy.branch.unwrap_or_else(|| "main".to_string()),
        worktree_path: legacy.worktree_path,
        tmux_session: legacy.session_name,
        docker_container: legacy.container_name,
        docker_image: legacy.docker_image,
        docker_ports: legacy.docker_ports,
        docker_volumes: legacy.docker_volumes,
        auto_accept: legacy.auto_accept,
        environment_vars: legacy.environment,
        current_task_id: legacy.current_task_id,
        assigned_tasks: legacy.tasks_assigned,
        description: legacy.description,
        tags: legacy.tags,
        metadata: legacy.metadata,
        created_at: legacy.created_at.unwrap_or(now),
        updated_at: legacy.updated_at.unwrap_or(now),
        last_accessed_at: legacy.last_activity,
    }
}

// --- the importer -------------------------------------------------------------

/// Imports the legacy JSON layout into an already-migrated store.
pub struct LegacyImporter {
    config: ImportConfig,
    backups: Vec<BackupInfo>,
}

impl LegacyImporter {
    pub fn new(config: ImportConfig) -> Self {
        LegacyImporter {
            config,
            backups: Vec::new(),
        }
    }

    fn projects_file(&self) -> PathBuf {
        self.config.data_dir.join("projects").join("projects.json")
    }

    fn agents_dir(&self) -> PathBuf {
        self.config.data_dir.join("agents")
    }

    fn agent_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.agents_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Copy one source file into the backup directory before touching it.
    fn back_up(&mut self, path: &Path) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("bad source path: {}", path.display())))?;
        let backup = self.config.backup_dir.join(format!("{}.{}.backup", name, stamp));
        fs::create_dir_all(&self.config.backup_dir)?;
        fs::copy(path, &backup)?;
        tracing::info!(backup = %backup.display(), "created import backup");
        self.backups.push(BackupInfo {
            original: path.to_path_buf(),
            backup,
        });
        Ok(())
    }

    /// Run the import against `conn`. Per-record failures are collected, not
    /// fatal; the report's `success` flag is false when any record failed.
    pub fn run(&mut self, conn: &Connection) -> Result<ImportReport> {
        let started = Instant::now();
        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            dry_run = self.config.dry_run,
            "starting legacy JSON import"
        );

        let mut report = ImportReport {
            success: true,
            dry_run: self.config.dry_run,
            projects_found: 0,
            projects_imported: 0,
            agents_found: 0,
            agents_imported: 0,
            errors: Vec::new(),
            backup_paths: Vec::new(),
            duration: Duration::ZERO,
        };

        self.import_projects(conn, &mut report)?;
        self.import_agents(conn, &mut report)?;

        report.success = report.errors.is_empty();
        report.backup_paths = self.backups.iter().map(|b| b.backup.clone()).collect();
        report.duration = started.elapsed();

        tracing::info!(
            projects = report.projects_imported,
            agents = report.agents_imported,
            errors = report.errors.len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "legacy import finished"
        );
        Ok(report)
    }

    fn import_projects(&mut self, conn: &Connection, report: &mut ImportReport) -> Result<()> {
        let path = self.projects_file();
        if !path.exists() {
            tracing::warn!("no projects.json found, skipping project import");
            return Ok(());
        }
        self.back_up(&path)?;

        let text = fs::read_to_string(&path)?;
        let file: LegacyProjectsFile = serde_json::from_str(&text)?;
        report.projects_found = file.projects.len();

        let repo = ProjectRepository::new(conn);
        for legacy in file.projects {
            let item = format!("project {}", legacy.id);
            let project = convert_project(legacy);
            if self.config.dry_run {
                report.projects_imported += 1;
                continue;
            }
            match repo.create(&project) {
                Ok(()) => report.projects_imported += 1,
                Err(e) => {
                    tracing::error!(item = %item, error = %e, "failed to import record");
                    report.errors.push(ImportError {
                        item,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            imported = report.projects_imported,
            found = report.projects_found,
            "projects imported"
        );
        Ok(())
    }

    fn import_agents(&mut self, conn: &Connection, report: &mut ImportReport) -> Result<()> {
        let files = self.agent_files()?;
        if files.is_empty() {
            tracing::warn!("no agents directory found, skipping agent import");
            return Ok(());
        }
        report.agents_found = files.len();

        let repo = AgentRepository::new(conn);
        for path in files {
            let item = format!("agent {}", path.display());
            let result = self.import_one_agent(conn, &repo, &path);
            match result {
                Ok(()) => report.agents_imported += 1,
                Err(e) => {
                    tracing::error!(item = %item, error = %e, "failed to import record");
                    report.errors.push(ImportError {
                        item,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            imported = report.agents_imported,
            found = report.agents_found,
            "agents imported"
        );
        Ok(())
    }

    fn import_one_agent(
        &mut self,
        conn: &Connection,
        repo: &AgentRepository<'_>,
        path: &Path,
    ) -> Result<()> {
        self.back_up(path)?;
        let text = fs::read_to_string(path)?;
        let legacy: LegacyAgent = serde_json::from_str(&text)?;
        let mut agent = convert_agent(legacy);

        // Agents written before project tracking existed carry no project id;
        // attach them to the project owning their worktree, creating one when
        // nothing matches.
        if agent.project_id.is_empty() && !agent.worktree_path.is_empty() && !self.config.dry_run {
            agent.project_id = find_or_create_project_for(conn, &agent)?;
        }

        if self.config.dry_run {
            return Ok(());
        }
        repo.create(&agent)
    }

    /// Rebuild the backup list from the backup directory, keeping the newest
    /// backup per source file. Lets a fresh process roll back an import done
    /// by an earlier one. Returns the number of backups found.
    pub fn discover_backups(&mut self) -> Result<usize> {
        if !self.config.backup_dir.exists() {
            return Ok(0);
        }
        let mut newest: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.config.backup_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "backup").unwrap_or(false))
            .collect();
        // The timestamp in the name sorts lexicographically, so the last
        // entry per source file is the newest backup.
        paths.sort();
        for path in paths {
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(original) = original_file_name(file_name) {
                newest.insert(original, path);
            }
        }
        self.backups = newest
            .into_iter()
            .map(|(name, backup)| BackupInfo {
                original: if name == "projects.json" {
                    self.config.data_dir.join("projects").join(name)
                } else {
                    self.config.data_dir.join("agents").join(name)
                },
                backup,
            })
            .collect();
        Ok(self.backups.len())
    }

    /// Undo a (partially) applied import: restore the JSON sources from
    /// their backups and delete the store file.
    pub fn rollback(&mut self, store_path: Option<&Path>) -> Result<()> {
        tracing::info!("rolling back legacy import");
        for backup in self.backups.drain(..) {
            if backup.backup.exists() {
                fs::copy(&backup.backup, &backup.original)?;
                fs::remove_file(&backup.backup)?;
                tracing::info!(restored = %backup.original.display(), "restored source file");
            }
        }
        if let Some(path) = store_path {
            if path.exists() {
                fs::remove_file(path)?;
                tracing::info!(store = %path.display(), "removed store file");
            }
        }
        Ok(())
    }

    /// Compare source record counts against what the store now holds.
    pub fn verify(&self, conn: &Connection) -> Result<bool> {
        let path = self.projects_file();
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let file: LegacyProjectsFile = serde_json::from_str(&text)?;
            let db_count = ProjectRepository::new(conn).count()? as usize;
            if file.projects.len() != db_count {
                tracing::error!(
                    json = file.projects.len(),
                    db = db_count,
                    "project count mismatch"
                );
                return Ok(false);
            }
        }

        let agent_files = self.agent_files()?;
        if !agent_files.is_empty() {
            let db_count = AgentRepository::new(conn).count()? as usize;
            if agent_files.len() != db_count {
                tracing::error!(
                    json = agent_files.len(),
                    db = db_count,
                    "agent count mismatch"
                );
                return Ok(false);
            }
        }

        tracing::info!("import verification passed");
        Ok(true)
    }
}

/// Strip the timestamp and `.backup` suffix from a backup file name, e.g.
/// `agent-1.json.2026-08-23T10-00-00.123.backup` -> `agent-1.json`.
fn original_file_name(backup_name: &str) -> Option<String> {
    let s = backup_name.strip_suffix(".backup")?;
    let s = &s[..s.rfind('.')?];
    let s = &s[..s.rfind('.')?];
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Attach an orphaned agent to the project whose path contains its worktree,
/// or create a fresh project from the worktree's parent directory.
fn find_or_create_project_for(conn: &Connection, agent: &Agent) -> Result<String> {
    let repo = ProjectRepository::new(conn);
    for project in repo.find_all()? {
        if agent.worktree_path.starts_with(&project.path) {
            tracing::info!(agent = %agent.name, project = %project.name, "auto-assigned agent");
            return Ok(project.id);
        }
    }

    let worktree = Path::new(&agent.worktree_path);
    let project_path = worktree
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| agent.worktree_path.clone());
    let project_name = Path::new(&project_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| project_path.clone());

    let now = Utc::now();
    let project = Project {
        id: generate_id("proj"),
        name: project_name.clone(),
        path: project_path,
        status: ProjectStatus::Active,
        git_repository: None,
        agent_ids: vec![agent.id.clone()],
        max_agents: 10,
        port_range: None,
        description: Some(format!("Auto-created for agent {}", agent.name)),
        tags: Vec::new(),
        metadata: serde_json::Map::new(),
        created_at: now,
        updated_at: now,
        last_accessed_at: None,
    };
    repo.create(&project)?;
    tracing::info!(project = %project_name, agent = %agent.name, "created project for orphan agent");
    Ok(project.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        schema::run_migrations(&mut conn).unwrap();
        conn
    }

    fn write_legacy_layout(dir: &Path) {
        fs::create_dir_all(dir.join("projects")).unwrap();
        fs::create_dir_all(dir.join("agents")).unwrap();
        fs::write(
            dir.join("projects").join("projects.json"),
            serde_json::json!({
                "projects": [{
                    "id": "proj-legacy",
                    "name": "legacy",
                    "path": "/work/legacy",
                    "status": "active",
                    "gitBranch": "main",
                    "tags": ["old"]
                }]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            dir.join("agents").join("agent-1.json"),
            serde_json::json!({
                "id": "agent-legacy",
                "name": "worker",
                "projectId": "proj-legacy",
                "status": "running",
                "dockerEnabled": false,
                "worktreePath": "/work/legacy/wt-1",
                "sessionName": "magents-worker",
                "environment": {"PORT": "3100"},
                "tasksAssigned": ["t1"]
            })
            .to_string(),
        )
        .unwrap();
    }

    #[test]
    fn test_import_converts_statuses_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_layout(dir.path());
        let conn = test_conn();

        let mut importer = LegacyImporter::new(ImportConfig::new(dir.path()));
        let report = importer.run(&conn).unwrap();
        assert!(report.success);
        assert_eq!(report.projects_imported, 1);
        assert_eq!(report.agents_imported, 1);
        assert_eq!(report.backup_paths.len(), 2);

        let agent = AgentRepository::new(&conn)
            .find_by_id("agent-legacy")
            .unwrap()
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.mode, AgentMode::Hybrid);
        assert_eq!(agent.tmux_session.as_deref(), Some("magents-worker"));
        assert_eq!(agent.assigned_tasks, vec!["t1".to_string()]);

        let project = ProjectRepository::new(&conn)
            .find_by_id("proj-legacy")
            .unwrap()
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.git_repository.unwrap().branch, "main");

        assert!(importer.verify(&conn).unwrap());
    }

    #[test]
    fn test_dry_run_counts_but_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_layout(dir.path());
        let conn = test_conn();

        let mut config = ImportConfig::new(dir.path());
        config.dry_run = true;
        let report = LegacyImporter::new(config).run(&conn).unwrap();
        assert!(report.success);
        assert!(report.dry_run);
        assert_eq!(report.items_imported(), 2);
        assert!(report.backup_paths.is_empty());
        assert_eq!(ProjectRepository::new(&conn).count().unwrap(), 0);
        assert_eq!(AgentRepository::new(&conn).count().unwrap(), 0);
    }

    #[test]
    fn test_bad_record_is_collected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_layout(dir.path());
        fs::write(dir.path().join("agents").join("broken.json"), "{ not json").unwrap();
        let conn = test_conn();

        let report = LegacyImporter::new(ImportConfig::new(dir.path()))
            .run(&conn)
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].item.contains("broken.json"));
        // The valid records still landed.
        assert_eq!(report.agents_imported, 1);
        assert_eq!(report.projects_imported, 1);
    }

    #[test]
    fn test_orphan_agent_gets_a_project() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("agents")).unwrap();
        fs::write(
            dir.path().join("agents").join("orphan.json"),
            serde_json::json!({
                "id": "agent-orphan",
                "name": "orphan",
                "worktreePath": "/work/solo/wt-main"
            })
            .to_string(),
        )
        .unwrap();
        let conn = test_conn();

        let report = LegacyImporter::new(ImportConfig::new(dir.path()))
            .run(&conn)
            .unwrap();
        assert!(report.success);

        let agent = AgentRepository::new(&conn)
            .find_by_id("agent-orphan")
            .unwrap()
            .unwrap();
        let project = ProjectRepository::new(&conn)
            .find_by_id(&agent.project_id)
            .unwrap()
            .unwrap();
        assert_eq!(project.path, "/work/solo");
        assert_eq!(project.agent_ids, vec!["agent-orphan".to_string()]);
    }

    #[test]
    fn test_rollback_restores_sources_and_removes_store() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_layout(dir.path());
        let store_file = dir.path().join("magents.db");
        fs::write(&store_file, b"placeholder").unwrap();
        let conn = test_conn();

        let projects_path = dir.path().join("projects").join("projects.json");
        let original = fs::read_to_string(&projects_path).unwrap();

        let mut importer = LegacyImporter::new(ImportConfig::new(dir.path()));
        importer.run(&conn).unwrap();

        // Simulate the import having mangled the source.
        fs::write(&projects_path, "{}").unwrap();

        importer.rollback(Some(&store_file)).unwrap();
        assert_eq!(fs::read_to_string(&projects_path).unwrap(), original);
        assert!(!store_file.exists());
    }

    #[test]
    fn test_discovered_backups_roll_back_across_processes() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_layout(dir.path());
        let conn = test_conn();

        let projects_path = dir.path().join("projects").join("projects.json");
        let original = fs::read_to_string(&projects_path).unwrap();

        LegacyImporter::new(ImportConfig::new(dir.path()))
            .run(&conn)
            .unwrap();
        fs::write(&projects_path, "{}").unwrap();

        // A fresh importer, as a new process would construct it.
        let mut importer = LegacyImporter::new(ImportConfig::new(dir.path()));
        assert_eq!(importer.discover_backups().unwrap(), 2);
        importer.rollback(None).unwrap();
        assert_eq!(fs::read_to_string(&projects_path).unwrap(), original);
    }

    #[test]
    fn test_original_file_name_strips_stamp() {
        assert_eq!(
            original_file_name("projects.json.2026-08-23T10-00-00.123.backup").as_deref(),
            Some("projects.json")
        );
        assert_eq!(original_file_name("stray.backup"), None);
    }
}
