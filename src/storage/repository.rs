//! Repositories: typed CRUD over the entity tables.
//!
//! Repositories borrow a plain [`Connection`], so the same code runs against
//! the store's long-lived connection, inside a transaction, or inside a
//! savepoint (both deref to `Connection`). Flexible-schema fields live in
//! JSON columns and round-trip through serde.

use crate::models::{
    Agent, AgentStatus, EntityKind, EventAction, GlobalConfig, Project, ProjectStatus, SyncEvent,
    Task, TaskStatus, GLOBAL_CONFIG_ID,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Common CRUD surface shared by the entity repositories.
pub trait Repository {
    type Entity;

    fn find_by_id(&self, id: &str) -> Result<Option<Self::Entity>>;
    fn find_all(&self) -> Result<Vec<Self::Entity>>;
    fn create(&self, entity: &Self::Entity) -> Result<()>;
    fn update(&self, entity: &Self::Entity) -> Result<()>;
    /// Returns whether a row was actually removed.
    fn delete(&self, id: &str) -> Result<bool>;
    fn count(&self) -> Result<i64>;
}

// --- column helpers -------------------------------------------------------

fn json_text<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json_text<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    match value {
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
        None => Ok(None),
    }
}

/// A serde-string enum as its wire string, e.g. `AgentStatus::Running` as
/// `RUNNING`.
fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(Error::Validation(format!(
            "expected string-encoded enum, got {}",
            other
        ))),
    }
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(t) => Ok(Some(serde_json::from_str(&t).map_err(|e| conversion_err(idx, e))?)),
        None => Ok(None),
    }
}

fn enum_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| conversion_err(idx, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(t) => Ok(Some(
            DateTime::parse_from_rfc3339(&t)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_err(idx, e))?,
        )),
        None => Ok(None),
    }
}

fn ts_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn opt_ts_text(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_text)
}

// --- agents ---------------------------------------------------------------

const AGENT_COLUMNS: &str = "id, name, project_id, status, mode, branch, worktree_path, \
     tmux_session, docker_container, docker_image, docker_ports, docker_volumes, auto_accept, \
     environment_vars, current_task_id, assigned_tasks, description, tags, metadata, \
     created_at, updated_at, last_accessed_at";

pub struct AgentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> AgentRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
        Ok(Agent {
            id: row.get(0)?,
            name: row.get(1)?,
            project_id: row.get(2)?,
            status: enum_col(row, 3)?,
            mode: enum_col(row, 4)?,
            branch: row.get(5)?,
            worktree_path: row.get(6)?,
            tmux_session: row.get(7)?,
            docker_container: row.get(8)?,
            docker_image: row.get(9)?,
            docker_ports: json_col(row, 10)?,
            docker_volumes: json_col(row, 11)?,
            auto_accept: row.get(12)?,
            environment_vars: json_col(row, 13)?,
            current_task_id: row.get(14)?,
            assigned_tasks: json_col(row, 15)?,
            description: row.get(16)?,
            tags: json_col(row, 17)?,
            metadata: json_col(row, 18)?,
            created_at: ts_col(row, 19)?,
            updated_at: ts_col(row, 20)?,
            last_accessed_at: opt_ts_col(row, 21)?,
        })
    }

    fn write(&self, agent: &Agent, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(
            sql,
            params![
                agent.id,
                agent.name,
                agent.project_id,
                enum_text(&agent.status)?,
                enum_text(&agent.mode)?,
                agent.branch,
                agent.worktree_path,
                agent.tmux_session,
                agent.docker_container,
                agent.docker_image,
                json_text(&agent.docker_ports)?,
                json_text(&agent.docker_volumes)?,
                agent.auto_accept,
                json_text(&agent.environment_vars)?,
                agent.current_task_id,
                json_text(&agent.assigned_tasks)?,
                agent.description,
                json_text(&agent.tags)?,
                json_text(&agent.metadata)?,
                ts_text(&agent.created_at),
                ts_text(&agent.updated_at),
                opt_ts_text(&agent.last_accessed_at),
            ],
        )?)
    }

    pub fn find_by_project(&self, project_id: &str) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM agents WHERE project_id = ?1 ORDER BY created_at",
            AGENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn find_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM agents WHERE status = ?1 ORDER BY created_at",
            AGENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![enum_text(&status)?], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl Repository for AgentRepository<'_> {
    type Entity = Agent;

    fn find_by_id(&self, id: &str) -> Result<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn find_all(&self) -> Result<Vec<Agent>> {
        let sql = format!("SELECT {} FROM agents ORDER BY created_at", AGENT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn create(&self, agent: &Agent) -> Result<()> {
        self.write(
            agent,
            "INSERT INTO agents (id, name, project_id, status, mode, branch, worktree_path, \
             tmux_session, docker_container, docker_image, docker_ports, docker_volumes, \
             auto_accept, environment_vars, current_task_id, assigned_tasks, description, tags, \
             metadata, created_at, updated_at, last_accessed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22)",
        )?;
        Ok(())
    }

    fn update(&self, agent: &Agent) -> Result<()> {
        let changed = self.write(
            agent,
            "UPDATE agents SET id = ?1, name = ?2, project_id = ?3, status = ?4, mode = ?5, \
             branch = ?6, worktree_path = ?7, tmux_session = ?8, docker_container = ?9, \
             docker_image = ?10, docker_ports = ?11, docker_volumes = ?12, auto_accept = ?13, \
             environment_vars = ?14, current_task_id = ?15, assigned_tasks = ?16, \
             description = ?17, tags = ?18, metadata = ?19, created_at = ?20, updated_at = ?21, \
             last_accessed_at = ?22 WHERE id = ?1",
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("agent {}", agent.id)));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?)
    }
}

// --- projects ---------------------------------------------------------------

const PROJECT_COLUMNS: &str = "id, name, path, status, git_repository, agent_ids, max_agents, \
     port_range, description, tags, metadata, created_at, updated_at, last_accessed_at";

pub struct ProjectRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ProjectRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
        Ok(Project {
            id: row.get(0)?,
            name: row.get(1)?,
            path: row.get(2)?,
            status: enum_col(row, 3)?,
            git_repository: opt_json_col(row, 4)?,
            agent_ids: json_col(row, 5)?,
            max_agents: row.get(6)?,
            port_range: opt_json_col(row, 7)?,
            description: row.get(8)?,
            tags: json_col(row, 9)?,
            metadata: json_col(row, 10)?,
            created_at: ts_col(row, 11)?,
            updated_at: ts_col(row, 12)?,
            last_accessed_at: opt_ts_col(row, 13)?,
        })
    }

    fn write(&self, project: &Project, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(
            sql,
            params![
                project.id,
                project.name,
                project.path,
                enum_text(&project.status)?,
                opt_json_text(&project.git_repository)?,
                json_text(&project.agent_ids)?,
                project.max_agents,
                opt_json_text(&project.port_range)?,
                project.description,
                json_text(&project.tags)?,
                json_text(&project.metadata)?,
                ts_text(&project.created_at),
                ts_text(&project.updated_at),
                opt_ts_text(&project.last_accessed_at),
            ],
        )?)
    }

    /// Look up the project owning the given filesystem path, if any.
    pub fn find_by_path(&self, path: &str) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE path = ?1", PROJECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![path], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn find_by_status(&self, status: ProjectStatus) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE status = ?1 ORDER BY created_at",
            PROJECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![enum_text(&status)?], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl Repository for ProjectRepository<'_> {
    type Entity = Project;

    fn find_by_id(&self, id: &str) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn find_all(&self) -> Result<Vec<Project>> {
        let sql = format!("SELECT {} FROM projects ORDER BY created_at", PROJECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn create(&self, project: &Project) -> Result<()> {
        self.write(
            project,
            "INSERT INTO projects (id, name, path, status, git_repository, agent_ids, \
             max_agents, port_range, description, tags, metadata, created_at, updated_at, \
             last_accessed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        Ok(())
    }

    fn update(&self, project: &Project) -> Result<()> {
        let changed = self.write(
            project,
            "UPDATE projects SET id = ?1, name = ?2, path = ?3, status = ?4, \
             git_repository = ?5, agent_ids = ?6, max_agents = ?7, port_range = ?8, \
             description = ?9, tags = ?10, metadata = ?11, created_at = ?12, updated_at = ?13, \
             last_accessed_at = ?14 WHERE id = ?1",
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("project {}", project.id)));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?)
    }
}

// --- tasks ------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, project_id, title, description, details, status, priority, \
     assigned_to_agent_id, parent_task_id, subtask_ids, dependencies, tags, metadata, \
     created_at, updated_at, assigned_at, started_at, completed_at";

pub struct TaskRepository<'a> {
    conn: &'a Connection,
}

impl<'a> TaskRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
        Ok(Task {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            details: row.get(4)?,
            status: enum_col(row, 5)?,
            priority: enum_col(row, 6)?,
            assigned_to_agent_id: row.get(7)?,
            parent_task_id: row.get(8)?,
            subtask_ids: json_col(row, 9)?,
            dependencies: json_col(row, 10)?,
            tags: json_col(row, 11)?,
            metadata: json_col(row, 12)?,
            created_at: ts_col(row, 13)?,
            updated_at: ts_col(row, 14)?,
            assigned_at: opt_ts_col(row, 15)?,
            started_at: opt_ts_col(row, 16)?,
            completed_at: opt_ts_col(row, 17)?,
        })
    }

    fn write(&self, task: &Task, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(
            sql,
            params![
                task.id,
                task.project_id,
                task.title,
                task.description,
                task.details,
                enum_text(&task.status)?,
                enum_text(&task.priority)?,
                task.assigned_to_agent_id,
                task.parent_task_id,
                json_text(&task.subtask_ids)?,
                json_text(&task.dependencies)?,
                json_text(&task.tags)?,
                json_text(&task.metadata)?,
                ts_text(&task.created_at),
                ts_text(&task.updated_at),
                opt_ts_text(&task.assigned_at),
                opt_ts_text(&task.started_at),
                opt_ts_text(&task.completed_at),
            ],
        )?)
    }

    pub fn find_by_project(&self, project_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![enum_text(&status)?], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn find_by_agent(&self, agent_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE assigned_to_agent_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![agent_id], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn find_subtasks(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent_task_id], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl Repository for TaskRepository<'_> {
    type Entity = Task;

    fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn find_all(&self) -> Result<Vec<Task>> {
        let sql = format!("SELECT {} FROM tasks ORDER BY created_at", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn create(&self, task: &Task) -> Result<()> {
        self.write(
            task,
            "INSERT INTO tasks (id, project_id, title, description, details, status, priority, \
             assigned_to_agent_id, parent_task_id, subtask_ids, dependencies, tags, metadata, \
             created_at, updated_at, assigned_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18)",
        )?;
        Ok(())
    }

    fn update(&self, task: &Task) -> Result<()> {
        let changed = self.write(
            task,
            "UPDATE tasks SET id = ?1, project_id = ?2, title = ?3, description = ?4, \
             details = ?5, status = ?6, priority = ?7, assigned_to_agent_id = ?8, \
             parent_task_id = ?9, subtask_ids = ?10, dependencies = ?11, tags = ?12, \
             metadata = ?13, created_at = ?14, updated_at = ?15, assigned_at = ?16, \
             started_at = ?17, completed_at = ?18 WHERE id = ?1",
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }
}

// --- config -----------------------------------------------------------------

/// Repository over the single `config` row. Writes are upserts keyed on the
/// fixed `global` id; the row is never deleted.
pub struct ConfigRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConfigRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<GlobalConfig> {
        Ok(GlobalConfig {
            id: row.get(0)?,
            max_agents: row.get(1)?,
            default_mode: enum_col(row, 2)?,
            auto_accept: row.get(3)?,
            default_port_range: opt_json_col(row, 4)?,
            reserved_ports: json_col(row, 5)?,
            data_dir: row.get(6)?,
            backup_history: json_col(row, 7)?,
            version: row.get(8)?,
            created_at: ts_col(row, 9)?,
            updated_at: ts_col(row, 10)?,
        })
    }

    pub fn get(&self) -> Result<Option<GlobalConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, max_agents, default_mode, auto_accept, default_port_range, \
             reserved_ports, data_dir, backup_history, version, created_at, updated_at \
             FROM config WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![GLOBAL_CONFIG_ID], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// The config row, created with defaults on first access.
    pub fn get_or_default(&self) -> Result<GlobalConfig> {
        if let Some(config) = self.get()? {
            return Ok(config);
        }
        let config = GlobalConfig::new();
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &GlobalConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (id, max_agents, default_mode, auto_accept, default_port_range, \
             reserved_ports, data_dir, backup_history, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET max_agents = ?2, default_mode = ?3, \
             auto_accept = ?4, default_port_range = ?5, reserved_ports = ?6, data_dir = ?7, \
             backup_history = ?8, version = ?9, updated_at = ?11",
            params![
                GLOBAL_CONFIG_ID,
                config.max_agents,
                enum_text(&config.default_mode)?,
                config.auto_accept,
                opt_json_text(&config.default_port_range)?,
                json_text(&config.reserved_ports)?,
                config.data_dir,
                json_text(&config.backup_history)?,
                config.version,
                ts_text(&config.created_at),
                ts_text(&config.updated_at),
            ],
        )?;
        Ok(())
    }
}

// --- events -----------------------------------------------------------------

const EVENT_COLUMNS: &str =
    "id, type, entity_type, entity_id, action, data, previous_data, timestamp, source, metadata";

/// Repository over the persisted event log. Rows are append-only.
pub struct EventRepository<'a> {
    conn: &'a Connection,
}

impl<'a> EventRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
        Ok(SyncEvent {
            id: row.get(0)?,
            event_type: enum_col(row, 1)?,
            entity_type: enum_col(row, 2)?,
            entity_id: row.get(3)?,
            action: enum_col(row, 4)?,
            data: json_col(row, 5)?,
            previous_data: opt_json_col(row, 6)?,
            timestamp: ts_col(row, 7)?,
            source: enum_col(row, 8)?,
            metadata: json_col(row, 9)?,
        })
    }

    pub fn insert(&self, event: &SyncEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, type, entity_type, entity_id, action, data, previous_data, \
             timestamp, source, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                enum_text(&event.event_type)?,
                enum_text(&event.entity_type)?,
                event.entity_id,
                enum_text(&event.action)?,
                json_text(&event.data)?,
                opt_json_text(&event.previous_data)?,
                ts_text(&event.timestamp),
                enum_text(&event.source)?,
                json_text(&event.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<SyncEvent>> {
        let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], Self::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// The most recent events, newest first.
    pub fn find_recent(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let sql = format!(
            "SELECT {} FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// All persisted events touching one entity, newest first.
    pub fn find_by_entity(&self, entity_id: &str) -> Result<Vec<SyncEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE entity_id = ?1 ORDER BY timestamp DESC, id DESC",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id], Self::from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    /// Delete events older than the cutoff; returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![ts_text(&cutoff)],
        )?)
    }
}

// --- mutation dispatch --------------------------------------------------------

/// Apply one entity mutation to the right repository. The `data` payload is
/// the full serialized entity for creates and updates; deletes only need the
/// id.
pub fn apply_mutation(
    conn: &Connection,
    kind: EntityKind,
    action: EventAction,
    entity_id: &str,
    data: &serde_json::Value,
) -> Result<()> {
    match kind {
        EntityKind::Agent => {
            let repo = AgentRepository::new(conn);
            match action {
                EventAction::Create => repo.create(&serde_json::from_value(data.clone())?),
                EventAction::Update => repo.update(&serde_json::from_value(data.clone())?),
                EventAction::Delete => repo.delete(entity_id).map(|_| ()),
            }
        }
        EntityKind::Project => {
            let repo = ProjectRepository::new(conn);
            match action {
                EventAction::Create => repo.create(&serde_json::from_value(data.clone())?),
                EventAction::Update => repo.update(&serde_json::from_value(data.clone())?),
                EventAction::Delete => repo.delete(entity_id).map(|_| ()),
            }
        }
        EntityKind::Task => {
            let repo = TaskRepository::new(conn);
            match action {
                EventAction::Create => repo.create(&serde_json::from_value(data.clone())?),
                EventAction::Update => repo.update(&serde_json::from_value(data.clone())?),
                EventAction::Delete => repo.delete(entity_id).map(|_| ()),
            }
        }
        EntityKind::Config => match action {
            EventAction::Create | EventAction::Update => {
                ConfigRepository::new(conn).save(&serde_json::from_value(data.clone())?)
            }
            EventAction::Delete => Err(Error::InvalidInput(
                "the config row cannot be deleted".to_string(),
            )),
        },
        EntityKind::Event => Err(Error::InvalidInput(
            "event rows are append-only and not a mutation target".to_string(),
        )),
    }
}
