//! Unified data model shared by the CLI, GUI, and API layers.
//!
//! These are flattened, normalized records optimized for SQLite storage and
//! real-time synchronization. Nested structures (docker settings, port
//! ranges, arbitrary metadata) are kept as JSON columns on purpose: they are
//! the flexible-schema escape hatch, and their serialization must round-trip
//! losslessly.

pub mod event;

pub use event::{EventAction, EventSource, EventType, SyncEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kinds of entities the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    Project,
    Task,
    Config,
    Event,
}

impl EntityKind {
    /// The SQLite table backing this entity kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agents",
            EntityKind::Project => "projects",
            EntityKind::Task => "tasks",
            EntityKind::Config => "config",
            EntityKind::Event => "events",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Agent => "agent",
            EntityKind::Project => "project",
            EntityKind::Task => "task",
            EntityKind::Config => "config",
            EntityKind::Event => "event",
        };
        write!(f, "{}", s)
    }
}

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Created,
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
    Error,
    Suspended,
}

/// How an agent session is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Tmux,
    #[default]
    Docker,
    Hybrid,
}

/// One coding-agent session bound to a project worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub status: AgentStatus,
    pub mode: AgentMode,
    pub branch: String,
    pub worktree_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmux_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub docker_ports: Vec<String>,
    #[serde(default)]
    pub docker_volumes: Vec<String>,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub assigned_tasks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectStatus {
    #[default]
    Active,
    Inactive,
    Archived,
    Error,
}

/// Git state attached to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRepositoryInfo {
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    #[serde(default = "default_true")]
    pub is_clean: bool,
}

fn default_true() -> bool {
    true
}

/// Inclusive port range reserved for a project's agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// A repository checkout that agents work inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepositoryInfo>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default = "default_max_agents")]
    pub max_agents: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

fn default_max_agents() -> u32 {
    10
}

/// Task workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    InProgress,
    Done,
    Blocked,
    Cancelled,
    Deferred,
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A unit of work, optionally assigned to an agent and nested under a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub subtask_ids: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Metadata for one store-file backup, appended to the ledger in the
/// global config row. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub auto_created: bool,
    pub data_version: i64,
}

/// The single global configuration row (id = "global").
///
/// Carries the backup-history ledger so that backup metadata survives
/// restores of the entity tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub id: String,
    pub max_agents: u32,
    pub default_mode: AgentMode,
    pub auto_accept: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_port_range: Option<PortRange>,
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub backup_history: Vec<BackupMetadata>,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The fixed id of the one config row.
pub const GLOBAL_CONFIG_ID: &str = "global";

impl GlobalConfig {
    /// A fresh default config row.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: GLOBAL_CONFIG_ID.to_string(),
            max_agents: 10,
            default_mode: AgentMode::Docker,
            auto_accept: false,
            default_port_range: Some(PortRange {
                start: 3000,
                end: 3999,
            }),
            reserved_ports: Vec::new(),
            data_dir: None,
            backup_history: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a prefixed unique id, e.g. `agent-6f9e...`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
