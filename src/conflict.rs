//! Pairwise conflict detection between recently executed commands, with
//! pluggable resolution strategies.
//!
//! Classification is first-match-wins: resource conflicts (two commands
//! touching the same agent or project close together), then state conflicts
//! (operation pairs that cannot both make sense), then concurrent conflicts
//! (different frontends racing within a second). Each class maps to a fixed
//! severity and a default strategy; callers can swap strategies per class.

use crate::activity::ActivityLogEntry;
use crate::models::generate_id;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Milliseconds within which same-resource commands collide.
pub const RESOURCE_WINDOW_MS: i64 = 5_000;
/// Milliseconds within which cross-source commands count as concurrent.
pub const CONCURRENT_WINDOW_MS: i64 = 1_000;

/// Operation pairs that cannot both be in flight against one entity.
const INCOMPATIBLE_PAIRS: [(&str, &str); 3] = [
    ("start-agent", "delete-agent"),
    ("create-agent", "delete-agent"),
    ("stop-agent", "start-agent"),
];

/// Commands that only read state and are always safe to let through.
const SAFE_OPERATIONS: [&str; 3] = ["status", "list", "show"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Resource,
    State,
    Concurrent,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictType::Resource => "resource",
            ConflictType::State => "state",
            ConflictType::Concurrent => "concurrent",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One detected conflict between two logged commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub command_a: ActivityLogEntry,
    pub command_b: ActivityLogEntry,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub auto_resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// How one conflict class gets resolved. Returning `Ok(Some(text))` marks
/// the conflict auto-resolved with that explanation; `Ok(None)` leaves it
/// for manual resolution.
pub trait ResolutionStrategy: Send + Sync {
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Option<String>>;
}

/// Default for resource conflicts: the later command wins.
pub struct LaterOperationWins;

impl ResolutionStrategy for LaterOperationWins {
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Option<String>> {
        let later = if conflict.command_a.timestamp > conflict.command_b.timestamp {
            &conflict.command_a
        } else {
            &conflict.command_b
        };
        Ok(Some(format!(
            "Resolved by allowing later operation: {}",
            later.command
        )))
    }
}

/// Default for state conflicts: a read-only command beats a destructive one;
/// two destructive commands need a human.
pub struct PreferSafeOperations;

fn is_safe(command: &str) -> bool {
    SAFE_OPERATIONS.iter().any(|op| command.contains(op))
}

impl ResolutionStrategy for PreferSafeOperations {
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Option<String>> {
        let a_safe = is_safe(&conflict.command_a.command);
        let b_safe = is_safe(&conflict.command_b.command);
        match (a_safe, b_safe) {
            (true, false) => Ok(Some(
                "Prioritized safe operation A over dangerous operation B".to_string(),
            )),
            (false, true) => Ok(Some(
                "Prioritized safe operation B over dangerous operation A".to_string(),
            )),
            _ => Ok(None),
        }
    }
}

/// Default for concurrent conflicts: both sides proceed.
pub struct AllowConcurrent;

impl ResolutionStrategy for AllowConcurrent {
    fn resolve(&self, _conflict: &ConflictInfo) -> Result<Option<String>> {
        Ok(Some(
            "Allowed concurrent operations from different sources".to_string(),
        ))
    }
}

/// Filters for [`ConflictResolver::get_conflicts`].
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub resolved: Option<bool>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
}

/// Detects conflicts between command pairs and records every one it sees.
pub struct ConflictResolver {
    conflicts: Vec<ConflictInfo>,
    strategies: HashMap<ConflictType, Box<dyn ResolutionStrategy>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// A resolver with the default strategy per conflict class.
    pub fn new() -> Self {
        let mut strategies: HashMap<ConflictType, Box<dyn ResolutionStrategy>> = HashMap::new();
        strategies.insert(ConflictType::Resource, Box::new(LaterOperationWins));
        strategies.insert(ConflictType::State, Box::new(PreferSafeOperations));
        strategies.insert(ConflictType::Concurrent, Box::new(AllowConcurrent));
        ConflictResolver {
            conflicts: Vec::new(),
            strategies,
        }
    }

    /// Swap the strategy used for one conflict class.
    pub fn register_strategy(
        &mut self,
        conflict_type: ConflictType,
        strategy: Box<dyn ResolutionStrategy>,
    ) {
        self.strategies.insert(conflict_type, strategy);
    }

    /// Classify a command pair. A detected conflict is recorded and returned;
    /// unrelated commands return `None`.
    pub fn detect(
        &mut self,
        command_a: &ActivityLogEntry,
        command_b: &ActivityLogEntry,
    ) -> Option<ConflictInfo> {
        let (conflict_type, severity) = if is_resource_conflict(command_a, command_b) {
            (ConflictType::Resource, Severity::Medium)
        } else if is_state_conflict(command_a, command_b) {
            (ConflictType::State, Severity::High)
        } else if is_concurrent_conflict(command_a, command_b) {
            (ConflictType::Concurrent, Severity::Low)
        } else {
            return None;
        };

        let conflict = ConflictInfo {
            id: generate_id("conflict"),
            timestamp: Utc::now(),
            command_a: command_a.clone(),
            command_b: command_b.clone(),
            conflict_type,
            severity,
            auto_resolved: false,
            resolution: None,
        };
        tracing::warn!(
            conflict = %conflict.id,
            kind = %conflict_type,
            a = %command_a.command,
            b = %command_b.command,
            "conflict detected"
        );
        self.conflicts.push(conflict.clone());
        Some(conflict)
    }

    /// Run the class strategy for a recorded conflict. Returns whether it
    /// was auto-resolved; unresolved conflicts stay recorded for manual
    /// handling and never block the commands themselves.
    pub fn resolve(&mut self, conflict_id: &str) -> Result<bool> {
        let index = match self.conflicts.iter().position(|c| c.id == conflict_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        let strategy = match self.strategies.get(&self.conflicts[index].conflict_type) {
            Some(s) => s,
            None => return Ok(false),
        };

        match strategy.resolve(&self.conflicts[index]) {
            Ok(Some(resolution)) => {
                self.conflicts[index].auto_resolved = true;
                self.conflicts[index].resolution = Some(resolution);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.conflicts[index].resolution =
                    Some(format!("Auto-resolution failed: {}", e));
                Ok(false)
            }
        }
    }

    /// Detect and immediately run resolution. Returns the conflict in its
    /// post-resolution state.
    pub fn detect_and_resolve(
        &mut self,
        command_a: &ActivityLogEntry,
        command_b: &ActivityLogEntry,
    ) -> Result<Option<ConflictInfo>> {
        let conflict = match self.detect(command_a, command_b) {
            Some(c) => c,
            None => return Ok(None),
        };
        self.resolve(&conflict.id)?;
        Ok(self.get_by_id(&conflict.id).cloned())
    }

    pub fn get_by_id(&self, id: &str) -> Option<&ConflictInfo> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub fn get_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictInfo> {
        self.conflicts
            .iter()
            .filter(|c| {
                filter.resolved.map_or(true, |r| c.auto_resolved == r)
                    && filter.severity.map_or(true, |s| c.severity == s)
                    && filter.since.map_or(true, |since| c.timestamp >= since)
            })
            .cloned()
            .collect()
    }
}

fn target_resource(entry: &ActivityLogEntry) -> Option<&str> {
    entry
        .params
        .get("agentId")
        .or_else(|| entry.params.get("projectId"))
        .and_then(|v| v.as_str())
}

fn millis_apart(a: &ActivityLogEntry, b: &ActivityLogEntry) -> i64 {
    (a.timestamp - b.timestamp).num_milliseconds().abs()
}

fn is_resource_conflict(a: &ActivityLogEntry, b: &ActivityLogEntry) -> bool {
    match (target_resource(a), target_resource(b)) {
        (Some(ra), Some(rb)) => ra == rb && millis_apart(a, b) < RESOURCE_WINDOW_MS,
        _ => false,
    }
}

fn is_state_conflict(a: &ActivityLogEntry, b: &ActivityLogEntry) -> bool {
    INCOMPATIBLE_PAIRS.iter().any(|(op_a, op_b)| {
        (a.command == *op_a && b.command == *op_b) || (a.command == *op_b && b.command == *op_a)
    })
}

fn is_concurrent_conflict(a: &ActivityLogEntry, b: &ActivityLogEntry) -> bool {
    a.source != b.source && millis_apart(a, b) < CONCURRENT_WINDOW_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityLog, CommandRecord};
    use crate::models::EventSource;

    fn entry(
        log: &mut ActivityLog,
        source: EventSource,
        command: &str,
        agent_id: Option<&str>,
    ) -> ActivityLogEntry {
        let mut record = CommandRecord::new(source, command);
        if let Some(id) = agent_id {
            record = record.param("agentId", serde_json::Value::String(id.to_string()));
        }
        log.log(record)
    }

    #[test]
    fn test_same_resource_within_window_is_medium() {
        let mut log = ActivityLog::new();
        let a = entry(&mut log, EventSource::Cli, "update-agent", Some("agent-1"));
        let b = entry(&mut log, EventSource::Gui, "update-agent", Some("agent-1"));

        let mut resolver = ConflictResolver::new();
        let conflict = resolver.detect(&a, &b).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Resource);
        assert_eq!(conflict.severity, Severity::Medium);
    }

    #[test]
    fn test_different_resources_do_not_conflict() {
        let mut log = ActivityLog::new();
        // Same source keeps the concurrent rule out of the way.
        let a = entry(&mut log, EventSource::Cli, "update-agent", Some("agent-1"));
        let b = entry(&mut log, EventSource::Cli, "update-agent", Some("agent-2"));

        let mut resolver = ConflictResolver::new();
        assert!(resolver.detect(&a, &b).is_none());
    }

    #[test]
    fn test_incompatible_pair_is_high_in_both_orders() {
        let mut log = ActivityLog::new();
        let start = entry(&mut log, EventSource::Cli, "start-agent", None);
        let stale = ActivityLogEntry {
            timestamp: start.timestamp - chrono::Duration::seconds(30),
            ..entry(&mut log, EventSource::Cli, "delete-agent", None)
        };

        let mut resolver = ConflictResolver::new();
        // Outside every time window, the incompatible pair still conflicts.
        let conflict = resolver.detect(&start, &stale).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::State);
        assert_eq!(conflict.severity, Severity::High);

        let reversed = resolver.detect(&stale, &start).unwrap();
        assert_eq!(reversed.conflict_type, ConflictType::State);
    }

    #[test]
    fn test_cross_source_race_is_low() {
        let mut log = ActivityLog::new();
        let a = entry(&mut log, EventSource::Cli, "list", None);
        let b = entry(&mut log, EventSource::Gui, "status", None);

        let mut resolver = ConflictResolver::new();
        let conflict = resolver.detect(&a, &b).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Concurrent);
        assert_eq!(conflict.severity, Severity::Low);
    }

    #[test]
    fn test_resource_conflict_resolves_to_later_command() {
        let mut log = ActivityLog::new();
        let earlier = entry(&mut log, EventSource::Cli, "stop-agent", Some("agent-1"));
        let later = entry(&mut log, EventSource::Gui, "update-agent", Some("agent-1"));

        let mut resolver = ConflictResolver::new();
        let conflict = resolver
            .detect_and_resolve(&earlier, &later)
            .unwrap()
            .unwrap();
        assert!(conflict.auto_resolved);
        assert_eq!(
            conflict.resolution.as_deref(),
            Some("Resolved by allowing later operation: update-agent")
        );
    }

    #[test]
    fn test_state_conflict_between_destructive_ops_stays_unresolved() {
        let mut log = ActivityLog::new();
        let a = entry(&mut log, EventSource::Cli, "start-agent", None);
        let b = entry(&mut log, EventSource::Gui, "delete-agent", None);

        let mut resolver = ConflictResolver::new();
        let conflict = resolver.detect_and_resolve(&a, &b).unwrap().unwrap();
        assert!(!conflict.auto_resolved);
        assert_eq!(conflict.resolution, None);

        let unresolved = resolver.get_conflicts(&ConflictFilter {
            resolved: Some(false),
            ..Default::default()
        });
        assert_eq!(unresolved.len(), 1);
    }

    #[test]
    fn test_custom_strategy_replaces_default() {
        struct AlwaysEscalate;
        impl ResolutionStrategy for AlwaysEscalate {
            fn resolve(&self, _conflict: &ConflictInfo) -> Result<Option<String>> {
                Ok(None)
            }
        }

        let mut log = ActivityLog::new();
        let a = entry(&mut log, EventSource::Cli, "list", None);
        let b = entry(&mut log, EventSource::Gui, "status", None);

        let mut resolver = ConflictResolver::new();
        resolver.register_strategy(ConflictType::Concurrent, Box::new(AlwaysEscalate));
        let conflict = resolver.detect_and_resolve(&a, &b).unwrap().unwrap();
        assert!(!conflict.auto_resolved);
    }

    #[test]
    fn test_filter_by_severity() {
        let mut log = ActivityLog::new();
        let a = entry(&mut log, EventSource::Cli, "start-agent", None);
        let b = entry(&mut log, EventSource::Gui, "delete-agent", None);
        let c = entry(&mut log, EventSource::Gui, "status", None);

        let mut resolver = ConflictResolver::new();
        resolver.detect(&a, &b);
        resolver.detect(&a, &c);

        let high = resolver.get_conflicts(&ConflictFilter {
            severity: Some(Severity::High),
            ..Default::default()
        });
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].conflict_type, ConflictType::State);
    }
}
