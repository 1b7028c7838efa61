//! Bounded in-memory log of executed commands.
//!
//! Every command that goes through the core context lands here, newest
//! first. The log is capped; once full, the oldest entries fall off. It is
//! the input the conflict detector scans, so entries carry the command
//! name, its parameters, and where it came from.

use crate::models::{generate_id, EventSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default cap on retained entries.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A command about to be logged; id and timestamp are assigned by the log.
#[derive(Debug, Clone, Default)]
pub struct CommandRecord {
    pub source: Option<EventSource>,
    pub command: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl CommandRecord {
    pub fn new(source: EventSource, command: &str) -> Self {
        CommandRecord {
            source: Some(source),
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Filters for querying the log. Empty filter returns everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub source: Option<EventSource>,
    pub command: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Aggregate counts over the retained entries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total_entries: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_command: BTreeMap<String, usize>,
    pub recent_activity: Vec<ActivityLogEntry>,
}

/// The bounded command log, newest entries first.
#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<ActivityLogEntry>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ActivityLog {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Record one command. Returns the stored entry.
    pub fn log(&mut self, record: CommandRecord) -> ActivityLogEntry {
        let entry = ActivityLogEntry {
            id: generate_id("log"),
            timestamp: Utc::now(),
            source: record.source.unwrap_or(EventSource::System),
            command: record.command,
            params: record.params,
            result: record.result,
            user_id: record.user_id,
            session_id: record.session_id,
        };
        self.entries.push_front(entry.clone());
        self.entries.truncate(self.capacity);
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_by_id(&self, id: &str) -> Option<&ActivityLogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Matching entries, newest first.
    pub fn get(&self, filter: &LogFilter) -> Vec<ActivityLogEntry> {
        let iter = self.entries.iter().filter(|e| {
            filter.source.map_or(true, |s| e.source == s)
                && filter.command.as_deref().map_or(true, |c| e.command == c)
                && filter
                    .user_id
                    .as_deref()
                    .map_or(true, |u| e.user_id.as_deref() == Some(u))
                && filter
                    .session_id
                    .as_deref()
                    .map_or(true, |s| e.session_id.as_deref() == Some(s))
                && filter.since.map_or(true, |since| e.timestamp >= since)
        });
        match filter.limit {
            Some(limit) => iter.take(limit).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    /// Drop entries older than the cutoff, or everything when no cutoff is
    /// given. Returns how many entries were removed.
    pub fn clear(&mut self, older_than: Option<DateTime<Utc>>) -> usize {
        let before = self.entries.len();
        match older_than {
            Some(cutoff) => self.entries.retain(|e| e.timestamp >= cutoff),
            None => self.entries.clear(),
        }
        before - self.entries.len()
    }

    pub fn stats(&self) -> ActivityStats {
        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_command: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &self.entries {
            *by_source.entry(entry.source.to_string()).or_default() += 1;
            *by_command.entry(entry.command.clone()).or_default() += 1;
        }
        ActivityStats {
            total_entries: self.entries.len(),
            by_source,
            by_command,
            recent_activity: self.entries.iter().take(10).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_command(log: &mut ActivityLog, source: EventSource, command: &str) -> ActivityLogEntry {
        log.log(CommandRecord::new(source, command))
    }

    #[test]
    fn test_entries_are_newest_first() {
        let mut log = ActivityLog::new();
        log_command(&mut log, EventSource::Cli, "create-agent");
        log_command(&mut log, EventSource::Gui, "stop-agent");

        let all = log.get(&LogFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].command, "stop-agent");
        assert_eq!(all[1].command, "create-agent");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log_command(&mut log, EventSource::Cli, &format!("cmd-{}", i));
        }
        assert_eq!(log.len(), 3);
        let all = log.get(&LogFilter::default());
        assert_eq!(all[0].command, "cmd-4");
        assert_eq!(all[2].command, "cmd-2");
    }

    #[test]
    fn test_filters_compose() {
        let mut log = ActivityLog::new();
        log.log(
            CommandRecord::new(EventSource::Cli, "start-agent").session("sess-1"),
        );
        log.log(
            CommandRecord::new(EventSource::Gui, "start-agent").session("sess-2"),
        );
        log.log(CommandRecord::new(EventSource::Gui, "list"));

        let gui_starts = log.get(&LogFilter {
            source: Some(EventSource::Gui),
            command: Some("start-agent".to_string()),
            ..Default::default()
        });
        assert_eq!(gui_starts.len(), 1);
        assert_eq!(gui_starts[0].session_id.as_deref(), Some("sess-2"));

        let limited = log.get(&LogFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_clear_with_cutoff() {
        let mut log = ActivityLog::new();
        let first = log_command(&mut log, EventSource::Cli, "old");
        log_command(&mut log, EventSource::Cli, "new");

        let cutoff = first.timestamp + chrono::Duration::microseconds(1);
        let removed = log.clear(Some(cutoff));
        assert_eq!(removed, 1);
        assert_eq!(log.get(&LogFilter::default())[0].command, "new");

        assert_eq!(log.clear(None), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_stats_counts_sources_and_commands() {
        let mut log = ActivityLog::new();
        for _ in 0..2 {
            log_command(&mut log, EventSource::Cli, "status");
        }
        log_command(&mut log, EventSource::Gui, "status");
        log_command(&mut log, EventSource::Gui, "delete-agent");

        let stats = log.stats();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.by_source["cli"], 2);
        assert_eq!(stats.by_source["gui"], 2);
        assert_eq!(stats.by_command["status"], 3);
        assert_eq!(stats.recent_activity.len(), 4);
    }
}
