//! Sync events: the canonical envelope describing one entity mutation.
//!
//! A [`SyncEvent`] is created exactly once per mutation, persisted to the
//! `events` table before broadcast, and immutable thereafter. Event types
//! are an enumerated topic registry rather than free-form strings, so a
//! subscription to an unknown topic fails at parse time instead of
//! silently matching nothing.

use crate::models::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventAction::Create => "create",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Where a mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Cli,
    Gui,
    Api,
    System,
    External,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventSource::Cli => "cli",
            EventSource::Gui => "gui",
            EventSource::Api => "api",
            EventSource::System => "system",
            EventSource::External => "external",
        };
        write!(f, "{}", s)
    }
}

/// The enumerated topics clients can subscribe to.
///
/// Wire format is `"<entity>.<action>"`, e.g. `"task.updated"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.created")]
    AgentCreated,
    #[serde(rename = "agent.updated")]
    AgentUpdated,
    #[serde(rename = "agent.deleted")]
    AgentDeleted,
    #[serde(rename = "project.created")]
    ProjectCreated,
    #[serde(rename = "project.updated")]
    ProjectUpdated,
    #[serde(rename = "project.deleted")]
    ProjectDeleted,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.deleted")]
    TaskDeleted,
    #[serde(rename = "config.updated")]
    ConfigUpdated,
    #[serde(rename = "sync.conflict")]
    SyncConflict,
}

impl EventType {
    /// All topics, in a stable order. Used for subscribe-to-everything.
    pub const ALL: [EventType; 11] = [
        EventType::AgentCreated,
        EventType::AgentUpdated,
        EventType::AgentDeleted,
        EventType::ProjectCreated,
        EventType::ProjectUpdated,
        EventType::ProjectDeleted,
        EventType::TaskCreated,
        EventType::TaskUpdated,
        EventType::TaskDeleted,
        EventType::ConfigUpdated,
        EventType::SyncConflict,
    ];

    /// The topic for a mutation of the given kind.
    ///
    /// Config rows are never deleted; delete maps to the update topic.
    pub fn for_mutation(kind: EntityKind, action: EventAction) -> Option<EventType> {
        match (kind, action) {
            (EntityKind::Agent, EventAction::Create) => Some(EventType::AgentCreated),
            (EntityKind::Agent, EventAction::Update) => Some(EventType::AgentUpdated),
            (EntityKind::Agent, EventAction::Delete) => Some(EventType::AgentDeleted),
            (EntityKind::Project, EventAction::Create) => Some(EventType::ProjectCreated),
            (EntityKind::Project, EventAction::Update) => Some(EventType::ProjectUpdated),
            (EntityKind::Project, EventAction::Delete) => Some(EventType::ProjectDeleted),
            (EntityKind::Task, EventAction::Create) => Some(EventType::TaskCreated),
            (EntityKind::Task, EventAction::Update) => Some(EventType::TaskUpdated),
            (EntityKind::Task, EventAction::Delete) => Some(EventType::TaskDeleted),
            (EntityKind::Config, _) => Some(EventType::ConfigUpdated),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::AgentCreated => "agent.created",
            EventType::AgentUpdated => "agent.updated",
            EventType::AgentDeleted => "agent.deleted",
            EventType::ProjectCreated => "project.created",
            EventType::ProjectUpdated => "project.updated",
            EventType::ProjectDeleted => "project.deleted",
            EventType::TaskCreated => "task.created",
            EventType::TaskUpdated => "task.updated",
            EventType::TaskDeleted => "task.deleted",
            EventType::ConfigUpdated => "config.updated",
            EventType::SyncConflict => "sync.conflict",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::Error::InvalidInput(format!("unknown event type: {}", s)))
    }
}

/// Canonical envelope for one entity mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub action: EventAction,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SyncEvent {
    /// Build an event for a mutation. Returns `None` for combinations that
    /// have no topic (event-table rows are internal and never broadcast).
    pub fn for_mutation(
        kind: EntityKind,
        action: EventAction,
        entity_id: &str,
        data: serde_json::Value,
        previous_data: Option<serde_json::Value>,
        source: EventSource,
    ) -> Option<SyncEvent> {
        let event_type = EventType::for_mutation(kind, action)?;
        Some(SyncEvent {
            id: crate::models::generate_id("evt"),
            event_type,
            entity_type: kind,
            entity_id: entity_id.to_string(),
            action,
            data,
            previous_data,
            timestamp: Utc::now(),
            source,
            metadata: serde_json::Map::new(),
        })
    }

    /// The originating session id, if the producer recorded one.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get("sessionId").and_then(|v| v.as_str())
    }

    /// Record the originating session id.
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.metadata.insert(
            "sessionId".to_string(),
            serde_json::Value::String(session_id.to_string()),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_format() {
        let json = serde_json::to_string(&EventType::TaskUpdated).unwrap();
        assert_eq!(json, r#""task.updated""#);
        let parsed: EventType = serde_json::from_str(r#""agent.deleted""#).unwrap();
        assert_eq!(parsed, EventType::AgentDeleted);
    }

    #[test]
    fn test_event_type_from_str_rejects_unknown() {
        assert!("task.updated".parse::<EventType>().is_ok());
        assert!("task.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn test_for_mutation_mapping() {
        assert_eq!(
            EventType::for_mutation(EntityKind::Task, EventAction::Update),
            Some(EventType::TaskUpdated)
        );
        // Config deletes collapse onto the update topic.
        assert_eq!(
            EventType::for_mutation(EntityKind::Config, EventAction::Delete),
            Some(EventType::ConfigUpdated)
        );
        // Event rows themselves are not broadcast topics.
        assert_eq!(
            EventType::for_mutation(EntityKind::Event, EventAction::Create),
            None
        );
    }

    #[test]
    fn test_sync_event_roundtrip() {
        let event = SyncEvent::for_mutation(
            EntityKind::Task,
            EventAction::Create,
            "task-1",
            serde_json::json!({"id": "task-1", "title": "hello"}),
            None,
            EventSource::Cli,
        )
        .unwrap()
        .with_session("sess-a");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"task.created""#));
        assert!(json.contains(r#""entityType":"task""#));
        assert!(json.contains(r#""action":"create""#));

        let back: SyncEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.session_id(), Some("sess-a"));
    }
}
