//! Wire protocol for the sync bus.
//!
//! Every frame is a JSON text message tagged by `type`. Subscriptions are
//! expressed in enumerated topics ([`EventType`]); a frame naming an unknown
//! topic fails to decode instead of silently subscribing to nothing.

use crate::models::{EventType, SyncEvent};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame. Oversized frames are rejected before
/// parsing.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// All frames that travel over a sync connection, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Add topics to the peer's subscription set.
    Subscribe {
        #[serde(rename = "eventTypes")]
        event_types: Vec<EventType>,
    },
    /// Remove topics; an empty (or missing) list clears the whole set.
    Unsubscribe {
        #[serde(rename = "eventTypes", default)]
        event_types: Vec<EventType>,
    },
    /// Application-level heartbeat.
    Ping,
    Pong,
    /// One entity mutation.
    SyncEvent { data: SyncEvent },
    /// Server-side rejection of the previous frame.
    Error { message: String },
}

impl WireMessage {
    /// Serialize for the wire, enforcing the payload bound.
    pub fn encode(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::InvalidInput(format!(
                "frame of {} bytes exceeds the {} byte limit",
                text.len(),
                MAX_PAYLOAD_BYTES
            )));
        }
        Ok(text)
    }

    /// Parse a received frame, enforcing the payload bound first.
    pub fn decode(text: &str) -> Result<WireMessage> {
        if text.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::InvalidInput(format!(
                "frame of {} bytes exceeds the {} byte limit",
                text.len(),
                MAX_PAYLOAD_BYTES
            )));
        }
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, EventAction, EventSource};

    #[test]
    fn test_tags_match_the_wire_format() {
        let ping = WireMessage::Ping.encode().unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);

        let subscribe = WireMessage::Subscribe {
            event_types: vec![EventType::TaskUpdated],
        }
        .encode()
        .unwrap();
        assert_eq!(
            subscribe,
            r#"{"type":"subscribe","eventTypes":["task.updated"]}"#
        );
    }

    #[test]
    fn test_sync_event_frame_roundtrip() {
        let event = SyncEvent::for_mutation(
            EntityKind::Agent,
            EventAction::Create,
            "agent-1",
            serde_json::json!({"id": "agent-1"}),
            None,
            EventSource::Gui,
        )
        .unwrap();
        let frame = WireMessage::SyncEvent { data: event.clone() };
        let decoded = WireMessage::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, WireMessage::SyncEvent { data: event });
    }

    #[test]
    fn test_unsubscribe_with_no_topics_decodes_to_empty() {
        let decoded = WireMessage::decode(r#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(
            decoded,
            WireMessage::Unsubscribe {
                event_types: vec![]
            }
        );
    }

    #[test]
    fn test_unknown_topic_is_rejected() {
        let err = WireMessage::decode(
            r#"{"type":"subscribe","eventTypes":["task.exploded"]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let padding = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let err = WireMessage::decode(&padding).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let event = SyncEvent::for_mutation(
            EntityKind::Task,
            EventAction::Update,
            "task-1",
            serde_json::Value::String("y".repeat(MAX_PAYLOAD_BYTES)),
            None,
            EventSource::Cli,
        )
        .unwrap();
        let err = WireMessage::SyncEvent { data: event }.encode().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
