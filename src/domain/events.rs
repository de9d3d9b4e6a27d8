//! Diagnostic events emitted by the core.
//!
//! Every notable transport, classification or reconciliation outcome is
//! recorded as an immutable event and handed to a diagnostics sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::AgentId;

/// A single diagnostic record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Agent focused when the event was recorded
    pub agent_id: AgentId,

    /// Category of event
    pub kind: EventKind,

    /// Severity
    pub level: EventLevel,

    /// Short title
    pub title: String,

    /// Human-readable summary
    pub message: String,

    /// Structured payload (raw envelope, key lists, ...)
    #[serde(default)]
    pub payload: Value,
}

impl DiagnosticEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        agent_id: AgentId,
        kind: EventKind,
        level: EventLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            agent_id,
            kind,
            level,
            title: title.into(),
            message: message.into(),
            payload: Value::Null,
        }
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Chat,
    Agent,
    Guild,
    Tool,
    Audio,
    Status,
    Debug,
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = DiagnosticEvent::new(
            AgentId::Sisi,
            EventKind::Status,
            EventLevel::Warning,
            "WS disconnected",
            "ws://127.0.0.1:10003",
        )
        .with_payload(json!({"url": "ws://127.0.0.1:10003"}));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"status\""));
        assert!(json.contains("\"level\":\"warning\""));

        let parsed: DiagnosticEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, EventKind::Status);
        assert_eq!(parsed.level, EventLevel::Warning);
        assert_eq!(parsed.payload["url"], "ws://127.0.0.1:10003");
    }
}
