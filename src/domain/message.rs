//! Transcript messages and their attachments.
//!
//! Messages are created by a local user action or by the reconciler on the
//! first reply fragment, then patched in place while a reply streams in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::agent::AgentId;

/// Meta key: assistant placeholder waiting for its first fragment (runtime only)
pub const META_PENDING_REPLY: &str = "pending_reply";

/// Meta key: message is still receiving streamed continuations (runtime only)
pub const META_STREAM_OPEN: &str = "stream_open";

/// Meta key: where the message came from (`"ui"` for local input)
pub const META_SOURCE: &str = "source";

/// Meta key: backend-assigned id of the reply this message renders
pub const META_BACKEND_MSG_ID: &str = "backend_msg_id";

/// `source` value for messages typed locally
pub const SOURCE_LOCAL: &str = "ui";

/// Author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Free-form message metadata with typed accessors for the keys the core reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(pub Map<String, Value>);

impl Meta {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Shallow merge: keys in `other` overwrite ours
    pub fn merge(&mut self, other: &Meta) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.0.get(key).map(is_truthy).unwrap_or(false)
    }

    pub fn pending_reply(&self) -> bool {
        self.flag(META_PENDING_REPLY)
    }

    pub fn stream_open(&self) -> bool {
        self.flag(META_STREAM_OPEN)
    }

    pub fn set_pending_reply(&mut self, value: bool) {
        self.insert(META_PENDING_REPLY, value);
    }

    pub fn set_stream_open(&mut self, value: bool) {
        self.insert(META_STREAM_OPEN, value);
    }

    pub fn source(&self) -> Option<&str> {
        self.0.get(META_SOURCE).and_then(Value::as_str)
    }

    /// True when the message was typed by the local user
    pub fn is_local(&self) -> bool {
        self.source() == Some(SOURCE_LOCAL)
    }

    pub fn backend_msg_id(&self) -> Option<&Value> {
        self.0.get(META_BACKEND_MSG_ID).filter(|v| !is_blank(v))
    }
}

impl From<Map<String, Value>> for Meta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A file or media item attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub mime: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub preview_url: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub source: String,
}

impl Attachment {
    /// Normalize a loosely shaped JSON attachment.
    ///
    /// Returns `None` for non-objects and for entries carrying neither an id
    /// nor a preview url.
    pub fn from_value(raw: &Value, default_source: &str) -> Option<Self> {
        let obj = raw.as_object()?;
        let text = |key: &str| obj.get(key).map(value_as_text).unwrap_or_default().trim().to_string();
        let number = |key: &str| obj.get(key).map(value_as_u64).unwrap_or(0);

        let id = text("id");
        let preview_url = text("preview_url");
        if id.is_empty() && preview_url.is_empty() {
            return None;
        }

        let or = |value: String, fallback: &str| {
            if value.is_empty() {
                fallback.to_string()
            } else {
                value
            }
        };

        let download_url = or(text("download_url"), &preview_url);
        Some(Self {
            id: or(id, &generate_id()),
            kind: or(text("kind"), "file"),
            name: or(text("name"), "attachment"),
            mime: or(text("mime"), "application/octet-stream"),
            size: number("size"),
            preview_url,
            download_url,
            thumbnail_url: text("thumbnail_url"),
            duration_ms: number("duration_ms"),
            source: or(text("source"), default_source),
        })
    }

    /// Normalize a JSON list; non-arrays yield an empty list, duplicate ids keep the first
    pub fn list_from_value(raw: Option<&Value>, default_source: &str) -> Vec<Self> {
        let items = match raw.and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        };
        dedupe_attachments(
            items
                .iter()
                .filter_map(|item| Self::from_value(item, default_source))
                .collect(),
        )
    }
}

/// Keep the first attachment for each id
pub fn dedupe_attachments(list: Vec<Attachment>) -> Vec<Attachment> {
    let mut out: Vec<Attachment> = Vec::with_capacity(list.len());
    for item in list {
        if !out.iter().any(|a| a.id == item.id) {
            out.push(item);
        }
    }
    out
}

/// One entry of an agent's transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within the agent's transcript
    pub id: String,

    /// Owning agent (older payloads call this `system_id`)
    #[serde(alias = "system_id")]
    pub agent_id: AgentId,

    pub role: Role,

    pub content: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub meta: Meta,

    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(agent_id: AgentId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            agent_id,
            role,
            content: content.into(),
            created_at: Utc::now(),
            meta: Meta::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = dedupe_attachments(attachments);
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Force runtime-only flags off (used on every cold load)
    pub fn clear_transient_flags(&mut self) {
        if self.is_assistant() {
            self.meta.set_pending_reply(false);
            self.meta.set_stream_open(false);
        }
    }
}

/// Partial update applied by [`crate::core::TranscriptStore::patch`]
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    /// Replace content
    pub content: Option<String>,

    /// Shallow-merged into existing meta
    pub meta: Option<Meta>,

    /// Replaces attachments only when present
    pub attachments: Option<Vec<Attachment>>,
}

impl MessagePatch {
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }
}

/// Generate a message/attachment id
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Render a JSON scalar as text (`null` becomes empty, objects become JSON)
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// JSON truthiness: false, null, 0, "" and NaN are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Coerce a JSON value to a number (strings are parsed, anything else is NaN)
pub fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null => 0.0,
        _ => f64::NAN,
    }
}

fn value_as_u64(value: &Value) -> u64 {
    let n = value_as_f64(value);
    if n.is_finite() && n > 0.0 {
        n as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attachment_defaults() {
        let raw = json!({"preview_url": " /files/a.png ", "size": "12"});
        let att = Attachment::from_value(&raw, "tool").unwrap();

        assert!(!att.id.is_empty());
        assert_eq!(att.kind, "file");
        assert_eq!(att.name, "attachment");
        assert_eq!(att.mime, "application/octet-stream");
        assert_eq!(att.preview_url, "/files/a.png");
        assert_eq!(att.download_url, "/files/a.png");
        assert_eq!(att.size, 12);
        assert_eq!(att.source, "tool");
    }

    #[test]
    fn test_attachment_rejects_anonymous() {
        assert!(Attachment::from_value(&json!({"name": "x"}), "tool").is_none());
        assert!(Attachment::from_value(&json!("a.png"), "tool").is_none());
    }

    #[test]
    fn test_attachment_list_dedupes() {
        let raw = json!([
            {"id": "a", "name": "first"},
            {"id": "a", "name": "second"},
            {"id": "b"},
            42
        ]);
        let list = Attachment::list_from_value(Some(&raw), "upload");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "first");

        assert!(Attachment::list_from_value(Some(&json!({"id": "a"})), "upload").is_empty());
    }

    #[test]
    fn test_meta_flags() {
        let mut meta = Meta::new().with(META_SOURCE, SOURCE_LOCAL);
        assert!(meta.is_local());
        assert!(!meta.stream_open());

        meta.set_stream_open(true);
        assert!(meta.stream_open());

        let patch = Meta::new().with(META_STREAM_OPEN, false).with("phase", "final");
        meta.merge(&patch);
        assert!(!meta.stream_open());
        assert_eq!(meta.get("phase"), Some(&json!("final")));
    }

    #[test]
    fn test_backend_id_ignores_blank() {
        let meta = Meta::new().with(META_BACKEND_MSG_ID, "  ");
        assert!(meta.backend_msg_id().is_none());

        let meta = Meta::new().with(META_BACKEND_MSG_ID, 17);
        assert_eq!(meta.backend_msg_id(), Some(&json!(17)));
    }

    #[test]
    fn test_clear_transient_flags_only_for_assistant() {
        let mut user = Message::new(AgentId::Sisi, Role::User, "hi");
        user.meta.set_pending_reply(true);
        user.clear_transient_flags();
        assert!(user.meta.pending_reply());

        let mut reply = Message::new(AgentId::Sisi, Role::Assistant, "");
        reply.meta.set_pending_reply(true);
        reply.meta.set_stream_open(true);
        reply.clear_transient_flags();
        assert!(!reply.meta.pending_reply());
        assert!(!reply.meta.stream_open());
    }

    #[test]
    fn test_message_accepts_system_id_alias() {
        let raw = json!({
            "id": "m1",
            "system_id": "liuye",
            "role": "assistant",
            "content": "hello",
            "created_at": "2025-01-01T00:00:00Z"
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.agent_id, AgentId::Liuye);
        assert!(msg.attachments.is_empty());
    }
}
