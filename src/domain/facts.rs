//! Typed facts extracted from inbound envelopes.
//!
//! The classifier narrows untyped JSON into these variants so the rest of the
//! core never inspects raw objects.

use serde_json::{Map, Value};

use super::agent::{AgentId, AgentStatus};
use super::message::{Attachment, Meta, Role};

/// One recognized piece of information carried by an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Fact {
    /// Input device list (non-arrays coerced to empty)
    DeviceList(Vec<Value>),

    /// TTS voice list (non-arrays coerced to empty)
    VoiceList(Vec<Value>),

    /// Backend "live" flag (`None` when explicitly null)
    LiveState(Option<bool>),

    /// Device connectivity flag (`None` when explicitly null)
    DeviceConnected(Option<bool>),

    /// Raw audio status plus its derived playing hint
    AudioStatus { raw: Value, playing: bool },

    /// Output level, already clamped to [0, 1]
    AudioLevel(f64),

    /// Agent state for the focused agent
    AgentStatus(AgentStatus),

    /// Backend switched the active agent
    SystemSwitch { agent: AgentId, payload: Value },

    /// Start/stop signal for the audio presence indicator
    AudioSignal { playing: bool, origin: SignalOrigin },

    /// Background music state change
    Music { event: String, playing: bool, info: Value },

    /// Device control request to forward to subscribers
    ControlIntent { action: String, fields: Map<String, Value> },

    /// Human-readable status line
    PanelMessage(String),

    /// Conversational reply fragment
    Reply(ReplyFragment),
}

/// Which envelope field produced an [`Fact::AudioSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOrigin {
    AudioEvent,
    PlaybackType,
    AudioCommand,
}

/// One piece of a (possibly streamed) reply
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplyFragment {
    /// Raw `type` field: agent id, `member`, or anything else
    pub kind: String,

    /// Backend message id (string or number)
    pub id: Value,

    pub uid: Value,

    pub username: Option<String>,

    /// Content flattened to text (objects are JSON-encoded)
    pub content: String,

    pub phase: String,

    pub is_intermediate: bool,

    pub attachments: Vec<Attachment>,

    pub audio_status: Option<Value>,
}

/// Markers that flag a phase as final
const FINAL_PHASE_MARKERS: [&str; 2] = ["final", "最终"];

impl ReplyFragment {
    /// Build a fragment from a `panelReply` object
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let text = |key: &str| match obj.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(super::message::value_as_text(other)),
        };

        Some(Self {
            kind: text("type").unwrap_or_default(),
            id: obj.get("id").cloned().unwrap_or(Value::Null),
            uid: obj.get("uid").cloned().unwrap_or(Value::Null),
            username: text("username").filter(|s| !s.is_empty()),
            content: flatten_content(obj.get("content")),
            phase: text("phase").unwrap_or_default(),
            is_intermediate: obj
                .get("is_intermediate")
                .map(super::message::is_truthy)
                .unwrap_or(false),
            attachments: Attachment::list_from_value(obj.get("attachments"), "tool"),
            audio_status: obj
                .get("audio_status")
                .or_else(|| obj.get("audioStatus"))
                .filter(|v| super::message::is_truthy(v))
                .cloned(),
        })
    }

    /// Author role: `member`/`user` fragments echo the human, the rest are replies
    pub fn role(&self) -> Role {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "member" | "user" => Role::User,
            _ => Role::Assistant,
        }
    }

    /// Agent named by the fragment's type, if it names one
    pub fn target_agent(&self) -> Option<AgentId> {
        AgentId::parse(&self.kind)
    }

    /// Whether the phase field carries a final marker
    pub fn phase_is_final(&self) -> bool {
        let lower = self.phase.to_lowercase();
        FINAL_PHASE_MARKERS.iter().any(|m| lower.contains(m))
    }

    /// A fragment is final unless it says it is intermediate or carries a non-final phase
    pub fn is_final(&self) -> bool {
        if self.is_intermediate {
            return false;
        }
        let phased_intermediate =
            self.role() == Role::Assistant && !self.phase.is_empty() && !self.phase_is_final();
        !phased_intermediate
    }

    /// Provenance meta merged into whichever message the fragment lands in
    pub fn provenance(&self) -> Meta {
        let role = self.role();
        let username = self.username.clone().unwrap_or_else(|| match role {
            Role::User => "User".to_string(),
            Role::Assistant => "SmartSisi".to_string(),
        });
        Meta::new()
            .with("username", username)
            .with("source", "ws.panelReply")
            .with("raw_type", self.kind.clone())
            .with("uid", self.uid.clone())
            .with("backend_msg_id", self.id.clone())
            .with("phase", self.phase.clone())
            .with("is_intermediate", self.is_intermediate)
    }
}

/// Flatten reply content to text: strings pass through, null is empty,
/// structured payloads are JSON-encoded
pub fn flatten_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
