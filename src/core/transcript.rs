//! Per-agent transcript store.
//!
//! The store is the single owner of both agents' message lists. Every
//! mutating operation writes a snapshot to storage afterwards; write
//! failures are logged and never reach the caller. Inside a runtime the
//! writes can be handed to a [`BackgroundWriter`] so mutations never wait
//! on disk; [`TranscriptStore::flush`] drains it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::message::{generate_id, value_as_text};
use crate::domain::{AgentId, Attachment, Message, MessagePatch, Meta, PerAgent, Role};

use super::backend_history::extract_backend_history;
use super::storage::{BackgroundWriter, KeyValueStorage, HISTORY_KEY};

/// Default number of messages kept per agent
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Both agents' transcripts plus their persistence
pub struct TranscriptStore {
    lists: PerAgent<Vec<Message>>,
    limit: usize,
    storage: Option<Arc<dyn KeyValueStorage>>,
    writer: Option<BackgroundWriter>,
}

impl TranscriptStore {
    /// Empty, unpersisted store
    pub fn new(limit: usize) -> Self {
        Self {
            lists: PerAgent::default(),
            limit: limit.max(1),
            storage: None,
            writer: None,
        }
    }

    /// Cold-load from storage. Unreadable data yields an empty transcript.
    pub fn load(storage: Arc<dyn KeyValueStorage>, limit: usize) -> Self {
        let limit = limit.max(1);
        let lists = match storage.get(HISTORY_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(data) => restore_lists(&data, limit),
                Err(e) => {
                    warn!("Discarding unreadable transcript: {}", e);
                    PerAgent::default()
                }
            },
            Ok(None) => PerAgent::default(),
            Err(e) => {
                warn!("Failed to read transcript: {}", e);
                PerAgent::default()
            }
        };

        Self {
            lists,
            limit,
            storage: Some(storage),
            writer: None,
        }
    }

    /// Move storage writes onto a background task.
    ///
    /// No-op without storage or outside a tokio runtime.
    pub fn write_in_background(&mut self) {
        if self.writer.is_some() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        if let Some(storage) = &self.storage {
            self.writer = Some(BackgroundWriter::spawn(storage.clone()));
        }
    }

    /// Wait for queued writes; later writes are synchronous again
    pub async fn flush(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn storage(&self) -> Option<&Arc<dyn KeyValueStorage>> {
        self.storage.as_ref()
    }

    /// Write one value through the writer if running, else in place
    pub(crate) fn store_value(&self, key: &str, value: String) {
        if let Some(writer) = &self.writer {
            writer.submit(key, value);
            return;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.set(key, &value) {
                warn!(key = %key, "Failed to write storage: {}", e);
            }
        }
    }

    pub fn messages(&self, agent: AgentId) -> &[Message] {
        &self.lists[agent]
    }

    pub fn get(&self, agent: AgentId, id: &str) -> Option<&Message> {
        self.lists[agent].iter().rev().find(|m| m.id == id)
    }

    pub fn last(&self, agent: AgentId) -> Option<&Message> {
        self.lists[agent].last()
    }

    /// Most recent user message
    pub fn last_user(&self, agent: AgentId) -> Option<&Message> {
        self.lists[agent].iter().rev().find(|m| m.is_user())
    }

    /// Most recent assistant message tagged with `backend_id`
    pub fn find_by_backend_id(&self, agent: AgentId, backend_id: &Value) -> Option<&Message> {
        if backend_id.is_null() || value_as_text(backend_id).trim().is_empty() {
            return None;
        }
        self.lists[agent]
            .iter()
            .rev()
            .filter(|m| m.is_assistant())
            .find(|m| m.meta.backend_msg_id() == Some(backend_id))
    }

    /// The latest assistant message, if it is still streaming
    pub fn open_stream_tail(&self, agent: AgentId) -> Option<&Message> {
        self.lists[agent]
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .filter(|m| m.meta.stream_open())
    }

    /// Latest assistant message emitted after the latest user message
    pub fn assistant_after_last_user(&self, agent: AgentId) -> Option<&Message> {
        self.lists[agent]
            .iter()
            .rev()
            .take_while(|m| !m.is_user())
            .find(|m| m.is_assistant())
    }

    /// Append a new message stamped now; returns its id
    pub fn append(
        &mut self,
        agent: AgentId,
        role: Role,
        content: impl Into<String>,
        meta: Meta,
        attachments: Vec<Attachment>,
    ) -> String {
        let message = Message::new(agent, role, content)
            .with_meta(meta)
            .with_attachments(attachments);
        let id = self.push(message);
        self.persist();
        id
    }

    /// Apply a patch; returns whether the message was found
    pub fn patch(&mut self, agent: AgentId, id: &str, patch: MessagePatch) -> bool {
        let message = match self.lists[agent].iter_mut().rev().find(|m| m.id == id) {
            Some(message) => message,
            None => return false,
        };

        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(meta) = patch.meta {
            message.meta.merge(&meta);
        }
        if let Some(attachments) = patch.attachments {
            message.attachments = crate::domain::message::dedupe_attachments(attachments);
        }

        self.persist();
        true
    }

    /// Merge server-sourced history into one agent's list.
    ///
    /// Entries already present (same role, timestamp and content) are
    /// skipped; new ones are appended at the tail in their incoming order.
    pub fn hydrate(&mut self, agent: AgentId, incoming: Vec<Message>) -> bool {
        let changed = self.merge_incoming(agent, incoming);
        if changed {
            self.persist();
        }
        changed
    }

    /// Hydrate both agents from a bootstrap payload in any accepted shape
    pub fn hydrate_payload(&mut self, payload: &Value) -> bool {
        let incoming = extract_backend_history(payload);
        let mut changed = false;
        for agent in AgentId::ALL {
            changed |= self.merge_incoming(agent, incoming[agent].clone());
        }
        if changed {
            self.persist();
        }
        changed
    }

    /// Force `pending_reply`/`stream_open` off on assistant messages
    pub fn clear_streaming_flags(&mut self, agent: Option<AgentId>) -> bool {
        let agents = match agent {
            Some(agent) => vec![agent],
            None => AgentId::ALL.to_vec(),
        };

        let mut changed = false;
        for agent in agents {
            for message in self.lists[agent].iter_mut().filter(|m| m.is_assistant()) {
                if message.meta.pending_reply() || message.meta.stream_open() {
                    message.clear_transient_flags();
                    changed = true;
                }
            }
        }
        if changed {
            self.persist();
        }
        changed
    }

    fn merge_incoming(&mut self, agent: AgentId, incoming: Vec<Message>) -> bool {
        if incoming.is_empty() {
            return false;
        }

        let mut seen: HashSet<(Role, DateTime<Utc>, String)> = self.lists[agent]
            .iter()
            .map(|m| (m.role, m.created_at, m.content.clone()))
            .collect();

        let skip = incoming.len().saturating_sub(self.limit);
        let mut appended = 0;
        for mut message in incoming.into_iter().skip(skip) {
            let key = (message.role, message.created_at, message.content.clone());
            if !seen.insert(key) {
                continue;
            }
            message.agent_id = agent;
            message.clear_transient_flags();
            self.push(message);
            appended += 1;
        }

        if appended > 0 {
            debug!(agent = %agent, appended, "Hydrated transcript");
        }
        appended > 0
    }

    fn push(&mut self, mut message: Message) -> String {
        let agent = message.agent_id;
        let list = &mut self.lists[agent];
        if message.id.is_empty() || list.iter().any(|m| m.id == message.id) {
            message.id = generate_id();
        }
        let id = message.id.clone();
        list.push(message);

        if list.len() > self.limit {
            let excess = list.len() - self.limit;
            list.drain(..excess);
        }
        id
    }

    /// Write both lists under [`HISTORY_KEY`]; failures are swallowed
    pub fn persist(&self) {
        if self.storage.is_none() {
            return;
        }

        match serde_json::to_string(&self.lists) {
            Ok(json) => self.store_value(HISTORY_KEY, json),
            Err(e) => warn!("Failed to persist transcript: {}", e),
        }
    }
}

/// Normalize a persisted `{sisi: [...], liuye: [...]}` snapshot
fn restore_lists(data: &Value, limit: usize) -> PerAgent<Vec<Message>> {
    let mut lists: PerAgent<Vec<Message>> = PerAgent::default();
    for agent in AgentId::ALL {
        let entries = match data.get(agent.as_str()).and_then(Value::as_array) {
            Some(entries) => entries,
            None => continue,
        };

        let list = &mut lists[agent];
        for entry in entries {
            if let Some(mut message) = restore_entry(agent, entry) {
                if list.iter().any(|m| m.id == message.id) {
                    message.id = generate_id();
                }
                list.push(message);
            }
        }
        if list.len() > limit {
            let excess = list.len() - limit;
            list.drain(..excess);
        }
    }
    lists
}

fn restore_entry(agent: AgentId, entry: &Value) -> Option<Message> {
    let obj = entry.as_object()?;
    let role = obj.get("role").and_then(Value::as_str).and_then(Role::parse)?;

    let id = obj.get("id").map(value_as_text).unwrap_or_default();
    let content = obj.get("content").map(value_as_text).unwrap_or_default();
    let created_at = obj
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let meta = obj
        .get("meta")
        .and_then(Value::as_object)
        .cloned()
        .map(Meta::from)
        .unwrap_or_default();

    let mut message = Message {
        id: if id.is_empty() { generate_id() } else { id },
        agent_id: agent,
        role,
        content,
        created_at,
        meta,
        attachments: Attachment::list_from_value(obj.get("attachments"), "upload"),
    };
    message.clear_transient_flags();
    Some(message)
}
