//! Conversation reconciler.
//!
//! Merges reply fragments into the per-agent transcript. Fragments may be
//! streamed (cumulative or incremental), repeated, or echoes of what the
//! local user just typed; the reconciler resolves each one to at most one
//! message so nothing the user sees is lost or duplicated.
//!
//! All per-agent runtime state (status, open-stream pointer, abort flag)
//! lives here next to the [`TranscriptStore`] it refers to.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{AgentId, AgentStatus, Attachment, Message, MessagePatch, Meta, PerAgent, ReplyFragment, Role};

use super::storage::CURRENT_AGENT_KEY;
use super::text::{canonical, merge_text, normalize_chunk};
use super::transcript::TranscriptStore;

/// Default window in which a user-role echo of a local message is suppressed
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_millis(12_000);

/// Prefixes the backend puts in front of echoed multimodal input
const MULTIMODAL_ECHO_PREFIXES: [&str; 2] = ["多模态:", "multimodal:"];

/// Runtime state tracked for each agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentState {
    pub status: AgentStatus,

    /// Message currently receiving streamed continuations
    pub stream: Option<String>,

    /// Assistant fragments are dropped while set
    pub aborted: bool,
}

/// What applying a fragment did to the transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new message was appended
    Appended { agent: AgentId, id: String },

    /// Content (and meta) merged into an existing message
    Merged { agent: AgentId, id: String },

    /// Only metadata was merged (echo or duplicate suppression)
    MetaOnly { agent: AgentId, id: String },

    /// Nothing changed
    Ignored { agent: AgentId, reason: &'static str },
}

impl ReconcileOutcome {
    pub fn agent(&self) -> AgentId {
        match self {
            Self::Appended { agent, .. }
            | Self::Merged { agent, .. }
            | Self::MetaOnly { agent, .. }
            | Self::Ignored { agent, .. } => *agent,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Appended { id, .. } | Self::Merged { id, .. } | Self::MetaOnly { id, .. } => Some(id),
            Self::Ignored { .. } => None,
        }
    }

    /// Whether the transcript changed
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Ignored { .. })
    }
}

/// Ids created by [`Reconciler::submit_local`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubmission {
    pub user_id: String,
    pub placeholder_id: String,
}

/// Owns the transcript and all per-agent conversation state
pub struct Reconciler {
    store: TranscriptStore,
    agents: PerAgent<AgentState>,
    focused: AgentId,
    active_audio: AgentId,
    echo_window: chrono::Duration,
}

impl Reconciler {
    /// Wrap a store; focus is restored from the store's storage when present
    pub fn new(store: TranscriptStore, echo_window: Duration) -> Self {
        let focused = restore_focus(&store);
        Self {
            store,
            agents: PerAgent::default(),
            focused,
            active_audio: focused,
            echo_window: chrono::Duration::milliseconds(echo_window.as_millis() as i64),
        }
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.store
    }

    /// Route storage writes through a background task
    pub fn persist_in_background(&mut self) {
        self.store.write_in_background();
    }

    /// Wait for queued storage writes
    pub async fn flush(&mut self) {
        self.store.flush().await;
    }

    pub fn messages(&self, agent: AgentId) -> &[Message] {
        self.store.messages(agent)
    }

    pub fn focused(&self) -> AgentId {
        self.focused
    }

    pub fn active_audio(&self) -> AgentId {
        self.active_audio
    }

    pub fn state(&self, agent: AgentId) -> &AgentState {
        &self.agents[agent]
    }

    pub fn status(&self, agent: AgentId) -> AgentStatus {
        self.agents[agent].status
    }

    pub fn stream_pointer(&self, agent: AgentId) -> Option<&str> {
        self.agents[agent].stream.as_deref()
    }

    /// Apply a status to the focused agent
    pub fn set_status(&mut self, status: AgentStatus) {
        let agent = self.focused;
        if self.agents[agent].status != status {
            debug!(agent = %agent, status = status.as_str(), "Agent status changed");
        }
        self.agents[agent].status = status;
    }

    /// Change focus locally and persist it
    pub fn focus(&mut self, agent: AgentId) {
        self.focused = agent;
        self.store.store_value(CURRENT_AGENT_KEY, agent.as_str().to_string());
    }

    /// Backend-driven switch: moves focus and the active audio agent
    pub fn system_switch(&mut self, agent: AgentId) {
        self.focus(agent);
        self.active_audio = agent;
    }

    /// Record a message typed locally, followed by a pending reply placeholder.
    ///
    /// Returns `None` when there is neither text nor an attachment to send.
    pub fn submit_local(
        &mut self,
        agent: AgentId,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Option<LocalSubmission> {
        if content.trim().is_empty() && attachments.is_empty() {
            return None;
        }

        // A new turn must not inherit the previous reply's stream
        self.close_open_stream(agent);
        self.agents[agent].aborted = false;

        let meta = Meta::new().with("source", "ui").with("username", "User");
        let user_id = self.store.append(agent, Role::User, content, meta, attachments);

        let mut placeholder = Meta::new();
        placeholder.set_pending_reply(true);
        let placeholder_id = self.store.append(agent, Role::Assistant, "", placeholder, Vec::new());

        debug!(agent = %agent, user_id = %user_id, "Submitted local message");
        Some(LocalSubmission {
            user_id,
            placeholder_id,
        })
    }

    /// Stop accepting assistant fragments for `agent` until the next user message
    pub fn abort_stream(&mut self, agent: AgentId) -> bool {
        self.agents[agent].aborted = true;
        self.close_open_stream(agent)
    }

    /// Clear transient flags and stream pointers for one or both agents
    pub fn clear_streaming_flags(&mut self, agent: Option<AgentId>) -> bool {
        match agent {
            Some(agent) => self.agents[agent].stream = None,
            None => {
                for agent in AgentId::ALL {
                    self.agents[agent].stream = None;
                }
            }
        }
        self.store.clear_streaming_flags(agent)
    }

    /// Merge server-sourced history into both transcripts
    pub fn hydrate(&mut self, payload: &Value) -> bool {
        self.store.hydrate_payload(payload)
    }

    /// Merge one reply fragment into the transcript
    pub fn apply_fragment(&mut self, fragment: &ReplyFragment, now: DateTime<Utc>) -> ReconcileOutcome {
        let agent = fragment.target_agent().unwrap_or(self.focused);
        match fragment.role() {
            Role::Assistant => self.apply_assistant(agent, fragment),
            Role::User => self.apply_user_echo(agent, fragment, now),
        }
    }

    fn apply_assistant(&mut self, agent: AgentId, fragment: &ReplyFragment) -> ReconcileOutcome {
        if self.agents[agent].aborted {
            return ReconcileOutcome::Ignored {
                agent,
                reason: "stream aborted",
            };
        }

        let is_final = fragment.is_final();
        let chunk = normalize_chunk(&fragment.content);

        // 1. Continue the open stream
        if let Some(open_id) = self.agents[agent].stream.clone() {
            if self.merge_into(agent, &open_id, &chunk, fragment, is_final) {
                if is_final {
                    self.agents[agent].stream = None;
                }
                debug!(agent = %agent, id = %open_id, is_final, "Merged into open stream");
                return ReconcileOutcome::Merged { agent, id: open_id };
            }
            debug!(agent = %agent, id = %open_id, "Dropping stale stream pointer");
            self.agents[agent].stream = None;
        }

        // 2. Message already tagged with this backend id
        let tagged = self
            .store
            .find_by_backend_id(agent, &fragment.id)
            .map(|m| m.id.clone());
        if let Some(id) = tagged {
            self.merge_into(agent, &id, &chunk, fragment, is_final);
            self.point_stream(agent, &id, is_final);
            debug!(agent = %agent, id = %id, "Merged by backend id");
            return ReconcileOutcome::Merged { agent, id };
        }

        // 3. Fill the pending placeholder left by a local submit
        let placeholder = self
            .store
            .last(agent)
            .filter(|m| m.is_assistant() && m.meta.pending_reply() && m.content.is_empty())
            .map(|m| m.id.clone());
        if let Some(id) = placeholder {
            let mut patch = MessagePatch::default()
                .content(chunk)
                .meta(fragment_meta(fragment, is_final));
            if !fragment.attachments.is_empty() {
                patch = patch.attachments(fragment.attachments.clone());
            }
            self.store.patch(agent, &id, patch);
            self.point_stream(agent, &id, is_final);
            debug!(agent = %agent, id = %id, "Filled reply placeholder");
            return ReconcileOutcome::Merged { agent, id };
        }

        // 4. Still-open tail, or the reply to the latest user turn
        let recent = self
            .store
            .open_stream_tail(agent)
            .or_else(|| self.store.assistant_after_last_user(agent))
            .map(|m| m.id.clone());
        if let Some(id) = recent {
            self.merge_into(agent, &id, &chunk, fragment, is_final);
            self.point_stream(agent, &id, is_final);
            debug!(agent = %agent, id = %id, "Merged into recent reply");
            return ReconcileOutcome::Merged { agent, id };
        }

        // 5. New reply
        if chunk.trim().is_empty() && fragment.attachments.is_empty() {
            return ReconcileOutcome::Ignored {
                agent,
                reason: "empty fragment",
            };
        }
        let mut meta = fragment.provenance();
        meta.set_stream_open(!is_final);
        let id = self.store.append(
            agent,
            Role::Assistant,
            chunk,
            meta,
            fragment.attachments.clone(),
        );
        if !is_final {
            self.agents[agent].stream = Some(id.clone());
        }
        debug!(agent = %agent, id = %id, is_final, "Appended reply");
        ReconcileOutcome::Appended { agent, id }
    }

    fn apply_user_echo(
        &mut self,
        agent: AgentId,
        fragment: &ReplyFragment,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let incoming = canonical(&fragment.content);
        if incoming.is_empty() {
            return ReconcileOutcome::Ignored {
                agent,
                reason: "empty echo",
            };
        }

        if let Some(last_user) = self.store.last_user(agent) {
            let id = last_user.id.clone();
            let previous = canonical(&last_user.content);

            let suppress_local = last_user.meta.is_local() && {
                let recent = now.signed_duration_since(last_user.created_at) <= self.echo_window;
                let extends = !previous.is_empty() && incoming.starts_with(&previous);
                let multimodal = !last_user.attachments.is_empty()
                    && MULTIMODAL_ECHO_PREFIXES.iter().any(|p| incoming.starts_with(p));
                recent || extends || multimodal
            };

            if suppress_local || previous == incoming {
                self.store
                    .patch(agent, &id, MessagePatch::default().meta(fragment.provenance()));
                debug!(agent = %agent, id = %id, "Suppressed user echo");
                return ReconcileOutcome::MetaOnly { agent, id };
            }
        }

        let duplicate_tail = self
            .store
            .last(agent)
            .map(|m| m.is_user() && m.content.trim() == fragment.content.trim())
            .unwrap_or(false);
        if duplicate_tail {
            return ReconcileOutcome::Ignored {
                agent,
                reason: "duplicate user tail",
            };
        }

        self.agents[agent].aborted = false;
        let id = self.store.append(
            agent,
            Role::User,
            fragment.content.clone(),
            fragment.provenance(),
            fragment.attachments.clone(),
        );
        debug!(agent = %agent, id = %id, "Appended user utterance");
        ReconcileOutcome::Appended { agent, id }
    }

    /// Shared merge for rules that extend an existing message
    fn merge_into(
        &mut self,
        agent: AgentId,
        id: &str,
        chunk: &str,
        fragment: &ReplyFragment,
        is_final: bool,
    ) -> bool {
        let content = match self.store.get(agent, id) {
            Some(existing) => merge_text(&existing.content, chunk),
            None => return false,
        };

        let mut patch = MessagePatch::default()
            .content(content)
            .meta(fragment_meta(fragment, is_final));
        if !fragment.attachments.is_empty() {
            patch = patch.attachments(fragment.attachments.clone());
        }
        self.store.patch(agent, id, patch)
    }

    fn point_stream(&mut self, agent: AgentId, id: &str, is_final: bool) {
        self.agents[agent].stream = if is_final { None } else { Some(id.to_string()) };
    }

    /// Close the latest assistant message if it is still open or pending
    fn close_open_stream(&mut self, agent: AgentId) -> bool {
        self.agents[agent].stream = None;

        let open = self
            .store
            .messages(agent)
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .filter(|m| m.meta.stream_open() || m.meta.pending_reply())
            .map(|m| m.id.clone());
        match open {
            Some(id) => {
                let mut meta = Meta::new();
                meta.set_stream_open(false);
                meta.set_pending_reply(false);
                self.store.patch(agent, &id, MessagePatch::default().meta(meta))
            }
            None => false,
        }
    }
}

/// Provenance plus the transient flags for a merged fragment
fn fragment_meta(fragment: &ReplyFragment, is_final: bool) -> Meta {
    let mut meta = fragment.provenance();
    meta.set_pending_reply(false);
    meta.set_stream_open(!is_final);
    meta
}

fn restore_focus(store: &TranscriptStore) -> AgentId {
    let stored = match store.storage().map(|s| s.get(CURRENT_AGENT_KEY)) {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            warn!("Failed to read focused agent: {}", e);
            None
        }
        None => None,
    };
    stored
        .and_then(|raw| AgentId::parse(raw.trim().trim_matches('"')))
        .unwrap_or_default()
}
