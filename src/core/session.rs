//! Session runtime.
//!
//! A [`Session`] owns every piece of core state and is driven by a single
//! task. Each input (a command, a finished connect, an inbound frame, an
//! expired timer) is processed to completion before the next one is
//! polled, so nothing is ever mutated concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::adapters::websocket::{Connector, Link};
use crate::config::{BackendConfig, ResolvedConfig};
use crate::domain::{
    AgentId, AgentStatus, AmbientState, Attachment, DiagnosticEvent, EventKind, EventLevel, Fact,
    Message, PerAgent, ReplyFragment,
};

use super::classifier::{classify, decode_envelope};
use super::diagnostics::{emit, DiagnosticsSink};
use super::reconciler::{LocalSubmission, ReconcileOutcome, Reconciler, DEFAULT_ECHO_WINDOW};
use super::stabilizer::{AudioStabilizer, StabilizerConfig};
use super::timer::sleep_until;
use super::transport::{
    ConnectionState, TransportCommand, TransportError, TransportManager, DEFAULT_RETRY_DELAY,
};

/// Capacity of the command queue feeding the session task
const COMMAND_BUFFER: usize = 64;

/// Capacity of the intent and update broadcast channels
const BROADCAST_BUFFER: usize = 256;

/// Runtime settings for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub backend: BackendConfig,
    pub reconnect_delay: Duration,
    pub stabilizer: StabilizerConfig,
    pub echo_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            reconnect_delay: DEFAULT_RETRY_DELAY,
            stabilizer: StabilizerConfig::default(),
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }
}

impl From<&ResolvedConfig> for SessionConfig {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            backend: config.backend.clone(),
            reconnect_delay: config.timing.reconnect_delay(),
            stabilizer: config.timing.stabilizer(),
            echo_window: config.transcript.echo_window(),
        }
    }
}

/// Requests accepted by a running session
#[derive(Debug)]
pub enum SessionCommand {
    Connect(String),
    Disconnect,
    /// Mode/url change: reconnects, or disconnects when not live
    ApplyBackend(BackendConfig),
    SubmitLocal {
        agent: AgentId,
        content: String,
        attachments: Vec<Attachment>,
        reply: oneshot::Sender<Option<LocalSubmission>>,
    },
    AbortStream(AgentId),
    Focus(AgentId),
    Hydrate(Value),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Observable change, broadcast to subscribers
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Connectivity { connected: bool, url: String },
    Message { message: Message, appended: bool },
    Status { agent: AgentId, status: AgentStatus },
    Focus(AgentId),
    AudioPlaying(bool),
    Hydrated,
}

/// Point-in-time copy of the session state
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub ambient: AmbientState,
    pub focused: AgentId,
    pub active_audio: AgentId,
    pub statuses: PerAgent<AgentStatus>,
    pub stream_pointers: PerAgent<Option<String>>,
    pub transcripts: PerAgent<Vec<Message>>,
}

/// The session task is gone
#[derive(Debug, Error)]
#[error("Session has shut down")]
pub struct SessionClosed;

/// A connect in flight
struct Opening {
    url: String,
    future: BoxFuture<'static, Result<Link, TransportError>>,
}

/// Owner of all core state
pub struct Session {
    config: SessionConfig,
    transport: TransportManager,
    reconciler: Reconciler,
    stabilizer: AudioStabilizer,
    ambient: AmbientState,
    diagnostics: Arc<dyn DiagnosticsSink>,
    connector: Arc<dyn Connector>,
    intents: broadcast::Sender<Value>,
    updates: broadcast::Sender<SessionUpdate>,
    link: Option<Link>,
    opening: Option<Opening>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        reconciler: Reconciler,
        connector: Arc<dyn Connector>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let (intents, _) = broadcast::channel(BROADCAST_BUFFER);
        let (updates, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            transport: TransportManager::new(config.reconnect_delay),
            stabilizer: AudioStabilizer::new(config.stabilizer),
            config,
            reconciler,
            ambient: AmbientState::default(),
            diagnostics,
            connector,
            intents,
            updates,
            link: None,
            opening: None,
        }
    }

    pub fn ambient(&self) -> &AmbientState {
        &self.ambient
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn connection(&self) -> &ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_intents(&self) -> broadcast::Receiver<Value> {
        self.intents.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut statuses: PerAgent<AgentStatus> = PerAgent::default();
        let mut stream_pointers: PerAgent<Option<String>> = PerAgent::default();
        let mut transcripts: PerAgent<Vec<Message>> = PerAgent::default();
        for agent in AgentId::ALL {
            statuses[agent] = self.reconciler.status(agent);
            stream_pointers[agent] = self.reconciler.stream_pointer(agent).map(str::to_string);
            transcripts[agent] = self.reconciler.messages(agent).to_vec();
        }
        SessionSnapshot {
            connection: self.transport.state().clone(),
            ambient: self.ambient.clone(),
            focused: self.reconciler.focused(),
            active_audio: self.reconciler.active_audio(),
            statuses,
            stream_pointers,
            transcripts,
        }
    }

    /// Spawn the session task and return a handle to it
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SessionHandle {
            tx,
            intents: self.intents.clone(),
            updates: self.updates.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    /// Drive the session until shutdown or until every handle is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        self.reconciler.persist_in_background();
        self.refresh(Instant::now());

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command, Instant::now()),
                },
                (url, result) = finish_opening(&mut self.opening) => {
                    self.on_link_opened(&url, result, Instant::now());
                }
                frame = next_frame(&mut self.link) => match frame {
                    Some(Ok(text)) => self.handle_frame(&text, Instant::now()),
                    Some(Err(e)) => self.on_link_closed(Some(e), Instant::now()),
                    None => self.on_link_closed(None, Instant::now()),
                },
                _ = sleep_until(deadline) => self.poll_timers(Instant::now()),
            }
        }

        let commands = self.transport.disconnect();
        self.execute(commands, Instant::now());
        self.reconciler.flush().await;
        info!("Session stopped");
    }

    /// Earliest pending timer across the transport and the stabilizer
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.transport.retry_deadline(), self.stabilizer.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whatever timers have expired
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(playing) = self.stabilizer.poll(now) {
            self.observe_audio(playing);
        }
        let commands = self.transport.poll_retry(now);
        self.execute(commands, now);
    }

    pub fn handle_command(&mut self, command: SessionCommand, now: Instant) {
        match command {
            SessionCommand::Connect(url) => {
                let commands = self.transport.connect(&url);
                self.execute(commands, now);
            }
            SessionCommand::Disconnect => {
                let commands = self.transport.disconnect();
                self.execute(commands, now);
            }
            SessionCommand::ApplyBackend(backend) => {
                self.config.backend = backend;
                self.refresh(now);
            }
            SessionCommand::SubmitLocal {
                agent,
                content,
                attachments,
                reply,
            } => {
                let submission = self.submit_local(agent, &content, attachments);
                let _ = reply.send(submission);
            }
            SessionCommand::AbortStream(agent) => {
                if self.reconciler.abort_stream(agent) {
                    debug!(agent = %agent, "Aborted open stream");
                }
            }
            SessionCommand::Focus(agent) => {
                self.reconciler.focus(agent);
                self.publish(SessionUpdate::Focus(agent));
            }
            SessionCommand::Hydrate(payload) => self.hydrate(&payload),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    pub fn submit_local(
        &mut self,
        agent: AgentId,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Option<LocalSubmission> {
        let submission = self.reconciler.submit_local(agent, content, attachments)?;
        self.publish_message(agent, &submission.user_id, true);
        self.publish_message(agent, &submission.placeholder_id, true);
        Some(submission)
    }

    pub fn hydrate(&mut self, payload: &Value) {
        if self.reconciler.hydrate(payload) {
            self.diagnose(EventKind::Status, EventLevel::Success, "History sync", "Restored history from backend", Value::Null);
            self.publish(SessionUpdate::Hydrated);
        }
    }

    /// Connect or disconnect to match the backend config
    pub fn refresh(&mut self, now: Instant) {
        let target = self.config.backend.live_target().map(str::to_string);
        let commands = self.transport.set_target(target.as_deref());
        self.execute(commands, now);
    }

    /// Process one inbound text frame
    pub fn handle_frame(&mut self, text: &str, now: Instant) {
        self.ambient.touch();

        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed envelope: {}", e);
                return;
            }
        };

        let classification = classify(&envelope);
        let raw = Value::Object(envelope);
        if !classification.unknown_keys.is_empty() {
            let keys = classification.unknown_keys.join(", ");
            self.diagnose(
                EventKind::Debug,
                EventLevel::Info,
                "WS unknown keys",
                format!("keys: {}", keys),
                json!({"keys": classification.unknown_keys, "payload": raw}),
            );
        }

        for fact in classification.facts {
            self.apply_fact(fact, &raw, now);
        }
    }

    fn apply_fact(&mut self, fact: Fact, raw: &Value, now: Instant) {
        match fact {
            Fact::DeviceList(list) => self.ambient.device_list = list,
            Fact::VoiceList(list) => self.ambient.voice_list = list,
            Fact::LiveState(state) => self.ambient.live_state = state,
            Fact::DeviceConnected(flag) => self.ambient.device_connected = flag,
            Fact::AudioStatus { raw: status, playing } => {
                self.ambient.audio_status = Some(status);
                self.set_audio(playing, now);
            }
            Fact::AudioLevel(level) => self.ambient.audio_level = level,
            Fact::AgentStatus(status) => {
                self.reconciler.set_status(status);
                let agent = self.reconciler.focused();
                self.publish(SessionUpdate::Status { agent, status });
            }
            Fact::SystemSwitch { agent, payload } => {
                self.reconciler.system_switch(agent);
                self.diagnose(EventKind::Status, EventLevel::Info, "systemSwitch", format!("mode={}", agent), payload);
                self.publish(SessionUpdate::Focus(agent));
            }
            Fact::AudioSignal { playing, origin } => {
                debug!(?origin, playing, "Audio signal");
                self.set_audio(playing, now);
            }
            Fact::Music { event, playing, info } => {
                let title = info.get("title").and_then(Value::as_str).unwrap_or_default();
                let message = if title.is_empty() {
                    event.clone()
                } else {
                    format!("{}: {}", event, title)
                };
                self.ambient.set_music(playing, Some(info));
                self.diagnose(EventKind::Audio, EventLevel::Info, "music_event", message, raw.clone());
            }
            Fact::ControlIntent { action, fields } => self.dispatch_intent(action, fields),
            Fact::PanelMessage(text) => {
                self.diagnose(EventKind::Status, EventLevel::Info, "panelMsg", text, raw.clone());
            }
            Fact::Reply(fragment) => self.apply_reply(&fragment, raw),
        }
    }

    fn apply_reply(&mut self, fragment: &ReplyFragment, raw: &Value) {
        let outcome = self.reconciler.apply_fragment(fragment, Utc::now());
        match &outcome {
            ReconcileOutcome::Appended { agent, id } => self.publish_message(*agent, id, true),
            ReconcileOutcome::Merged { agent, id } | ReconcileOutcome::MetaOnly { agent, id } => {
                self.publish_message(*agent, id, false)
            }
            ReconcileOutcome::Ignored { agent, reason } => {
                debug!(agent = %agent, reason, "Fragment ignored");
            }
        }

        let kind = if fragment.kind.is_empty() { "reply" } else { fragment.kind.as_str() };
        self.diagnose(
            EventKind::Status,
            EventLevel::Info,
            "panelReply",
            format!("{}: {}", kind, fragment.content),
            raw.clone(),
        );
    }

    fn dispatch_intent(&mut self, action: String, fields: Map<String, Value>) {
        let mut payload = fields;
        payload.insert("action".to_string(), Value::String(action.clone()));
        payload.insert("_received_at".to_string(), json!(Utc::now().timestamp_millis()));
        let payload = Value::Object(payload);

        let title = if action.is_empty() { "intent".to_string() } else { action };
        self.diagnose(EventKind::Status, EventLevel::Info, "control_intent", title, payload.clone());

        // No subscribers is fine
        let _ = self.intents.send(payload);
    }

    fn set_audio(&mut self, playing: bool, now: Instant) {
        if let Some(observed) = self.stabilizer.set_playing(playing, false, now) {
            self.observe_audio(observed);
        }
    }

    fn observe_audio(&mut self, playing: bool) {
        self.ambient.audio_playing = playing;
        self.publish(SessionUpdate::AudioPlaying(playing));
    }

    /// A connect attempt finished
    pub fn on_link_opened(&mut self, url: &str, result: Result<Link, TransportError>, now: Instant) {
        match result {
            Ok(link) => {
                let commands = self.transport.on_open(url);
                if commands.contains(&TransportCommand::Close) {
                    // Superseded by a newer connect; dropping the link closes it
                    return;
                }
                self.execute(commands, now);
                self.link = Some(link);
            }
            Err(e) => {
                self.diagnose(
                    EventKind::Status,
                    EventLevel::Error,
                    "WS connect failed",
                    format!("{}: {}", url, e),
                    json!({"url": url}),
                );
                let commands = self.transport.on_close(Some(&e), now);
                self.execute(commands, now);
            }
        }
    }

    /// The live link ended or errored
    pub fn on_link_closed(&mut self, error: Option<TransportError>, now: Instant) {
        self.link = None;
        let commands = self.transport.on_close(error.as_ref(), now);
        self.execute(commands, now);
    }

    fn execute(&mut self, commands: Vec<TransportCommand>, now: Instant) {
        for command in commands {
            match command {
                TransportCommand::Open(url) => {
                    self.link = None;
                    let connector = self.connector.clone();
                    let target = url.clone();
                    self.opening = Some(Opening {
                        url,
                        future: Box::pin(async move { connector.open(&target).await }),
                    });
                }
                TransportCommand::Close => {
                    self.link = None;
                    self.opening = None;
                }
                TransportCommand::ResetAmbient => self.reset_ambient(now),
                TransportCommand::Connectivity { connected, url } => {
                    self.ambient.set_connected(connected, &url);
                    if connected {
                        self.diagnose(EventKind::Status, EventLevel::Success, "WS connected", url.clone(), Value::Null);
                    } else {
                        self.diagnose(EventKind::Status, EventLevel::Warning, "WS disconnected", url.clone(), Value::Null);
                    }
                    self.publish(SessionUpdate::Connectivity { connected, url });
                }
            }
        }
    }

    fn reset_ambient(&mut self, now: Instant) {
        if let Some(playing) = self.stabilizer.reset(now) {
            self.observe_audio(playing);
        }
        self.ambient.set_music(false, None);
        self.reconciler.clear_streaming_flags(None);
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn publish_message(&self, agent: AgentId, id: &str, appended: bool) {
        if let Some(message) = self.reconciler.transcript().get(agent, id) {
            self.publish(SessionUpdate::Message {
                message: message.clone(),
                appended,
            });
        }
    }

    fn diagnose(
        &self,
        kind: EventKind,
        level: EventLevel,
        title: &str,
        message: impl Into<String>,
        payload: Value,
    ) {
        let event = DiagnosticEvent::new(self.reconciler.focused(), kind, level, title, message)
            .with_payload(payload);
        emit(self.diagnostics.as_ref(), event);
    }
}

/// Resolve when the in-flight connect finishes; pend forever when there is none
async fn finish_opening(opening: &mut Option<Opening>) -> (String, Result<Link, TransportError>) {
    let result = match opening.as_mut() {
        Some(op) => op.future.as_mut().await,
        None => std::future::pending().await,
    };
    let url = opening.take().map(|op| op.url).unwrap_or_default();
    (url, result)
}

/// Next frame of the live link; pend forever when there is none
async fn next_frame(link: &mut Option<Link>) -> Option<Result<String, TransportError>> {
    match link.as_mut() {
        Some(link) => link.next_frame().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    intents: broadcast::Sender<Value>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.tx.send(command).await.map_err(|_| SessionClosed)
    }

    pub async fn connect(&self, url: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Connect(url.into())).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn apply_backend(&self, backend: BackendConfig) -> Result<(), SessionClosed> {
        self.send(SessionCommand::ApplyBackend(backend)).await
    }

    pub async fn submit_local(
        &self,
        agent: AgentId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Option<LocalSubmission>, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SubmitLocal {
            agent,
            content: content.into(),
            attachments,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionClosed)
    }

    pub async fn abort_stream(&self, agent: AgentId) -> Result<(), SessionClosed> {
        self.send(SessionCommand::AbortStream(agent)).await
    }

    pub async fn focus(&self, agent: AgentId) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Focus(agent)).await
    }

    pub async fn hydrate(&self, payload: Value) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Hydrate(payload)).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| SessionClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Shutdown).await
    }

    pub fn subscribe_intents(&self) -> broadcast::Receiver<Value> {
        self.intents.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }
}
