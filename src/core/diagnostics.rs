//! Diagnostics sinks.
//!
//! The core reports notable outcomes as [`DiagnosticEvent`]s. Sinks decide
//! where they go: the tracing subscriber, a bounded in-memory log, or an
//! append-only JSONL file. Sink failures never reach the core.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use tracing::{debug, error, info, warn};

use crate::domain::{AgentId, DiagnosticEvent, EventKind, EventLevel};

/// Default number of entries kept by [`EventLog`]
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 500;

/// Destination for diagnostic events
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &DiagnosticEvent) -> Result<()>;
}

/// Record into a sink, logging instead of propagating failures
pub fn emit(sink: &dyn DiagnosticsSink, event: DiagnosticEvent) {
    if let Err(e) = sink.record(&event) {
        warn!(title = %event.title, "Failed to record diagnostic: {:#}", e);
    }
}

impl<S: DiagnosticsSink + ?Sized> DiagnosticsSink for Arc<S> {
    fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        (**self).record(event)
    }
}

/// Forwards events to `tracing` at the matching level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        let agent = event.agent_id.as_str();
        let kind = format!("{:?}", event.kind).to_lowercase();
        match event.level {
            EventLevel::Error => error!(agent, kind = %kind, "{}: {}", event.title, event.message),
            EventLevel::Warning => warn!(agent, kind = %kind, "{}: {}", event.title, event.message),
            EventLevel::Success => info!(agent, kind = %kind, "{}: {}", event.title, event.message),
            EventLevel::Info if event.kind == EventKind::Debug => {
                debug!(agent, kind = %kind, "{}: {}", event.title, event.message)
            }
            EventLevel::Info => info!(agent, kind = %kind, "{}: {}", event.title, event.message),
        }
        Ok(())
    }
}

/// Bounded in-memory log, newest first
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<DiagnosticEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot, newest first
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot filtered by agent and/or kind
    pub fn filtered(&self, agent: Option<AgentId>, kind: Option<EventKind>) -> Vec<DiagnosticEvent> {
        self.events()
            .into_iter()
            .filter(|e| agent.map_or(true, |a| e.agent_id == a))
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl DiagnosticsSink for EventLog {
    fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| anyhow!("Event log poisoned: {}", e))?;
        events.push_front(event.clone());
        events.truncate(self.capacity);
        Ok(())
    }
}

/// Append-only JSONL file shared between processes
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log under the configured home (`$SISILINK_HOME/events.jsonl`)
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::config::events_log_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every recorded event, oldest first
    pub fn replay(&self) -> Result<Vec<DiagnosticEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read events file")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: DiagnosticEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }
        Ok(events)
    }
}

impl DiagnosticsSink for JsonlSink {
    fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;
        file.lock_exclusive()
            .context("Failed to acquire file lock on events file")?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(file, "{}", json).context("Failed to write event")?;
        file.flush().context("Failed to flush event")?;

        // Lock is released when file is dropped
        Ok(())
    }
}

/// Delivers each event to every inner sink
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn DiagnosticsSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl DiagnosticsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl DiagnosticsSink for Fanout {
    /// Every sink sees the event even if an earlier one fails
    fn record(&self, event: &DiagnosticEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(kind: EventKind, title: &str) -> DiagnosticEvent {
        DiagnosticEvent::new(AgentId::Sisi, kind, EventLevel::Info, title, "")
    }

    #[test]
    fn test_event_log_newest_first_and_bounded() {
        let log = EventLog::new(2);
        log.record(&event(EventKind::Status, "a")).unwrap();
        log.record(&event(EventKind::Debug, "b")).unwrap();
        log.record(&event(EventKind::Audio, "c")).unwrap();

        let titles: Vec<_> = log.events().into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["c", "b"]);
        assert_eq!(log.filtered(None, Some(EventKind::Debug)).len(), 1);
        assert!(log.filtered(Some(AgentId::Liuye), None).is_empty());
    }

    #[test]
    fn test_jsonl_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlSink::new(temp.path().join("nested/events.jsonl"));

        assert!(sink.replay().unwrap().is_empty());
        sink.record(&event(EventKind::Status, "WS connected")).unwrap();
        sink.record(&event(EventKind::Debug, "WS unknown keys")).unwrap();

        let events = sink.replay().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].title, "WS connected");
        assert_eq!(events[1].kind, EventKind::Debug);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(EventLog::default());
        let b = Arc::new(EventLog::default());
        let fanout = Fanout::new().with(a.clone()).with(TracingSink).with(b.clone());

        emit(&fanout, event(EventKind::Chat, "panelReply"));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
