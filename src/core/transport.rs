//! Transport connection state machine.
//!
//! The manager never performs I/O itself. Each transition returns the
//! [`TransportCommand`]s the session must carry out (open a link, drop it,
//! reset ambient state, report connectivity). All failures end in a
//! scheduled retry, so no transition can fail.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use super::timer::{TimerKind, TimerSlot};

/// Default delay before reconnecting after an unexpected close
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1200);

/// Failure to construct or keep a live link
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid transport url: {0}")]
    InvalidUrl(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Link error: {0}")]
    Link(String),
}

/// Lifecycle phase of the single live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the retry delay to elapse
    Reconnecting,
}

/// Process-wide connection state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub url: String,
    pub manual_close: bool,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Start opening a link to the url
    Open(String),

    /// Drop the current link (or abandon an in-flight open)
    Close,

    /// Reset audio/music state and close open streams
    ResetAmbient,

    /// Report connectivity to ambient state and diagnostics
    Connectivity { connected: bool, url: String },
}

/// Owns the connection state and its retry timer
#[derive(Debug)]
pub struct TransportManager {
    state: ConnectionState,
    target: Option<String>,
    retry: TimerSlot,
    retry_delay: Duration,
}

impl TransportManager {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            state: ConnectionState::default(),
            target: None,
            retry: TimerSlot::new(TimerKind::Reconnect),
            retry_delay,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// Desired url, if the transport should be live
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }

    /// Connect to `url`; a no-op when already connecting or connected to it
    pub fn connect(&mut self, url: &str) -> Vec<TransportCommand> {
        let url = url.trim();
        if url.is_empty() {
            return self.disconnect();
        }
        self.target = Some(url.to_string());

        let live = matches!(
            self.state.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        );
        if live && self.state.url == url {
            return Vec::new();
        }

        let mut commands = self.teardown();
        self.state = ConnectionState {
            status: ConnectionStatus::Connecting,
            url: url.to_string(),
            manual_close: false,
        };
        info!(url = %url, "Connecting");
        commands.push(TransportCommand::Open(url.to_string()));
        commands
    }

    /// Manual close: cancels any retry and stays disconnected
    pub fn disconnect(&mut self) -> Vec<TransportCommand> {
        self.target = None;
        self.teardown()
    }

    /// Change the desired url; `None` disconnects
    pub fn set_target(&mut self, url: Option<&str>) -> Vec<TransportCommand> {
        match url {
            Some(url) => self.connect(url),
            None => self.disconnect(),
        }
    }

    /// The link to `url` finished opening
    pub fn on_open(&mut self, url: &str) -> Vec<TransportCommand> {
        if self.state.status != ConnectionStatus::Connecting || self.state.url != url {
            debug!(url = %url, "Ignoring open for superseded link");
            return vec![TransportCommand::Close];
        }
        self.state.status = ConnectionStatus::Connected;
        info!(url = %url, "Connected");
        vec![TransportCommand::Connectivity {
            connected: true,
            url: url.to_string(),
        }]
    }

    /// The link closed or failed to open; schedules a retry unless closed manually
    pub fn on_close(&mut self, error: Option<&TransportError>, now: Instant) -> Vec<TransportCommand> {
        if !matches!(
            self.state.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            return Vec::new();
        }

        match error {
            Some(e) => info!(url = %self.state.url, "Transport closed: {}", e),
            None => info!(url = %self.state.url, "Transport closed"),
        }
        let url = self.state.url.clone();
        let commands = vec![
            TransportCommand::Close,
            TransportCommand::ResetAmbient,
            TransportCommand::Connectivity { connected: false, url },
        ];

        if self.state.manual_close {
            self.state.status = ConnectionStatus::Disconnected;
        } else {
            self.state.status = ConnectionStatus::Reconnecting;
            self.retry.arm(now + self.retry_delay);
            debug!(delay_ms = self.retry_delay.as_millis() as u64, "Reconnect scheduled");
        }
        commands
    }

    /// Fire the retry if due
    pub fn poll_retry(&mut self, now: Instant) -> Vec<TransportCommand> {
        if !self.retry.take_expired(now) {
            return Vec::new();
        }
        // Retry reopens even when the url is unchanged
        self.state.status = ConnectionStatus::Disconnected;
        match self.target.clone() {
            Some(url) => self.connect(&url),
            None => self.disconnect(),
        }
    }

    /// Tear down whatever is live and mark the close as manual
    fn teardown(&mut self) -> Vec<TransportCommand> {
        let was_live = self.state.status != ConnectionStatus::Disconnected;
        self.state.manual_close = true;
        if self.retry.cancel() {
            debug!("Cancelled pending reconnect");
        }

        let url = self.state.url.clone();
        self.state.status = ConnectionStatus::Disconnected;
        if !was_live {
            return vec![TransportCommand::ResetAmbient];
        }
        info!(url = %url, "Disconnected");
        vec![
            TransportCommand::Close,
            TransportCommand::ResetAmbient,
            TransportCommand::Connectivity { connected: false, url },
        ]
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "ws://127.0.0.1:10003";

    #[test]
    fn test_connect_is_idempotent() {
        let mut t = TransportManager::default();
        let commands = t.connect(URL);
        assert_eq!(commands.last(), Some(&TransportCommand::Open(URL.to_string())));
        assert_eq!(t.status(), ConnectionStatus::Connecting);

        assert!(t.connect(URL).is_empty());
        t.on_open(URL);
        assert!(t.connect(URL).is_empty());
        assert_eq!(t.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_unexpected_close_schedules_retry() {
        let now = Instant::now();
        let mut t = TransportManager::default();
        t.connect(URL);
        t.on_open(URL);

        let commands = t.on_close(None, now);
        assert!(commands.contains(&TransportCommand::ResetAmbient));
        assert_eq!(t.status(), ConnectionStatus::Reconnecting);
        assert_eq!(t.retry_deadline(), Some(now + DEFAULT_RETRY_DELAY));

        assert!(t.poll_retry(now + Duration::from_millis(1199)).is_empty());
        let commands = t.poll_retry(now + DEFAULT_RETRY_DELAY);
        assert_eq!(commands.last(), Some(&TransportCommand::Open(URL.to_string())));
        assert_eq!(t.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_connect_failure_treated_as_close() {
        let now = Instant::now();
        let mut t = TransportManager::default();
        t.connect(URL);

        let err = TransportError::Connect("refused".to_string());
        t.on_close(Some(&err), now);
        assert_eq!(t.status(), ConnectionStatus::Reconnecting);
        assert!(t.retry_deadline().is_some());
    }

    #[test]
    fn test_disconnect_cancels_retry() {
        let now = Instant::now();
        let mut t = TransportManager::default();
        t.connect(URL);
        t.on_close(None, now);

        t.disconnect();
        assert_eq!(t.status(), ConnectionStatus::Disconnected);
        assert!(t.state().manual_close);
        assert!(t.retry_deadline().is_none());
        assert!(t.poll_retry(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_manual_close_does_not_retry() {
        let now = Instant::now();
        let mut t = TransportManager::default();
        t.connect(URL);
        t.on_open(URL);
        t.disconnect();

        assert!(t.on_close(None, now).is_empty());
        assert!(t.retry_deadline().is_none());
    }

    #[test]
    fn test_target_change_reconnects() {
        let mut t = TransportManager::default();
        t.connect(URL);
        t.on_open(URL);

        let commands = t.set_target(Some("ws://10.0.0.2:10003"));
        assert_eq!(commands[0], TransportCommand::Close);
        assert_eq!(
            commands.last(),
            Some(&TransportCommand::Open("ws://10.0.0.2:10003".to_string()))
        );
        assert_eq!(t.state().url, "ws://10.0.0.2:10003");
        assert!(!t.state().manual_close);
    }

    #[test]
    fn test_open_for_superseded_link_is_closed() {
        let mut t = TransportManager::default();
        t.connect(URL);
        t.connect("ws://other:1");
        assert_eq!(t.on_open(URL), vec![TransportCommand::Close]);
    }
}
