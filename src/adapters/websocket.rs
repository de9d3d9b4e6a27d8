//! Live transport links.
//!
//! A [`Connector`] opens a [`Link`]: a stream of inbound text frames. The
//! session owns at most one link at a time and drops it to close.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::core::transport::TransportError;

/// Default time allowed for the opening handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound frames of an open link; the stream ends when the peer closes
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// An open connection
pub struct Link {
    url: String,
    inbound: FrameStream,
}

impl Link {
    pub fn new(url: impl Into<String>, inbound: FrameStream) -> Self {
        Self {
            url: url.into(),
            inbound,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next inbound frame; `None` once the link closed
    pub async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.next().await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("url", &self.url).finish()
    }
}

/// Opens links to a url
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }

        let (stream, response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Connect(format!("handshake timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        // Ping/pong is answered by tungstenite while the stream is polled
        let inbound = stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Link(e.to_string()))),
                }
            })
            .boxed();

        Ok(Link::new(url, inbound))
    }
}
