//! History bootstrap over HTTP.
//!
//! Endpoint: POST {http_base}/api/get-msg
//! Body: `{"limit": 320, "canonical_user_id": "..."}`

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::storage::{KeyValueStorage, StorageError, HISTORY_USER_KEY};

/// Number of messages requested from the backend
pub const HISTORY_FETCH_LIMIT: usize = 320;

/// Errors fetching history
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("get-msg failed: {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid history payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Source of server-side history
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch a history payload in any shape the transcript can hydrate from
    async fn fetch(&self) -> Result<Value, HistoryError>;
}

#[derive(Debug, Serialize)]
struct GetMsgRequest<'a> {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical_user_id: Option<&'a str>,
}

/// Client for the backend's `get-msg` endpoint
pub struct HttpHistoryClient {
    endpoint: String,
    limit: usize,
    storage: Option<Arc<dyn KeyValueStorage>>,
    client: reqwest::Client,
}

impl HttpHistoryClient {
    pub fn new(http_base: &str) -> Self {
        Self {
            endpoint: join_url(http_base, "/api/get-msg"),
            limit: HISTORY_FETCH_LIMIT,
            storage: None,
            client: reqwest::Client::new(),
        }
    }

    /// Remember the backend's canonical user id in `storage`
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn remembered_user(&self) -> Option<String> {
        let storage = self.storage.as_ref()?;
        match storage.get(HISTORY_USER_KEY) {
            Ok(value) => value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
            Err(e) => {
                warn!("Failed to read history user id: {}", e);
                None
            }
        }
    }

    fn remember_user(&self, payload: &Value) -> Result<(), HistoryError> {
        let user_id = payload
            .get("user_id")
            .map(crate::domain::message::value_as_text)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let (Some(storage), Some(user_id)) = (&self.storage, user_id) {
            storage.set(HISTORY_USER_KEY, &user_id)?;
        }
        Ok(())
    }
}

#[async_trait]
impl HistorySource for HttpHistoryClient {
    async fn fetch(&self) -> Result<Value, HistoryError> {
        let user = self.remembered_user();
        let request = GetMsgRequest {
            limit: self.limit,
            canonical_user_id: user.as_deref(),
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        if !payload.is_object() {
            return Err(HistoryError::InvalidPayload("expected a JSON object".to_string()));
        }
        if let Err(e) = self.remember_user(&payload) {
            warn!("Failed to remember history user id: {}", e);
        }
        debug!(endpoint = %self.endpoint, "Fetched history");
        Ok(payload)
    }
}

/// Join a base url and a path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), path.trim_start_matches('/'))
}
