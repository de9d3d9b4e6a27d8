//! History CLI commands.
//!
//! - `sisilink history sync` - Fetch backend history into the local transcript

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;

use crate::adapters::{HistoryError, HistorySource, HttpHistoryClient};
use crate::config;
use crate::core::diagnostics::{emit, DiagnosticsSink};
use crate::core::{KeyValueStorage, TranscriptStore};
use crate::domain::{AgentId, DiagnosticEvent, EventKind, EventLevel};

/// History subcommands
#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    /// Fetch backend history, merge it and persist the transcript
    Sync {
        /// Override the backend HTTP base url
        #[arg(long)]
        http_base: Option<String>,

        /// Number of messages to request
        #[arg(short, long, default_value = "320")]
        limit: usize,
    },
}

/// Execute `history sync`
pub async fn execute_sync(http_base: Option<String>, limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let storage: Arc<dyn KeyValueStorage> = Arc::new(super::open_storage()?);
    let diagnostics = super::diagnostics_sink()?;

    let base = http_base.unwrap_or_else(|| cfg.backend.http_base.clone());
    let client = HttpHistoryClient::new(&base)
        .with_storage(storage.clone())
        .with_limit(limit);

    let mut store = TranscriptStore::load(storage, cfg.transcript.history_limit);
    let before: Vec<usize> = AgentId::ALL.iter().map(|a| store.messages(*a).len()).collect();

    let changed = hydrate_from(&client, &mut store, diagnostics.as_ref())
        .await
        .with_context(|| format!("History sync failed: {}", client.endpoint()))?;

    if !changed {
        println!("Transcript already up to date");
        return Ok(());
    }

    for (agent, count) in AgentId::ALL.iter().zip(before) {
        let now = store.messages(*agent).len();
        println!("{} ({}): {} -> {} messages", agent, agent.display_name(), count, now);
    }
    Ok(())
}

/// Fetch from `source` and merge into `store`.
///
/// The outcome is recorded as a diagnostic; a fetch failure is a warning.
pub async fn hydrate_from(
    source: &dyn HistorySource,
    store: &mut TranscriptStore,
    diagnostics: &dyn DiagnosticsSink,
) -> Result<bool> {
    match source.fetch().await {
        Ok(payload) => {
            let changed = store.hydrate_payload(&payload);
            let message = if changed {
                "Restored history from backend"
            } else {
                "No new history"
            };
            emit(
                diagnostics,
                DiagnosticEvent::new(AgentId::default(), EventKind::Status, EventLevel::Success, "History sync", message),
            );
            Ok(changed)
        }
        Err(e) => {
            record_failure(diagnostics, &e);
            Err(e.into())
        }
    }
}

/// Record a failed fetch as a warning diagnostic
pub fn record_failure(diagnostics: &dyn DiagnosticsSink, error: &HistoryError) {
    emit(
        diagnostics,
        DiagnosticEvent::new(
            AgentId::default(),
            EventKind::Status,
            EventLevel::Warning,
            "History sync failed",
            error.to_string(),
        )
        .with_payload(json!({"error": error.to_string()})),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventLog;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Fixed(Option<Value>);

    #[async_trait]
    impl HistorySource for Fixed {
        async fn fetch(&self) -> Result<Value, HistoryError> {
            self.0
                .clone()
                .ok_or_else(|| HistoryError::InvalidPayload("expected a JSON object".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hydrate_from_merges_and_records() {
        let log = EventLog::default();
        let mut store = TranscriptStore::new(200);
        let payload = json!({"list": [
            {"type": "member", "content": "你好", "createtime": 1700000000},
            {"type": "fay", "content": "你好呀", "createtime": 1700000001}
        ]});

        let changed = hydrate_from(&Fixed(Some(payload.clone())), &mut store, &log).await.unwrap();
        assert!(changed);
        assert_eq!(store.messages(AgentId::Sisi).len(), 2);

        let again = hydrate_from(&Fixed(Some(payload)), &mut store, &log).await.unwrap();
        assert!(!again);
        assert_eq!(log.events()[0].level, EventLevel::Success);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_a_warning() {
        let log = EventLog::default();
        let mut store = TranscriptStore::new(200);

        assert!(hydrate_from(&Fixed(None), &mut store, &log).await.is_err());
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Warning);
        assert_eq!(events[0].title, "History sync failed");
    }
}
