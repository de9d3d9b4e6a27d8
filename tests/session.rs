//! Session Integration Tests
//!
//! Drives a spawned session through an in-memory connector: frames in,
//! transcript and ambient changes out, reconnects on a paused clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use sisilink::adapters::{Connector, Link};
use sisilink::config::{BackendConfig, BackendMode};
use sisilink::core::storage::HISTORY_KEY;
use sisilink::core::{
    EventLog, KeyValueStorage, MemoryStorage, Reconciler, Session, SessionConfig, SessionHandle,
    SessionUpdate, TransportError, TranscriptStore,
};
use sisilink::domain::{AgentId, EventLevel, Role};

/// Hands out pre-arranged links; refuses once they run out
#[derive(Default)]
struct ChannelConnector {
    links: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
    opens: AtomicUsize,
}

impl ChannelConnector {
    fn with_link() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let connector = Arc::new(Self::default());
        let tx = connector.add_link();
        (connector, tx)
    }

    fn add_link(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push_back(rx);
        tx
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .links
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Connect("refused".to_string()))?;

        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|text| (Ok(text), rx))
        })
        .boxed();
        Ok(Link::new(url, frames))
    }
}

fn live_config() -> SessionConfig {
    SessionConfig {
        backend: BackendConfig {
            mode: BackendMode::Real,
            ws_url: "ws://test".to_string(),
            ..BackendConfig::default()
        },
        ..SessionConfig::default()
    }
}

fn start(
    connector: Arc<ChannelConnector>,
    log: Arc<EventLog>,
) -> (SessionHandle, broadcast::Receiver<SessionUpdate>) {
    let config = live_config();
    let reconciler = Reconciler::new(TranscriptStore::new(200), config.echo_window);
    let session = Session::new(config, reconciler, connector, log);
    let updates = session.subscribe_updates();
    let (handle, _task) = session.spawn();
    (handle, updates)
}

async fn next_connectivity(updates: &mut broadcast::Receiver<SessionUpdate>) -> bool {
    loop {
        if let SessionUpdate::Connectivity { connected, .. } = updates.recv().await.unwrap() {
            return connected;
        }
    }
}

async fn next_audio(updates: &mut broadcast::Receiver<SessionUpdate>) -> bool {
    loop {
        if let SessionUpdate::AudioPlaying(playing) = updates.recv().await.unwrap() {
            return playing;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_streamed_reply_lands_in_one_message() {
    let (connector, tx) = ChannelConnector::with_link();
    let (handle, mut updates) = start(connector, Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    tx.send(r#"{"panelReply":{"type":"sisi","id":7,"content":"你好","is_intermediate":true}}"#.to_string())
        .unwrap();
    tx.send(r#"{"panelReply":{"type":"sisi","id":7,"content":"你好，今天天气不错"}}"#.to_string())
        .unwrap();

    let snapshot = loop {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.stream_pointers.sisi.is_none() && !snapshot.transcripts.sisi.is_empty() {
            break snapshot;
        }
        tokio::task::yield_now().await;
    };

    let messages = &snapshot.transcripts.sisi;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].content, "你好，今天天气不错");
    assert!(!messages[0].meta.stream_open());
    assert!(snapshot.transcripts.liuye.is_empty());
    assert!(snapshot.ambient.ws_connected);
    assert!(snapshot.ambient.last_message_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_local_submit_echo_and_reply() {
    let (connector, tx) = ChannelConnector::with_link();
    let (handle, mut updates) = start(connector, Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    let submission = handle
        .submit_local(AgentId::Sisi, "hi there", Vec::new())
        .await
        .unwrap()
        .unwrap();

    tx.send(r#"{"panelReply":{"type":"member","content":"hi  there"}}"#.to_string())
        .unwrap();
    tx.send(r#"{"panelReply":{"type":"sisi","content":"hello"}}"#.to_string())
        .unwrap();

    let snapshot = loop {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.transcripts.sisi.last().map(|m| m.content.as_str()) == Some("hello") {
            break snapshot;
        }
        tokio::task::yield_now().await;
    };

    let messages = &snapshot.transcripts.sisi;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, submission.user_id);
    assert_eq!(messages[0].content, "hi there");
    assert_eq!(messages[1].id, submission.placeholder_id);
    assert!(!messages[1].meta.pending_reply());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_delay_until_disconnected() {
    let (connector, tx) = ChannelConnector::with_link();
    let log = Arc::new(EventLog::default());
    let (handle, mut updates) = start(connector.clone(), log.clone());
    assert!(next_connectivity(&mut updates).await);
    assert_eq!(connector.opens(), 1);

    // Peer goes away
    drop(tx);
    assert!(!next_connectivity(&mut updates).await);
    let closed_at = Instant::now();

    // The retry is refused and reported as another drop
    assert!(!next_connectivity(&mut updates).await);
    assert!(closed_at.elapsed() >= Duration::from_millis(1200));
    assert_eq!(connector.opens(), 2);
    assert!(log
        .events()
        .iter()
        .any(|e| e.title == "WS connect failed" && e.level == EventLevel::Error));

    handle.disconnect().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.ambient.ws_connected);

    let opens = connector.opens();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.opens(), opens);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_after_disconnect() {
    let (connector, _tx) = ChannelConnector::with_link();
    let (handle, mut updates) = start(connector.clone(), Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    handle.disconnect().await.unwrap();
    assert!(!next_connectivity(&mut updates).await);

    let _second = connector.add_link();
    handle.connect("ws://other").await.unwrap();
    assert!(next_connectivity(&mut updates).await);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.ambient.ws_url, "ws://other");
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_audio_stop_is_debounced() {
    let (connector, tx) = ChannelConnector::with_link();
    let (_handle, mut updates) = start(connector, Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    tx.send(r#"{"audio_event":"start"}"#.to_string()).unwrap();
    assert!(next_audio(&mut updates).await);
    let started_at = Instant::now();

    tx.send(r#"{"audio_event":"complete"}"#.to_string()).unwrap();
    assert!(!next_audio(&mut updates).await);
    assert!(started_at.elapsed() >= Duration::from_millis(1100));
}

#[tokio::test(start_paused = true)]
async fn test_close_resets_ambient_and_closes_streams() {
    let (connector, tx) = ChannelConnector::with_link();
    let (handle, mut updates) = start(connector, Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    tx.send(r#"{"music_event":"start","music_title":"Song"}"#.to_string())
        .unwrap();
    tx.send(r#"{"panelReply":{"type":"liuye","content":"partial","phase":"streaming"}}"#.to_string())
        .unwrap();
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.stream_pointers.liuye.is_some() {
            assert!(snapshot.ambient.music_playing);
            break;
        }
        tokio::task::yield_now().await;
    }

    drop(tx);
    assert!(!next_connectivity(&mut updates).await);

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.ambient.music_playing);
    assert!(snapshot.ambient.music_info.is_none());
    assert!(snapshot.stream_pointers.liuye.is_none());
    assert!(!snapshot.transcripts.liuye[0].meta.stream_open());
}

#[tokio::test(start_paused = true)]
async fn test_mock_mode_cancels_pending_reconnect() {
    let (connector, tx) = ChannelConnector::with_link();
    let (handle, mut updates) = start(connector.clone(), Arc::new(EventLog::default()));
    assert!(next_connectivity(&mut updates).await);

    drop(tx);
    assert!(!next_connectivity(&mut updates).await);

    handle
        .apply_backend(BackendConfig {
            mode: BackendMode::Mock,
            ..BackendConfig::default()
        })
        .await
        .unwrap();
    handle.snapshot().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_transcript_writes() {
    let (connector, _tx) = ChannelConnector::with_link();
    let storage = Arc::new(MemoryStorage::new());
    let config = live_config();
    let reconciler = Reconciler::new(TranscriptStore::load(storage.clone(), 200), config.echo_window);
    let session = Session::new(config, reconciler, connector, Arc::new(EventLog::default()));
    let (handle, task) = session.spawn();

    for i in 0..10 {
        handle
            .submit_local(AgentId::Liuye, &format!("q{}", i), Vec::new())
            .await
            .unwrap()
            .unwrap();
    }
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let raw = storage.get(HISTORY_KEY).unwrap().unwrap();
    let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let liuye = stored["liuye"].as_array().unwrap();
    assert_eq!(liuye.len(), 20);
    assert_eq!(liuye[18]["content"], "q9");
}
