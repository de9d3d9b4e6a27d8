//! Envelope Classification Integration Tests
//!
//! Realistic backend frames through the public decode/classify API.

use serde_json::json;

use sisilink::core::{classify, decode_envelope, EnvelopeError};
use sisilink::domain::{AgentId, AgentStatus, Fact, SignalOrigin};

#[test]
fn test_mixed_envelope_yields_facts_in_order() {
    let envelope = decode_envelope(
        r#"{
            "liveState": 1,
            "audioStatus": {"playing": true},
            "audio_level": 1.7,
            "agent_status": "thinking",
            "systemSwitch": {"mode": "liuye"},
            "panelReply": {"type": "liuye", "content": "ok", "audio_status": "busy"},
            "trace_id": "abc"
        }"#,
    )
    .unwrap();

    let classification = classify(&envelope);
    assert_eq!(classification.unknown_keys, vec!["trace_id".to_string()]);

    let facts = &classification.facts;
    assert_eq!(facts[0], Fact::LiveState(Some(true)));
    assert!(matches!(facts[1], Fact::AudioStatus { playing: true, .. }));
    assert_eq!(facts[2], Fact::AudioLevel(1.0));
    assert_eq!(facts[3], Fact::AgentStatus(AgentStatus::Thinking));
    assert!(matches!(facts[4], Fact::SystemSwitch { agent: AgentId::Liuye, .. }));

    // The reply's own audio status precedes the reply
    assert!(matches!(facts[5], Fact::AudioStatus { playing: true, .. }));
    match &facts[6] {
        Fact::Reply(fragment) => {
            assert_eq!(fragment.target_agent(), Some(AgentId::Liuye));
            assert_eq!(fragment.content, "ok");
        }
        other => panic!("expected reply, got {:?}", other),
    }
    assert_eq!(facts.len(), 7);
}

#[test]
fn test_playback_signals() {
    let facts = classify(&decode_envelope(r#"{"type":"play_start"}"#).unwrap()).facts;
    assert_eq!(
        facts,
        vec![Fact::AudioSignal {
            playing: true,
            origin: SignalOrigin::PlaybackType
        }]
    );

    let facts = classify(&decode_envelope(r#"{"audio_command":"stop"}"#).unwrap()).facts;
    assert_eq!(
        facts,
        vec![Fact::AudioSignal {
            playing: false,
            origin: SignalOrigin::AudioCommand
        }]
    );
}

#[test]
fn test_bare_listening_needs_panel_text() {
    let facts = classify(&decode_envelope(r#"{"agent_status":"listening"}"#).unwrap()).facts;
    assert!(facts.is_empty());

    let facts = classify(
        &decode_envelope(r#"{"agent_status":"listening","panelMsg":"聆听中..."}"#).unwrap(),
    )
    .facts;
    assert_eq!(facts[0], Fact::AgentStatus(AgentStatus::Listening));
    assert_eq!(facts[1], Fact::PanelMessage("聆听中...".to_string()));
}

#[test]
fn test_music_info_fallback() {
    let facts = classify(
        &decode_envelope(r#"{"music_event":"resume","music_file":"a.mp3","music_title":"A"}"#).unwrap(),
    )
    .facts;
    match &facts[0] {
        Fact::Music { playing, info, .. } => {
            assert!(*playing);
            assert_eq!(info, &json!({"file": "a.mp3", "title": "A"}));
        }
        other => panic!("expected music, got {:?}", other),
    }
}

#[test]
fn test_non_object_frames_are_rejected() {
    assert!(matches!(decode_envelope("[1,2]"), Err(EnvelopeError::NotObject)));
    assert!(matches!(decode_envelope("ping"), Err(EnvelopeError::NotJson(_))));
}
