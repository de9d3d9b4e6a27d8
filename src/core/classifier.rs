//! Inbound envelope classification.
//!
//! An envelope is one JSON object pushed by the backend. Classification
//! narrows it into [`Fact`]s and reports top-level keys nobody recognizes.
//! It never fails on content: only frames that are not JSON objects are
//! rejected, by [`decode_envelope`].

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::ambient::{audio_status_playing, coerce_flag};
use crate::domain::message::{is_truthy, value_as_f64, value_as_text};
use crate::domain::{AgentId, AgentStatus, Fact, ReplyFragment, SignalOrigin};

/// Top-level keys the classifier understands
pub const KNOWN_KEYS: &[&str] = &[
    "deviceList",
    "voiceList",
    "liveState",
    "is_connect",
    "isConnect",
    "agent_status",
    "agentStatus",
    "panelMsg",
    "panelReply",
    "systemSwitch",
    "audio_status",
    "audioStatus",
    "audio_level",
    "audioLevel",
    "audio_event",
    "audioEvent",
    "audio_command",
    "audioCommand",
    "music_event",
    "musicEvent",
    "music_info",
    "musicInfo",
    "music_file",
    "musicFile",
    "music_title",
    "musicTitle",
    "control_intent",
    "controlIntent",
    "type",
];

/// A frame that cannot be classified at all
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Envelope is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotObject,
}

/// Result of classifying one envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Recognized facts in processing order
    pub facts: Vec<Fact>,

    /// Top-level keys outside [`KNOWN_KEYS`], sorted
    pub unknown_keys: Vec<String>,
}

/// Parse a text frame into an envelope object
pub fn decode_envelope(text: &str) -> Result<Map<String, Value>, EnvelopeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(obj) => Ok(obj),
        _ => Err(EnvelopeError::NotObject),
    }
}

/// Keys of `obj` not present in `known`, as a sorted set
pub fn collect_unknown_keys(obj: &Map<String, Value>, known: &[&str]) -> Vec<String> {
    obj.keys()
        .filter(|key| !known.contains(&key.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Classify a decoded envelope
pub fn classify(obj: &Map<String, Value>) -> Classification {
    let mut facts = Vec::new();

    if let Some(list) = obj.get("deviceList") {
        facts.push(Fact::DeviceList(as_list(list)));
    }
    if let Some(list) = obj.get("voiceList") {
        facts.push(Fact::VoiceList(as_list(list)));
    }
    if let Some(state) = obj.get("liveState") {
        facts.push(Fact::LiveState(coerce_flag(state)));
    }
    for key in ["is_connect", "isConnect"] {
        if let Some(flag) = obj.get(key) {
            facts.push(Fact::DeviceConnected(coerce_flag(flag)));
        }
    }
    for key in ["audio_status", "audioStatus"] {
        if let Some(raw) = obj.get(key) {
            facts.push(audio_status_fact(raw));
        }
    }
    for key in ["audio_level", "audioLevel"] {
        let level = obj.get(key).map(value_as_f64).filter(|n| n.is_finite());
        if let Some(level) = level {
            facts.push(Fact::AudioLevel(level.clamp(0.0, 1.0)));
        }
    }

    if let Some(status) = agent_status(obj) {
        facts.push(Fact::AgentStatus(status));
    }

    if let Some(switch) = obj.get("systemSwitch").filter(|v| v.is_object()) {
        let agent = switch
            .get("mode")
            .and_then(Value::as_str)
            .and_then(AgentId::parse);
        if let Some(agent) = agent {
            facts.push(Fact::SystemSwitch {
                agent,
                payload: switch.clone(),
            });
        }
    }

    let audio_event = first_text(obj, &["audio_event", "audioEvent"]);
    match audio_event.as_deref() {
        Some("start") => facts.push(signal(true, SignalOrigin::AudioEvent)),
        Some("complete") | Some("finished") => facts.push(signal(false, SignalOrigin::AudioEvent)),
        _ => {}
    }
    match obj.get("type").and_then(Value::as_str) {
        Some("play_start") => facts.push(signal(true, SignalOrigin::PlaybackType)),
        Some("play_finished") => facts.push(signal(false, SignalOrigin::PlaybackType)),
        _ => {}
    }
    match first_text(obj, &["audio_command", "audioCommand"]).as_deref() {
        Some("start") => facts.push(signal(true, SignalOrigin::AudioCommand)),
        Some("stop") => facts.push(signal(false, SignalOrigin::AudioCommand)),
        _ => {}
    }

    if let Some(event) = first_text(obj, &["music_event", "musicEvent"]) {
        let playing = matches!(event.as_str(), "start" | "playing" | "resume");
        facts.push(Fact::Music {
            event,
            playing,
            info: music_info(obj),
        });
    }

    let intent = ["control_intent", "controlIntent"]
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| is_truthy(v))
        .and_then(Value::as_object);
    if let Some(intent) = intent {
        let action = ["action", "intent"]
            .iter()
            .filter_map(|key| intent.get(*key))
            .find(|v| is_truthy(v))
            .map(|v| value_as_text(v).trim().to_string())
            .unwrap_or_default();
        facts.push(Fact::ControlIntent {
            action,
            fields: intent.clone(),
        });
    }

    if let Some(panel) = obj.get("panelMsg").filter(|v| is_truthy(v)) {
        facts.push(Fact::PanelMessage(value_as_text(panel)));
    }

    if let Some(reply) = obj.get("panelReply").filter(|v| is_truthy(v)) {
        if let Some(fragment) = ReplyFragment::from_value(reply) {
            if let Some(raw) = &fragment.audio_status {
                facts.push(audio_status_fact(raw));
            }
            facts.push(Fact::Reply(fragment));
        }
    }

    Classification {
        facts,
        unknown_keys: collect_unknown_keys(obj, KNOWN_KEYS),
    }
}

fn as_list(value: &Value) -> Vec<Value> {
    value.as_array().cloned().unwrap_or_default()
}

fn signal(playing: bool, origin: SignalOrigin) -> Fact {
    Fact::AudioSignal { playing, origin }
}

fn audio_status_fact(raw: &Value) -> Fact {
    Fact::AudioStatus {
        raw: raw.clone(),
        playing: audio_status_playing(raw),
    }
}

/// First truthy value among synonymous keys, rendered as text
fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| is_truthy(v))
        .map(value_as_text)
}

/// Agent status, with bare `listening` suppressed unless a status line accompanies it
fn agent_status(obj: &Map<String, Value>) -> Option<AgentStatus> {
    let raw = obj
        .get("agent_status")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("agentStatus"))
        .filter(|v| is_truthy(v))?;
    let status = AgentStatus::parse(&value_as_text(raw))?;

    let has_panel_text = obj
        .get("panelMsg")
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if status == AgentStatus::Listening && !has_panel_text {
        return None;
    }
    Some(status)
}

fn music_info(obj: &Map<String, Value>) -> Value {
    let explicit = ["music_info", "musicInfo"]
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| is_truthy(v));
    if let Some(info) = explicit {
        return info.clone();
    }
    json!({
        "file": first_text(obj, &["music_file", "musicFile"]).unwrap_or_default(),
        "title": first_text(obj, &["music_title", "musicTitle"]).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_json(raw: Value) -> Classification {
        match raw {
            Value::Object(obj) => classify(&obj),
            _ => panic!("test envelope must be an object"),
        }
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(decode_envelope("not json"), Err(EnvelopeError::NotJson(_))));
        assert!(matches!(decode_envelope("[1,2]"), Err(EnvelopeError::NotObject)));
        assert!(decode_envelope(r#"{"panelMsg":"x"}"#).is_ok());
    }

    #[test]
    fn test_unknown_keys_exact() {
        let obj = decode_envelope(r#"{"panelMsg":"x","deviceList":[],"foo":1,"bar":2}"#).unwrap();
        assert_eq!(collect_unknown_keys(&obj, &["panelMsg", "deviceList"]), vec!["bar", "foo"]);
        assert_eq!(classify(&obj).unknown_keys, vec!["bar", "foo"]);
    }

    #[test]
    fn test_lists_coerced() {
        let c = classify_json(json!({"deviceList": "nope", "voiceList": [{"id": 1}]}));
        assert_eq!(c.facts[0], Fact::DeviceList(vec![]));
        assert_eq!(c.facts[1], Fact::VoiceList(vec![json!({"id": 1})]));
    }

    #[test]
    fn test_audio_level_clamped_and_filtered() {
        let c = classify_json(json!({"audio_level": 3.5}));
        assert_eq!(c.facts, vec![Fact::AudioLevel(1.0)]);

        let c = classify_json(json!({"audioLevel": "abc"}));
        assert!(c.facts.is_empty());
    }

    #[test]
    fn test_bare_listening_suppressed() {
        let c = classify_json(json!({"agent_status": "listening"}));
        assert!(c.facts.is_empty());

        let c = classify_json(json!({"agent_status": "listening", "panelMsg": "聆听中"}));
        assert!(c.facts.contains(&Fact::AgentStatus(AgentStatus::Listening)));

        let c = classify_json(json!({"agentStatus": "wake_pending"}));
        assert_eq!(c.facts, vec![Fact::AgentStatus(AgentStatus::WakePending)]);

        let c = classify_json(json!({"agent_status": "dreaming"}));
        assert!(c.facts.is_empty());
    }

    #[test]
    fn test_system_switch_requires_known_agent() {
        let c = classify_json(json!({"systemSwitch": {"mode": "LiuYe"}}));
        assert!(matches!(c.facts[0], Fact::SystemSwitch { agent: AgentId::Liuye, .. }));

        let c = classify_json(json!({"systemSwitch": {"mode": "other"}}));
        assert!(c.facts.is_empty());
    }

    #[test]
    fn test_audio_signals() {
        let c = classify_json(json!({"audio_event": "finished", "audioCommand": "start"}));
        assert_eq!(
            c.facts,
            vec![
                signal(false, SignalOrigin::AudioEvent),
                signal(true, SignalOrigin::AudioCommand),
            ]
        );

        let c = classify_json(json!({"type": "play_start"}));
        assert_eq!(c.facts, vec![signal(true, SignalOrigin::PlaybackType)]);
        assert!(c.unknown_keys.is_empty());
    }

    #[test]
    fn test_music_info_fallback() {
        let c = classify_json(json!({"music_event": "resume", "musicTitle": "Rain"}));
        match &c.facts[0] {
            Fact::Music { event, playing, info } => {
                assert_eq!(event, "resume");
                assert!(*playing);
                assert_eq!(info["title"], "Rain");
                assert_eq!(info["file"], "");
            }
            other => panic!("unexpected fact {:?}", other),
        }
    }

    #[test]
    fn test_control_intent_action_fallback() {
        let c = classify_json(json!({"controlIntent": {"intent": " volume_up ", "step": 2}}));
        match &c.facts[0] {
            Fact::ControlIntent { action, fields } => {
                assert_eq!(action, "volume_up");
                assert_eq!(fields["step"], 2);
            }
            other => panic!("unexpected fact {:?}", other),
        }
    }

    #[test]
    fn test_reply_carries_audio_status() {
        let c = classify_json(json!({
            "panelReply": {"type": "sisi", "content": "hi", "audio_status": "busy"}
        }));
        assert_eq!(c.facts.len(), 2);
        assert!(matches!(c.facts[0], Fact::AudioStatus { playing: true, .. }));
        assert!(matches!(c.facts[1], Fact::Reply(_)));
    }

    #[test]
    fn test_unknown_keys_do_not_block_facts() {
        let c = classify_json(json!({"panelMsg": "ready", "extra": true}));
        assert_eq!(c.facts, vec![Fact::PanelMessage("ready".to_string())]);
        assert_eq!(c.unknown_keys, vec!["extra"]);
    }
}
