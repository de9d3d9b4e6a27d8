//! Ambient presence state shown next to the conversation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::message::{is_truthy, value_as_f64};

/// Connectivity, audio and music indicators fed by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AmbientState {
    /// Live transport is open
    pub ws_connected: bool,

    /// Last url the transport reported on
    pub ws_url: String,

    /// When the last frame (or connectivity change) arrived
    pub last_message_at: Option<DateTime<Utc>>,

    pub device_list: Vec<Value>,

    pub voice_list: Vec<Value>,

    pub live_state: Option<bool>,

    pub device_connected: Option<bool>,

    /// Last raw audio status as sent by the backend
    pub audio_status: Option<Value>,

    /// Stabilized playing indicator
    pub audio_playing: bool,

    pub audio_level: f64,

    pub music_playing: bool,

    pub music_info: Option<Value>,
}

impl AmbientState {
    pub fn set_connected(&mut self, connected: bool, url: &str) {
        self.ws_connected = connected;
        if !url.is_empty() {
            self.ws_url = url.to_string();
        }
        self.last_message_at = Some(Utc::now());
    }

    pub fn touch(&mut self) {
        self.last_message_at = Some(Utc::now());
    }

    pub fn set_music(&mut self, playing: bool, info: Option<Value>) {
        self.music_playing = playing;
        self.music_info = info.filter(is_truthy);
    }
}

/// Derive the playing hint from an audio status payload.
///
/// A bare string means playing only for `"busy"`; an object is playing when
/// `playing`/`is_busy` is truthy or either queue size is positive.
pub fn audio_status_playing(status: &Value) -> bool {
    match status {
        Value::String(s) => s == "busy",
        Value::Object(obj) => {
            let flag = |key: &str| obj.get(key).map(is_truthy).unwrap_or(false);
            let queued = |key: &str| obj.get(key).map(value_as_f64).map(|n| n > 0.0).unwrap_or(false);
            flag("playing") || flag("is_busy") || queued("queue_size") || queued("scene_queue_size")
        }
        _ => false,
    }
}

/// Coerce a connectivity flag: numbers compare against zero, strings are parsed
pub fn coerce_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        other => {
            let n = value_as_f64(other);
            if n.is_nan() {
                None
            } else {
                Some(n != 0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audio_status_string() {
        assert!(audio_status_playing(&json!("busy")));
        assert!(!audio_status_playing(&json!("idle")));
    }

    #[test]
    fn test_audio_status_object() {
        assert!(audio_status_playing(&json!({"playing": true})));
        assert!(audio_status_playing(&json!({"is_busy": 1})));
        assert!(audio_status_playing(&json!({"queue_size": 2})));
        assert!(audio_status_playing(&json!({"scene_queue_size": "1"})));
        assert!(!audio_status_playing(&json!({"playing": false, "queue_size": 0})));
    }

    #[test]
    fn test_coerce_flag() {
        assert_eq!(coerce_flag(&json!(1)), Some(true));
        assert_eq!(coerce_flag(&json!(0)), Some(false));
        assert_eq!(coerce_flag(&json!("1")), Some(true));
        assert_eq!(coerce_flag(&json!(true)), Some(true));
        assert_eq!(coerce_flag(&json!(null)), None);
        assert_eq!(coerce_flag(&json!("nope")), None);
    }

    #[test]
    fn test_music_info_drops_empty() {
        let mut ambient = AmbientState::default();
        ambient.set_music(true, Some(json!({"title": "x"})));
        assert!(ambient.music_playing);
        assert!(ambient.music_info.is_some());

        ambient.set_music(false, Some(Value::Null));
        assert!(ambient.music_info.is_none());
    }
}
