//! Side-channel protocol: the page reports back by calling `console.debug`
//! with a single string `<prefix><json>`, where the JSON is
//! `{"type": <tag>, "payload": <any>}`.
//!
//! Console traffic that is not at the reserved level, carries more than one
//! argument, or lacks the prefix belongs to the page and is ignored.

use std::fmt;

use cdp_adapter::LogEntry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::PatchError;
use crate::normalize::{normalize_args, ArgValue};

/// Console level reserved for side-channel messages.
pub const RESERVED_LEVEL: &str = "debug";

/// Unique marker that distinguishes side-channel lines from page logging.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchPrefix(String);

impl PatchPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    pub fn generate() -> Self {
        Self(format!("__feedtap_{}__:", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Init,
    Hooked,
    Open,
    Message,
    Error,
    Close,
}

impl MessageKind {
    /// Socket tags arrive either bare or with a `websocket_` prefix.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let bare = tag.strip_prefix("websocket_").unwrap_or(tag);
        match bare {
            "init" if bare.len() == tag.len() => Some(Self::Init),
            "hooked" if bare.len() == tag.len() => Some(Self::Hooked),
            "open" => Some(Self::Open),
            "message" => Some(Self::Message),
            "error" => Some(Self::Error),
            "close" => Some(Self::Close),
            _ => None,
        }
    }

    /// Tag emitted by the page script.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Hooked => "hooked",
            Self::Open => "websocket_open",
            Self::Message => "websocket_message",
            Self::Error => "websocket_error",
            Self::Close => "websocket_close",
        }
    }
}

/// One decoded side-channel message, payload still untyped.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchMessage {
    pub kind: MessageKind,
    pub payload: Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: Value,
}

/// Decodes a console entry, returning `None` for anything that is not a
/// well-formed side-channel message.
pub fn decode(prefix: &PatchPrefix, entry: &LogEntry) -> Option<PatchMessage> {
    if entry.level != RESERVED_LEVEL {
        return None;
    }
    let [line] = entry.args.as_slice() else {
        return None;
    };
    let body = line.strip_prefix(prefix.as_str())?;
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(target: "feed-patch", %err, "dropping malformed side-channel line");
            return None;
        }
    };
    let Some(kind) = MessageKind::from_tag(&envelope.tag) else {
        debug!(target: "feed-patch", tag = %envelope.tag, "dropping unknown side-channel type");
        return None;
    };
    Some(PatchMessage {
        kind,
        payload: envelope.payload,
    })
}

/// Renders the console line the page script would emit for `kind`.
pub fn encode_line(prefix: &PatchPrefix, kind: MessageKind, payload: &Value) -> String {
    format!(
        "{prefix}{}",
        json!({ "type": kind.tag(), "payload": payload })
    )
}

/// Settings snapshot reported by `init` and `hooked`. The three settings
/// documents arrive JSON-encoded with nested objects already stripped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsSnapshot {
    pub settings: Option<String>,
    pub chat_settings: Option<String>,
    pub initializer_settings: Option<String>,
    pub csrftoken: Option<String>,
    pub has_player: bool,
    pub has_websocket: bool,
    pub room: Option<String>,
}

impl SettingsSnapshot {
    pub fn from_payload(payload: Value) -> Result<Self, PatchError> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(payload)?)
    }

    pub fn handler_settings(&self) -> Result<Value, PatchError> {
        decode_document(self.settings.as_deref())
    }

    pub fn chat_settings(&self) -> Result<Value, PatchError> {
        decode_document(self.chat_settings.as_deref())
    }

    pub fn initializer_settings(&self) -> Result<Value, PatchError> {
        decode_document(self.initializer_settings.as_deref())
    }
}

fn decode_document(raw: Option<&str>) -> Result<Value, PatchError> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Null),
    }
}

/// A single chat/event frame observed on the page's socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedEvent {
    /// Epoch milliseconds at which the page observed the frame.
    pub timestamp: Option<f64>,
    pub method: String,
    pub callback: Option<String>,
    pub args: Vec<ArgValue>,
}

#[derive(Deserialize)]
struct RawFeed {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    callback: Option<Value>,
    #[serde(default)]
    args: Vec<Value>,
}

impl FeedEvent {
    /// Builds a feed event from a socket-message payload. Payloads whose own
    /// `type` is not `message`, or that carry no method, yield `None`.
    pub fn from_payload(payload: Value) -> Result<Option<Self>, PatchError> {
        let raw: RawFeed = serde_json::from_value(payload)?;
        if raw.kind != "message" {
            return Ok(None);
        }
        let Some(method) = raw.method else {
            return Ok(None);
        };
        let args: Vec<String> = raw.args.into_iter().map(value_text).collect();
        Ok(Some(Self {
            timestamp: raw.timestamp,
            method,
            callback: raw.callback.filter(|cb| !cb.is_null()).map(value_text),
            args: normalize_args(&args),
        }))
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClosePayload {
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub was_clean: Option<bool>,
}

impl ClosePayload {
    pub fn from_payload(payload: Value) -> Result<Self, PatchError> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> PatchPrefix {
        PatchPrefix::new("__p__:")
    }

    fn debug_line(line: String) -> LogEntry {
        LogEntry::new("debug", vec![line])
    }

    #[test]
    fn decodes_prefixed_debug_lines() {
        let line = encode_line(&prefix(), MessageKind::Open, &Value::Null);
        let decoded = decode(&prefix(), &debug_line(line)).expect("decoded");
        assert_eq!(decoded.kind, MessageKind::Open);
        assert_eq!(decoded.payload, Value::Null);
    }

    #[test]
    fn ignores_page_console_traffic() {
        let line = encode_line(&prefix(), MessageKind::Init, &json!({}));
        // wrong level
        assert!(decode(&prefix(), &LogEntry::new("log", vec![line.clone()])).is_none());
        // extra argument
        assert!(decode(
            &prefix(),
            &LogEntry::new("debug", vec![line.clone(), "x".into()])
        )
        .is_none());
        // no prefix
        assert!(decode(&prefix(), &debug_line(r#"{"type":"init"}"#.into())).is_none());
        // other prefix
        assert!(decode(&PatchPrefix::new("__q__:"), &debug_line(line)).is_none());
    }

    #[test]
    fn drops_unknown_and_malformed_messages() {
        assert!(decode(&prefix(), &debug_line("__p__:{\"type\":\"bogus\"}".into())).is_none());
        assert!(decode(&prefix(), &debug_line("__p__:not json".into())).is_none());
    }

    #[test]
    fn accepts_bare_and_prefixed_socket_tags() {
        for (tag, kind) in [
            ("open", MessageKind::Open),
            ("websocket_open", MessageKind::Open),
            ("message", MessageKind::Message),
            ("websocket_message", MessageKind::Message),
            ("websocket_error", MessageKind::Error),
            ("close", MessageKind::Close),
            ("init", MessageKind::Init),
            ("hooked", MessageKind::Hooked),
        ] {
            assert_eq!(MessageKind::from_tag(tag), Some(kind), "{tag}");
        }
        assert_eq!(MessageKind::from_tag("websocket_init"), None);
    }

    #[test]
    fn feed_payload_is_normalized() {
        let event = FeedEvent::from_payload(json!({
            "type": "message",
            "timestamp": 1700000000000.0,
            "method": "onRoomMsg",
            "callback": 7,
            "args": ["alice", "12", "true", "{\"tip\":5}", {"raw": 1}]
        }))
        .expect("payload")
        .expect("event");
        assert_eq!(event.method, "onRoomMsg");
        assert_eq!(event.callback.as_deref(), Some("7"));
        assert_eq!(
            event.args,
            vec![
                ArgValue::Text("alice".into()),
                ArgValue::Number(12.0),
                ArgValue::Bool(true),
                ArgValue::Structured(json!({ "tip": 5 })),
                ArgValue::Structured(json!({ "raw": 1 })),
            ]
        );
    }

    #[test]
    fn non_message_payloads_decode_to_nothing() {
        assert_eq!(
            FeedEvent::from_payload(json!({ "type": "ping", "method": "x" })).expect("payload"),
            None
        );
    }

    #[test]
    fn snapshot_documents_decode_lazily() {
        let snapshot = SettingsSnapshot::from_payload(json!({
            "settings": "{\"room\":\"alice\"}",
            "chatSettings": null,
            "initializerSettings": "not json",
            "csrftoken": "abc",
            "hasPlayer": true,
            "hasWebsocket": true,
            "room": "alice"
        }))
        .expect("snapshot");
        assert_eq!(snapshot.room.as_deref(), Some("alice"));
        assert_eq!(snapshot.handler_settings().expect("doc"), json!({ "room": "alice" }));
        assert_eq!(snapshot.chat_settings().expect("doc"), Value::Null);
        assert!(snapshot.initializer_settings().is_err());
    }

    #[test]
    fn init_line_carries_embedded_settings() {
        let line = encode_line(
            &prefix(),
            MessageKind::Init,
            &json!({
                "settings": "{\"room\":\"alice\",\"port\":443}",
                "chatSettings": "{\"font\":\"sans\"}",
                "csrftoken": "tok"
            }),
        );
        let message = decode(&prefix(), &debug_line(line)).expect("decoded");
        assert_eq!(message.kind, MessageKind::Init);

        let snapshot = SettingsSnapshot::from_payload(message.payload).expect("snapshot");
        assert_eq!(
            snapshot.handler_settings().expect("doc"),
            json!({ "room": "alice", "port": 443 })
        );
        assert_eq!(snapshot.chat_settings().expect("doc"), json!({ "font": "sans" }));
        assert_eq!(snapshot.csrftoken.as_deref(), Some("tok"));
    }

    #[test]
    fn generated_prefixes_are_unique() {
        assert_ne!(PatchPrefix::generate(), PatchPrefix::generate());
    }
}
