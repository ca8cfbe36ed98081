//! Notifications surfaced by a running session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One intercepted console call (`Runtime.consoleAPICalled`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Console severity as reported by the page, e.g. `log`, `debug`, `error`.
    pub level: String,
    /// Textual form of every argument, in call order.
    pub args: Vec<String>,
    pub timestamp: Option<f64>,
}

impl LogEntry {
    pub fn new(level: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            level: level.into(),
            args,
            timestamp: None,
        }
    }

    pub(crate) fn from_params(params: &Value) -> Self {
        let level = params
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("log")
            .to_string();
        let args = params
            .get("args")
            .and_then(Value::as_array)
            .map(|args| args.iter().map(remote_object_text).collect())
            .unwrap_or_default();
        let timestamp = params.get("timestamp").and_then(Value::as_f64);
        Self {
            level,
            args,
            timestamp,
        }
    }
}

fn remote_object_text(obj: &Value) -> String {
    match obj.get("value") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => obj
            .get("unserializableValue")
            .or_else(|| obj.get("description"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                obj.get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("undefined")
                    .to_string()
            }),
        Some(other) => other.to_string(),
    }
}

/// A `DOM.childNodeInserted` notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInserted {
    pub node_id: i64,
    pub parent_node_id: i64,
    pub previous_node_id: i64,
}

impl ChildInserted {
    pub(crate) fn from_params(params: &Value) -> Option<Self> {
        Some(Self {
            node_id: params.get("node")?.get("nodeId")?.as_i64()?,
            parent_node_id: params.get("parentNodeId")?.as_i64()?,
            previous_node_id: params
                .get("previousNodeId")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    PageLoaded,
    Console(LogEntry),
    ChildInserted(ChildInserted),
    /// The debugging connection went away without `stop()` being called.
    Disconnected { reason: String },
}

/// Browser cookie as reported by `Network.getCookies`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}
