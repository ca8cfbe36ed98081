//! Typing of raw feed-message arguments.

use serde::Serialize;
use serde_json::Value;

/// A feed argument after normalization. Serializes untagged, so JSON output
/// shows the plain value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Number(f64),
    Structured(Value),
    Text(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Rules, first match wins: exact `true`/`false`; a string that parses
/// entirely as a finite number; a `{`-prefixed string that parses as JSON;
/// anything else stays text. Total and deterministic.
///
/// Numbers must be finite: `Infinity`, `-Infinity` and `NaN` stay text.
pub fn normalize_arg(raw: &str) -> ArgValue {
    match raw {
        "true" => return ArgValue::Bool(true),
        "false" => return ArgValue::Bool(false),
        _ => {}
    }
    if let Some(number) = parse_number(raw) {
        return ArgValue::Number(number);
    }
    if raw.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            return ArgValue::Structured(value);
        }
    }
    ArgValue::Text(raw.to_string())
}

pub fn normalize_args<S: AsRef<str>>(raw: &[S]) -> Vec<ArgValue> {
    raw.iter().map(|arg| normalize_arg(arg.as_ref())).collect()
}

fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}
