//! Normalization of raw tool results into evidence events.
//!
//! Results are opaque JSON. Only three fields are looked at: `timestamp`,
//! `content` and `items`; everything else travels along in `raw`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Normalized output of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceEvent {
    pub id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub items: Vec<Value>,
    pub raw: Value,
}

/// Build an event from a raw result.
pub fn normalize(tool: &str, server: Option<&str>, raw: Value) -> EvidenceEvent {
    EvidenceEvent {
        id: Uuid::new_v4().to_string(),
        tool: tool.to_string(),
        server: server.map(str::to_string),
        timestamp: extract_timestamp(&raw).unwrap_or_else(Utc::now),
        content: extract_content(&raw),
        items: extract_items(&raw),
        raw,
    }
}

/// `timestamp` as RFC 3339 text, or Unix seconds / milliseconds.
pub fn extract_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw.get("timestamp")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_i64()?;
            // Anything past 1e11 reads as milliseconds.
            if n.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

/// Text of the result: MCP text blocks joined by newlines, a plain string, or
/// the compact JSON of whatever else came back.
pub fn extract_content(raw: &Value) -> String {
    match raw.get("content") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match raw {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        },
    }
}

pub fn extract_items(raw: &Value) -> Vec<Value> {
    raw.get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
