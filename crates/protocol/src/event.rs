//! Inbound agent execution events (body of `POST /sessions/:id/event`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TokenUsage;

/// Tags the reducer understands. Anything else arrives as `Unknown`.
const KNOWN_TYPES: &[&str] = &["assistant", "tool_use", "tool_result", "result", "error"];

/// One event from an agent's execution stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    ToolUse {
        id: String,
        tool: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    ToolResult {
        id: String,
        #[serde(default)]
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Result {
        cost: f64,
        duration: f64,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    Unknown {
        #[serde(default)]
        raw: Value,
    },
}

impl StreamEvent {
    /// Parse an event body.
    ///
    /// Objects with an unrecognized `type` become `Unknown { raw }` holding the
    /// whole object. Non-objects, a missing `type`, or a known type with bad
    /// fields are errors.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        use serde::de::Error as _;

        let Some(object) = value.as_object() else {
            return Err(serde_json::Error::custom("event must be a JSON object"));
        };
        let Some(kind) = object.get("type").and_then(Value::as_str) else {
            return Err(serde_json::Error::custom("event is missing a string `type`"));
        };

        if kind == "unknown" || !KNOWN_TYPES.contains(&kind) {
            let raw = if kind == "unknown" {
                object.get("raw").cloned().unwrap_or(Value::Null)
            } else {
                value
            };
            return Ok(StreamEvent::Unknown { raw });
        }

        serde_json::from_value(value)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Assistant { .. } => "assistant",
            StreamEvent::ToolUse { .. } => "tool_use",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Unknown { .. } => "unknown",
        }
    }

    /// Sender-supplied timestamp, if any. `Unknown` never carries one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            StreamEvent::Assistant { timestamp, .. }
            | StreamEvent::ToolUse { timestamp, .. }
            | StreamEvent::ToolResult { timestamp, .. }
            | StreamEvent::Result { timestamp, .. }
            | StreamEvent::Error { timestamp, .. } => *timestamp,
            StreamEvent::Unknown { .. } => None,
        }
    }
}
