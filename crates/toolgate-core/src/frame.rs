//! Chat frame helpers.
//!
//! Frames are kept as plain `serde_json::Value` objects so that whatever
//! metadata the upstream attaches travels through the proxy untouched.

use chrono::Utc;
use serde_json::{json, Value};

/// What the `done` field of an upstream frame tells us about the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    UpstreamHasMore,
    UpstreamSentAll,
    /// `done` missing or not a boolean.
    CommunicationFailure,
}

pub fn done_of(frame: &Value) -> TurnStatus {
    match frame.get("done") {
        Some(Value::Bool(true)) => TurnStatus::UpstreamSentAll,
        Some(Value::Bool(false)) => TurnStatus::UpstreamHasMore,
        _ => TurnStatus::CommunicationFailure,
    }
}

/// The `message.content` delta of a frame; empty when absent.
pub fn content_of(frame: &Value) -> &str {
    frame
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Current UTC instant as `YYYY-MM-DDTHH:MM:SS.ffffffZ`, the shape the
/// upstream stamps its own frames with.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Builds a synthesized streaming frame carrying `text`, shaped like an
/// upstream token frame.
pub fn assistant_frame(model: &str, text: impl Into<String>) -> Value {
    json!({
        "created_at": utc_timestamp(),
        "done": false,
        "model": model,
        "message": { "role": "assistant", "content": text.into() },
    })
}

/// Copies `frame`, forces `done: false` and replaces `message.content` with
/// `text`. Every other field of the original frame is preserved. Frames
/// whose shape is too broken to patch are rebuilt from scratch.
pub fn replace_text(frame: &Value, text: impl Into<String>) -> Value {
    let mut copy = if frame.is_object() {
        frame.clone()
    } else {
        json!({})
    };
    copy["done"] = Value::Bool(false);
    if !copy.get("message").is_some_and(Value::is_object) {
        copy["message"] = json!({ "role": "assistant" });
    }
    copy["message"]["content"] = Value::String(text.into());
    copy
}
