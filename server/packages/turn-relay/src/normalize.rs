//! Maps the heterogeneous payloads forwarded by the capture agent into
//! uniform text updates.

use serde_json::Value;

use crate::sse::{self, DONE_SENTINEL};

/// Keys under which the agent envelope may carry the captured payload.
const ENVELOPE_PAYLOAD_KEYS: &[&str] = &["data", "payload", "event", "chunk"];

/// Keys whose primitive string value is an appended fragment.
const DELTA_STRING_KEYS: &[&str] = &["v"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamUpdate {
    /// Absolute snapshot of the assistant text so far.
    Full(String),
    /// Fragment to append.
    Delta(String),
}

impl UpstreamUpdate {
    pub fn text(&self) -> &str {
        match self {
            Self::Full(text) | Self::Delta(text) => text,
        }
    }
}

/// Envelope payload after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayPayload {
    Json(Value),
    Frames(Vec<sse::SseFrame>),
    Raw(String),
    Missing,
}

impl RelayPayload {
    pub fn from_envelope(message: &Value) -> Self {
        let payload = ENVELOPE_PAYLOAD_KEYS
            .iter()
            .find_map(|key| message.get(*key))
            .filter(|value| !value.is_null());

        match payload {
            Some(Value::String(text)) => Self::from_text(text),
            Some(value) => Self::Json(value.clone()),
            None => Self::Missing,
        }
    }

    pub fn from_text(text: &str) -> Self {
        if text.is_empty() {
            return Self::Missing;
        }
        // Whitespace-only text is still a fragment; trimming only guides parsing.
        let trimmed = text.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.is_object() || value.is_array() || value.is_string() {
                return Self::Json(value);
            }
        }
        if sse::looks_like_event_stream(text) {
            return Self::Frames(sse::decode_frames(text));
        }
        Self::Raw(text.to_string())
    }
}

type Matcher = fn(&Value) -> Option<UpstreamUpdate>;

/// Tried in order; the first matcher that recognizes the shape wins.
const MATCHERS: &[(&str, Matcher)] = &[
    ("envelope_string", match_envelope_string),
    ("patch_batch", match_patch_batch),
    ("assistant_message", match_assistant_message),
    ("delta_field", match_delta_field),
    ("chat_choices", match_chat_choices),
];

/// Normalizes one inbound relay message. Event-stream text may carry several
/// frames, so several updates can come out of a single message.
pub fn normalize(message: &Value) -> Vec<UpstreamUpdate> {
    match RelayPayload::from_envelope(message) {
        RelayPayload::Json(value) => normalize_value(&value).into_iter().collect(),
        RelayPayload::Frames(frames) => frames
            .iter()
            .filter(|frame| !frame.is_done())
            .filter_map(|frame| match RelayPayload::from_text(&frame.data) {
                RelayPayload::Json(value) => normalize_value(&value),
                RelayPayload::Raw(text) => raw_fragment(&text),
                RelayPayload::Frames(_) | RelayPayload::Missing => None,
            })
            .collect(),
        RelayPayload::Raw(text) => raw_fragment(&text).into_iter().collect(),
        RelayPayload::Missing => Vec::new(),
    }
}

pub fn normalize_value(value: &Value) -> Option<UpstreamUpdate> {
    MATCHERS.iter().find_map(|(name, matcher)| {
        let update = matcher(value)?;
        tracing::trace!(matcher = *name, len = update.text().len(), "normalized payload");
        Some(update)
    })
}

fn raw_fragment(text: &str) -> Option<UpstreamUpdate> {
    if text.trim() == DONE_SENTINEL || text.is_empty() {
        return None;
    }
    Some(UpstreamUpdate::Delta(text.to_string()))
}

fn match_envelope_string(value: &Value) -> Option<UpstreamUpdate> {
    if let Value::String(text) = value {
        return raw_fragment(text);
    }
    DELTA_STRING_KEYS
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(|text| UpstreamUpdate::Delta(text.to_string()))
}

fn match_patch_batch(value: &Value) -> Option<UpstreamUpdate> {
    if value.get("o").and_then(Value::as_str) != Some("patch") {
        return None;
    }
    let ops = value.get("v")?.as_array()?;
    let text: String = ops
        .iter()
        .filter(|op| op.get("o").and_then(Value::as_str) == Some("append"))
        .filter(|op| {
            op.get("p")
                .and_then(Value::as_str)
                .is_some_and(|path| path.starts_with("/message/content/parts"))
        })
        .filter_map(|op| op.get("v").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(UpstreamUpdate::Delta(text))
}

fn match_assistant_message(value: &Value) -> Option<UpstreamUpdate> {
    let message = value
        .get("message")
        .or_else(|| value.get("v").and_then(|v| v.get("message")))
        .or_else(|| (value.get("author").is_some() || value.get("role").is_some()).then_some(value))?;

    let role = message
        .get("author")
        .and_then(|author| author.get("role"))
        .or_else(|| message.get("role"))
        .and_then(Value::as_str)?;
    if role != "assistant" {
        return None;
    }

    let content = message.get("content")?;
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Object(_) => {
            if let Some(parts) = content.get("parts").and_then(Value::as_array) {
                parts.iter().filter_map(Value::as_str).collect()
            } else {
                content.get("text").and_then(Value::as_str)?.to_string()
            }
        }
        Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
        _ => return None,
    };

    if text.is_empty() {
        return None;
    }
    Some(UpstreamUpdate::Full(text))
}

fn match_delta_field(value: &Value) -> Option<UpstreamUpdate> {
    let text = value.get("delta")?.as_str()?;
    Some(UpstreamUpdate::Delta(text.to_string()))
}

fn match_chat_choices(value: &Value) -> Option<UpstreamUpdate> {
    let choices = value.get("choices")?.as_array()?;
    let fragments: Vec<&str> = choices
        .iter()
        .filter_map(|choice| choice.get("delta")?.get("content")?.as_str())
        .collect();
    if fragments.is_empty() {
        return None;
    }
    Some(UpstreamUpdate::Delta(fragments.concat()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDiff {
    Unchanged,
    /// `next` extends `prev`; carries the added suffix.
    Append(String),
    /// `next` does not extend `prev`; the whole snapshot replaces the tracked
    /// text and is re-emitted as a delta.
    Reset(String),
}

pub fn compute_delta(next: &str, prev: &str) -> SnapshotDiff {
    if next == prev {
        SnapshotDiff::Unchanged
    } else if let Some(suffix) = next.strip_prefix(prev) {
        SnapshotDiff::Append(suffix.to_string())
    } else {
        SnapshotDiff::Reset(next.to_string())
    }
}
