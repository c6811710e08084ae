//! Post-processing of the accumulated assistant text.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status token the capture convention places around genuine final output.
pub const COMPLETION_MARKER: &str = "finished_successfully";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as the Responses API carries them.
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```([^`\r\n]*)\r?\n(.*?)```").expect("valid fence regex")
    })
}

fn version_tag_regex() -> &'static Regex {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    VERSION.get_or_init(|| Regex::new(r"^v\d+").expect("valid version regex"))
}

pub fn sanitize(text: &str) -> String {
    sanitize_output(text).text
}

pub fn sanitize_output(text: &str) -> SanitizedOutput {
    let (stripped, tool_calls) = extract_tool_calls(text);
    SanitizedOutput {
        text: trim_at_marker(&stripped),
        tool_calls,
    }
}

/// Removes every fenced block carrying a parseable `tool_calls` array and
/// returns the remaining text plus the calls in block order. Fences pair up
/// opener to closer whatever their language tag; only untagged or `json`
/// blocks are candidates.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for captures in fence_regex().captures_iter(text) {
        let (Some(block), Some(info), Some(body)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let info = info.as_str().trim();
        if !(info.is_empty() || info.eq_ignore_ascii_case("json")) {
            continue;
        }
        if !body.as_str().contains("tool_calls") {
            continue;
        }
        let entries = match serde_json::from_str::<Value>(body.as_str()) {
            Ok(Value::Object(mut object)) => match object.remove("tool_calls") {
                Some(Value::Array(entries)) => entries,
                _ => continue,
            },
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "tool call block did not parse; keeping as text");
                continue;
            }
        };

        out.push_str(&text[cursor..block.start()]);
        cursor = block.end();
        calls.extend(entries.iter().filter_map(tool_call_from_value));
    }

    out.push_str(&text[cursor..]);
    (out, calls)
}

fn tool_call_from_value(entry: &Value) -> Option<ToolCall> {
    let function = entry.get("function").unwrap_or(entry);
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments").or_else(|| function.get("args")) {
        Some(Value::String(raw)) => raw.clone(),
        Some(value) => value.to_string(),
        None => "{}".to_string(),
    };
    let id = entry
        .get("id")
        .or_else(|| entry.get("call_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

/// One marker keeps what precedes it; two or more keep what lies between the
/// first and last. The `v<digits>` prefix is only stripped when a marker was
/// found.
pub fn trim_at_marker(text: &str) -> String {
    let positions: Vec<usize> = text
        .match_indices(COMPLETION_MARKER)
        .map(|(index, _)| index)
        .collect();

    let kept = match positions.as_slice() {
        [] => return text.trim().to_string(),
        [only] => &text[..*only],
        [first, .., last] => &text[first + COMPLETION_MARKER.len()..*last],
    };

    let kept = kept.trim();
    version_tag_regex().replace(kept, "").trim().to_string()
}
