//! The single in-flight turn.
//!
//! An `InflightSession` accumulates the assistant text for one turn, numbers
//! every protocol event it emits, and resolves its sink exactly once. It does
//! no locking of its own; the owning [`crate::relay::Relay`] serializes access.

use axum::body::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::normalize::{compute_delta, SnapshotDiff, UpstreamUpdate};
use crate::prompt::TurnRequest;
use crate::responses::{
    ContentPart, ItemStatus, OutputItem, ResponseError, ResponseObject, ResponseStatus,
};
use crate::sanitize::{sanitize_output, SanitizedOutput};
use crate::sse;

pub const EVENT_CREATED: &str = "response.created";
pub const EVENT_IN_PROGRESS: &str = "response.in_progress";
pub const EVENT_OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
pub const EVENT_CONTENT_PART_ADDED: &str = "response.content_part.added";
pub const EVENT_TEXT_DELTA: &str = "response.output_text.delta";
pub const EVENT_TEXT_DONE: &str = "response.output_text.done";
pub const EVENT_CONTENT_PART_DONE: &str = "response.content_part.done";
pub const EVENT_OUTPUT_ITEM_DONE: &str = "response.output_item.done";
pub const EVENT_COMPLETED: &str = "response.completed";
pub const EVENT_RELAY_PASSTHROUGH: &str = "response.relay.event";

pub const TIMEOUT_ERROR_CODE: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Stream,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    InProgress,
    Completed,
    Cancelled,
    Errored,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::InProgress)
    }
}

/// How a turn ends. Only terminal outcomes can be passed to `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(ResponseError),
}

impl TurnOutcome {
    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self::Failed(ResponseError::new(code, message))
    }

    fn into_parts(self) -> (ResponseStatus, SessionState, Option<ResponseError>) {
        match self {
            Self::Completed => (ResponseStatus::Completed, SessionState::Completed, None),
            Self::Cancelled => (ResponseStatus::Cancelled, SessionState::Cancelled, None),
            Self::Failed(error) => {
                let state = if error.code == TIMEOUT_ERROR_CODE {
                    SessionState::TimedOut
                } else {
                    SessionState::Errored
                };
                (ResponseStatus::Error, state, Some(error))
            }
        }
    }
}

#[derive(Debug)]
pub enum EventSink {
    /// Encoded SSE frames for a live caller.
    Stream(mpsc::UnboundedSender<Bytes>),
    /// Resolved once with the final response.
    Buffered(Option<oneshot::Sender<ResponseObject>>),
    Closed,
}

impl EventSink {
    pub fn stream() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Stream(tx), rx)
    }

    pub fn buffered() -> (Self, oneshot::Receiver<ResponseObject>) {
        let (tx, rx) = oneshot::channel();
        (Self::Buffered(Some(tx)), rx)
    }

    fn mode(&self) -> SessionMode {
        match self {
            Self::Stream(_) => SessionMode::Stream,
            Self::Buffered(_) | Self::Closed => SessionMode::Buffered,
        }
    }
}

#[derive(Debug)]
pub struct InflightSession {
    id: String,
    created_at: i64,
    mode: SessionMode,
    state: SessionState,
    sequence_number: u64,
    last_text: String,
    response: ResponseObject,
    output_item_id: String,
    output_index: usize,
    content_index: usize,
    sink: EventSink,
    timeout: Option<AbortHandle>,
}

impl InflightSession {
    pub fn new(request: &TurnRequest, default_model: &str, sink: EventSink) -> Self {
        let id = format!("resp_{}", uuid::Uuid::new_v4().simple());
        let created_at = unix_now();
        let response = ResponseObject::in_progress(
            id.clone(),
            created_at,
            request
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            request.instructions.clone(),
            request.input.clone(),
            request.metadata.clone(),
        );

        Self {
            id,
            created_at,
            mode: sink.mode(),
            state: SessionState::Created,
            sequence_number: 0,
            last_text: String::new(),
            response,
            output_item_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            output_index: 0,
            content_index: 0,
            sink,
            timeout: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn last_text(&self) -> &str {
        &self.last_text
    }

    /// Number the next emitted event will carry.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn response(&self) -> &ResponseObject {
        &self.response
    }

    pub fn set_timeout(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.timeout.replace(handle) {
            previous.abort();
        }
    }

    pub fn emit(&mut self, event_type: &str, mut payload: Value) {
        if self.is_closed() {
            return;
        }

        let sequence_number = self.sequence_number;
        self.sequence_number += 1;

        if let Value::Object(map) = &mut payload {
            map.insert("type".to_string(), Value::String(event_type.to_string()));
            map.insert("sequence_number".to_string(), Value::from(sequence_number));
        }

        if let EventSink::Stream(tx) = &self.sink {
            let frame = sse::encode_frame(Some(event_type), &payload.to_string());
            if tx.send(Bytes::from(frame)).is_err() {
                tracing::debug!(
                    session_id = %self.id,
                    event = event_type,
                    sequence_number,
                    "stream consumer gone; event dropped"
                );
            }
        }
    }

    /// Emits the opening cascade and moves the turn to `in_progress`.
    pub fn begin(&mut self) {
        if self.state != SessionState::Created {
            return;
        }
        self.state = SessionState::InProgress;

        let response = self.response_value();
        self.emit(EVENT_CREATED, json!({ "response": response }));
        self.emit(EVENT_IN_PROGRESS, json!({ "response": response }));

        let item = OutputItem::assistant_message(self.output_item_id.clone());
        self.response.output = vec![item.clone()];
        self.emit(
            EVENT_OUTPUT_ITEM_ADDED,
            json!({ "output_index": self.output_index, "item": item }),
        );
        self.emit(
            EVENT_CONTENT_PART_ADDED,
            json!({
                "item_id": self.output_item_id,
                "output_index": self.output_index,
                "content_index": self.content_index,
                "part": ContentPart::output_text(""),
            }),
        );
    }

    pub fn apply(&mut self, update: UpstreamUpdate) {
        match update {
            UpstreamUpdate::Full(text) => self.apply_full_snapshot(&text),
            UpstreamUpdate::Delta(text) => self.apply_delta_fragment(&text),
        }
    }

    pub fn apply_full_snapshot(&mut self, text: &str) {
        if self.is_closed() {
            return;
        }
        match compute_delta(text, &self.last_text) {
            SnapshotDiff::Unchanged => {}
            SnapshotDiff::Append(suffix) => {
                self.last_text = text.to_string();
                self.emit_text_delta(&suffix);
            }
            SnapshotDiff::Reset(snapshot) => {
                tracing::debug!(
                    session_id = %self.id,
                    previous_len = self.last_text.len(),
                    next_len = snapshot.len(),
                    "snapshot does not extend tracked text; resetting"
                );
                self.last_text = snapshot.clone();
                self.emit_text_delta(&snapshot);
            }
        }
    }

    pub fn apply_delta_fragment(&mut self, text: &str) {
        if self.is_closed() || text.is_empty() {
            return;
        }
        self.last_text.push_str(text);
        self.emit_text_delta(text);
    }

    pub fn passthrough(&mut self, message: Value) {
        self.emit(EVENT_RELAY_PASSTHROUGH, json!({ "message": message }));
    }

    /// First call wins; every later call is a no-op returning `false`.
    pub fn finalize(&mut self, outcome: TurnOutcome) -> bool {
        if self.is_closed() {
            return false;
        }
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }

        let SanitizedOutput { text, tool_calls } = sanitize_output(&self.last_text);
        let part = ContentPart::output_text(text.clone());
        let message = OutputItem::Message {
            id: self.output_item_id.clone(),
            status: ItemStatus::Completed,
            role: "assistant".to_string(),
            content: vec![part.clone()],
        };
        self.response.output = vec![message.clone()];

        self.emit(
            EVENT_TEXT_DONE,
            json!({
                "item_id": self.output_item_id,
                "output_index": self.output_index,
                "content_index": self.content_index,
                "text": text,
            }),
        );
        self.emit(
            EVENT_CONTENT_PART_DONE,
            json!({
                "item_id": self.output_item_id,
                "output_index": self.output_index,
                "content_index": self.content_index,
                "part": part,
            }),
        );
        self.emit(
            EVENT_OUTPUT_ITEM_DONE,
            json!({ "output_index": self.output_index, "item": message }),
        );

        for call in &tool_calls {
            let item = OutputItem::function_call(call);
            let output_index = self.response.output.len();
            self.response.output.push(item.clone());
            self.emit(
                EVENT_OUTPUT_ITEM_ADDED,
                json!({ "output_index": output_index, "item": item }),
            );
            self.emit(
                EVENT_OUTPUT_ITEM_DONE,
                json!({ "output_index": output_index, "item": item }),
            );
        }

        let (status, terminal, error) = outcome.into_parts();
        self.response.status = status;
        self.response.output_text = text;
        self.response.tool_calls = tool_calls;
        self.response.error = error;
        self.response.completed_at = Some(unix_now());

        let response = self.response_value();
        self.emit(EVENT_COMPLETED, json!({ "response": response }));
        self.state = terminal;

        match std::mem::replace(&mut self.sink, EventSink::Closed) {
            EventSink::Stream(tx) => {
                let _ = tx.send(Bytes::from(sse::done_frame()));
            }
            EventSink::Buffered(Some(tx)) => {
                if tx.send(self.response.clone()).is_err() {
                    tracing::debug!(session_id = %self.id, "buffered caller gone before resolution");
                }
            }
            EventSink::Buffered(None) | EventSink::Closed => {}
        }

        tracing::info!(
            session_id = %self.id,
            status = self.response.status.as_str(),
            events = self.sequence_number,
            text_len = self.response.output_text.len(),
            tool_calls = self.response.tool_calls.len(),
            "turn finished"
        );
        true
    }

    fn emit_text_delta(&mut self, delta: &str) {
        let payload = json!({
            "item_id": self.output_item_id,
            "output_index": self.output_index,
            "content_index": self.content_index,
            "delta": delta,
        });
        self.emit(EVENT_TEXT_DELTA, payload);
    }

    fn response_value(&self) -> Value {
        serde_json::to_value(&self.response).unwrap_or(Value::Null)
    }
}

impl Drop for InflightSession {
    fn drop(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
