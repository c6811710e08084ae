//! Server-sent-event framing.
//!
//! The encoder produces the frames written to streaming callers. The decoder
//! is used on raw event-stream text forwarded by the capture agent.

/// Reserved data payload marking the end of a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Encodes one frame: optional `event:` line, one `data:` line per payload
/// line, blank-line terminator.
pub fn encode_frame(event: Option<&str>, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 32);
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
    out.push('\n');
    out
}

pub fn done_frame() -> String {
    encode_frame(None, DONE_SENTINEL)
}

/// Incremental decoder. Partial lines are buffered until the next `push`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    current: Option<PendingFrame>,
}

#[derive(Debug, Default)]
struct PendingFrame {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl PendingFrame {
    fn into_frame(self) -> SseFrame {
        SseFrame {
            event: self.event,
            id: self.id,
            data: self.data.join("\n"),
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flushes a trailing line and any frame not yet terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.current.take().map(PendingFrame::into_frame)
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.current.take().map(PendingFrame::into_frame);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        let frame = self.current.get_or_insert_with(PendingFrame::default);
        match field {
            "event" => frame.event = Some(value.to_string()),
            "id" => frame.id = Some(value.to_string()),
            "data" => frame.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Decodes a complete block of event-stream text.
pub fn decode_frames(text: &str) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(text);
    frames.extend(decoder.finish());
    frames
}

/// True when the text looks like event-stream framing rather than a plain
/// payload.
pub fn looks_like_event_stream(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("data:") || line.starts_with("event:")
    })
}
