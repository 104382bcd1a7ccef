//! Server-sent-event parsing and framing.
//!
//! The proxy reads the agent's SSE stream line-by-line and re-emits each
//! event downstream with identical framing. Events named `done` or `error`
//! terminate a stream.

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            event: "error".to_string(),
            data: serde_json::json!({ "error": reason.into() }).to_string(),
        }
    }

    /// `done` and `error` end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self.event.as_str(), "done" | "error")
    }
}

/// Incremental line-oriented SSE parser.
///
/// Feed lines without their trailing newline; a blank line dispatches the
/// accumulated event. Unknown fields (`id:`, `retry:`) and comments are
/// ignored, as are events with no data.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            let event_name = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = self.data.join("\n");
            self.data.clear();
            return Some(SseEvent {
                event: event_name.unwrap_or_else(|| "message".to_string()),
                data,
            });
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // comments (": ...") and other fields fall through
        None
    }
}

/// Encode an event with proper framing: `event:` line, `data:` lines, blank
/// terminator
pub fn encode(event: &SseEvent) -> String {
    let mut out = String::with_capacity(event.event.len() + event.data.len() + 16);
    out.push_str("event: ");
    out.push_str(&event.event);
    out.push('\n');
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}
