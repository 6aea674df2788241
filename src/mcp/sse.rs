/// A parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Events are separated by blank lines; each event
/// carries optional `event:` and one or more `data:` fields. Chunks from the
/// network may split lines or events arbitrarily, so the parser buffers
/// partial input between `push` calls.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_type: Option<String>,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning any events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() || self.event_type.is_some() {
                    events.push(SseEvent {
                        event_type: self.event_type.take(),
                        data: std::mem::take(&mut self.data),
                    });
                }
            } else if let Some(event_type) = line.strip_prefix("event:") {
                self.event_type = Some(event_type.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
            // Comment lines (":" prefix) and unknown fields are ignored.
        }

        events
    }
}
