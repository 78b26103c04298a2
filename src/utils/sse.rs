use bytes::{BufMut, Bytes, BytesMut};

/// A single server-sent event as this relay consumes and emits them: only
/// the `event` and `data` fields matter for LLM streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        SseEvent {
            event: None,
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        if let Some(event) = &self.event {
            buffer.put_slice(b"event: ");
            buffer.put_slice(event.as_bytes());
            buffer.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            buffer.put_slice(b"data: ");
            buffer.put_slice(line.as_bytes());
            buffer.put_u8(b'\n');
        }
        buffer.put_u8(b'\n');
        buffer.freeze()
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Upstream chunk boundaries fall anywhere, so the
/// parser buffers until it has complete lines and only emits an event at the
/// blank-line terminator.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of bytes; returns every event completed by it.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            line_bytes.pop(); // the \n itself
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.pop();
            }
            let line = String::from_utf8_lossy(&line_bytes).into_owned();

            if line.is_empty() {
                if !self.current.data.is_empty() || self.current.event.is_some() {
                    events.push(std::mem::take(&mut self.current));
                }
                continue;
            }
            self.parse_line(&line);
        }
        events
    }

    fn parse_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            "event" => self.current.event = Some(value.to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_parsing() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: hello world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello world");
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: first\n\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: hel").is_empty());
        let events = parser.process(b"lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: chunk\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "chunk");
    }

    #[test]
    fn test_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_named_event_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.process(b": keep-alive\nevent: result\ndata: payload\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("result"));
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn test_done_marker() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_done());
    }

    #[test]
    fn test_round_trip_framing() {
        let event = SseEvent::data("hello\nworld");
        assert_eq!(&event.to_bytes()[..], b"data: hello\ndata: world\n\n");
    }
}
