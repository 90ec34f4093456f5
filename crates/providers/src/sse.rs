//! Incremental SSE line decoding shared by the streaming adapters.
//!
//! Upstreams deliver `data: {json}` records split arbitrarily across TCP
//! reads. [`SseBuffer`] accumulates bytes and yields complete data
//! payloads; the `[DONE]` sentinel is surfaced as [`SseEvent::Done`].

/// One decoded SSE record.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// The payload of a `data:` line (without the prefix).
    Data(String),
    /// The `[DONE]` terminal sentinel.
    Done,
}

/// Accumulates raw bytes and yields complete SSE events.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every event completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            // Skip blank separators and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
            // Other field names (event:, id:, retry:) are ignored — the
            // providers we speak to put everything in data lines, except
            // Anthropic whose event names are mirrored inside the JSON.
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_record() {
        let mut buf = SseBuffer::new();
        let events = buf.push(b"data: {\"x\":1}\n\n");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".into())]);
    }

    #[test]
    fn record_split_across_reads() {
        let mut buf = SseBuffer::new();
        assert!(buf.push(b"data: {\"x\"").is_empty());
        let events = buf.push(b":1}\n");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".into())]);
    }

    #[test]
    fn done_sentinel() {
        let mut buf = SseBuffer::new();
        let events = buf.push(b"data: [DONE]\n\n");
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn comments_and_event_names_skipped() {
        let mut buf = SseBuffer::new();
        let events = buf.push(b": keep-alive\nevent: message_start\ndata: {}\n");
        assert_eq!(events, vec![SseEvent::Data("{}".into())]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut buf = SseBuffer::new();
        let events = buf.push(b"data: {\"a\":2}\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("{\"a\":2}".into())]);
    }

    #[test]
    fn multiple_records_one_read() {
        let mut buf = SseBuffer::new();
        let events = buf.push(b"data: 1\n\ndata: 2\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("1".into()),
                SseEvent::Data("2".into()),
                SseEvent::Done
            ]
        );
    }
}
