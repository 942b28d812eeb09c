//! Line framing for server-sent-event streams

use memchr::memchr;

/// Splits a byte stream into lines, tolerating chunk boundaries anywhere
/// (including inside a UTF-8 sequence or between `\r` and `\n`).
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(relative) = memchr(b'\n', &self.buffer[start..]) {
            let newline = start + relative;
            push_line(&self.buffer[start..newline], &mut lines);
            start = newline + 1;
        }

        if flush {
            push_line(&self.buffer[start..], &mut lines);
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }

        lines
    }
}

fn push_line(bytes: &[u8], lines: &mut Vec<String>) {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        Err(e) => tracing::warn!("dropping non-UTF-8 stream line: {}", e),
    }
}

/// The payload of a `data:` line; `event:`, `id:` and comment lines yield `None`
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_chunk_boundaries() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(buffer.push(b"data: one\n\n"), vec!["data: one"]);
        assert_eq!(buffer.push(b"data: t"), Vec::<String>::new());
        assert_eq!(buffer.push(b"wo\r"), Vec::<String>::new());
        assert_eq!(buffer.push(b"\n"), vec!["data: two"]);
        assert_eq!(buffer.finish(), Vec::<String>::new());
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut buffer = SseLineBuffer::default();
        let text = "data: é\n".as_bytes();
        assert!(buffer.push(&text[..7]).is_empty());
        assert_eq!(buffer.push(&text[7..]), vec!["data: é"]);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: [DONE]").is_empty());
        assert_eq!(buffer.finish(), vec!["data: [DONE]"]);
    }

    #[test]
    fn test_data_payload_spacing_variants() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: response.completed"), None);
        assert_eq!(data_payload(": keep-alive"), None);
    }
}
