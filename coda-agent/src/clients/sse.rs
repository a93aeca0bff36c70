use super::LLMError;
use async_stream::stream;
use futures::{Stream, StreamExt};
use tracing::trace;

/// Splits a server-sent-event byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line is available so payloads split
/// across network chunks (including mid UTF-8 sequence) are reassembled.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every complete data payload found so far.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flushes a trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        None
    } else {
        Some(data.to_string())
    }
}

/// Streams the `data:` payloads of an SSE response. Ends at `[DONE]` or when
/// the connection closes.
pub fn data_events(
    response: reqwest::Response,
    provider: String,
) -> impl Stream<Item = Result<String, LLMError>> + Send {
    stream! {
        let mut bytes = response.bytes_stream();
        let mut lines = SseLineBuffer::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(LLMError::ConnectionFailed {
                        provider: provider.clone(),
                        message: format!("Stream interrupted: {}", e),
                    });
                    return;
                }
            };

            for payload in lines.push(&chunk) {
                if payload == "[DONE]" {
                    trace!("SSE stream finished");
                    return;
                }
                yield Ok(payload);
            }
        }

        if let Some(payload) = lines.finish() {
            if payload != "[DONE]" {
                yield Ok(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_split_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: {\"a\":").is_empty());
        let payloads = buffer.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut buffer = SseLineBuffer::new();
        let payloads = buffer.push(b"event: content_block_delta\r\n: keepalive\r\ndata:{}\r\n\r\n");
        assert_eq!(payloads, vec!["{}".to_string()]);
    }

    #[test]
    fn test_multibyte_char_split() {
        let text = "data: héllo\n".as_bytes();
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(&text[..8]).is_empty());
        assert_eq!(buffer.push(&text[8..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: tail").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
        assert!(buffer.finish().is_none());
    }
}
