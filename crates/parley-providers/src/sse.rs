//! Server-Sent Events decoding.
//!
//! Turns any byte stream (normally a `reqwest` response body) into a
//! `Stream<Item = SseEvent>`. Bytes are buffered until a full line is
//! available, so multi-byte characters split across network chunks survive.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    sse_events(response.bytes_stream())
}

/// Parse an arbitrary byte stream as SSE.
pub fn sse_events<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + 'static,
{
    futures::stream::unfold(
        Decoder {
            bytes: Box::pin(bytes),
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            done: false,
        },
        |mut dec| async move {
            loop {
                if let Some(line) = dec.next_line() {
                    if let Some(event) = dec.feed_line(&line) {
                        return Some((Ok(event), dec));
                    }
                    continue;
                }

                if dec.done {
                    return dec.flush().map(|event| (Ok(event), dec));
                }

                match dec.bytes.next().await {
                    Some(Ok(chunk)) => dec.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        dec.done = true;
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), dec));
                    }
                    None => {
                        dec.done = true;
                        // A final line without a trailing newline still counts.
                        if !dec.buffer.is_empty() {
                            dec.buffer.push(b'\n');
                        }
                    }
                }
            }
        },
    )
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct Decoder<E> {
    bytes: ByteStream<E>,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    done: bool,
}

impl<E> Decoder<E> {
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        Some(line.trim_end_matches('\r').to_string())
    }

    /// Apply one line; returns an event when a blank line dispatches one.
    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + use<> {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(parts: &[&'static [u8]]) -> Vec<SseEvent> {
        let stream = sse_events(chunks(parts));
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.expect("event"));
        }
        events
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let events = collect(&[b"data: {\"a\":", b"1}\n\n: keep-alive\n", b"data: [DONE]\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn test_multibyte_character_split() {
        let text = "data: héllo\n\n".as_bytes();
        let (head, tail) = text.split_at(8);
        let head: &'static [u8] = Box::leak(head.to_vec().into_boxed_slice());
        let tail: &'static [u8] = Box::leak(tail.to_vec().into_boxed_slice());
        let events = collect(&[head, tail]).await;
        assert_eq!(events[0].data, "héllo");
    }

    #[tokio::test]
    async fn test_named_event_and_trailing_data() {
        let events = collect(&[b"event: message\r\ndata: a\r\ndata: b\r\n\r\ndata: tail"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[1].data, "tail");
    }
}
