use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::ProviderId;

/// A decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Joined `data:` payload of one event.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

struct SseDecoder<S> {
    body: Pin<Box<S>>,
    provider: ProviderId,
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    pending: VecDeque<Result<SseEvent>>,
    closed: bool,
}

impl<S> SseDecoder<S> {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                self.flush_event();
            } else {
                self.handle_line(line);
            }
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        let line = match String::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                warn!("Invalid UTF-8 in {} stream: {}", self.provider, e);
                self.pending.push_back(Err(Error::upstream(
                    self.provider,
                    "stream contained invalid UTF-8",
                )));
                return;
            }
        };

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            self.data_lines.push(data.to_string());
        }
        // `event:`, `id:` and `:` comment lines carry nothing we need.
    }

    fn flush_event(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.drain(..).collect::<Vec<_>>().join("\n");
        if data.trim() == "[DONE]" {
            self.pending.push_back(Ok(SseEvent::Done));
        } else if !data.is_empty() {
            self.pending.push_back(Ok(SseEvent::Data(data)));
        }
    }

    fn finish(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(line);
        }
        self.flush_event();
    }
}

/// Turns a raw HTTP body into SSE events, preserving arrival order.
pub fn decode_events<S, B, E>(body: S, provider: ProviderId) -> BoxStream<'static, Result<SseEvent>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: Display + 'static,
{
    let decoder = SseDecoder {
        body: Box::pin(body),
        provider,
        buffer: Vec::new(),
        data_lines: Vec::new(),
        pending: VecDeque::new(),
        closed: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.pending.pop_front() {
                return Some((item, decoder));
            }
            if decoder.closed {
                return None;
            }
            match decoder.body.next().await {
                Some(Ok(bytes)) => decoder.push_bytes(bytes.as_ref()),
                Some(Err(e)) => {
                    warn!("{} stream read error: {}", decoder.provider, e);
                    decoder.closed = true;
                    let err = Error::upstream(decoder.provider, "stream was interrupted");
                    return Some((Err(err), decoder));
                }
                None => {
                    debug!("{} stream body ended", decoder.provider);
                    decoder.closed = true;
                    decoder.finish();
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: Vec<&'static str>) -> impl Stream<Item = std::result::Result<&'static [u8], String>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes())))
    }

    #[tokio::test]
    async fn test_decodes_events_split_across_chunks() {
        let events: Vec<_> = decode_events(
            body(vec!["data: {\"a\":", "1}\n\n: keepalive\n\ndata: two\r\n\r\n", "data: [DONE]\n\n"]),
            ProviderId::OpenAI,
        )
        .collect()
        .await;

        let events: Vec<SseEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Data("two".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_flushes_trailing_event_without_blank_line() {
        let events: Vec<_> = decode_events(
            body(vec!["event: message_stop\ndata: {\"type\":\"message_stop\"}"]),
            ProviderId::Anthropic,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &SseEvent::Data("{\"type\":\"message_stop\"}".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let parts: Vec<std::result::Result<&'static [u8], String>> = vec![
            Ok(&b"data: one\n\n"[..]),
            Err("connection reset".to_string()),
            Ok(&b"data: never\n\n"[..]),
        ];
        let events: Vec<_> = decode_events(stream::iter(parts), ProviderId::OpenAI)
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        let err = events[1].as_ref().unwrap_err();
        assert!(!err.to_string().contains("connection reset"));
    }
}
