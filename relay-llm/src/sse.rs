use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Splits a byte stream into server-sent events.
///
/// Events may straddle network chunks, and carriage returns are dropped so
/// `\r\n` framing parses the same as `\n`. Bytes are decoded only once an
/// event is complete, so multi-byte chars split across chunks survive.
pub(crate) fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut ended)| async move {
            loop {
                if let Some(idx) = find_event_end(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..idx + 2).collect();
                    if let Some(event) = parse_event(&raw[..idx]) {
                        return Some((Ok(event), (stream, buffer, ended)));
                    }
                    continue;
                }

                if ended {
                    // Trailing event without the blank-line terminator.
                    let raw = std::mem::take(&mut buffer);
                    return parse_event(&raw).map(|event| (Ok(event), (stream, buffer, ended)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        ended = true;
                        buffer.clear();
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer, ended)));
                    }
                    None => ended = true,
                }
            }
        },
    )
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}
