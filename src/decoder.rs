//! Event decoding: raw transport bytes/frames into discrete [`RawEvent`]s.
//!
//! Three framings are supported:
//!
//! ```text
//! SSE       event: response.output_text.delta      -> RawEvent { kind: Some(..), payload }
//!           data: {"delta":"Hi"}
//!
//! NDJSON    {"choices":[...]}\n                      -> RawEvent { kind: None, payload }
//!
//! WebSocket Text({"type":"response.completed",..}) -> RawEvent { kind: Some("response.completed"), payload }
//! ```
//!
//! Decoders are lazy and ordered. A malformed individual line or frame is
//! skipped and the sequence continues. A read error ends the sequence with a
//! single terminal `Err`.

use crate::{Error, Result};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{self, Message};

/// Sentinel payload some SSE servers send as the last event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// SSE `event:` name or the `type` field of a WebSocket frame
    pub kind: Option<String>,
    pub payload: Vec<u8>,
}

impl RawEvent {
    pub fn new(kind: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Unnamed event, the shape NDJSON lines and plain `data:` events take.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(None, payload)
    }

    pub fn named(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(kind.into()), payload)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A pinned, boxed stream of decoded events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// Wire framing of a stateless response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Sse,
    Ndjson,
}

/// Decode a byte stream according to `framing`.
pub fn decode<S, B, E>(framing: Framing, bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    match framing {
        Framing::Sse => sse_events(bytes),
        Framing::Ndjson => ndjson_events(bytes),
    }
}

/// Decode a Server-Sent Events byte stream.
///
/// `eventsource-stream` buffers events that span network chunk boundaries.
/// A `[DONE]` or empty payload closes the sequence without error.
pub fn sse_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let events = bytes.eventsource().scan(false, |finished, item| {
        if *finished {
            return futures::future::ready(None);
        }

        let next = match item {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() || data == DONE_SENTINEL {
                    *finished = true;
                    return futures::future::ready(None);
                }
                let kind = match event.event.as_str() {
                    "" | "message" => None,
                    name => Some(name.to_string()),
                };
                Some(Ok(RawEvent::new(kind, data.as_bytes().to_vec())))
            }
            Err(EventStreamError::Transport(e)) => {
                *finished = true;
                Some(Err(e.into()))
            }
            Err(EventStreamError::Utf8(e)) => {
                log::debug!("skipping SSE event with invalid UTF-8: {}", e);
                None
            }
            Err(EventStreamError::Parser(e)) => {
                log::debug!("skipping malformed SSE event: {}", e);
                None
            }
        };

        futures::future::ready(Some(next))
    });

    Box::pin(events.filter_map(futures::future::ready))
}

struct LineState<S> {
    inner: Pin<Box<S>>,
    buffer: Vec<u8>,
    ready: VecDeque<RawEvent>,
    finished: bool,
}

impl<S> LineState<S> {
    fn push_line(&mut self, line: &[u8]) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        if std::str::from_utf8(line).is_err() {
            log::debug!("skipping non UTF-8 NDJSON line ({} bytes)", line.len());
            return;
        }
        self.ready.push_back(RawEvent::data(line.to_vec()));
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn flush_tail(&mut self) {
        let tail = std::mem::take(&mut self.buffer);
        self.push_line(&tail);
    }
}

/// Decode a newline-delimited JSON byte stream. Each non-blank line is one
/// unnamed event; a trailing line without a newline is emitted at EOF.
pub fn ndjson_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let state = LineState {
        inner: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_complete_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.finished = true;
                    state.flush_tail();
                }
            }
        }
    });

    Box::pin(events)
}

#[derive(Deserialize)]
struct Discriminant {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// What a single WebSocket frame means to the event sequence.
#[derive(Debug)]
pub enum FrameOutcome {
    Event(RawEvent),
    /// Control frame or malformed payload
    Skip,
    /// The peer closed the connection
    Closed(Error),
}

/// Classify one WebSocket frame. The event kind is read from the JSON
/// payload's `type` field.
pub fn decode_frame(message: Message) -> FrameOutcome {
    let payload: Vec<u8> = match message {
        Message::Text(text) => text.as_str().as_bytes().to_vec(),
        Message::Binary(data) => data.to_vec(),
        Message::Close(frame) => {
            return FrameOutcome::Closed(match frame {
                Some(frame) => Error::closed(Some(u16::from(frame.code)), frame.reason.as_str()),
                None => Error::closed(None, "connection closed by peer"),
            });
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return FrameOutcome::Skip,
    };

    match serde_json::from_slice::<Discriminant>(&payload) {
        Ok(discriminant) => FrameOutcome::Event(RawEvent::new(discriminant.kind, payload)),
        Err(e) => {
            log::debug!("skipping malformed WebSocket frame: {}", e);
            FrameOutcome::Skip
        }
    }
}

/// Decode a stream of WebSocket frames. A close frame or read error ends the
/// sequence with a terminal `Err`.
pub fn websocket_events<S>(frames: S) -> EventStream
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Send + 'static,
{
    let events = frames.scan(false, |finished, frame| {
        if *finished {
            return futures::future::ready(None);
        }
        let next = match frame {
            Ok(message) => match decode_frame(message) {
                FrameOutcome::Event(event) => Some(Ok(event)),
                FrameOutcome::Skip => None,
                FrameOutcome::Closed(err) => {
                    *finished = true;
                    Some(Err(err))
                }
            },
            Err(e) => {
                *finished = true;
                Some(Err(Error::WebSocket(e)))
            }
        };
        futures::future::ready(Some(next))
    });

    Box::pin(events.filter_map(futures::future::ready))
}
