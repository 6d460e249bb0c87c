//! Stream processor: the per-call state machine, its background worker and
//! the caller-facing [`ResponseStream`].
//!
//! # Complete Flow
//!
//! ```text
//! transport bytes / frames
//!     │
//!     │ decoder (SSE / NDJSON / WebSocket)
//!     ▼
//! RawEvent
//!     │
//!     │ Dialect::classify
//!     ▼
//! StreamChunk ──► StreamProcessor::handle ──► Vec<StreamEvent>
//!                                                 │
//!                                                 │ bounded mpsc (backpressure)
//!                                                 ▼
//!                                           ResponseStream
//! ```
//!
//! # States
//!
//! A call is `OPEN` until one of these happens, then `ENDED`:
//!
//! - a snapshot carrying choices, or a completed event, is handled
//! - the provider reports an error
//! - the transport fails, times out, or the caller cancels
//! - the decoder is exhausted (finalize-on-close)
//!
//! The end of a call is reported to the [`Observer`] and the usage listener
//! exactly once, whichever of these paths is taken first.

use crate::aggregator::DeltaAggregator;
use crate::assembler::ToolCallAssembler;
use crate::decoder::{EventStream, RawEvent};
use crate::dialect::{Dialect, StreamChunk};
use crate::observer::{CallMeta, CallSummary, CallToken, Observer};
use crate::types::{Choice, GenerateResponse, Message, StreamEvent, Usage};
use crate::usage::{UsageListener, UsagePublisher};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default capacity of the delivery queue between worker and caller.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Mutable per-call state. Owned by exactly one processor, never shared.
#[derive(Debug, Default)]
pub struct StreamState {
    aggregator: DeltaAggregator,
    assembler: ToolCallAssembler,
    model: String,
    response_id: Option<String>,
    /// Latest cumulative usage seen so far
    usage: Option<Usage>,
    /// Last response handed to the caller
    last_response: Option<GenerateResponse>,
    publisher: UsagePublisher,
    ended: bool,
    failed: bool,
}

impl StreamState {
    fn note_model(&mut self, model: Option<&str>) {
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            self.model = model.to_string();
        }
    }

    fn note_response_id(&mut self, id: Option<&str>) {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            self.response_id = Some(id.to_string());
        }
    }

    fn note_usage(&mut self, usage: Option<Usage>) {
        if let Some(usage) = usage.filter(|u| !u.is_empty()) {
            self.usage = Some(usage);
        }
    }

    fn response(&self, choices: Vec<Choice>) -> GenerateResponse {
        GenerateResponse {
            choices,
            usage: self.usage,
            model: self.model.clone(),
            response_id: self.response_id.clone(),
        }
    }
}

/// Turns classified events of one call into [`StreamEvent`]s.
pub struct StreamProcessor {
    dialect: Arc<dyn Dialect>,
    observer: Arc<dyn Observer>,
    token: CallToken,
    state: StreamState,
}

impl StreamProcessor {
    /// Start a call. The observer's `on_call_start` runs here.
    pub fn new(
        dialect: Arc<dyn Dialect>,
        observer: Arc<dyn Observer>,
        usage_listener: Option<Arc<dyn UsageListener>>,
        meta: &CallMeta,
    ) -> Self {
        let token = observer.on_call_start(meta);
        let state = StreamState {
            model: meta.model.clone(),
            publisher: UsagePublisher::new(usage_listener),
            ..Default::default()
        };
        Self {
            dialect,
            observer,
            token,
            state,
        }
    }

    pub fn token(&self) -> CallToken {
        self.token
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended
    }

    /// Ended through an error rather than a clean terminal event.
    pub fn is_failed(&self) -> bool {
        self.state.failed
    }

    pub fn model(&self) -> &str {
        &self.state.model
    }

    pub fn response_id(&self) -> Option<&str> {
        self.state.response_id.as_deref()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.state.usage
    }

    /// Classify and handle one raw event. Events that fail classification
    /// are skipped.
    pub fn process(&mut self, event: &RawEvent) -> Vec<StreamEvent> {
        if self.state.ended {
            return Vec::new();
        }
        match self.dialect.classify(event) {
            Ok(chunk) => self.handle(chunk),
            Err(e) => {
                log::debug!(
                    "{}: skipping event {:?} that failed to classify: {}",
                    self.dialect.name(),
                    event.kind,
                    e
                );
                Vec::new()
            }
        }
    }

    /// Advance the state machine by one classified chunk.
    pub fn handle(&mut self, chunk: StreamChunk) -> Vec<StreamEvent> {
        if self.state.ended {
            return Vec::new();
        }

        match chunk {
            StreamChunk::Started { model, response_id } => {
                self.state.note_model(model.as_deref());
                self.state.note_response_id(response_id.as_deref());
                Vec::new()
            }
            StreamChunk::Delta {
                model,
                response_id,
                choices,
                usage,
            } => {
                self.state.note_model(model.as_deref());
                self.state.note_response_id(response_id.as_deref());
                self.state.note_usage(usage);

                let mut finalized = Vec::new();
                for delta in choices {
                    if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
                        self.observer.on_stream_delta(self.token, text);
                    }
                    self.state.aggregator.update_delta(
                        delta.index,
                        delta.content.as_deref(),
                        &delta.tool_calls,
                    );
                    if let Some(reason) = delta.finish_reason.as_deref() {
                        finalized.push(self.state.aggregator.finalize_choice(delta.index, reason));
                    }
                }

                if finalized.is_empty() {
                    return Vec::new();
                }
                let response = self.state.response(finalized);
                vec![self.emit(response)]
            }
            StreamChunk::ItemAdded {
                item_id,
                call_id,
                name,
            } => {
                self.state
                    .assembler
                    .item_added(&item_id, call_id.as_deref(), name.as_deref());
                Vec::new()
            }
            StreamChunk::ArgumentsDelta { item_id, delta } => {
                self.state.assembler.arguments_delta(&item_id, &delta);
                Vec::new()
            }
            StreamChunk::ItemDone {
                item_id,
                call_id,
                name,
                arguments,
            } => {
                let call = self.state.assembler.item_done(
                    &item_id,
                    call_id.as_deref(),
                    name.as_deref(),
                    arguments.as_deref(),
                );
                let choice = Choice::new(
                    0,
                    Message::assistant_tool_calls("", vec![call]),
                    Some("tool_calls".to_string()),
                );
                let response = self.state.response(vec![choice]);
                vec![self.emit(response)]
            }
            StreamChunk::Snapshot(snapshot) => self.snapshot(snapshot, false),
            StreamChunk::Completed(snapshot) => self.snapshot(snapshot, true),
            StreamChunk::Failed(failure) => {
                let err = Error::provider(failure.message, failure.code);
                self.end_with_error(&err);
                vec![StreamEvent::Error(err)]
            }
            StreamChunk::Ignored => {
                log::trace!("{}: ignoring event", self.dialect.name());
                Vec::new()
            }
        }
    }

    fn snapshot(&mut self, mut snapshot: GenerateResponse, terminal: bool) -> Vec<StreamEvent> {
        self.state.note_model(Some(snapshot.model.as_str()));
        self.state.note_response_id(snapshot.response_id.as_deref());
        self.state.note_usage(snapshot.usage);

        let mut events = Vec::new();
        if snapshot.choices.is_empty() {
            // Usage-only trailer: never surface empty choices.
            if snapshot.usage.is_some_and(|u| !u.is_empty()) {
                events.extend(self.reemit_with_usage());
            }
            if terminal {
                self.end_ok();
            }
            return events;
        }

        let removed = self.state.assembler.filter_snapshot(&mut snapshot);
        if removed > 0 {
            log::debug!("suppressed {} tool call(s) already emitted", removed);
        }
        self.state.aggregator.clear();

        if !snapshot.choices.is_empty() {
            let response = self.state.response(snapshot.choices);
            events.push(self.emit(response));
        }
        self.end_ok();
        events
    }

    fn reemit_with_usage(&mut self) -> Option<StreamEvent> {
        let usage = self.state.usage;
        let last = self.state.last_response.as_mut()?;
        last.usage = usage;
        Some(StreamEvent::Response(last.clone()))
    }

    fn emit(&mut self, response: GenerateResponse) -> StreamEvent {
        self.state.last_response = Some(response.clone());
        StreamEvent::Response(response)
    }

    fn summary(&self) -> CallSummary {
        CallSummary {
            model: self.state.model.clone(),
            usage: self.state.usage,
            response_id: self.state.response_id.clone(),
            response: self.state.last_response.clone(),
        }
    }

    fn end_ok(&mut self) {
        if self.state.ended {
            return;
        }
        self.state.ended = true;
        self.state
            .publisher
            .publish_once(&self.state.model, self.state.usage.as_ref());
        let summary = self.summary();
        self.observer.on_call_end(self.token, Ok(&summary));
    }

    fn end_with_error(&mut self, err: &Error) {
        if self.state.ended {
            return;
        }
        self.state.ended = true;
        self.state.failed = true;
        self.state
            .publisher
            .publish_once(&self.state.model, self.state.usage.as_ref());
        self.observer.on_call_end(self.token, Err(err));
    }

    /// End the call with a transport-level error. Returns the event to
    /// deliver, or `None` when a terminal event already closed the call.
    pub fn fail(&mut self, err: Error) -> Option<StreamEvent> {
        if self.state.ended {
            log::debug!("ignoring error after terminal event: {}", err);
            return None;
        }
        self.end_with_error(&err);
        Some(StreamEvent::Error(err))
    }

    /// Report a failure that happened before the stream opened. The error
    /// goes back to the caller directly, not through the queue.
    pub fn abort(&mut self, err: &Error) {
        self.end_with_error(err);
    }

    /// Finalize-on-close: close the call with the best known state if no
    /// terminal event did.
    pub fn finish(&mut self) {
        self.end_ok();
    }
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("dialect", &self.dialect.name())
            .field("token", &self.token)
            .field("state", &self.state)
            .finish()
    }
}

/// Pull-based source of raw events for the worker.
#[async_trait]
pub trait EventSource: Send {
    /// `None` is a clean end of the sequence.
    async fn next_event(&mut self) -> Option<Result<RawEvent>>;
}

#[async_trait]
impl EventSource for EventStream {
    async fn next_event(&mut self) -> Option<Result<RawEvent>> {
        self.next().await
    }
}

/// Worker settings for one call.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Idle time allowed between two events
    pub read_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    /// The source ending before a terminal event is an error (persistent
    /// sessions) rather than a clean close (stateless bodies)
    pub require_terminal: bool,
}

/// How the worker left the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Terminal event or clean end of stream
    Completed,
    /// Transport, protocol or provider error
    Failed { incompatible: bool },
    /// Cancelled by the caller or the receiver went away
    Cancelled,
}

async fn read_next<S>(source: &mut S, read_timeout: Option<Duration>) -> Option<Result<RawEvent>>
where
    S: EventSource + ?Sized,
{
    match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, source.next_event()).await {
            Ok(next) => next,
            Err(_) => Some(Err(Error::timeout())),
        },
        None => source.next_event().await,
    }
}

async fn deliver(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Read `source` until the call ends, pushing events into `tx` in decode
/// order. Blocks when the queue is full.
pub async fn pump<S>(
    processor: &mut StreamProcessor,
    source: &mut S,
    tx: &mpsc::Sender<StreamEvent>,
    options: &WorkerOptions,
) -> PumpOutcome
where
    S: EventSource + ?Sized,
{
    let cancel = &options.cancel;

    while !processor.is_ended() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = read_next(source, options.read_timeout) => Some(next),
        };

        let Some(next) = next else {
            return cancelled(processor, tx).await;
        };

        match next {
            Some(Ok(event)) => {
                for out in processor.process(&event) {
                    if !deliver(tx, cancel, out).await {
                        return cancelled(processor, tx).await;
                    }
                }
            }
            Some(Err(err)) => {
                let incompatible = err.is_protocol_incompatible();
                if let Some(out) = processor.fail(err) {
                    let _ = tx.send(out).await;
                }
                return PumpOutcome::Failed { incompatible };
            }
            None if options.require_terminal => {
                let err = Error::closed(None, "connection closed before the response completed");
                if let Some(out) = processor.fail(err) {
                    let _ = tx.send(out).await;
                }
                return PumpOutcome::Failed {
                    incompatible: false,
                };
            }
            None => processor.finish(),
        }
    }

    if processor.is_failed() {
        PumpOutcome::Failed {
            incompatible: false,
        }
    } else {
        PumpOutcome::Completed
    }
}

// The terminal error waits for queue space; it is only lost when the
// receiver is gone.
async fn cancelled(processor: &mut StreamProcessor, tx: &mpsc::Sender<StreamEvent>) -> PumpOutcome {
    if let Some(out) = processor.fail(Error::Cancelled) {
        let _ = tx.send(out).await;
    }
    PumpOutcome::Cancelled
}

/// Create the bounded delivery queue for one call.
pub fn channel(capacity: usize) -> (mpsc::Sender<StreamEvent>, ResponseStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ResponseStream::new(rx))
}

/// Run a stateless call on a background task. The connection behind
/// `events` is released when the task ends.
pub fn spawn(
    mut processor: StreamProcessor,
    mut events: EventStream,
    options: WorkerOptions,
    capacity: usize,
) -> ResponseStream {
    let (tx, stream) = channel(capacity);
    tokio::spawn(async move {
        let outcome = pump(&mut processor, &mut events, &tx, &options).await;
        log::debug!("stream worker finished: {:?}", outcome);
    });
    stream
}

/// Ordered events of one call, as delivered by its worker.
///
/// The stream ends after the terminal event. At most one
/// [`StreamEvent::Error`] is ever delivered and it is always last.
pub struct ResponseStream {
    inner: ReceiverStream<StreamEvent>,
}

impl ResponseStream {
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Drain the stream into one response.
    ///
    /// Responses are merged by choice index. A re-delivery of the previous
    /// response (a usage trailer) only updates usage. The terminal error, if
    /// any, is returned instead of a partial response.
    pub async fn collect_response(mut self) -> Result<GenerateResponse> {
        let mut merged: Option<GenerateResponse> = None;
        let mut previous: Option<Vec<Choice>> = None;

        while let Some(event) = self.next().await {
            let response = event.into_result()?;

            if previous.as_ref() == Some(&response.choices) {
                if let Some(merged) = merged.as_mut() {
                    if response.usage.is_some() {
                        merged.usage = response.usage;
                    }
                }
                continue;
            }

            previous = Some(response.choices.clone());
            match merged.as_mut() {
                Some(merged) => merged.merge(response),
                None => merged = Some(response),
            }
        }

        merged.ok_or_else(|| Error::stream("stream ended without a response"))
    }
}

impl Stream for ResponseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}
