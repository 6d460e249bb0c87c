//! Persistent per-conversation sessions.
//!
//! Turns that share a conversation key run on one connection, one at a time.
//! When a turn's input extends the previous turn's input, only the appended
//! suffix is sent together with the previous response id:
//!
//! ```text
//! turn 1: input [a, b]     -> send [a, b]
//! turn 2: input [a, b, c]  -> send [c], previous_response_id = resp_1
//! turn 3: input [a, x]     -> send [a, x]   (not an extension)
//! ```
//!
//! Any failure during a turn closes the connection and evicts the cached
//! entry, so the next turn starts over on a fresh connection (or on the
//! stateless transport if the breaker tripped in the meantime).

use crate::breaker::CircuitBreaker;
use crate::decoder::{FrameOutcome, RawEvent, decode_frame};
use crate::processor::{EventSource, PumpOutcome};
use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// One open persistent connection.
#[async_trait]
pub trait SessionConnection: Send {
    /// Send the request body of one turn.
    async fn send_turn(&mut self, body: Value) -> Result<()>;

    /// Next event of the current turn. `None` means the peer went away
    /// without a close frame.
    async fn next_event(&mut self) -> Option<Result<RawEvent>>;

    async fn close(&mut self);
}

/// Opens persistent connections.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SessionConnection>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector with bearer authentication.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    api_key: Option<String>,
    connect_timeout: Option<Duration>,
}

impl WsConnector {
    pub fn new(api_key: Option<String>, connect_timeout: Option<Duration>) -> Self {
        Self {
            api_key,
            connect_timeout,
        }
    }
}

fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => Error::handshake(format!(
            "server rejected the upgrade with HTTP {}",
            response.status()
        )),
        other => Error::WebSocket(other),
    }
}

#[async_trait]
impl SessionConnector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn SessionConnection>> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| Error::config(format!("invalid WebSocket URL {}: {}", endpoint, e)))?;

        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::config(format!("invalid API key header: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let connect = connect_async(request);
        let (ws, _) = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::timeout())?,
            None => connect.await,
        }
        .map_err(handshake_error)?;

        log::debug!("opened persistent session to {}", endpoint);
        Ok(Box::new(WsConnection { ws }))
    }
}

/// A WebSocket session connection.
pub struct WsConnection {
    ws: WsStream,
}

/// Wrap a request body into a `response.create` frame.
pub fn create_frame(body: Value) -> Value {
    let mut frame = json!({ "type": "response.create" });
    if let (Value::Object(frame), Value::Object(body)) = (&mut frame, body) {
        for (key, value) in body {
            if key != "stream" && key != "type" {
                frame.insert(key, value);
            }
        }
    }
    frame
}

#[async_trait]
impl SessionConnection for WsConnection {
    async fn send_turn(&mut self, body: Value) -> Result<()> {
        let frame = create_frame(body);
        self.ws.send(Frame::text(frame.to_string())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<RawEvent>> {
        loop {
            match self.ws.next().await? {
                Ok(message) => match decode_frame(message) {
                    FrameOutcome::Event(event) => return Some(Ok(event)),
                    FrameOutcome::Skip => continue,
                    FrameOutcome::Closed(err) => return Some(Err(err)),
                },
                Err(e) => return Some(Err(Error::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("error while closing session: {}", e);
        }
    }
}

/// Cached state of one conversation.
pub struct SessionState {
    pub connection: Box<dyn SessionConnection>,
    /// Input items sent so far, as the caller supplied them
    pub last_input: Vec<Message>,
    pub last_response_id: Option<String>,
    /// Identifies the turn in flight, if any
    pub turn_token: Option<String>,
    turns: u64,
}

impl SessionState {
    pub fn new(connection: Box<dyn SessionConnection>) -> Self {
        Self {
            connection,
            last_input: Vec::new(),
            last_response_id: None,
            turn_token: None,
            turns: 0,
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("last_input", &self.last_input.len())
            .field("last_response_id", &self.last_response_id)
            .field("turn_token", &self.turn_token)
            .finish_non_exhaustive()
    }
}

/// What to send for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPlan {
    /// Index of the first input item to send
    pub start: usize,
    pub previous_response_id: Option<String>,
}

impl TurnPlan {
    pub fn full() -> Self {
        Self {
            start: 0,
            previous_response_id: None,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.previous_response_id.is_some()
    }

    /// The items of `input` this plan sends.
    pub fn items<'a>(&self, input: &'a [Message]) -> &'a [Message] {
        input.get(self.start..).unwrap_or_default()
    }
}

/// Decide between a suffix continuation and a full send. A continuation
/// needs a previous response id and an input that strictly extends the
/// previous input in order.
pub fn plan_turn(last_input: &[Message], last_response_id: Option<&str>, input: &[Message]) -> TurnPlan {
    match last_response_id {
        Some(id)
            if !last_input.is_empty()
                && input.len() > last_input.len()
                && input.starts_with(last_input) =>
        {
            TurnPlan {
                start: last_input.len(),
                previous_response_id: Some(id.to_string()),
            }
        }
        _ => TurnPlan::full(),
    }
}

type Slot = Arc<Mutex<Option<SessionState>>>;

/// Exclusive access to one conversation's session for the length of a turn.
pub struct SessionTurn {
    key: String,
    endpoint: String,
    slot: Slot,
    guard: OwnedMutexGuard<Option<SessionState>>,
}

impl SessionTurn {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.guard.as_ref()
    }

    /// Plan the turn for `input` against the cached state.
    pub fn plan(&self, input: &[Message]) -> TurnPlan {
        match self.guard.as_ref() {
            Some(state) => plan_turn(&state.last_input, state.last_response_id.as_deref(), input),
            None => TurnPlan::full(),
        }
    }

    pub async fn send(&mut self, body: Value) -> Result<()> {
        let state = self
            .guard
            .as_mut()
            .ok_or_else(|| Error::closed(None, "session is not connected"))?;
        state.turns += 1;
        state.turn_token = Some(format!("{}#{}", self.key, state.turns));
        state.connection.send_turn(body).await
    }
}

impl std::fmt::Debug for SessionTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTurn")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint)
            .field("state", &self.guard.as_ref())
            .finish()
    }
}

#[async_trait]
impl EventSource for SessionTurn {
    async fn next_event(&mut self) -> Option<Result<RawEvent>> {
        match self.guard.as_mut() {
            Some(state) => state.connection.next_event().await,
            None => None,
        }
    }
}

/// Cache of persistent sessions keyed by conversation key.
pub struct SessionManager {
    sessions: DashMap<String, Slot>,
    connector: Arc<dyn SessionConnector>,
    breaker: Arc<CircuitBreaker>,
    cooldown: Duration,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        breaker: Arc<CircuitBreaker>,
        cooldown: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
            breaker,
            cooldown,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Lock the session for `key`, connecting on first use. Waits while
    /// another turn of the same conversation is in flight.
    ///
    /// A connect failure is recorded with the breaker and returned.
    pub async fn acquire(&self, key: &str, endpoint: &str) -> Result<SessionTurn> {
        let (slot, mut guard) = loop {
            let slot = self.sessions.entry(key.to_string()).or_default().clone();
            let guard = slot.clone().lock_owned().await;
            // The entry may have been evicted while we waited.
            let current = self
                .sessions
                .get(key)
                .map(|entry| Arc::ptr_eq(entry.value(), &slot))
                .unwrap_or(false);
            if current {
                break (slot, guard);
            }
        };

        if guard.is_none() {
            match self.connector.connect(endpoint).await {
                Ok(connection) => *guard = Some(SessionState::new(connection)),
                Err(err) => {
                    self.sessions
                        .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
                    if self.breaker.record_failure(endpoint, &err, self.cooldown) {
                        log::warn!("persistent session handshake to {} rejected: {}", endpoint, err);
                    }
                    return Err(err);
                }
            }
        }

        Ok(SessionTurn {
            key: key.to_string(),
            endpoint: endpoint.to_string(),
            slot,
            guard,
        })
    }

    /// Settle a finished turn and release the lock.
    ///
    /// A completed turn keeps the connection and records `input` and
    /// `response_id` for the next continuation. Anything else tears the
    /// session down.
    pub async fn complete(
        &self,
        mut turn: SessionTurn,
        outcome: PumpOutcome,
        input: Vec<Message>,
        response_id: Option<String>,
    ) {
        match outcome {
            PumpOutcome::Completed => {
                if let Some(state) = turn.guard.as_mut() {
                    state.last_input = input;
                    state.last_response_id = response_id;
                    state.turn_token = None;
                }
            }
            PumpOutcome::Failed { incompatible } => {
                if incompatible {
                    self.breaker.trip(&turn.endpoint, self.cooldown);
                }
                log::warn!("tearing down session {} after a failed turn", turn.key);
                self.teardown(&mut turn).await;
            }
            PumpOutcome::Cancelled => {
                log::warn!("tearing down session {} after cancellation", turn.key);
                self.teardown(&mut turn).await;
            }
        }
    }

    /// Close and evict the session behind `turn`. The next turn for the
    /// same key opens a fresh connection.
    pub async fn teardown(&self, turn: &mut SessionTurn) {
        if let Some(mut state) = turn.guard.take() {
            state.connection.close().await;
        }
        self.sessions
            .remove_if(&turn.key, |_, slot| Arc::ptr_eq(slot, &turn.slot));
    }

    /// Close every cached session.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for slot in slots {
            if let Some(mut state) = slot.lock().await.take() {
                state.connection.close().await;
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}
