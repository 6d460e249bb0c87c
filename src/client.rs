//! Client: transport selection and call lifecycle
//!
//! The client turns one [`GenerateRequest`] into one [`ResponseStream`]. It
//! picks a transport per call, starts a [`StreamProcessor`] and hands both to
//! a background worker.
//!
//! # Transport Selection
//!
//! ```text
//! stream(request)
//!     │
//!     ├─ conversation_key set? websocket_url configured?
//!     │  dialect continues sessions? breaker closed for the endpoint?
//!     │       │
//!     │       ├─ yes ─> SessionManager::acquire(key)
//!     │       │            │
//!     │       │            ├─ connected ─> plan turn (suffix + previous id)
//!     │       │            │               send ─> pump(require_terminal)
//!     │       │            │               complete(turn, outcome)
//!     │       │            │
//!     │       │            └─ connect/send failed ─> stateless
//!     │       │
//!     │       └─ no ──> stateless
//!     │
//!     └─ stateless: POST (retried through the backoff advisor, if any)
//!                   pump until terminal event or end of body
//! ```
//!
//! A failure after the first event has been delivered is terminal for that
//! call and never retried, whatever the transport.
//!
//! # Example
//!
//! ```rust,no_run
//! use llm_wire::{Client, ClientConfig, GenerateRequest, Message, Provider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::for_provider(Provider::Ollama)
//!     .model("qwen2.5:7b")
//!     .build()?;
//! let client = Client::new(config)?;
//!
//! let response = client
//!     .generate(GenerateRequest::new(vec![Message::user("Hello!")]))
//!     .await?;
//! println!("{}", response.text().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use crate::breaker::CircuitBreaker;
use crate::config::ClientConfig;
use crate::decoder::EventStream;
use crate::dialect::{Continuation, Dialect};
use crate::observer::CallMeta;
use crate::processor::{self, PumpOutcome, ResponseStream, StreamProcessor, WorkerOptions};
use crate::retry::retry_with_advisor;
use crate::session::{SessionManager, WsConnector};
use crate::transport::HttpTransport;
use crate::types::{GenerateRequest, GenerateResponse};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Streaming client for one provider endpoint.
///
/// Cheap to clone: clones share the HTTP connection pool and the session
/// cache.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    transport: HttpTransport,
    dialect: Arc<dyn Dialect>,
    sessions: Arc<SessionManager>,
}

impl Client {
    /// Create a client from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.framing,
            config.timeout_duration(),
        )?;

        let connector = match &config.session_connector {
            Some(connector) => connector.clone(),
            None => Arc::new(WsConnector::new(
                config.api_key.clone(),
                Some(config.timeout_duration()),
            )),
        };
        let breaker = config
            .breaker
            .clone()
            .unwrap_or_else(CircuitBreaker::global);
        let sessions = Arc::new(SessionManager::new(connector, breaker, config.cooldown()));

        Ok(Self {
            dialect: config.dialect.build(),
            config,
            transport,
            sessions,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.sessions.breaker()
    }

    /// Start a call and return its event stream.
    ///
    /// Errors that happen before the stream opens (invalid input, a
    /// rejected HTTP request) are returned here. Everything after that is
    /// delivered as the stream's last event.
    pub async fn stream(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream> {
        let model = self.model_for(&request);

        if let Some((key, endpoint)) = self.session_route(&request) {
            if let Some(stream) = self
                .stream_session(&request, &model, key, endpoint, cancel.clone())
                .await?
            {
                return Ok(stream);
            }
        }

        self.stream_stateless(&request, &model, cancel).await
    }

    /// Run a call to completion and merge its responses.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        self.stream(request, CancellationToken::new())
            .await?
            .collect_response()
            .await
    }

    /// Close every cached persistent session.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    fn model_for(&self, request: &GenerateRequest) -> String {
        if request.model.is_empty() {
            self.config.model.clone()
        } else {
            request.model.clone()
        }
    }

    /// Conversation key and endpoint, when this call may use a session.
    fn session_route<'a>(&'a self, request: &'a GenerateRequest) -> Option<(&'a str, &'a str)> {
        let key = request.conversation_key.as_deref().filter(|k| !k.is_empty())?;
        let endpoint = self.config.websocket_url.as_deref()?;
        if !self.dialect.supports_sessions() {
            return None;
        }
        if self.breaker().is_open(endpoint) {
            log::debug!(
                "persistent sessions disabled for {}, using stateless transport",
                endpoint
            );
            return None;
        }
        Some((key, endpoint))
    }

    fn worker_options(&self, cancel: CancellationToken, require_terminal: bool) -> WorkerOptions {
        WorkerOptions {
            read_timeout: self.config.read_timeout_duration(),
            cancel,
            require_terminal,
        }
    }

    fn start_call(&self, meta: &CallMeta) -> StreamProcessor {
        StreamProcessor::new(
            self.dialect.clone(),
            self.config.observer.clone(),
            self.config.usage_listener.clone(),
            meta,
        )
    }

    /// Run the call on the conversation's session. `Ok(None)` means the
    /// session could not be used and the call should go stateless.
    async fn stream_session(
        &self,
        request: &GenerateRequest,
        model: &str,
        key: &str,
        endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<Option<ResponseStream>> {
        let meta = CallMeta {
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            dialect: self.dialect.name().to_string(),
            conversation_key: Some(key.to_string()),
            persistent: true,
        };

        // Waiting behind another turn of the same conversation is cancellable.
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            acquired = self.sessions.acquire(key, endpoint) => acquired,
        };

        let mut turn = match acquired {
            Ok(turn) => turn,
            Err(Error::Cancelled) => {
                self.start_call(&meta).abort(&Error::Cancelled);
                return Err(Error::Cancelled);
            }
            Err(err) => {
                log::debug!(
                    "persistent session for {} unavailable ({}), using stateless transport",
                    key,
                    err
                );
                return Ok(None);
            }
        };

        let plan = turn.plan(&request.messages);
        let input = Continuation {
            items: plan.items(&request.messages),
            previous_response_id: plan.previous_response_id.as_deref(),
        };
        // Dropping the turn releases the lock and keeps the session.
        let body = self.dialect.encode_request(request, model, input, true)?;

        if plan.is_incremental() {
            log::debug!(
                "continuing session {} with {} new item(s)",
                key,
                input.items.len()
            );
        }

        if let Err(err) = turn.send(body).await {
            log::debug!(
                "sending turn on session {} failed ({}), using stateless transport",
                key,
                err
            );
            let incompatible = err.is_protocol_incompatible();
            self.sessions
                .complete(turn, PumpOutcome::Failed { incompatible }, Vec::new(), None)
                .await;
            return Ok(None);
        }

        let mut processor = self.start_call(&meta);
        let options = self.worker_options(cancel, true);
        let (tx, stream) = processor::channel(self.config.channel_capacity);
        let sessions = self.sessions.clone();
        let sent_input = request.messages.clone();

        tokio::spawn(async move {
            let outcome = processor::pump(&mut processor, &mut turn, &tx, &options).await;
            drop(tx);
            log::debug!("session turn finished: {:?}", outcome);
            let response_id = processor.response_id().map(str::to_string);
            sessions.complete(turn, outcome, sent_input, response_id).await;
        });

        Ok(Some(stream))
    }

    async fn stream_stateless(
        &self,
        request: &GenerateRequest,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<ResponseStream> {
        let body =
            self.dialect
                .encode_request(request, model, Continuation::full(&request.messages), true)?;
        let path = self.dialect.endpoint_path();

        let meta = CallMeta {
            model: model.to_string(),
            endpoint: self.transport.endpoint(path),
            dialect: self.dialect.name().to_string(),
            conversation_key: request.conversation_key.clone(),
            persistent: false,
        };
        let mut processor = self.start_call(&meta);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            opened = self.open(path, &body) => opened,
        };

        match opened {
            Ok(events) => Ok(processor::spawn(
                processor,
                events,
                self.worker_options(cancel, false),
                self.config.channel_capacity,
            )),
            Err(err) => {
                processor.abort(&err);
                Err(err)
            }
        }
    }

    async fn open(&self, path: &str, body: &serde_json::Value) -> Result<EventStream> {
        match &self.config.retry {
            Some(retry) => retry_with_advisor(retry, || self.transport.open(path, body)).await,
            None => self.transport.open(path, body).await,
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("dialect", &self.dialect.name())
            .field("sessions", &self.sessions)
            .finish()
    }
}
