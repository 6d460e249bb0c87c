//! # llm-wire
//!
//! Streaming client core for heterogeneous LLM wire protocols.
//!
//! ## Overview
//!
//! Model servers stream their answers in many shapes: Server-Sent Events,
//! newline-delimited JSON, WebSocket frames; inline tool-call fragments or
//! an item lifecycle; usage on every chunk or in a trailer. This crate turns
//! all of them into one ordered sequence of [`StreamEvent`]s carrying
//! canonical [`GenerateResponse`]s.
//!
//! ## Key Features
//!
//! - **Finalized output only**: a choice is surfaced once its finish signal
//!   arrives, never while it is still receiving deltas
//! - **Tool-call assembly**: argument fragments are concatenated in arrival
//!   order and parsed once, with de-duplication across the incremental and
//!   snapshot paths
//! - **Exactly-once usage**: a usage listener hears about each call once,
//!   with the latest cumulative figure
//! - **Persistent sessions**: turns of one conversation share a WebSocket
//!   connection and send only the unseen suffix of their input
//! - **Circuit breaker**: endpoints that reject the session protocol fall
//!   back to stateless HTTP for a cooling-off period
//! - **Backpressure and cancellation**: a bounded queue between the worker
//!   and the caller, and a `CancellationToken` per call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_wire::{Client, ClientConfig, GenerateRequest, Message, StreamEvent};
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .model("qwen2.5-32b-instruct")
//!         .base_url("http://localhost:1234/v1")
//!         .build()?;
//!     let client = Client::new(config)?;
//!
//!     let request = GenerateRequest::new(vec![Message::user("What's the capital of France?")]);
//!     let mut stream = client.stream(request, CancellationToken::new()).await?;
//!
//!     while let Some(event) = stream.next().await {
//!         match event {
//!             StreamEvent::Response(response) => {
//!                 println!("{}", response.text().unwrap_or_default());
//!             }
//!             StreamEvent::Error(err) => eprintln!("call failed: {}", err),
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **decoder**: SSE, NDJSON and WebSocket framing into `RawEvent`s
//! - **dialect**, **chat**, **responses**: classification of raw events into
//!   one tagged union, and request encoding
//! - **aggregator**, **assembler**: per-choice and per-item accumulation
//! - **processor**: the per-call state machine and its background worker
//! - **usage**, **observer**: the narrow callback boundaries
//! - **session**, **breaker**, **transport**, **client**: transport selection
//! - **config**, **error**, **retry**: configuration, errors and backoff

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// These modules are private (internal implementation details) unless explicitly
// re-exported through `pub use` statements below.

/// Delta aggregation for inline tool-call fragments and choice text.
mod aggregator;

/// Item-keyed tool-call assembly and snapshot de-duplication.
mod assembler;

/// Per-endpoint circuit breaker guarding the persistent-session path.
mod breaker;

/// Chat-completions dialect.
mod chat;

/// Top-level client: transport selection, `stream()` and `generate()`.
mod client;

/// Client configuration, provider presets and environment resolution.
mod config;

/// SSE, NDJSON and WebSocket event decoding.
mod decoder;

/// The tagged union every dialect classifies into, and the dialect seam.
mod dialect;

/// Error types and conversions.
/// Defines the `Error` enum and `Result<T>` type alias used across all public APIs.
mod error;

/// Call lifecycle notifications.
mod observer;

/// The stream processor state machine, its worker and the response stream.
mod processor;

/// Responses (item lifecycle) dialect.
mod responses;

/// Persistent per-conversation sessions.
mod session;

/// Stateless HTTP transport.
mod transport;

/// Canonical request and response types.
mod types;

/// Exactly-once usage publication.
mod usage;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
/// Public as a module so callers can reuse the backoff policy for their own
/// operations.
pub mod retry;

// --- Client ---

pub use client::Client;

// --- Configuration ---

pub use config::{
    ClientConfig, ClientConfigBuilder, ENV_API_KEY, ENV_BASE_URL, ENV_MODEL, Provider,
    get_api_key, get_base_url, get_model,
};

// --- Errors ---

pub use error::{
    CLOSE_MANDATORY_EXTENSION, CLOSE_POLICY_VIOLATION, CLOSE_UNSUPPORTED_DATA, Error, Result,
};

// --- Canonical Types ---

pub use types::{
    Choice, GenerateRequest, GenerateResponse, Message, MessageRole, StreamEvent, ToolArguments,
    ToolCall, ToolSpec, Usage,
};

// --- Decoding and Dialects ---

pub use chat::ChatCompletions;
pub use decoder::{
    DONE_SENTINEL, EventStream, FrameOutcome, Framing, RawEvent, decode, decode_frame,
    ndjson_events, sse_events, websocket_events,
};
pub use dialect::{
    ChoiceDelta, Continuation, Dialect, DialectKind, ProviderFailure, StreamChunk,
    ToolCallFragment,
};
pub use responses::Responses;

// --- Stream Processing ---

pub use aggregator::{ChoiceAccumulator, DeltaAggregator, ToolCallAccumulator};
pub use assembler::ToolCallAssembler;
pub use processor::{
    DEFAULT_CHANNEL_CAPACITY, EventSource, PumpOutcome, ResponseStream, StreamProcessor,
    StreamState, WorkerOptions, channel, pump, spawn,
};

// --- Boundaries ---

pub use observer::{CallMeta, CallSummary, CallToken, NoopObserver, Observer};
pub use usage::{UsageListener, UsagePublisher};

// --- Sessions and Transports ---

pub use breaker::{CircuitBreaker, DEFAULT_COOLDOWN, normalize_endpoint};
pub use session::{
    SessionConnection, SessionConnector, SessionManager, SessionState, SessionTurn, TurnPlan,
    WsConnection, WsConnector, create_frame, plan_turn,
};
pub use transport::HttpTransport;

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types.
/// Import with `use llm_wire::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, Error, GenerateRequest, GenerateResponse, Message, Observer,
        Provider, ResponseStream, Result, StreamEvent, ToolCall, ToolSpec, Usage, UsageListener,
    };
}
