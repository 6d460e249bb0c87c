//! Call lifecycle observer.
//!
//! The stream processor reports three lifecycle points to a single
//! [`Observer`] passed in explicitly:
//!
//! ```text
//! on_call_start(meta) -> token        once, before the first event is read
//! on_stream_delta(token, text)        for every non-empty text fragment
//! on_call_end(token, Ok | Err)        exactly once, however the stream ended
//! ```
//!
//! Persistence, cost accounting and metrics live behind this trait; the core
//! never depends on what an observer does with the notifications. Callbacks
//! run synchronously on the stream worker, so they should return quickly.
//!
//! # Example
//!
//! ```rust
//! use llm_wire::{CallMeta, CallSummary, CallToken, Error, Observer};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct Counter {
//!     next: AtomicU64,
//! }
//!
//! impl Observer for Counter {
//!     fn on_call_start(&self, meta: &CallMeta) -> CallToken {
//!         println!("calling {} via {}", meta.model, meta.endpoint);
//!         CallToken::new(self.next.fetch_add(1, Ordering::SeqCst))
//!     }
//!
//!     fn on_call_end(&self, token: CallToken, outcome: Result<&CallSummary, &Error>) {
//!         println!("call {} ended ok={}", token.id(), outcome.is_ok());
//!     }
//! }
//! ```

use crate::Error;
use crate::types::{GenerateResponse, Usage};

/// Describes a call as it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMeta {
    pub model: String,
    /// Endpoint URL the call is sent to
    pub endpoint: String,
    /// Dialect name, e.g. `chat_completions`
    pub dialect: String,
    pub conversation_key: Option<String>,
    /// Whether the call runs on a persistent session
    pub persistent: bool,
}

/// Opaque handle linking the end of a call to its start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallToken(u64);

impl CallToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Best known outcome of a finished call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSummary {
    pub model: String,
    pub usage: Option<Usage>,
    pub response_id: Option<String>,
    /// Last response delivered to the caller, if any
    pub response: Option<GenerateResponse>,
}

/// Lifecycle notifications for one call. Every method has a no-op default.
pub trait Observer: Send + Sync {
    fn on_call_start(&self, _meta: &CallMeta) -> CallToken {
        CallToken::default()
    }

    fn on_stream_delta(&self, _token: CallToken, _text: &str) {}

    fn on_call_end(&self, _token: CallToken, _outcome: Result<&CallSummary, &Error>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
