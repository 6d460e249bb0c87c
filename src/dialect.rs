//! Normalized event kinds and the dialect seam.
//!
//! Every provider-specific event shape is classified into one [`StreamChunk`]
//! variant before the stream processor sees it, so the processor's state
//! machine is a single exhaustive `match` instead of a chain of best-effort
//! unmarshal attempts.

use crate::decoder::RawEvent;
use crate::types::{GenerateRequest, GenerateResponse, Message, Usage};
use crate::{Result, chat::ChatCompletions, responses::Responses};
use std::sync::Arc;

/// One inline tool-call fragment inside a choice delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    /// Position of the call within the choice, when the provider sends one
    pub index: Option<u32>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Incremental update for one choice/candidate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceDelta {
    pub index: u32,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
}

/// Human-readable message plus machine code of a provider-reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub message: String,
    pub code: Option<String>,
}

/// A decoded event, classified by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Call metadata announced before any content
    Started {
        model: Option<String>,
        response_id: Option<String>,
    },
    /// Per-choice deltas; `usage` is the cumulative figure when present
    Delta {
        model: Option<String>,
        response_id: Option<String>,
        choices: Vec<ChoiceDelta>,
        usage: Option<Usage>,
    },
    /// A tool call item opened (keyed by the provider's item id)
    ItemAdded {
        item_id: String,
        call_id: Option<String>,
        name: Option<String>,
    },
    /// Argument fragment for an open tool call item
    ArgumentsDelta { item_id: String, delta: String },
    /// A tool call item is complete
    ItemDone {
        item_id: String,
        call_id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Non-delta object carrying full choices and/or usage. Ends the call
    /// only when it carries choices.
    Snapshot(GenerateResponse),
    /// Terminal snapshot: ends the call even when it carries no choices
    Completed(GenerateResponse),
    /// Explicit error or failed-status event
    Failed(ProviderFailure),
    /// Unknown or irrelevant kind
    Ignored,
}

/// Input for one request: the items to send and, when continuing a
/// persistent session, the response they follow.
#[derive(Debug, Clone, Copy)]
pub struct Continuation<'a> {
    pub items: &'a [Message],
    pub previous_response_id: Option<&'a str>,
}

impl<'a> Continuation<'a> {
    /// Full input, no server-side context reused
    pub fn full(items: &'a [Message]) -> Self {
        Self {
            items,
            previous_response_id: None,
        }
    }
}

/// A provider wire dialect: how events are classified and how requests are
/// encoded.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classify one raw event. An `Err` is a local decode error: the
    /// processor logs it and skips the event.
    fn classify(&self, event: &RawEvent) -> Result<StreamChunk>;

    /// Encode the request body for this dialect.
    fn encode_request(
        &self,
        request: &GenerateRequest,
        model: &str,
        input: Continuation<'_>,
        stream: bool,
    ) -> Result<serde_json::Value>;

    /// Path of the stateless endpoint, relative to the base URL.
    fn endpoint_path(&self) -> &'static str;

    /// Whether turns can continue from a previous response id over a
    /// persistent session.
    fn supports_sessions(&self) -> bool {
        false
    }
}

/// Built-in dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialectKind {
    #[default]
    ChatCompletions,
    Responses,
}

impl DialectKind {
    pub fn build(&self) -> Arc<dyn Dialect> {
        match self {
            DialectKind::ChatCompletions => Arc::new(ChatCompletions),
            DialectKind::Responses => Arc::new(Responses),
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" | "chat_completions" | "chat-completions" => Some(DialectKind::ChatCompletions),
            "responses" => Some(DialectKind::Responses),
            _ => None,
        }
    }
}
