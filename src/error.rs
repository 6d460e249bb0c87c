//! Error types for the llm-wire client core

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket close code for a policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for data the peer cannot accept.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// WebSocket close code sent when a required extension was not negotiated.
pub const CLOSE_MANDATORY_EXTENSION: u16 = 1010;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Non-success HTTP status from the model server
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Error event reported by the provider inside the stream
    #[error("Provider error{}: {message}", code_suffix(.code))]
    Provider {
        message: String,
        code: Option<String>,
    },

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Persistent connection closed by the peer
    #[error("Connection closed{}: {reason}", close_suffix(.code))]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// WebSocket upgrade was rejected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// The caller cancelled the call
    #[error("Call cancelled")]
    Cancelled,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default()
}

fn close_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(" ({c})")).unwrap_or_default()
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error from an HTTP status and body
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a new provider-reported error
    pub fn provider(msg: impl Into<String>, code: Option<String>) -> Self {
        Error::Provider {
            message: msg.into(),
            code,
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a connection-closed error
    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether the error says the peer cannot speak the persistent-session
    /// protocol at all, as opposed to a transient network failure.
    ///
    /// These are the failures that trip the circuit breaker.
    pub fn is_protocol_incompatible(&self) -> bool {
        match self {
            Error::Handshake(_) => true,
            Error::ConnectionClosed { code: Some(code), .. } => matches!(
                *code,
                CLOSE_POLICY_VIOLATION | CLOSE_UNSUPPORTED_DATA | CLOSE_MANDATORY_EXTENSION
            ),
            Error::WebSocket(err) => match err {
                tungstenite::Error::Http(_) => true,
                tungstenite::Error::Protocol(protocol) => {
                    protocol.to_string().to_lowercase().contains("handshake")
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Machine-readable code for provider errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Provider { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
