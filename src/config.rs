//! Client configuration, provider shortcuts and environment resolution

use crate::breaker::{CircuitBreaker, DEFAULT_COOLDOWN};
use crate::decoder::Framing;
use crate::dialect::DialectKind;
use crate::observer::{NoopObserver, Observer};
use crate::processor::DEFAULT_CHANNEL_CAPACITY;
use crate::retry::RetryConfig;
use crate::session::SessionConnector;
use crate::usage::UsageListener;
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the base URL
pub const ENV_BASE_URL: &str = "LLM_WIRE_BASE_URL";
/// Environment variable overriding the model
pub const ENV_MODEL: &str = "LLM_WIRE_MODEL";
/// Environment variable holding the API key
pub const ENV_API_KEY: &str = "LLM_WIRE_API_KEY";

/// Supported provider shortcuts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl Provider {
    /// Get the default base URL for this provider
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }

    /// Persistent-session endpoint, for providers that offer one
    pub fn websocket_url(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAI => Some("wss://api.openai.com/v1/responses"),
            _ => None,
        }
    }

    pub fn default_dialect(&self) -> DialectKind {
        match self {
            Provider::OpenAI => DialectKind::Responses,
            _ => DialectKind::ChatCompletions,
        }
    }

    /// Parse a provider from a string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "open-ai" => Some(Provider::OpenAI),
            "lmstudio" | "lm-studio" | "lm_studio" => Some(Provider::LMStudio),
            "ollama" => Some(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Some(Provider::LlamaCpp),
            "vllm" => Some(Provider::VLLM),
            _ => None,
        }
    }
}

fn resolve_base_url(
    from_env: Option<String>,
    provider: Option<Provider>,
    fallback: Option<&str>,
) -> String {
    if let Some(url) = from_env.filter(|u| !u.is_empty()) {
        return url;
    }
    if let Some(p) = provider {
        return p.default_url().to_string();
    }
    fallback
        .unwrap_or(Provider::LMStudio.default_url())
        .to_string()
}

/// Get the base URL from environment variable or provider default
///
/// Priority:
/// 1. `LLM_WIRE_BASE_URL` environment variable
/// 2. Provider default URL (if provider is Some)
/// 3. fallback parameter, then the LM Studio default
///
/// # Examples
///
/// ```rust,no_run
/// use llm_wire::{get_base_url, Provider};
///
/// let url = get_base_url(None, None);
/// let url = get_base_url(Some(Provider::Ollama), None);
/// let url = get_base_url(None, Some("http://localhost:1234/v1"));
/// ```
pub fn get_base_url(provider: Option<Provider>, fallback: Option<&str>) -> String {
    resolve_base_url(env::var(ENV_BASE_URL).ok(), provider, fallback)
}

fn resolve_model(from_env: Option<String>, fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    if prefer_env {
        if let Some(model) = from_env.filter(|m| !m.is_empty()) {
            return Some(model);
        }
    }
    fallback.map(|s| s.to_string())
}

/// Get the model name from environment variable or fallback
///
/// ```rust,no_run
/// use llm_wire::get_model;
///
/// let model = get_model(Some("qwen2.5-32b-instruct"), true);
/// let forced = get_model(Some("specific-model"), false);
/// ```
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    resolve_model(env::var(ENV_MODEL).ok(), fallback, prefer_env)
}

/// API key from `LLM_WIRE_API_KEY`, or the fallback
pub fn get_api_key(fallback: Option<&str>) -> Option<String> {
    env::var(ENV_API_KEY)
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| fallback.map(|s| s.to_string()))
}

/// Options for a [`Client`](crate::Client)
#[derive(Clone)]
pub struct ClientConfig {
    /// Model used when a request does not name one
    pub model: String,

    /// Base URL of the stateless HTTP endpoints
    pub base_url: String,

    /// API key (most local servers don't need this)
    pub api_key: Option<String>,

    pub dialect: DialectKind,

    /// Framing of stateless response bodies
    pub framing: Framing,

    /// Persistent-session endpoint; sessions are disabled when unset
    pub websocket_url: Option<String>,

    /// Connect and response-header timeout in seconds
    pub timeout: u64,

    /// Longest idle gap between two events, in seconds
    pub read_timeout: Option<u64>,

    /// Capacity of the per-call delivery queue
    pub channel_capacity: usize,

    /// Seconds persistent sessions stay disabled after a breaker trip
    pub breaker_cooldown: u64,

    /// Backoff policy consulted when opening a stateless stream fails
    pub retry: Option<RetryConfig>,

    pub observer: Arc<dyn Observer>,

    pub usage_listener: Option<Arc<dyn UsageListener>>,

    /// Breaker table; the process-wide one when unset
    pub breaker: Option<Arc<CircuitBreaker>>,

    /// Session connector; WebSocket when unset
    pub session_connector: Option<Arc<dyn SessionConnector>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("dialect", &self.dialect)
            .field("framing", &self.framing)
            .field("websocket_url", &self.websocket_url)
            .field("timeout", &self.timeout)
            .field("read_timeout", &self.read_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .field("retry", &self.retry)
            .field("usage_listener", &self.usage_listener.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Create a new builder for ClientConfig
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Builder preloaded with a provider's URL, dialect and session endpoint
    pub fn for_provider(provider: Provider) -> ClientConfigBuilder {
        let mut builder = ClientConfigBuilder::default()
            .base_url(provider.default_url())
            .dialect(provider.default_dialect());
        if let Some(ws) = provider.websocket_url() {
            builder = builder.websocket_url(ws);
        }
        builder
    }

    /// Builder filled from `LLM_WIRE_*` environment variables
    pub fn from_env(provider: Option<Provider>) -> ClientConfigBuilder {
        let mut builder = match provider {
            Some(p) => Self::for_provider(p),
            None => Self::builder(),
        }
        .base_url(get_base_url(provider, None));
        if let Some(model) = get_model(None, true) {
            builder = builder.model(model);
        }
        if let Some(key) = get_api_key(None) {
            builder = builder.api_key(key);
        }
        builder
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn read_timeout_duration(&self) -> Option<Duration> {
        self.read_timeout.map(Duration::from_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    dialect: Option<DialectKind>,
    framing: Option<Framing>,
    websocket_url: Option<String>,
    timeout: Option<u64>,
    read_timeout: Option<u64>,
    channel_capacity: Option<usize>,
    breaker_cooldown: Option<u64>,
    retry: Option<RetryConfig>,
    observer: Option<Arc<dyn Observer>>,
    usage_listener: Option<Arc<dyn UsageListener>>,
    breaker: Option<Arc<CircuitBreaker>>,
    session_connector: Option<Arc<dyn SessionConnector>>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dialect", &self.dialect)
            .field("websocket_url", &self.websocket_url)
            .finish()
    }
}

impl ClientConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn dialect(mut self, dialect: DialectKind) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = Some(framing);
        self
    }

    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, seconds: u64) -> Self {
        self.read_timeout = Some(seconds);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    pub fn breaker_cooldown(mut self, seconds: u64) -> Self {
        self.breaker_cooldown = Some(seconds);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn usage_listener(mut self, listener: Arc<dyn UsageListener>) -> Self {
        self.usage_listener = Some(listener);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn session_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.session_connector = Some(connector);
        self
    }

    pub fn build(self) -> crate::Result<ClientConfig> {
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| crate::Error::config("model is required"))?;

        let base_url = self
            .base_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| crate::Error::config("base_url is required"))?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(crate::Error::config(format!(
                "base_url must be an http(s) URL, got {}",
                base_url
            )));
        }

        if let Some(ws) = self.websocket_url.as_deref() {
            if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
                return Err(crate::Error::config(format!(
                    "websocket_url must be a ws(s) URL, got {}",
                    ws
                )));
            }
        }

        let channel_capacity = self.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        if channel_capacity == 0 {
            return Err(crate::Error::config("channel_capacity must be at least 1"));
        }

        Ok(ClientConfig {
            model,
            base_url,
            api_key: self.api_key,
            dialect: self.dialect.unwrap_or_default(),
            framing: self.framing.unwrap_or_default(),
            websocket_url: self.websocket_url,
            timeout: self.timeout.unwrap_or(60),
            read_timeout: self.read_timeout,
            channel_capacity,
            breaker_cooldown: self.breaker_cooldown.unwrap_or(DEFAULT_COOLDOWN.as_secs()),
            retry: self.retry,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            usage_listener: self.usage_listener,
            breaker: self.breaker,
            session_connector: self.session_connector,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_default_urls() {
        assert_eq!(Provider::OpenAI.default_url(), "https://api.openai.com/v1");
        assert_eq!(Provider::LMStudio.default_url(), "http://localhost:1234/v1");
        assert_eq!(Provider::Ollama.default_url(), "http://localhost:11434/v1");
        assert_eq!(Provider::LlamaCpp.default_url(), "http://localhost:8080/v1");
        assert_eq!(Provider::VLLM.default_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!(Provider::from_str("OpenAI"), Some(Provider::OpenAI));
        assert_eq!(Provider::from_str("LM-Studio"), Some(Provider::LMStudio));
        assert_eq!(Provider::from_str("llama.cpp"), Some(Provider::LlamaCpp));
        assert_eq!(Provider::from_str("vllm"), Some(Provider::VLLM));
        assert_eq!(Provider::from_str("unknown"), None);
    }

    #[test]
    fn test_resolve_base_url_priority() {
        assert_eq!(
            resolve_base_url(Some("http://env:1/v1".into()), Some(Provider::Ollama), None),
            "http://env:1/v1"
        );
        assert_eq!(
            resolve_base_url(None, Some(Provider::Ollama), None),
            "http://localhost:11434/v1"
        );
        assert_eq!(
            resolve_base_url(None, None, Some("http://custom:8080/v1")),
            "http://custom:8080/v1"
        );
        assert_eq!(resolve_base_url(Some(String::new()), None, None), "http://localhost:1234/v1");
    }

    #[test]
    fn test_resolve_model() {
        assert_eq!(resolve_model(Some("env".into()), Some("fb"), true).as_deref(), Some("env"));
        assert_eq!(resolve_model(Some("env".into()), Some("fb"), false).as_deref(), Some("fb"));
        assert_eq!(resolve_model(None, None, true), None);
    }

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder()
            .model("model-x")
            .base_url("http://localhost:1234/v1")
            .build()
            .unwrap();

        assert_eq!(config.dialect, DialectKind::ChatCompletions);
        assert_eq!(config.framing, Framing::Sse);
        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.breaker_cooldown, 300);
        assert_eq!(config.timeout, 60);
        assert!(config.websocket_url.is_none());
    }

    #[test]
    fn test_builder_validation() {
        assert!(ClientConfig::builder().base_url("http://x").build().is_err());
        assert!(ClientConfig::builder().model("m").build().is_err());
        assert!(
            ClientConfig::builder()
                .model("m")
                .base_url("ftp://x")
                .build()
                .is_err()
        );
        assert!(
            ClientConfig::builder()
                .model("m")
                .base_url("http://x")
                .websocket_url("http://not-ws")
                .build()
                .is_err()
        );
        assert!(
            ClientConfig::builder()
                .model("m")
                .base_url("http://x")
                .channel_capacity(0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_for_provider_presets() {
        let config = ClientConfig::for_provider(Provider::OpenAI)
            .model("gpt-x")
            .build()
            .unwrap();
        assert_eq!(config.dialect, DialectKind::Responses);
        assert_eq!(
            config.websocket_url.as_deref(),
            Some("wss://api.openai.com/v1/responses")
        );
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = ClientConfig::builder()
            .model("m")
            .base_url("http://x")
            .api_key("sk-secret")
            .build()
            .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}
