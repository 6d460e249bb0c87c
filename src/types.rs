//! Canonical request/response types shared by every dialect and transport

use crate::Error;
use serde::{Deserialize, Serialize};

/// Message role in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// Arguments of a finalized tool call.
///
/// Providers stream arguments as a JSON string. When the assembled string
/// parses it is kept as a value, otherwise the raw text is preserved so the
/// caller can decide what to do with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolArguments {
    Parsed(serde_json::Value),
    Raw(String),
}

impl ToolArguments {
    /// Parse an assembled argument buffer. An empty buffer means "no arguments".
    pub fn from_buffer(buffer: &str) -> Self {
        if buffer.trim().is_empty() {
            return ToolArguments::Parsed(serde_json::json!({}));
        }
        match serde_json::from_str(buffer) {
            Ok(value) => ToolArguments::Parsed(value),
            Err(e) => {
                log::debug!("tool arguments are not valid JSON, keeping raw text: {}", e);
                ToolArguments::Raw(buffer.to_string())
            }
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            ToolArguments::Parsed(value) => Some(value),
            ToolArguments::Raw(_) => None,
        }
    }

    /// Arguments as the JSON text a provider expects on the request side.
    pub fn to_json_string(&self) -> String {
        match self {
            ToolArguments::Parsed(value) => value.to_string(),
            ToolArguments::Raw(raw) => raw.clone(),
        }
    }
}

/// A finalized tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool definition offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A message in the conversation.
///
/// Messages double as the input items of a persistent session: the
/// session manager compares them structurally to detect prefix extensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text)
    }

    /// Assistant turn that requested tools
    pub fn assistant_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(MessageRole::Assistant, text)
        }
    }

    /// Result of a tool call, addressed by the call id
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    /// True when the message carries neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }
}

/// One finalized choice/candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn new(index: u32, message: Message, finish_reason: Option<String>) -> Self {
        Self {
            index,
            message,
            finish_reason,
        }
    }
}

/// Token counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    /// Usage with `total_tokens == 0` carries no information worth reporting.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

/// A (possibly partial) canonical response.
///
/// Only finalized choices ever appear here; an accumulator still receiving
/// deltas is never surfaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateResponse {
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl GenerateResponse {
    /// Text of the first choice, if any
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }

    /// Tool calls across every choice, in choice order
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.choices.iter().flat_map(|c| c.message.tool_calls.iter())
    }

    /// Fold a later streamed response into this one.
    ///
    /// Choices with the same index are concatenated (text appended, tool calls
    /// extended, latest finish reason wins). Usage, model and response id take
    /// the latest non-empty value.
    pub fn merge(&mut self, other: GenerateResponse) {
        for choice in other.choices {
            match self.choices.iter_mut().find(|c| c.index == choice.index) {
                Some(existing) => {
                    existing.message.content.push_str(&choice.message.content);
                    existing.message.tool_calls.extend(choice.message.tool_calls);
                    if choice.finish_reason.is_some() {
                        existing.finish_reason = choice.finish_reason;
                    }
                }
                None => self.choices.push(choice),
            }
        }
        self.choices.sort_by_key(|c| c.index);
        if other.usage.is_some() {
            self.usage = other.usage;
        }
        if !other.model.is_empty() {
            self.model = other.model;
        }
        if other.response_id.is_some() {
            self.response_id = other.response_id;
        }
    }
}

/// Canonical request handed to a dialect encoder
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateRequest {
    /// Model override; the client's configured model is used when empty
    #[serde(default)]
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Session affinity key. Requests that share a key may reuse one
    /// persistent connection and continue from the previous response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn conversation_key(mut self, key: impl Into<String>) -> Self {
        self.conversation_key = Some(key.into());
        self
    }
}

/// The unit delivered to the caller: exactly one of a response or an error.
#[derive(Debug)]
pub enum StreamEvent {
    Response(GenerateResponse),
    Error(Error),
}

impl StreamEvent {
    pub fn response(&self) -> Option<&GenerateResponse> {
        match self {
            StreamEvent::Response(response) => Some(response),
            StreamEvent::Error(_) => None,
        }
    }

    pub fn err(&self) -> Option<&Error> {
        match self {
            StreamEvent::Response(_) => None,
            StreamEvent::Error(err) => Some(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    pub fn into_result(self) -> crate::Result<GenerateResponse> {
        match self {
            StreamEvent::Response(response) => Ok(response),
            StreamEvent::Error(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_arguments_from_buffer() {
        assert_eq!(
            ToolArguments::from_buffer(r#"{"a":1}"#),
            ToolArguments::Parsed(json!({"a": 1}))
        );
        assert_eq!(ToolArguments::from_buffer(""), ToolArguments::Parsed(json!({})));
        assert_eq!(
            ToolArguments::from_buffer(r#"{"a":"#),
            ToolArguments::Raw(r#"{"a":"#.to_string())
        );
    }

    #[test]
    fn test_tool_arguments_serialize_untagged() {
        let parsed = serde_json::to_string(&ToolArguments::Parsed(json!({"x": 1}))).unwrap();
        assert_eq!(parsed, r#"{"x":1}"#);
        let raw = serde_json::to_string(&ToolArguments::Raw("oops".into())).unwrap();
        assert_eq!(raw, r#""oops""#);
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.tool_calls.is_empty());

        let result = Message::tool_result("call_1", "42");
        assert_eq!(result.role, MessageRole::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(MessageRole::Tool.as_str(), "tool");
    }

    #[test]
    fn test_usage_is_empty() {
        assert!(Usage::default().is_empty());
        assert!(!Usage::new(10, 3, 13).is_empty());
    }

    #[test]
    fn test_response_merge_concatenates_by_index() {
        let mut acc = GenerateResponse {
            choices: vec![Choice::new(0, Message::assistant("Hello"), None)],
            model: "m".into(),
            ..Default::default()
        };
        acc.merge(GenerateResponse {
            choices: vec![
                Choice::new(0, Message::assistant(", world"), Some("stop".into())),
                Choice::new(1, Message::assistant("other"), Some("stop".into())),
            ],
            usage: Some(Usage::new(1, 2, 3)),
            model: String::new(),
            response_id: Some("resp_1".into()),
        });

        assert_eq!(acc.choices.len(), 2);
        assert_eq!(acc.text(), Some("Hello, world"));
        assert_eq!(acc.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(acc.usage, Some(Usage::new(1, 2, 3)));
        assert_eq!(acc.model, "m");
        assert_eq!(acc.response_id.as_deref(), Some("resp_1"));
    }

    #[test]
    fn test_stream_event_accessors() {
        let event = StreamEvent::Response(GenerateResponse::default());
        assert!(event.response().is_some());
        assert!(event.err().is_none());

        let event = StreamEvent::Error(Error::timeout());
        assert!(event.is_error());
        assert!(event.into_result().is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = GenerateRequest::new(vec![Message::user("hi")])
            .model("model-x")
            .max_tokens(64)
            .temperature(0.2)
            .conversation_key("conv-1");
        assert_eq!(request.model, "model-x");
        assert_eq!(request.max_tokens, Some(64));
        assert_eq!(request.conversation_key.as_deref(), Some("conv-1"));
    }
}
