//! Chat-completions dialect (OpenAI-compatible servers).
//!
//! Streaming chunks look like:
//!
//! ```text
//! Chunk 1: { choices: [{ index: 0, delta: { content: "Hel" } }] }
//! Chunk 2: { choices: [{ index: 0, delta: { tool_calls: [{ index: 0, id: "call_1", function: { name: "get_weather" } }] } }] }
//! Chunk 3: { choices: [{ index: 0, delta: { tool_calls: [{ index: 0, function: { arguments: "{\"loc" } }] } }] }
//! Chunk 4: { choices: [{ index: 0, delta: {}, finish_reason: "tool_calls" }] }
//! Chunk 5: { choices: [], usage: { prompt_tokens: 10, completion_tokens: 3, total_tokens: 13 } }
//! ```
//!
//! Chunk 5 is a usage-only trailer. A non-streaming `chat.completion` object
//! (choices carrying `message` instead of `delta`) is classified as a snapshot.

use crate::decoder::RawEvent;
use crate::dialect::{
    ChoiceDelta, Continuation, Dialect, ProviderFailure, StreamChunk, ToolCallFragment,
};
use crate::types::{
    Choice, GenerateRequest, GenerateResponse, Message, ToolArguments, ToolCall, ToolSpec, Usage,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// The chat-completions dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletions;

/// Wire usage object
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<ChatUsage> for Usage {
    fn from(usage: ChatUsage) -> Self {
        let total = if usage.total_tokens == 0 {
            usage.prompt_tokens + usage.completion_tokens
        } else {
            usage.total_tokens
        };
        Usage::new(usage.prompt_tokens, usage.completion_tokens, total)
    }
}

/// Streaming chunk or non-streaming completion object
#[derive(Debug, Clone, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Option<ChatDelta>,
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChatFunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ChatFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl ChatError {
    fn into_failure(self) -> ProviderFailure {
        let code = match self.code {
            Some(serde_json::Value::String(code)) => Some(code),
            Some(serde_json::Value::Null) | None => self.kind,
            Some(other) => Some(other.to_string()),
        };
        ProviderFailure {
            message: self
                .message
                .unwrap_or_else(|| "provider reported an error".to_string()),
            code,
        }
    }
}

/// Request message in wire format
#[derive(Debug, Clone, Serialize)]
struct ChatRequestMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Chat-completions request body
#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatRequestMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

/// Tool definition in the function-calling wire format
pub(crate) fn tool_to_function_format(tool: &ToolSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn to_wire_message(message: &Message) -> ChatRequestMessage {
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|call| ChatToolCall {
                    id: call.id.clone(),
                    call_type: function_type(),
                    function: ChatFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_json_string(),
                    },
                })
                .collect(),
        )
    };

    ChatRequestMessage {
        role: message.role.as_str(),
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn snapshot_choice(choice: ChatChoice) -> Choice {
    let (content, tool_calls) = match choice.message {
        Some(message) => (
            message.content.unwrap_or_default(),
            message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| {
                    ToolCall::new(
                        call.id,
                        call.function.name,
                        ToolArguments::from_buffer(&call.function.arguments),
                    )
                })
                .collect(),
        ),
        None => (String::new(), Vec::new()),
    };

    Choice::new(
        choice.index,
        Message::assistant_tool_calls(content, tool_calls),
        choice.finish_reason,
    )
}

fn delta_choice(choice: ChatChoice) -> ChoiceDelta {
    let delta = choice.delta.unwrap_or_default();
    ChoiceDelta {
        index: choice.index,
        content: delta.content,
        tool_calls: delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|fragment| {
                let (name, arguments) = match fragment.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                ToolCallFragment {
                    index: fragment.index,
                    id: fragment.id,
                    name,
                    arguments,
                }
            })
            .collect(),
        finish_reason: choice.finish_reason,
    }
}

impl Dialect for ChatCompletions {
    fn name(&self) -> &'static str {
        "chat_completions"
    }

    fn classify(&self, event: &RawEvent) -> Result<StreamChunk> {
        let chunk: ChatChunk = serde_json::from_slice(&event.payload)
            .map_err(|e| Error::stream(format!("Failed to parse chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Ok(StreamChunk::Failed(error.into_failure()));
        }
        if event.kind.as_deref() == Some("error") {
            return Ok(StreamChunk::Failed(ProviderFailure {
                message: event.text().into_owned(),
                code: None,
            }));
        }

        let usage = chunk.usage.map(Usage::from);
        let is_snapshot = chunk.choices.iter().any(|c| c.message.is_some());

        if is_snapshot || (chunk.choices.is_empty() && usage.is_some()) {
            return Ok(StreamChunk::Snapshot(GenerateResponse {
                choices: chunk.choices.into_iter().map(snapshot_choice).collect(),
                usage,
                model: chunk.model.unwrap_or_default(),
                response_id: chunk.id,
            }));
        }

        if chunk.choices.is_empty() {
            return Ok(StreamChunk::Started {
                model: chunk.model,
                response_id: chunk.id,
            });
        }

        Ok(StreamChunk::Delta {
            model: chunk.model,
            response_id: chunk.id,
            choices: chunk.choices.into_iter().map(delta_choice).collect(),
            usage,
        })
    }

    fn encode_request(
        &self,
        request: &GenerateRequest,
        model: &str,
        input: Continuation<'_>,
        stream: bool,
    ) -> Result<serde_json::Value> {
        if input.items.is_empty() {
            return Err(Error::invalid_input("request has no messages"));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(tool_to_function_format).collect())
        };

        // Chat completions has no server-side continuation; the full input
        // is always sent.
        let body = ChatRequest {
            model: model.to_string(),
            messages: input.items.iter().map(to_wire_message).collect(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
        };

        Ok(serde_json::to_value(body)?)
    }

    fn endpoint_path(&self) -> &'static str {
        "/chat/completions"
    }
}
