//! Item-lifecycle dialect (responses-style APIs), used over SSE and
//! persistent WebSocket sessions.
//!
//! A tool call arrives as a triple keyed by the provider's item id, which is
//! distinct from the call id the model refers to later:
//!
//! ```text
//! response.output_item.added            { item: { id: "fc_1", type: "function_call", call_id: "call_1", name: "f" } }
//! response.function_call_arguments.delta { item_id: "fc_1", delta: "{\"a\"" }
//! response.function_call_arguments.delta { item_id: "fc_1", delta: ":1}" }
//! response.output_item.done             { item: { id: "fc_1", type: "function_call", call_id: "call_1", arguments: "{\"a\":1}" } }
//! response.completed                    { response: { id, model, output: [...], usage } }
//! ```
//!
//! `response.completed` repeats every output item, so a tool call already
//! emitted on `output_item.done` shows up a second time in the snapshot.

use crate::decoder::RawEvent;
use crate::dialect::{ChoiceDelta, Continuation, Dialect, ProviderFailure, StreamChunk};
use crate::types::{
    Choice, GenerateRequest, GenerateResponse, Message, MessageRole, ToolArguments, ToolCall,
    Usage,
};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};

/// The item-lifecycle dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct Responses;

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    response: Option<ResponseObject>,
    #[serde(default)]
    item: Option<OutputItem>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentPart {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<ResponsesUsage> for Usage {
    fn from(usage: ResponsesUsage) -> Self {
        let total = if usage.total_tokens == 0 {
            usage.input_tokens + usage.output_tokens
        } else {
            usage.total_tokens
        };
        Usage::new(usage.input_tokens, usage.output_tokens, total)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

fn code_string(code: Option<Value>) -> Option<String> {
    match code {
        Some(Value::String(code)) => Some(code),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn failure(error: Option<ErrorObject>, message: Option<String>, code: Option<Value>) -> ProviderFailure {
    let error = error.unwrap_or_default();
    ProviderFailure {
        message: error
            .message
            .or(message)
            .unwrap_or_else(|| "response failed".to_string()),
        code: code_string(error.code).or_else(|| code_string(code)),
    }
}

fn is_function_call(item: &OutputItem) -> bool {
    item.kind.as_deref() == Some("function_call")
}

fn snapshot(response: ResponseObject, incomplete: bool) -> GenerateResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for item in response.output {
        match item.kind.as_deref() {
            Some("message") => {
                for part in item.content {
                    if matches!(part.kind.as_deref(), Some("output_text") | Some("text")) {
                        text.push_str(part.text.as_deref().unwrap_or_default());
                    }
                }
            }
            Some("function_call") => {
                let id = item.call_id.or(item.id).unwrap_or_default();
                tool_calls.push(ToolCall::new(
                    id,
                    item.name.unwrap_or_default(),
                    ToolArguments::from_buffer(item.arguments.as_deref().unwrap_or_default()),
                ));
            }
            _ => {}
        }
    }

    let choices = if text.is_empty() && tool_calls.is_empty() {
        Vec::new()
    } else {
        let finish_reason = if incomplete {
            "length"
        } else if tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        vec![Choice::new(
            0,
            Message::assistant_tool_calls(text, tool_calls),
            Some(finish_reason.to_string()),
        )]
    };

    GenerateResponse {
        choices,
        usage: response.usage.map(Usage::from),
        model: response.model.unwrap_or_default(),
        response_id: response.id,
    }
}

fn input_items(items: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for message in items {
        match message.role {
            MessageRole::Tool => out.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.content,
            })),
            role => {
                if !message.content.is_empty() || message.tool_calls.is_empty() {
                    out.push(json!({
                        "type": "message",
                        "role": role.as_str(),
                        "content": message.content,
                    }));
                }
                for call in &message.tool_calls {
                    out.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments.to_json_string(),
                    }));
                }
            }
        }
    }
    out
}

impl Dialect for Responses {
    fn name(&self) -> &'static str {
        "responses"
    }

    fn classify(&self, event: &RawEvent) -> Result<StreamChunk> {
        let envelope: Envelope = serde_json::from_slice(&event.payload)
            .map_err(|e| Error::stream(format!("Failed to parse event: {}", e)))?;

        let kind = event
            .kind
            .clone()
            .or_else(|| envelope.kind.clone())
            .unwrap_or_default();

        let chunk = match kind.as_str() {
            "response.created" | "response.in_progress" => {
                let response = envelope.response.unwrap_or_default();
                StreamChunk::Started {
                    model: response.model,
                    response_id: response.id,
                }
            }
            "response.output_text.delta" => StreamChunk::Delta {
                model: None,
                response_id: None,
                choices: vec![ChoiceDelta {
                    index: 0,
                    content: envelope.delta,
                    ..Default::default()
                }],
                usage: None,
            },
            "response.output_item.added" => match envelope.item {
                Some(item) if is_function_call(&item) => StreamChunk::ItemAdded {
                    item_id: item.id.unwrap_or_default(),
                    call_id: item.call_id,
                    name: item.name,
                },
                _ => StreamChunk::Ignored,
            },
            "response.function_call_arguments.delta" => match envelope.item_id {
                Some(item_id) => StreamChunk::ArgumentsDelta {
                    item_id,
                    delta: envelope.delta.unwrap_or_default(),
                },
                None => return Err(Error::stream("arguments delta without item_id")),
            },
            "response.output_item.done" => match envelope.item {
                Some(item) if is_function_call(&item) => StreamChunk::ItemDone {
                    item_id: item.id.unwrap_or_default(),
                    call_id: item.call_id,
                    name: item.name,
                    arguments: item.arguments,
                },
                _ => StreamChunk::Ignored,
            },
            "response.completed" | "response.done" => {
                StreamChunk::Completed(snapshot(envelope.response.unwrap_or_default(), false))
            }
            "response.incomplete" => {
                StreamChunk::Completed(snapshot(envelope.response.unwrap_or_default(), true))
            }
            "response.failed" => {
                let response = envelope.response.unwrap_or_default();
                StreamChunk::Failed(failure(response.error, envelope.message, envelope.code))
            }
            "error" => StreamChunk::Failed(failure(envelope.error, envelope.message, envelope.code)),
            _ => StreamChunk::Ignored,
        };

        Ok(chunk)
    }

    fn encode_request(
        &self,
        request: &GenerateRequest,
        model: &str,
        input: Continuation<'_>,
        stream: bool,
    ) -> Result<Value> {
        if input.items.is_empty() {
            return Err(Error::invalid_input("request has no input items"));
        }

        let mut body = json!({
            "model": model,
            "input": input_items(input.items),
            "stream": stream,
        });

        if let Some(previous) = input.previous_response_id {
            body["previous_response_id"] = json!(previous);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        })
                    })
                    .collect(),
            );
        }

        Ok(body)
    }

    fn endpoint_path(&self) -> &'static str {
        "/responses"
    }

    fn supports_sessions(&self) -> bool {
        true
    }
}
