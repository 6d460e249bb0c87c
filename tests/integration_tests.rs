//! Integration tests for the stateless HTTP path
//!
//! These drive a real `Client` against a wiremock server and check the
//! end-to-end behavior of decoding, aggregation and usage publication.

use futures::StreamExt;
use llm_wire::retry::RetryConfig;
use llm_wire::{
    CallMeta, CallSummary, CallToken, Client, ClientConfig, DialectKind, Error, Framing,
    GenerateRequest, Message, Observer, StreamEvent, Usage, UsageListener,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type UsageCalls = Arc<Mutex<Vec<(String, Usage)>>>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn usage_recorder() -> (Arc<dyn UsageListener>, UsageCalls) {
    let calls: UsageCalls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let listener: Arc<dyn UsageListener> = Arc::new(move |model: &str, usage: &Usage| {
        sink.lock().unwrap().push((model.to_string(), *usage));
    });
    (listener, calls)
}

fn sse(events: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn named_sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|event| format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap(), event))
        .collect()
}

async fn mount_stream(server: &MockServer, route: &str, body: String, mime: &str) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, mime))
        .mount(server)
        .await;
}

fn config(server: &MockServer) -> llm_wire::ClientConfigBuilder {
    ClientConfig::builder()
        .model("default-model")
        .base_url(format!("{}/v1", server.uri()))
        .timeout(5)
}

fn chunk(content: Option<&str>, finish: Option<&str>, usage: Option<serde_json::Value>) -> serde_json::Value {
    let mut delta = json!({});
    if let Some(text) = content {
        delta["content"] = json!(text);
    }
    let mut chunk = json!({
        "id": "chatcmpl-1",
        "model": "model-x",
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }]
    });
    if let Some(usage) = usage {
        chunk["usage"] = usage;
    }
    chunk
}

#[tokio::test]
async fn test_hello_world_end_to_end() {
    init_logging();
    let server = MockServer::start().await;
    let body = sse(&[
        chunk(Some("Hello"), None, None),
        chunk(Some(", world"), None, None),
        chunk(
            None,
            Some("stop"),
            Some(json!({"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13})),
        ),
    ]);
    mount_stream(&server, "/v1/chat/completions", body, "text/event-stream").await;

    let (listener, usage_calls) = usage_recorder();
    let client = Client::new(config(&server).usage_listener(listener).build().unwrap()).unwrap();

    let stream = client
        .stream(
            GenerateRequest::new(vec![Message::user("Say hello")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let events: Vec<StreamEvent> = stream.collect().await;

    assert_eq!(events.len(), 1);
    let response = events[0].response().unwrap();
    assert_eq!(response.choices[0].message.content, "Hello, world");
    assert_eq!(response.usage.unwrap().total_tokens, 13);
    assert_eq!(
        *usage_calls.lock().unwrap(),
        vec![("model-x".to_string(), Usage::new(10, 3, 13))]
    );
}

#[tokio::test]
async fn test_usage_only_trailer_reemits_last_response() {
    let server = MockServer::start().await;
    let body = sse(&[
        chunk(Some("Hi"), Some("stop"), None),
        json!({
            "id": "chatcmpl-1",
            "model": "model-x",
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 6, "total_tokens": 15}
        }),
    ]);
    mount_stream(&server, "/v1/chat/completions", body, "text/event-stream").await;

    let (listener, usage_calls) = usage_recorder();
    let client = Client::new(config(&server).usage_listener(listener).build().unwrap()).unwrap();

    let events: Vec<StreamEvent> = client
        .stream(GenerateRequest::new(vec![Message::user("hi")]), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    for event in &events {
        assert!(!event.response().unwrap().choices.is_empty());
    }
    assert_eq!(events[0].response().unwrap().usage, None);
    assert_eq!(events[1].response().unwrap().usage, Some(Usage::new(9, 6, 15)));
    assert_eq!(usage_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_generate_merges_trailer_without_duplicating_text() {
    let server = MockServer::start().await;
    let body = sse(&[
        chunk(Some("Hi"), Some("stop"), None),
        json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 6, "total_tokens": 15}}),
    ]);
    mount_stream(&server, "/v1/chat/completions", body, "text/event-stream").await;

    let client = Client::new(config(&server).build().unwrap()).unwrap();
    let response = client
        .generate(GenerateRequest::new(vec![Message::user("hi")]))
        .await
        .unwrap();

    assert_eq!(response.text(), Some("Hi"));
    assert_eq!(response.usage, Some(Usage::new(9, 6, 15)));
}

#[tokio::test]
async fn test_tool_call_fragments_parse_in_order() {
    let server = MockServer::start().await;
    let fragment = |id: Option<&str>, name: Option<&str>, args: &str| {
        let mut call = json!({"index": 0, "function": {"arguments": args}});
        if let Some(id) = id {
            call["id"] = json!(id);
        }
        if let Some(name) = name {
            call["function"]["name"] = json!(name);
        }
        json!({"model": "model-x", "choices": [{"index": 0, "delta": {"tool_calls": [call]}}]})
    };
    let body = sse(&[
        fragment(Some("call_1"), Some("add"), "{\"a\""),
        fragment(None, None, ":1"),
        fragment(None, None, "}"),
        json!({"model": "model-x", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ]);
    mount_stream(&server, "/v1/chat/completions", body, "text/event-stream").await;

    let client = Client::new(config(&server).build().unwrap()).unwrap();
    let response = client
        .generate(GenerateRequest::new(vec![Message::user("add")]))
        .await
        .unwrap();

    let calls: Vec<_> = response.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].name, "add");
    assert_eq!(calls[0].arguments.as_value(), Some(&json!({"a": 1})));
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));
}

#[tokio::test]
async fn test_item_done_and_snapshot_emit_tool_call_once() {
    let server = MockServer::start().await;
    let item = json!({
        "id": "fc_1",
        "type": "function_call",
        "call_id": "call_1",
        "name": "lookup",
        "arguments": "{\"q\":\"rust\"}"
    });
    let body = named_sse(&[
        json!({"type": "response.created", "response": {"id": "resp_1", "model": "model-x"}}),
        json!({"type": "response.output_item.added", "item": {"id": "fc_1", "type": "function_call", "call_id": "call_1", "name": "lookup"}}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"q\":"}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"rust\"}"}),
        json!({"type": "response.output_item.done", "item": item}),
        json!({"type": "response.completed", "response": {
            "id": "resp_1",
            "model": "model-x",
            "output": [item],
            "usage": {"input_tokens": 7, "output_tokens": 5, "total_tokens": 12}
        }}),
    ]);
    mount_stream(&server, "/v1/responses", body, "text/event-stream").await;

    let (listener, usage_calls) = usage_recorder();
    let client = Client::new(
        config(&server)
            .dialect(DialectKind::Responses)
            .usage_listener(listener)
            .build()
            .unwrap(),
    )
    .unwrap();

    let events: Vec<StreamEvent> = client
        .stream(GenerateRequest::new(vec![Message::user("look")]), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    let carrying_call = events
        .iter()
        .filter_map(StreamEvent::response)
        .filter(|r| r.tool_calls().any(|c| c.id == "call_1"))
        .count();
    assert_eq!(carrying_call, 1);
    assert!(events.iter().all(|e| !e.is_error()));
    assert_eq!(
        *usage_calls.lock().unwrap(),
        vec![("model-x".to_string(), Usage::new(7, 5, 12))]
    );
}

#[tokio::test]
async fn test_ndjson_framing() {
    let server = MockServer::start().await;
    let body = format!(
        "{}\n{}\n",
        chunk(Some("line "), None, None),
        chunk(Some("framed"), Some("stop"), None)
    );
    mount_stream(&server, "/v1/chat/completions", body, "application/x-ndjson").await;

    let client = Client::new(config(&server).framing(Framing::Ndjson).build().unwrap()).unwrap();
    let response = client
        .generate(GenerateRequest::new(vec![Message::user("hi")]))
        .await
        .unwrap();

    assert_eq!(response.text(), Some("line framed"));
}

#[tokio::test]
async fn test_non_success_status_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let client = Client::new(config(&server).build().unwrap()).unwrap();
    let err = client
        .stream(GenerateRequest::new(vec![Message::user("hi")]), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Api { status, message } => {
            assert_eq!(status, 401);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_advisor_reopens_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_stream(
        &server,
        "/v1/chat/completions",
        sse(&[chunk(Some("ok"), Some("stop"), None)]),
        "text/event-stream",
    )
    .await;

    let retry = RetryConfig::new()
        .with_max_attempts(2)
        .with_initial_delay(Duration::from_millis(10));
    let client = Client::new(config(&server).retry(retry).build().unwrap()).unwrap();
    let response = client
        .generate(GenerateRequest::new(vec![Message::user("hi")]))
        .await
        .unwrap();

    assert_eq!(response.text(), Some("ok"));
}

#[derive(Default)]
struct RecordingObserver {
    starts: Mutex<Vec<CallMeta>>,
    deltas: Mutex<Vec<String>>,
    ends: Mutex<Vec<Result<Option<String>, String>>>,
}

impl Observer for RecordingObserver {
    fn on_call_start(&self, meta: &CallMeta) -> CallToken {
        let mut starts = self.starts.lock().unwrap();
        starts.push(meta.clone());
        CallToken::new(starts.len() as u64)
    }

    fn on_stream_delta(&self, _token: CallToken, text: &str) {
        self.deltas.lock().unwrap().push(text.to_string());
    }

    fn on_call_end(&self, _token: CallToken, outcome: Result<&CallSummary, &Error>) {
        self.ends.lock().unwrap().push(
            outcome
                .map(|summary| summary.response_id.clone())
                .map_err(|e| e.to_string()),
        );
    }
}

#[tokio::test]
async fn test_provider_error_event_is_terminal_and_observed() {
    let server = MockServer::start().await;
    let body = sse(&[
        chunk(Some("partial"), None, None),
        json!({"error": {"message": "model overloaded", "code": "server_busy"}}),
        chunk(Some("never seen"), Some("stop"), None),
    ]);
    mount_stream(&server, "/v1/chat/completions", body, "text/event-stream").await;

    let observer = Arc::new(RecordingObserver::default());
    let client = Client::new(config(&server).observer(observer.clone()).build().unwrap()).unwrap();

    let events: Vec<StreamEvent> = client
        .stream(GenerateRequest::new(vec![Message::user("hi")]), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    let err = events[0].err().unwrap();
    assert_eq!(err.code(), Some("server_busy"));

    let starts = observer.starts.lock().unwrap();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].model, "default-model");
    assert!(!starts[0].persistent);
    assert_eq!(*observer.deltas.lock().unwrap(), vec!["partial"]);
    let ends = observer.ends.lock().unwrap();
    assert_eq!(ends.len(), 1);
    assert!(ends[0].as_ref().unwrap_err().contains("model overloaded"));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse(&[chunk(Some("late"), Some("stop"), None)]), "text/event-stream")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = Client::new(config(&server).build().unwrap()).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client
        .stream(GenerateRequest::new(vec![Message::user("hi")]), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

// Serves one SSE response that trickles `events` with `gap` between them.
async fn start_trickle_server(events: Vec<serde_json::Value>, gap: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        for event in events {
            socket
                .write_all(format!("data: {}\n\n", event).as_bytes())
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(gap).await;
        }
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{}/v1", addr)
}

#[tokio::test]
async fn test_stream_outlives_request_timeout() {
    init_logging();
    let base_url = start_trickle_server(
        vec![
            chunk(Some("one "), None, None),
            chunk(Some("two "), None, None),
            chunk(Some("three "), None, None),
            chunk(Some("four"), Some("stop"), None),
        ],
        Duration::from_millis(400),
    )
    .await;

    let config = ClientConfig::builder()
        .model("default-model")
        .base_url(base_url)
        .timeout(1)
        .read_timeout(1)
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let response = client
        .generate(GenerateRequest::new(vec![Message::user("count")]))
        .await
        .unwrap();
    assert_eq!(response.text(), Some("one two three four"));
}
