use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use futures::{StreamExt, stream};
use llm_wire::{
    CallMeta, DialectKind, NoopObserver, RawEvent, StreamEvent, StreamProcessor, sse_events,
};
use serde_json::json;
use std::sync::Arc;

fn processor(kind: DialectKind) -> StreamProcessor {
    let meta = CallMeta {
        model: "bench-model".to_string(),
        ..Default::default()
    };
    StreamProcessor::new(kind.build(), Arc::new(NoopObserver), None, &meta)
}

// Chat chunks: `count` text deltas, then a finish chunk with usage
fn text_events(count: usize) -> Vec<RawEvent> {
    let mut events: Vec<RawEvent> = (0..count)
        .map(|i| {
            RawEvent::data(
                json!({
                    "model": "bench-model",
                    "choices": [{"index": 0, "delta": {"content": format!("token{} ", i)}}]
                })
                .to_string(),
            )
        })
        .collect();
    events.push(RawEvent::data(
        json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": count, "total_tokens": count + 10}
        })
        .to_string(),
    ));
    events
}

// Chat chunks: one tool call whose arguments arrive in `count` fragments
fn tool_fragment_events(count: usize) -> Vec<RawEvent> {
    let mut events = vec![RawEvent::data(
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "search", "arguments": "{\"q\":\""}}
        ]}}]})
        .to_string(),
    )];
    events.extend((0..count).map(|_| {
        RawEvent::data(
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "abc"}}
            ]}}]})
            .to_string(),
        )
    }));
    events.push(RawEvent::data(
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"}"}}
        ]}, "finish_reason": "tool_calls"}]})
        .to_string(),
    ));
    events
}

// Item lifecycle: added, `count` argument deltas, done, completed snapshot
fn item_lifecycle_events(count: usize) -> Vec<RawEvent> {
    let item = json!({"id": "fc_1", "type": "function_call", "call_id": "call_1", "name": "search", "arguments": "{}"});
    let mut events = vec![RawEvent::named(
        "response.output_item.added",
        json!({"type": "response.output_item.added", "item": {"id": "fc_1", "type": "function_call", "call_id": "call_1", "name": "search"}}).to_string(),
    )];
    events.extend((0..count).map(|_| {
        RawEvent::named(
            "response.function_call_arguments.delta",
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "x"}).to_string(),
        )
    }));
    events.push(RawEvent::named(
        "response.output_item.done",
        json!({"type": "response.output_item.done", "item": item}).to_string(),
    ));
    events.push(RawEvent::named(
        "response.completed",
        json!({"type": "response.completed", "response": {"id": "resp_1", "output": [item]}}).to_string(),
    ));
    events
}

fn run(kind: DialectKind, events: &[RawEvent]) -> usize {
    let mut p = processor(kind);
    let mut emitted: Vec<StreamEvent> = Vec::new();
    for event in events {
        emitted.extend(p.process(event));
    }
    p.finish();
    emitted.len()
}

// Benchmark: text deltas through the chat dialect
fn bench_text_deltas(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_text_deltas");

    for count in [10, 100, 1000].iter() {
        let events = text_events(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| run(DialectKind::ChatCompletions, black_box(events)));
        });
    }

    group.finish();
}

// Benchmark: inline tool-call fragment aggregation
fn bench_tool_fragments(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_tool_fragments");

    for count in [10, 100, 1000].iter() {
        let events = tool_fragment_events(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| run(DialectKind::ChatCompletions, black_box(events)));
        });
    }

    group.finish();
}

// Benchmark: item-keyed assembly plus snapshot de-duplication
fn bench_item_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_item_lifecycle");

    for count in [10, 100, 1000].iter() {
        let events = item_lifecycle_events(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| run(DialectKind::Responses, black_box(events)));
        });
    }

    group.finish();
}

// Benchmark: SSE framing of a body split into small network chunks
fn bench_sse_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("sse_decode");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for count in [100, 1000].iter() {
        let body: String = text_events(*count)
            .iter()
            .map(|event| format!("data: {}\n\n", event.text()))
            .collect();
        let chunks: Vec<Vec<u8>> = body.as_bytes().chunks(64).map(|c| c.to_vec()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &chunks, |b, chunks| {
            b.iter(|| {
                let input = stream::iter(
                    chunks
                        .iter()
                        .cloned()
                        .map(Ok::<_, llm_wire::Error>)
                        .collect::<Vec<_>>(),
                );
                runtime.block_on(async { sse_events(input).count().await })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_text_deltas,
    bench_tool_fragments,
    bench_item_lifecycle,
    bench_sse_decode
);

criterion_main!(benches);
