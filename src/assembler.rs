//! Item-keyed tool-call assembly and duplicate suppression.
//!
//! Item-lifecycle providers describe one tool call twice: first as an
//! `added` → `arguments delta`* → `done` sequence keyed by an item id, then
//! again inside the final snapshot. The assembler emits on `done`, remembers
//! what it emitted, and strips those calls from the snapshot.

use crate::aggregator::ToolCallAccumulator;
use crate::types::{GenerateResponse, ToolCall};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    items: HashMap<String, ToolCallAccumulator>,
    emitted: HashSet<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an item. A repeated `added` for the same item keeps its buffer.
    pub fn item_added(&mut self, item_id: &str, call_id: Option<&str>, name: Option<&str>) {
        let call = self.items.entry(item_id.to_string()).or_default();
        call.apply(call_id, name, None);
    }

    /// Append an argument fragment. Fragments for an item that was never
    /// announced open it implicitly.
    pub fn arguments_delta(&mut self, item_id: &str, delta: &str) {
        self.items
            .entry(item_id.to_string())
            .or_default()
            .append(delta);
    }

    /// Finalize an item and record its id as emitted.
    ///
    /// Arguments carried on the `done` event win over the streamed buffer
    /// when present, since they are the provider's own final text.
    pub fn item_done(
        &mut self,
        item_id: &str,
        call_id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ToolCall {
        let mut call = self.items.remove(item_id).unwrap_or_default();
        call.apply(call_id, name, None);
        if let Some(arguments) = arguments.filter(|args| !args.is_empty()) {
            call.args = arguments.to_string();
        }
        if call.id.is_empty() {
            call.id = item_id.to_string();
        }

        self.emitted.insert(item_id.to_string());
        self.emitted.insert(call.id.clone());
        call.finish()
    }

    pub fn was_emitted(&self, id: &str) -> bool {
        self.emitted.contains(id)
    }

    pub fn pending(&self) -> usize {
        self.items.len()
    }

    /// Remove already-emitted tool calls from a snapshot and drop choices
    /// left with neither text nor tool calls. Returns the number of calls
    /// removed.
    ///
    /// A text choice that lost all of its calls finishes with `stop`.
    pub fn filter_snapshot(&self, response: &mut GenerateResponse) -> usize {
        let mut removed = 0;
        for choice in &mut response.choices {
            let before = choice.message.tool_calls.len();
            choice
                .message
                .tool_calls
                .retain(|call| !self.emitted.contains(&call.id));
            let dropped = before - choice.message.tool_calls.len();
            if dropped > 0
                && choice.message.tool_calls.is_empty()
                && choice.finish_reason.as_deref() == Some("tool_calls")
            {
                choice.finish_reason = Some("stop".to_string());
            }
            removed += dropped;
        }
        response.choices.retain(|choice| !choice.message.is_empty());
        removed
    }
}
