//! Delta aggregation: per-choice text and inline tool-call fragments.
//!
//! Text and tool calls arrive as **incremental deltas** spread across many
//! chunks. A single tool call might arrive as:
//!
//! ```text
//! Chunk 1: { index: 0, tool_calls: [{ index: 0, id: "call_abc123", function: { name: "get_weather" } }] }
//! Chunk 2: { index: 0, tool_calls: [{ index: 0, function: { arguments: "{\"loc" } }] }
//! Chunk 3: { index: 0, tool_calls: [{ index: 0, function: { arguments: "ation\":\"Paris\"}" } }] }
//! Chunk 4: { index: 0, finish_reason: "tool_calls" }
//! ```
//!
//! The [`DeltaAggregator`] keeps one [`ChoiceAccumulator`] per choice index
//! and only surfaces a [`Choice`] when a finish signal finalizes it. Several
//! choices can be open at once; each is finalized independently.

use crate::dialect::ToolCallFragment;
use crate::types::{Choice, Message, ToolArguments, ToolCall};
use std::collections::{BTreeMap, HashMap};

/// An in-progress tool call being assembled from fragments.
///
/// ```text
/// Initial state:     { id: "", name: "", args: "" }
/// After fragment 1:  { id: "call_123", name: "search", args: "" }
/// After fragment 2:  { id: "call_123", name: "search", args: "{\"q" }
/// After fragment 3:  { id: "call_123", name: "search", args: "{\"q\":\"rust\"}" }
/// ```
///
/// Argument fragments may split JSON at arbitrary byte positions (mid-string,
/// mid-number). They are appended strictly in arrival order and only parsed
/// by [`finish`](Self::finish).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallAccumulator {
    pub id: String,
    pub name: String,
    pub args: String,
}

impl ToolCallAccumulator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args: String::new(),
        }
    }

    /// Merge one fragment. Id and name are set on first sight and never
    /// overwritten by an empty value.
    pub fn apply(&mut self, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            self.id = id.to_string();
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            self.name = name.to_string();
        }
        if let Some(arguments) = arguments {
            self.args.push_str(arguments);
        }
    }

    pub fn append(&mut self, fragment: &str) {
        self.args.push_str(fragment);
    }

    pub fn finish(self) -> ToolCall {
        let arguments = ToolArguments::from_buffer(&self.args);
        ToolCall::new(self.id, self.name, arguments)
    }
}

/// Working state for one choice index.
#[derive(Debug, Clone, Default)]
pub struct ChoiceAccumulator {
    pub index: u32,
    pub text: String,
    /// Tool calls in order of first appearance
    pub tool_calls: Vec<ToolCallAccumulator>,
    pub finish_reason: Option<String>,
    /// Fragment index -> position in `tool_calls`
    slots: HashMap<u32, usize>,
}

impl ChoiceAccumulator {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    fn route(&mut self, fragment: &ToolCallFragment) -> usize {
        if let Some(slot) = fragment.index {
            if let Some(&pos) = self.slots.get(&slot) {
                return pos;
            }
            let pos = self.open_call();
            self.slots.insert(slot, pos);
            return pos;
        }

        if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(pos) = self.tool_calls.iter().position(|call| call.id == id) {
                return pos;
            }
            return self.open_call();
        }

        // Neither index nor id: a continuation of the most recent call.
        match self.tool_calls.len() {
            0 => self.open_call(),
            len => len - 1,
        }
    }

    fn open_call(&mut self) -> usize {
        self.tool_calls.push(ToolCallAccumulator::default());
        self.tool_calls.len() - 1
    }

    pub fn apply_fragment(&mut self, fragment: &ToolCallFragment) {
        let pos = self.route(fragment);
        self.tool_calls[pos].apply(
            fragment.id.as_deref(),
            fragment.name.as_deref(),
            fragment.arguments.as_deref(),
        );
    }

    pub fn into_choice(self, finish_reason: Option<String>) -> Choice {
        let index = self.index;
        let tool_calls = self
            .tool_calls
            .into_iter()
            .enumerate()
            .filter_map(|(pos, mut call)| {
                if call.id.is_empty() && call.name.is_empty() {
                    log::debug!("dropping tool call fragment without id or name on choice {}", index);
                    return None;
                }
                if call.id.is_empty() {
                    call.id = format!("call_{}_{}", index, pos);
                }
                Some(call.finish())
            })
            .collect();

        Choice::new(
            index,
            Message::assistant_tool_calls(self.text, tool_calls),
            finish_reason.or(self.finish_reason),
        )
    }
}

/// Per-choice accumulation of streamed deltas.
#[derive(Debug, Default)]
pub struct DeltaAggregator {
    choices: BTreeMap<u32, ChoiceAccumulator>,
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one delta to choice `index`, creating its accumulator on first
    /// sight. Deltas for the same index must be applied in arrival order.
    pub fn update_delta(&mut self, index: u32, text: Option<&str>, fragments: &[ToolCallFragment]) {
        let choice = self
            .choices
            .entry(index)
            .or_insert_with(|| ChoiceAccumulator::new(index));

        if let Some(text) = text {
            choice.text.push_str(text);
        }
        for fragment in fragments {
            choice.apply_fragment(fragment);
        }
    }

    /// Build the finalized choice for `index` and drop it from the working
    /// set. An index with no accumulated state yields an empty choice.
    pub fn finalize_choice(&mut self, index: u32, finish_reason: &str) -> Choice {
        self.choices
            .remove(&index)
            .unwrap_or_else(|| ChoiceAccumulator::new(index))
            .into_choice(Some(finish_reason.to_string()))
    }

    pub fn is_open(&self, index: u32) -> bool {
        self.choices.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn clear(&mut self) {
        self.choices.clear();
    }
}
