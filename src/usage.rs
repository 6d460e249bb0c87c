//! Exactly-once usage reporting.

use crate::types::Usage;
use std::fmt;
use std::sync::Arc;

/// Receives the token usage of a finished call.
///
/// Any `Fn(&str, &Usage) + Send + Sync` closure is a listener:
///
/// ```rust
/// use llm_wire::{Usage, UsageListener};
///
/// let listener = |model: &str, usage: &Usage| {
///     println!("{model}: {} tokens", usage.total_tokens);
/// };
/// listener.on_usage("model-x", &Usage::new(10, 3, 13));
/// ```
pub trait UsageListener: Send + Sync {
    fn on_usage(&self, model: &str, usage: &Usage);
}

impl<F> UsageListener for F
where
    F: Fn(&str, &Usage) + Send + Sync,
{
    fn on_usage(&self, model: &str, usage: &Usage) {
        self(model, usage)
    }
}

/// Per-call publication state. Created fresh for every call, never shared.
#[derive(Default)]
pub struct UsagePublisher {
    listener: Option<Arc<dyn UsageListener>>,
    published: bool,
}

impl UsagePublisher {
    pub fn new(listener: Option<Arc<dyn UsageListener>>) -> Self {
        Self {
            listener,
            published: false,
        }
    }

    /// Notify the listener unless already published, the model is unknown,
    /// or there is no usage worth reporting. Returns `true` when this call
    /// published.
    pub fn publish_once(&mut self, model: &str, usage: Option<&Usage>) -> bool {
        if self.published || model.is_empty() {
            return false;
        }
        let Some(usage) = usage.filter(|usage| !usage.is_empty()) else {
            return false;
        };

        if let Some(listener) = &self.listener {
            listener.on_usage(model, usage);
        }
        self.published = true;
        true
    }

    pub fn is_published(&self) -> bool {
        self.published
    }
}

impl fmt::Debug for UsagePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsagePublisher")
            .field("listener", &self.listener.is_some())
            .field("published", &self.published)
            .finish()
    }
}
