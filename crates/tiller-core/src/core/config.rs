//! Run configuration: model selection plus the caller-supplied hooks.
//!
//! Hooks are plain function values so callers can capture whatever state
//! they need (queues, budgets, session handles) without implementing a
//! trait per concern.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;

use crate::core::moderation::{StreamDecision, StreamTextEvent};
use crate::messages::{LlmMessage, Message};

/// Required hook: narrows the full history to what the model sees.
/// Runs on every generation attempt, after `transform_context`.
pub type ConvertToLlmFn = Arc<dyn Fn(&[Message]) -> Vec<LlmMessage> + Send + Sync>;

/// Optional hook: rewrites the working context before each attempt
/// (compaction, pruning, redaction). An error fails the run.
pub type TransformContextFn =
    Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, Result<Vec<Message>>> + Send + Sync>;

/// Optional hook: drains queued user messages. Polled before each tool
/// call; the first non-empty batch interrupts the remaining calls.
pub type SteeringFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Message>>> + Send + Sync>;

/// Optional hook: synchronous per-chunk moderation of streamed text.
pub type StreamTextFn = Arc<dyn Fn(&StreamTextEvent) -> StreamDecision + Send + Sync>;

#[derive(Clone)]
pub struct AgentConfig {
    pub model: String,
    pub convert_to_llm: ConvertToLlmFn,
    pub transform_context: Option<TransformContextFn>,
    pub get_steering_messages: Option<SteeringFn>,
    pub on_stream_text: Option<StreamTextFn>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>, convert_to_llm: ConvertToLlmFn) -> Self {
        Self {
            model: model.into(),
            convert_to_llm,
            transform_context: None,
            get_steering_messages: None,
            on_stream_text: None,
        }
    }

    #[must_use]
    pub fn with_transform_context(mut self, hook: TransformContextFn) -> Self {
        self.transform_context = Some(hook);
        self
    }

    #[must_use]
    pub fn with_steering(mut self, hook: SteeringFn) -> Self {
        self.get_steering_messages = Some(hook);
        self
    }

    #[must_use]
    pub fn with_stream_text(mut self, hook: StreamTextFn) -> Self {
        self.on_stream_text = Some(hook);
        self
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("transform_context", &self.transform_context.is_some())
            .field("get_steering_messages", &self.get_steering_messages.is_some())
            .field("on_stream_text", &self.on_stream_text.is_some())
            .finish_non_exhaustive()
    }
}

/// Conversion hook that forwards recognized roles and drops opaque entries.
pub fn convert_recognized() -> ConvertToLlmFn {
    Arc::new(|messages| {
        messages
            .iter()
            .filter_map(LlmMessage::from_message)
            .collect()
    })
}

/// A run was started against a context it cannot work with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Continuation was requested on a context with no messages.
    pub fn empty_context() -> Self {
        Self::new("Cannot continue: no messages in context")
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_error_message_is_stable() {
        assert_eq!(
            ConfigError::empty_context().to_string(),
            "Cannot continue: no messages in context"
        );
    }

    #[test]
    fn config_error_downcasts_from_anyhow() {
        let err: anyhow::Error = ConfigError::empty_context().into();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn convert_recognized_drops_opaque() {
        let convert = convert_recognized();
        let messages = vec![
            Message::user("hi"),
            Message::Opaque(serde_json::json!({ "role": "note" })),
        ];
        assert_eq!(convert(&messages).len(), 1);
    }

    #[test]
    fn debug_shows_which_hooks_are_set() {
        let config = AgentConfig::new("test-model", convert_recognized());
        let rendered = format!("{config:?}");
        assert!(rendered.contains("test-model"));
        assert!(rendered.contains("transform_context: false"));
    }
}
