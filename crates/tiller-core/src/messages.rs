//! Message types for context histories and run results.
//!
//! Histories are open-ended: alongside the user, assistant and tool-result
//! entries the runtime produces, callers may persist entries with custom
//! roles (notes, summaries, checkpoints). Those deserialize into
//! [`Message::Opaque`] and round-trip untouched; the `convert_to_llm` hook
//! decides what the model actually sees.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ToolOutput, ToolResultBlock};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One entry in a context history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    /// Caller-defined entry with a role the runtime does not interpret.
    #[serde(untagged)]
    Opaque(Value),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::text(text))
    }

    pub fn user_content(content: UserContent) -> Self {
        Self::User(UserMessage::new(content))
    }

    pub fn role(&self) -> &str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool_result",
            Self::Opaque(value) => value
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Whether this entry is one of the roles the runtime interprets.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Opaque(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: i64,
}

impl UserMessage {
    pub fn new(content: UserContent) -> Self {
        Self {
            content,
            timestamp: now_millis(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(UserContent::Text(text.into()))
    }
}

/// User content is either a plain string or structured blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        /// Base64-encoded image data.
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantBlock>,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub usage: Usage,
    pub stop_reason: StopReason,
    /// Present when `stop_reason` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        content: Vec<AssistantBlock>,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            content,
            model: model.into(),
            provider: provider.into(),
            usage: Usage::default(),
            stop_reason,
            error_message: None,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Concatenated text blocks, ignoring reasoning and tool calls.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let AssistantBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ToolResultBlock>,
    /// Host-side payload kept out of model requests.
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: i64,
}

impl ToolResultMessage {
    pub fn from_output(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: ToolOutput,
        is_error: bool,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: output.content,
            details: output.details,
            is_error,
            timestamp: now_millis(),
        }
    }

    /// Error result carrying a single text block.
    pub fn failure(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::from_output(tool_call_id, tool_name, ToolOutput::text(text), true)
    }

    /// Concatenated text blocks of the result content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ToolResultBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Narrowed history entry: only the roles the transport understands.
/// Produced by a `convert_to_llm` hook from the full [`Message`] history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum LlmMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl LlmMessage {
    /// `None` for opaque entries; conversion hooks drop or rewrite those.
    pub fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::User(m) => Some(Self::User(m.clone())),
            Message::Assistant(m) => Some(Self::Assistant(m.clone())),
            Message::ToolResult(m) => Some(Self::ToolResult(m.clone())),
            Message::Opaque(_) => None,
        }
    }
}

impl From<LlmMessage> for Message {
    fn from(message: LlmMessage) -> Self {
        match message {
            LlmMessage::User(m) => Self::User(m),
            LlmMessage::Assistant(m) => Self::Assistant(m),
            LlmMessage::ToolResult(m) => Self::ToolResult(m),
        }
    }
}

/// Token accounting for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: Cost,
}

/// Dollar cost breakdown for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the response.
    Stop,
    /// Output token limit reached.
    Length,
    /// The model requested tool calls.
    ToolUse,
    /// Generation failed; see `error_message`.
    Error,
    /// Generation was cancelled before completing.
    Aborted,
}
