//! Transport contract between the turn driver and model backends.
//!
//! A backend is just a function: it receives one [`StreamRequest`] and
//! returns a stream of [`StreamEvent`]s ending in `Done` or `Error`. The
//! driver never talks HTTP itself, which keeps backends swappable and makes
//! scripted streams trivial to build in tests.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::messages::{AssistantMessage, LlmMessage, StopReason};
use crate::tools::ToolDefinition;

/// Incremental events produced while one assistant message is generated.
///
/// Block events carry the content index they apply to. Every stream must end
/// with exactly one `Done` or `Error`, each carrying the complete assistant
/// message for the generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start,
    TextStart {
        index: usize,
    },
    TextDelta {
        index: usize,
        delta: String,
    },
    TextEnd {
        index: usize,
        text: String,
    },
    ReasoningStart {
        index: usize,
    },
    ReasoningDelta {
        index: usize,
        delta: String,
    },
    ReasoningSignature {
        index: usize,
        signature: String,
    },
    ReasoningEnd {
        index: usize,
        reasoning: String,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// Partial JSON for the arguments of the tool call at `index`.
    ToolCallDelta {
        index: usize,
        arguments_delta: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        reason: StopReason,
        message: AssistantMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection could not be established or was lost.
    Connect,
    Timeout,
    /// Malformed or truncated payload from the backend.
    Parse,
    /// Error reported by the backend itself.
    Api,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect error",
            Self::Timeout => "timeout",
            Self::Parse => "parse error",
            Self::Api => "api error",
        };
        f.write_str(label)
    }
}

/// Failure surfaced by a transport mid-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;

/// Event stream for one generation attempt.
pub type AssistantStream = BoxStream<'static, TransportResult<StreamEvent>>;

/// Everything a backend needs for one generation attempt.
///
/// `cancel` is minted per attempt; the driver cancels it to abandon this
/// attempt without touching the rest of the run.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolDefinition>,
    pub cancel: CancellationToken,
}

/// Backend entry point. Errors returned here (before any stream exists)
/// fail the run; failures after the stream starts travel in-band as
/// `Err` items or an `Error` event.
pub type StreamFn =
    Arc<dyn Fn(StreamRequest) -> BoxFuture<'static, Result<AssistantStream>> + Send + Sync>;
