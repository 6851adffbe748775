//! Tool contract consumed by the turn driver.
//!
//! Tools are host-defined capabilities the model can invoke mid-run. The
//! driver only depends on this trait; execution details (filesystem, HTTP,
//! subprocesses) stay on the caller's side of the boundary.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-facing description of a tool, sent to the model with each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// One block of tool output content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        /// Base64-encoded image data.
        data: String,
    },
}

/// What a tool returns on success: model-visible content plus a host-side
/// details payload that is kept in the context but never sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolResultBlock>,
    #[serde(default)]
    pub details: Value,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::Text { text: text.into() }],
            details: Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A capability the model can call during a run.
///
/// Implementations must be cheap to share; the driver clones the `Arc` and
/// runs `execute` on its own task so a panicking tool cannot take down the
/// run.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments this tool accepts.
    fn parameters(&self) -> Value;

    async fn execute(&self, tool_call_id: &str, arguments: Value) -> Result<ToolOutput>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters(),
        }
    }
}
