//! Lifecycle events emitted by the turn driver.
//!
//! Events arrive in a strict order: `agent_start`, then for each turn
//! `turn_start` .. `turn_end`, then `agent_end`. Message events nest inside
//! turns, and `message_end` alone is enough to reconstruct the history a run
//! appended. `message_update` is a best-effort progress signal and may be
//! dropped under backpressure; every other event is reliable.

use serde::{Deserialize, Serialize};

use crate::messages::{Message, ToolResultMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A run began.
    AgentStart,
    /// A turn began. One turn covers one generation plus its tool phase.
    TurnStart,
    /// A message was appended to the working context, or an assistant
    /// message started streaming. Carries the initial snapshot.
    MessageStart { message: Message },
    /// Streaming progress for an in-flight assistant message. Carries the
    /// partial snapshot so far. Best-effort; may be dropped.
    MessageUpdate { message: Message },
    /// A message reached its final form. Replaying these in order rebuilds
    /// everything the run appended.
    MessageEnd { message: Message },
    /// A tool call is about to execute.
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// A tool call finished, was rejected, or was skipped. `result` is the
    /// same message later appended to the context.
    ToolExecutionEnd {
        tool_call_id: String,
        result: ToolResultMessage,
        is_error: bool,
    },
    /// The current turn finished.
    TurnEnd,
    /// The run finished. `messages` holds exactly what this run appended.
    AgentEnd { messages: Vec<Message> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AssistantBlock, AssistantMessage, StopReason};
    use serde_json::json;

    #[test]
    fn unit_variants_serialize_as_bare_tags() {
        assert_eq!(
            serde_json::to_value(AgentEvent::AgentStart).unwrap(),
            json!({ "type": "agent_start" })
        );
        assert_eq!(
            serde_json::to_value(AgentEvent::TurnEnd).unwrap(),
            json!({ "type": "turn_end" })
        );
    }

    #[test]
    fn message_end_round_trips() {
        let event = AgentEvent::MessageEnd {
            message: Message::Assistant(AssistantMessage::new(
                "test-model",
                "test-provider",
                vec![AssistantBlock::Text { text: "hi".into() }],
                StopReason::Stop,
            )),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message_end");
        assert_eq!(value["message"]["role"], "assistant");
        let back: AgentEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn tool_execution_end_round_trips() {
        let event = AgentEvent::ToolExecutionEnd {
            tool_call_id: "call_1".into(),
            result: ToolResultMessage::failure("call_1", "bash", "exit 1"),
            is_error: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_execution_end");
        assert_eq!(value["is_error"], true);
        let back: AgentEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn agent_end_carries_appended_messages() {
        let event = AgentEvent::AgentEnd {
            messages: vec![Message::user("hi")],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
    }
}
