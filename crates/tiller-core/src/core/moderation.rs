//! Per-chunk stream moderation.
//!
//! A moderator sees every non-empty text chunk as it streams and decides,
//! synchronously, whether generation continues. An abort decision never
//! stops anything by itself; the driver cancels the attempt, discards the
//! partial message and retries with the correction injected as a user
//! message.

use crate::core::config::StreamTextFn;
use crate::messages::UserContent;

/// One text chunk together with everything accumulated so far in the
/// current generation attempt. `accumulated` restarts from empty on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTextEvent {
    pub chunk: String,
    pub accumulated: String,
}

/// Moderator verdict for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDecision {
    Continue,
    /// Abandon this attempt and retry after injecting `content` as a user
    /// message.
    Abort { content: UserContent },
}

impl StreamDecision {
    pub fn abort(text: impl Into<String>) -> Self {
        Self::Abort {
            content: UserContent::Text(text.into()),
        }
    }
}

/// Runs the moderator for one chunk. No moderator means continue.
pub(crate) fn evaluate(
    moderator: Option<&StreamTextFn>,
    chunk: &str,
    accumulated: &str,
) -> StreamDecision {
    match moderator {
        Some(hook) => hook(&StreamTextEvent {
            chunk: chunk.to_string(),
            accumulated: accumulated.to_string(),
        }),
        None => StreamDecision::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn no_moderator_always_continues() {
        assert_eq!(
            evaluate(None, "chunk", "chunk"),
            StreamDecision::Continue
        );
    }

    #[test]
    fn moderator_sees_chunk_and_accumulated() {
        let hook: StreamTextFn = Arc::new(|event| {
            if event.accumulated.contains("bad") {
                StreamDecision::abort("Do not say bad.")
            } else {
                StreamDecision::Continue
            }
        });
        assert_eq!(
            evaluate(Some(&hook), "good", "all good"),
            StreamDecision::Continue
        );
        let decision = evaluate(Some(&hook), "d", "this is bad");
        assert_eq!(
            decision,
            StreamDecision::Abort {
                content: UserContent::Text("Do not say bad.".into())
            }
        );
    }
}
