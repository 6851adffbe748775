//! Turn driver for UI-agnostic loop execution.
//!
//! The driver alternates model generation and tool execution against a
//! private copy of the caller's context and emits `AgentEvent`s via async
//! channels. No direct stdout/stderr writes occur in this module.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::{AgentConfig, ConfigError};
use crate::core::events::AgentEvent;
use crate::core::moderation::{self, StreamDecision};
use crate::messages::{
    AssistantBlock, AssistantMessage, Message, StopReason, ToolResultMessage, UserContent,
};
use crate::tools::{Tool, ToolDefinition};
use crate::transport::{
    AssistantStream, StreamEvent, StreamFn, StreamRequest, TransportError, TransportErrorKind,
};

/// Input to a run: system prompt, prior messages and available tools.
///
/// The driver never mutates the caller's context. It works on a private
/// copy and returns only the messages it appended; callers merge those
/// back however they store history.
#[derive(Clone)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl AgentContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("system_prompt", &self.system_prompt)
            .field("messages", &self.messages.len())
            .field(
                "tools",
                &self.tools.iter().map(|tool| tool.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Channel-based event sender (async, bounded).
///
/// Events are wrapped in `Arc` for efficient cloning to multiple consumers.
pub type AgentEventTx = mpsc::Sender<Arc<AgentEvent>>;

/// Channel-based event receiver (async, bounded).
pub type AgentEventRx = mpsc::Receiver<Arc<AgentEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort `message_update` sends
/// without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for high-volume events (`MessageUpdate`) that can be
/// dropped if the consumer is slow. Use `send_important()` for events that
/// must be delivered (lifecycle, message boundaries, tool execution).
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
}

impl EventSender {
    /// Creates a new `EventSender` wrapping the given channel sender.
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: AgentEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: AgentEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}

/// Spawns a broadcast task that distributes events to multiple consumers.
///
/// Uses `try_send` (best-effort) to prevent slow consumers from blocking
/// others. Events are dropped if a consumer's channel is full. Closed
/// channels are automatically removed.
///
/// The task exits when the source channel closes.
pub fn spawn_broadcaster(
    mut rx: AgentEventRx,
    mut subscribers: Vec<AgentEventTx>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            subscribers.retain(|tx| {
                match tx.try_send(Arc::clone(&event)) {
                    Ok(()) | Err(TrySendError::Full(_)) => true, // drop this event, keep channel
                    Err(TrySendError::Closed(_)) => false,       // remove closed channel
                }
            });
        }
    })
}

/// Result text for tool calls skipped after steering messages arrive.
pub const SKIPPED_TOOL_MESSAGE: &str = "Skipped due to queued user message";

/// One tool call extracted from an assistant message, ready for dispatch.
#[derive(Debug, Clone)]
struct ToolCallRequest {
    id: String,
    name: String,
    arguments: Value,
}

fn requested_tool_calls(message: &AssistantMessage) -> Vec<ToolCallRequest> {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            AssistantBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some(ToolCallRequest {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Accumulates streamed blocks into partial assistant snapshots.
///
/// The terminal `done`/`error` event carries the authoritative message; the
/// draft feeds `message_start`/`message_update` snapshots and stands in
/// when the stream dies without a terminal event.
#[derive(Debug, Clone)]
struct AssistantDraft {
    model: String,
    blocks: Vec<DraftBlock>,
    accumulated_text: String,
}

#[derive(Debug, Clone)]
enum DraftBlock {
    Text {
        index: usize,
        text: String,
    },
    Reasoning {
        index: usize,
        text: String,
        signature: Option<String>,
    },
    ToolCall {
        index: usize,
        id: String,
        name: String,
        arguments_json: String,
    },
}

impl DraftBlock {
    fn index(&self) -> usize {
        match self {
            Self::Text { index, .. }
            | Self::Reasoning { index, .. }
            | Self::ToolCall { index, .. } => *index,
        }
    }
}

impl AssistantDraft {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            blocks: Vec::new(),
            accumulated_text: String::new(),
        }
    }

    /// All text streamed so far in this attempt. Resets with the draft on
    /// retry.
    fn accumulated(&self) -> &str {
        &self.accumulated_text
    }

    fn slot(&mut self, index: usize, make: impl FnOnce(usize) -> DraftBlock) -> &mut DraftBlock {
        let at = match self.blocks.iter().position(|block| block.index() == index) {
            Some(at) => at,
            None => {
                self.blocks.push(make(index));
                self.blocks.len() - 1
            }
        };
        &mut self.blocks[at]
    }

    fn append_text(&mut self, index: usize, delta: &str) {
        self.accumulated_text.push_str(delta);
        if let DraftBlock::Text { text, .. } = self.slot(index, |index| DraftBlock::Text {
            index,
            text: String::new(),
        }) {
            text.push_str(delta);
        }
    }

    /// Folds a non-terminal stream event into the draft. Returns whether
    /// the visible snapshot changed. `TextDelta` goes through
    /// [`Self::append_text`] instead so the caller can moderate it.
    fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::TextStart { index } => {
                self.slot(*index, |index| DraftBlock::Text {
                    index,
                    text: String::new(),
                });
                false
            }
            StreamEvent::TextEnd { index, text } => {
                if let DraftBlock::Text { text: current, .. } =
                    self.slot(*index, |index| DraftBlock::Text {
                        index,
                        text: String::new(),
                    })
                {
                    *current = text.clone();
                }
                true
            }
            StreamEvent::ReasoningStart { index } => {
                self.slot(*index, |index| DraftBlock::Reasoning {
                    index,
                    text: String::new(),
                    signature: None,
                });
                false
            }
            StreamEvent::ReasoningDelta { index, delta } => {
                if let DraftBlock::Reasoning { text, .. } =
                    self.slot(*index, |index| DraftBlock::Reasoning {
                        index,
                        text: String::new(),
                        signature: None,
                    })
                {
                    text.push_str(delta);
                }
                true
            }
            StreamEvent::ReasoningSignature { index, signature } => {
                if let DraftBlock::Reasoning {
                    signature: current, ..
                } = self.slot(*index, |index| DraftBlock::Reasoning {
                    index,
                    text: String::new(),
                    signature: None,
                }) {
                    *current = Some(signature.clone());
                }
                true
            }
            StreamEvent::ReasoningEnd { index, reasoning } => {
                if let DraftBlock::Reasoning { text, .. } =
                    self.slot(*index, |index| DraftBlock::Reasoning {
                        index,
                        text: String::new(),
                        signature: None,
                    })
                {
                    *text = reasoning.clone();
                }
                true
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.slot(*index, |index| DraftBlock::ToolCall {
                    index,
                    id: id.clone(),
                    name: name.clone(),
                    arguments_json: String::new(),
                });
                true
            }
            StreamEvent::ToolCallDelta {
                index,
                arguments_delta,
            } => {
                if let DraftBlock::ToolCall { arguments_json, .. } =
                    self.slot(*index, |index| DraftBlock::ToolCall {
                        index,
                        id: String::new(),
                        name: String::new(),
                        arguments_json: String::new(),
                    })
                {
                    arguments_json.push_str(arguments_delta);
                }
                true
            }
            StreamEvent::Start
            | StreamEvent::TextDelta { .. }
            | StreamEvent::ToolCallEnd { .. }
            | StreamEvent::Done { .. }
            | StreamEvent::Error { .. } => false,
        }
    }

    fn assistant_blocks(&self) -> Vec<AssistantBlock> {
        self.blocks
            .iter()
            .map(|block| match block {
                DraftBlock::Text { text, .. } => AssistantBlock::Text { text: text.clone() },
                DraftBlock::Reasoning {
                    text, signature, ..
                } => AssistantBlock::Reasoning {
                    reasoning: text.clone(),
                    signature: signature.clone(),
                },
                DraftBlock::ToolCall {
                    id,
                    name,
                    arguments_json,
                    ..
                } => AssistantBlock::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: serde_json::from_str(arguments_json).unwrap_or(Value::Null),
                },
            })
            .collect()
    }

    /// Partial snapshot for `message_start`/`message_update` events.
    fn snapshot(&self) -> AssistantMessage {
        AssistantMessage::new(
            self.model.clone(),
            String::new(),
            self.assistant_blocks(),
            StopReason::Stop,
        )
    }

    /// Error-stop message standing in for a missing terminal event.
    fn into_failure(self, error: &TransportError) -> AssistantMessage {
        let blocks = self.assistant_blocks();
        AssistantMessage::new(self.model, String::new(), blocks, StopReason::Error)
            .with_error_message(error.to_string())
    }
}

/// Outcome of one generation attempt.
enum GenerationOutcome {
    Completed(AssistantMessage),
    /// Moderator abort: the partial message is discarded and `content`
    /// becomes a correction user message.
    Aborted { content: UserContent },
}

/// Working copy of the context plus the messages appended during the run.
struct RunState {
    working: Vec<Message>,
    appended: Vec<Message>,
}

impl RunState {
    fn new(existing: Vec<Message>) -> Self {
        Self {
            working: existing,
            appended: Vec::new(),
        }
    }

    /// Appends a finalized message, emitting its start/end events.
    async fn append(&mut self, message: Message, sender: &EventSender) {
        sender
            .send_important(AgentEvent::MessageStart {
                message: message.clone(),
            })
            .await;
        self.working.push(message.clone());
        self.appended.push(message.clone());
        sender
            .send_important(AgentEvent::MessageEnd { message })
            .await;
    }

    /// Appends an assistant message whose `message_start` already went out
    /// while streaming.
    async fn append_streamed(&mut self, message: Message, sender: &EventSender) {
        self.working.push(message.clone());
        self.appended.push(message.clone());
        sender
            .send_important(AgentEvent::MessageEnd { message })
            .await;
    }
}

/// Runs a fresh loop: appends `prompts` to a copy of the context, then
/// alternates generation and tool execution until the model stops
/// requesting tools.
///
/// Returns the messages appended during the run, in order. `cancel` links
/// the run to caller-side cancellation; `None` gives the run its own root
/// token.
pub async fn run_agent_loop(
    prompts: Vec<Message>,
    context: &AgentContext,
    config: &AgentConfig,
    cancel: Option<CancellationToken>,
    stream_fn: &StreamFn,
    tx: AgentEventTx,
) -> Result<Vec<Message>> {
    let sender = EventSender::new(tx);
    drive(prompts, context, config, cancel, stream_fn, &sender).await
}

/// Resumes a context as-is: generation starts from the existing messages
/// with no new prompt. Fails before emitting any event if the context has
/// no messages.
pub async fn continue_agent_loop(
    context: &AgentContext,
    config: &AgentConfig,
    cancel: Option<CancellationToken>,
    stream_fn: &StreamFn,
    tx: AgentEventTx,
) -> Result<Vec<Message>> {
    if context.messages.is_empty() {
        return Err(ConfigError::empty_context().into());
    }
    let sender = EventSender::new(tx);
    drive(Vec::new(), context, config, cancel, stream_fn, &sender).await
}

async fn drive(
    prompts: Vec<Message>,
    context: &AgentContext,
    config: &AgentConfig,
    cancel: Option<CancellationToken>,
    stream_fn: &StreamFn,
    sender: &EventSender,
) -> Result<Vec<Message>> {
    let run_id = Uuid::new_v4();
    let run_token = cancel.map_or_else(CancellationToken::new, |outer| outer.child_token());
    let tool_defs: Vec<ToolDefinition> =
        context.tools.iter().map(|tool| tool.definition()).collect();

    debug!(
        run_id = %run_id,
        model = %config.model,
        tools = tool_defs.len(),
        prompts = prompts.len(),
        "run starting"
    );

    let mut state = RunState::new(context.messages.clone());

    sender.send_important(AgentEvent::AgentStart).await;
    sender.send_important(AgentEvent::TurnStart).await;

    for prompt in prompts {
        state.append(prompt, sender).await;
    }

    let mut turns = 0usize;
    let stop_reason = loop {
        turns += 1;
        let assistant = generate(
            config,
            stream_fn,
            &context.system_prompt,
            &tool_defs,
            &run_token,
            &mut state,
            sender,
        )
        .await?;

        let stop_reason = assistant.stop_reason;
        let calls = requested_tool_calls(&assistant);
        state
            .append_streamed(Message::Assistant(assistant), sender)
            .await;

        if stop_reason == StopReason::ToolUse && !calls.is_empty() {
            run_tool_phase(&calls, context, config, &mut state, sender).await?;
            sender.send_important(AgentEvent::TurnEnd).await;
            sender.send_important(AgentEvent::TurnStart).await;
            continue;
        }
        break stop_reason;
    };

    sender.send_important(AgentEvent::TurnEnd).await;
    sender
        .send_important(AgentEvent::AgentEnd {
            messages: state.appended.clone(),
        })
        .await;

    debug!(
        run_id = %run_id,
        turns,
        stop_reason = ?stop_reason,
        appended = state.appended.len(),
        "run finished"
    );
    Ok(state.appended)
}

/// Runs generation attempts until one completes.
///
/// Each attempt re-runs `transform_context` and `convert_to_llm` on the
/// working context and gets a fresh child token. A moderator abort cancels
/// that token, injects the correction and retries; there is no retry cap.
async fn generate(
    config: &AgentConfig,
    stream_fn: &StreamFn,
    system_prompt: &str,
    tool_defs: &[ToolDefinition],
    run_token: &CancellationToken,
    state: &mut RunState,
    sender: &EventSender,
) -> Result<AssistantMessage> {
    loop {
        if let Some(transform) = &config.transform_context {
            state.working = transform(state.working.clone()).await?;
        }
        let messages = (config.convert_to_llm)(&state.working);

        let attempt_token = run_token.child_token();
        let request = StreamRequest {
            model: config.model.clone(),
            system_prompt: system_prompt.to_string(),
            messages,
            tools: tool_defs.to_vec(),
            cancel: attempt_token.clone(),
        };
        let stream = stream_fn(request).await?;

        match consume_stream(stream, &attempt_token, config, sender).await {
            GenerationOutcome::Completed(message) => return Ok(message),
            GenerationOutcome::Aborted { content } => {
                debug!("moderator aborted generation, retrying with correction");
                state.append(Message::user_content(content), sender).await;
            }
        }
    }
}

/// Drains one transport stream into a terminal assistant message.
///
/// Emits `message_start` when the stream produces its first event and
/// `message_update` as content accrues. Mid-stream transport failures and
/// streams that end without a terminal event produce an error-stop message
/// instead of failing the run.
async fn consume_stream(
    mut stream: AssistantStream,
    attempt_token: &CancellationToken,
    config: &AgentConfig,
    sender: &EventSender,
) -> GenerationOutcome {
    let mut draft = AssistantDraft::new(&config.model);
    let mut started = false;

    while let Some(item) = stream.next().await {
        if !started {
            started = true;
            sender
                .send_important(AgentEvent::MessageStart {
                    message: Message::Assistant(draft.snapshot()),
                })
                .await;
        }
        let event = match item {
            Ok(event) => event,
            Err(error) => {
                warn!(error = %error, "transport failed mid-stream");
                return GenerationOutcome::Completed(draft.into_failure(&error));
            }
        };
        match event {
            StreamEvent::Done { message, .. } => {
                return GenerationOutcome::Completed(message);
            }
            StreamEvent::Error { message, .. } => {
                warn!(reason = ?message.stop_reason, "transport reported an error event");
                return GenerationOutcome::Completed(message);
            }
            StreamEvent::TextDelta { index, delta } => {
                if delta.is_empty() {
                    continue;
                }
                draft.append_text(index, &delta);
                match moderation::evaluate(
                    config.on_stream_text.as_ref(),
                    &delta,
                    draft.accumulated(),
                ) {
                    StreamDecision::Continue => {
                        sender.send_delta(AgentEvent::MessageUpdate {
                            message: Message::Assistant(draft.snapshot()),
                        });
                    }
                    StreamDecision::Abort { content } => {
                        attempt_token.cancel();
                        return GenerationOutcome::Aborted { content };
                    }
                }
            }
            other => {
                if draft.apply(&other) {
                    sender.send_delta(AgentEvent::MessageUpdate {
                        message: Message::Assistant(draft.snapshot()),
                    });
                }
            }
        }
    }

    warn!("transport stream ended without a terminal event");
    if !started {
        sender
            .send_important(AgentEvent::MessageStart {
                message: Message::Assistant(draft.snapshot()),
            })
            .await;
    }
    let error = TransportError::new(
        TransportErrorKind::Parse,
        "stream ended without a terminal event",
    );
    GenerationOutcome::Completed(draft.into_failure(&error))
}

/// Executes the tool calls from one assistant message, in order.
///
/// Before each call the steering hook is drained; the first non-empty
/// batch is appended to the context and every not-yet-executed call is
/// skipped with a synthetic error result. All results are appended after
/// the phase, in call order.
async fn run_tool_phase(
    calls: &[ToolCallRequest],
    context: &AgentContext,
    config: &AgentConfig,
    state: &mut RunState,
    sender: &EventSender,
) -> Result<()> {
    let mut interrupted = false;
    let mut results = Vec::with_capacity(calls.len());

    for call in calls {
        if !interrupted
            && let Some(steering) = &config.get_steering_messages
        {
            let queued = steering().await?;
            if !queued.is_empty() {
                info!(
                    queued = queued.len(),
                    "steering messages arrived, skipping remaining tool calls"
                );
                for message in queued {
                    state.append(message, sender).await;
                }
                interrupted = true;
            }
        }

        sender
            .send_important(AgentEvent::ToolExecutionStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            })
            .await;

        let result = if interrupted {
            ToolResultMessage::failure(call.id.clone(), call.name.clone(), SKIPPED_TOOL_MESSAGE)
        } else {
            execute_tool_call(context, call).await
        };

        sender
            .send_important(AgentEvent::ToolExecutionEnd {
                tool_call_id: call.id.clone(),
                result: result.clone(),
                is_error: result.is_error,
            })
            .await;
        results.push(result);
    }

    for result in results {
        state.append(Message::ToolResult(result), sender).await;
    }
    Ok(())
}

/// Runs one tool call on its own task. Failures and panics become error
/// results; they never abort the run.
async fn execute_tool_call(context: &AgentContext, call: &ToolCallRequest) -> ToolResultMessage {
    let Some(tool) = context.tools.iter().find(|tool| tool.name() == call.name) else {
        warn!(tool = %call.name, "model requested an unknown tool");
        return ToolResultMessage::failure(
            call.id.clone(),
            call.name.clone(),
            format!("Unknown tool: {}", call.name),
        );
    };

    let tool = Arc::clone(tool);
    let id = call.id.clone();
    let arguments = call.arguments.clone();
    let handle = tokio::spawn(async move { tool.execute(&id, arguments).await });

    match handle.await {
        Ok(Ok(output)) => {
            ToolResultMessage::from_output(call.id.clone(), call.name.clone(), output, false)
        }
        Ok(Err(error)) => {
            warn!(tool = %call.name, error = %error, "tool execution failed");
            ToolResultMessage::failure(call.id.clone(), call.name.clone(), error.to_string())
        }
        Err(join_error) => {
            warn!(tool = %call.name, error = %join_error, "tool task did not complete");
            let text = if join_error.is_panic() {
                format!("Tool panicked: {join_error}")
            } else {
                format!("Tool task was cancelled: {join_error}")
            };
            ToolResultMessage::failure(call.id.clone(), call.name.clone(), text)
        }
    }
}
