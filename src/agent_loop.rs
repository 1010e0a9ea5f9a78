//! The turn state machine.
//!
//! One run is one task executing [`run`]: transform history for the target
//! provider, stream a model invocation (with bounded retry), append the
//! assistant message, execute requested tools, drain steering input, and
//! repeat until the model stops without tool calls and nothing is queued.
//! Exactly one `AgentEnd` event closes every run.

pub mod queues;
pub(crate) mod tool_execution;

#[cfg(test)]
pub(crate) mod test_utils;

pub use queues::{DrainMode, MessageQueue};

use crate::events::{AgentEvent, AgentEventEnvelope, EndReason, SequenceCounter};
use crate::llm::{
    transform, EventStream, Message, RetryConfig, RetryError, StopReason, StreamAccumulator,
    StreamErrorKind, StreamEvent, StreamRequest, ThinkingLevel, Usage,
};
use crate::model::Model;
use crate::providers;
use crate::tools::ToolSet;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tool_execution::execute_tool_calls;

/// Seam between the loop and the provider layer.
///
/// The HTTP implementation dispatches on the model's wire protocol; tests
/// substitute a scripted client.
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &Model;

    /// Start one adapter invocation. The returned stream terminates in
    /// exactly one `Done` or `Error` event.
    fn stream(&self, request: StreamRequest, cancel: &CancellationToken) -> EventStream;
}

/// [`ModelClient`] backed by the real provider adapters.
pub struct HttpModelClient {
    model: Model,
}

impl HttpModelClient {
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self { model }
    }
}

impl ModelClient for HttpModelClient {
    fn model(&self) -> &Model {
        &self.model
    }

    fn stream(&self, request: StreamRequest, cancel: &CancellationToken) -> EventStream {
        providers::stream_model(&self.model, request, cancel)
    }
}

/// Wraps events in envelopes and broadcasts them to subscribers.
///
/// Emission is synchronous and never blocks the loop; a run with no
/// subscribers simply drops its events.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<AgentEventEnvelope>,
    seq: SequenceCounter,
}

impl EventEmitter {
    pub(crate) fn new(tx: broadcast::Sender<AgentEventEnvelope>) -> Self {
        Self {
            tx,
            seq: SequenceCounter::new(),
        }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        let envelope = AgentEventEnvelope::wrap(event, &self.seq);
        let _ = self.tx.send(envelope);
    }
}

/// Loop behavior knobs, set once at agent construction.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Retry policy for retryable provider failures.
    pub retry: RetryConfig,
    /// Wall-clock limit per tool call. `None` disables the limit.
    pub tool_timeout: Option<Duration>,
    /// Hard cap on model invocations per run.
    pub max_turns: usize,
    /// How many steering messages each drain point consumes.
    pub steering_drain: DrainMode,
    /// How many follow-up messages the next prompt consumes.
    pub follow_up_drain: DrainMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            tool_timeout: None,
            max_turns: 50,
            steering_drain: DrainMode::OneAtATime,
            follow_up_drain: DrainMode::All,
        }
    }
}

/// Everything one run borrows from its agent.
pub(crate) struct RunContext {
    pub client: Arc<dyn ModelClient>,
    pub tools: Arc<ToolSet>,
    pub history: Arc<Mutex<Vec<Message>>>,
    pub steering: Arc<MessageQueue>,
    pub system_prompt: Option<String>,
    pub thinking: ThinkingLevel,
    pub api_key: String,
    pub config: AgentConfig,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
}

impl RunContext {
    fn snapshot_history(&self) -> Vec<Message> {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn append_history(&self, messages: impl IntoIterator<Item = Message>) {
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend(messages);
    }
}

/// Drive one run to its `AgentEnd`.
pub(crate) async fn run(ctx: RunContext) {
    let mut total_usage = Usage::default();
    let outcome = run_turns(&ctx, &mut total_usage).await;
    info!(
        "run finished model={} outcome={outcome:?} cost={}",
        ctx.client.model().id,
        total_usage.cost
    );
    ctx.emitter.emit(AgentEvent::ended(outcome, total_usage));
}

async fn run_turns(ctx: &RunContext, total_usage: &mut Usage) -> EndReason {
    let mut turn = 0usize;
    loop {
        if ctx.cancel.is_cancelled() {
            return EndReason::Aborted;
        }
        if turn >= ctx.config.max_turns {
            return EndReason::Error {
                message: format!("turn limit of {} reached", ctx.config.max_turns),
            };
        }

        let api = ctx.client.model().api;
        let messages = match transform(&ctx.snapshot_history(), api) {
            Ok(messages) => messages,
            Err(error) => {
                return EndReason::Error {
                    message: error.to_string(),
                }
            }
        };
        let request = StreamRequest {
            system_prompt: ctx.system_prompt.clone(),
            messages,
            tools: ctx.tools.specs(),
            thinking: ctx.thinking,
            max_tokens: ctx.client.model().max_tokens,
            api_key: ctx.api_key.clone(),
        };

        ctx.emitter.emit(AgentEvent::turn_start(turn));
        let completed = match stream_with_retry(ctx, request).await {
            StreamOutcome::Completed(completed) => completed,
            StreamOutcome::Aborted => return EndReason::Aborted,
            StreamOutcome::Failed(message) => return EndReason::Error { message },
        };

        total_usage.add(&completed.usage);
        ctx.append_history([completed.message]);
        ctx.emitter.emit(AgentEvent::TurnEnd {
            turn,
            stop_reason: completed.stop_reason,
            usage: completed.usage,
        });

        if !completed.tool_calls.is_empty() {
            let records = execute_tool_calls(
                &ctx.tools,
                completed.tool_calls,
                &ctx.cancel,
                ctx.config.tool_timeout,
                &ctx.emitter,
            )
            .await;
            // Results land in history even on abort so a later
            // continue_turn() sees every tool call answered.
            ctx.append_history(
                records
                    .into_iter()
                    .map(|r| Message::tool_result(r.id, r.content, r.is_error)),
            );
            if ctx.cancel.is_cancelled() {
                return EndReason::Aborted;
            }
            ctx.append_history(ctx.steering.drain(ctx.config.steering_drain));
            turn += 1;
            continue;
        }

        let steered = ctx.steering.drain(ctx.config.steering_drain);
        if steered.is_empty() {
            return EndReason::Completed;
        }
        debug!("steering drained count={}", steered.len());
        ctx.append_history(steered);
        turn += 1;
    }
}

/// Result of one successful model invocation.
struct CompletedTurn {
    message: Message,
    stop_reason: StopReason,
    usage: Usage,
    tool_calls: Vec<(String, String, serde_json::Value)>,
}

enum StreamOutcome {
    Completed(CompletedTurn),
    Aborted,
    Failed(String),
}

/// Stream one invocation, retrying retryable failures with backoff.
///
/// Each attempt starts a fresh accumulator; deltas forwarded before a
/// retryable failure are re-emitted by the retried attempt.
async fn stream_with_retry(ctx: &RunContext, request: StreamRequest) -> StreamOutcome {
    let retry = &ctx.config.retry;
    let mut attempt = 0u32;
    loop {
        let mut accumulator = StreamAccumulator::new();
        let mut stream = ctx.client.stream(request.clone(), &ctx.cancel);
        let mut failure: Option<(StreamErrorKind, String, bool)> = None;

        while let Some(event) = stream.next().await {
            match &event {
                StreamEvent::Error {
                    kind,
                    message,
                    retryable,
                } => {
                    failure = Some((*kind, message.clone(), *retryable));
                    break;
                }
                StreamEvent::TextDelta { delta } => {
                    ctx.emitter.emit(AgentEvent::text_delta(delta.clone()));
                }
                StreamEvent::ThinkingDelta { delta } => {
                    ctx.emitter.emit(AgentEvent::thinking_delta(delta.clone()));
                }
                StreamEvent::ToolCallDelta {
                    id,
                    name,
                    arguments_delta,
                } => {
                    ctx.emitter.emit(AgentEvent::ToolCallDelta {
                        id: id.clone(),
                        name: name.clone(),
                        arguments_delta: arguments_delta.clone(),
                    });
                }
                StreamEvent::Start { .. }
                | StreamEvent::ToolCallEnd { .. }
                | StreamEvent::Done { .. } => {}
            }
            accumulator.apply(&event);
        }

        let Some((kind, message, retryable)) = failure else {
            return StreamOutcome::Completed(CompletedTurn {
                stop_reason: accumulator.stop_reason().unwrap_or(StopReason::EndTurn),
                usage: accumulator.usage(),
                tool_calls: accumulator.tool_calls(),
                message: accumulator.into_message(),
            });
        };

        if kind == StreamErrorKind::Cancelled {
            return StreamOutcome::Aborted;
        }
        if !retryable {
            return StreamOutcome::Failed(message);
        }
        if attempt >= retry.max_retries {
            return StreamOutcome::Failed(
                RetryError {
                    attempts: attempt + 1,
                    last_message: message,
                }
                .to_string(),
            );
        }

        attempt += 1;
        let delay = retry.delay_for(attempt);
        warn!(
            "provider failure, retrying attempt={attempt} delay_ms={} error={message}",
            delay.as_millis()
        );
        ctx.emitter.emit(AgentEvent::Retrying {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            message,
        });
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancel.cancelled() => return StreamOutcome::Aborted,
        }
    }
}
