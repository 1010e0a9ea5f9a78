//! Subscriber-facing agent events.
//!
//! [`AgentEvent`] is what [`Agent::subscribe`](crate::agent::Agent::subscribe)
//! delivers: model output deltas interleaved with turn and tool-execution
//! boundaries. Every event is wrapped in an [`AgentEventEnvelope`] carrying
//! an id, a per-run sequence number, and a timestamp, so consumers can
//! deduplicate, order, and display them.
//!
//! A typical sequence for one prompt:
//! 1. `TurnStart`
//! 2. `TextDelta` / `ThinkingDelta` / `ToolCallDelta` while the model streams
//! 3. `TurnEnd`, then `ToolExecutionStart` / `ToolExecutionEnd` per call
//! 4. back to 1 if tools ran, otherwise `AgentEnd`

use crate::llm::{StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// Why a run ended. Exactly one `AgentEnd` closes every run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// The model finished without requesting tools and no input is queued.
    Completed,
    /// [`Agent::abort`](crate::agent::Agent::abort) was called.
    Aborted,
    /// A fatal error ended the run (fatal provider error, exhausted
    /// retries, or a history the target provider rejects).
    Error { message: String },
}

/// Events emitted during agent execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// One model invocation is starting. `turn` counts invocations within a
    /// run, starting at 0.
    TurnStart { turn: usize },

    /// Streaming visible output.
    TextDelta { delta: String },

    /// Streaming reasoning output.
    ThinkingDelta { delta: String },

    /// Streaming tool-call arguments. `name` is present on the first delta
    /// of a call only.
    ToolCallDelta {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments_delta: String,
    },

    /// One model invocation finished; its message is now in history.
    TurnEnd {
        turn: usize,
        stop_reason: StopReason,
        usage: Usage,
    },

    /// A requested tool is about to execute.
    ToolExecutionStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Progress reported by a running tool.
    ToolExecutionUpdate {
        id: String,
        name: String,
        message: String,
    },

    /// A tool finished; its result is now in history.
    ToolExecutionEnd {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },

    /// A retryable provider failure; the invocation will be retried after
    /// the given delay.
    Retrying {
        attempt: u32,
        delay_ms: u64,
        message: String,
    },

    /// The run is over. Always the final event of a run. `usage` sums token
    /// counts and cost across every model invocation of the run.
    AgentEnd { outcome: EndReason, usage: Usage },
}

impl AgentEvent {
    #[must_use]
    pub const fn turn_start(turn: usize) -> Self {
        Self::TurnStart { turn }
    }

    #[must_use]
    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    #[must_use]
    pub fn thinking_delta(delta: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            delta: delta.into(),
        }
    }

    #[must_use]
    pub fn tool_execution_start(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolExecutionStart {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    #[must_use]
    pub fn tool_execution_end(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolExecutionEnd {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
        }
    }

    #[must_use]
    pub const fn ended(outcome: EndReason, usage: Usage) -> Self {
        Self::AgentEnd { outcome, usage }
    }

    /// Whether this event closes a run.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::AgentEnd { .. })
    }
}

/// Per-run counter assigning each event its position.
///
/// Starts at 0 for every run. Cheap to clone; clones share the counter, so
/// tool tasks emitting progress from other tokio tasks stay in one
/// numbering. Relaxed ordering suffices since the broadcast channel already
/// orders sender against receiver.
#[derive(Clone, Debug)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Claim the next sequence number.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Envelope wrapping every [`AgentEvent`].
///
/// The `event` field is flattened in JSON so `event_id`, `sequence`,
/// `timestamp`, and the event's `type` discriminant appear at one level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentEventEnvelope {
    /// UUID v4 identifying this emission.
    pub event_id: uuid::Uuid,
    /// Position within the run, starting at 0, no gaps.
    pub sequence: u64,
    /// UTC time of emission.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The wrapped event.
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl AgentEventEnvelope {
    /// Wrap an event, assigning it a unique ID, the next sequence number,
    /// and the current UTC timestamp.
    #[must_use]
    pub fn wrap(event: AgentEvent, seq: &SequenceCounter) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            sequence: seq.next(),
            timestamp: OffsetDateTime::now_utc(),
            event,
        }
    }
}
