//! Canonical message and stream-event vocabulary.
//!
//! Every provider adapter translates its vendor wire format into the types
//! here. The rest of the crate (transform, agent loop, tools) only ever sees
//! this vocabulary, never vendor shapes.

pub mod retry;
pub mod stream;
pub mod transform;

pub use retry::{RetryConfig, RetryError};
pub use stream::{EventStream, StreamAccumulator};
pub use transform::{transform, TransformError};

use crate::model::Model;
use serde::{Deserialize, Serialize};

/// One unit of conversation history.
///
/// History is an append-only ordered sequence; nothing in the core reorders
/// or deduplicates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: Vec<ContentBlock>,
    },
    User {
        content: Vec<ContentBlock>,
    },
    Assistant {
        content: Vec<ContentBlock>,
    },
    ToolResult {
        tool_call_id: String,
        content: Vec<ContentBlock>,
        is_error: bool,
    },
}

impl Message {
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
        }
    }

    /// Content blocks of this message, regardless of variant.
    #[must_use]
    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content }
            | Self::ToolResult { content, .. } => content,
        }
    }

    /// Concatenated text of all `Text` blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls requested by an assistant message.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content().iter().filter_map(|b| match b {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }
}

/// One block inside a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    /// Extended-reasoning content, distinct from visible output text.
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Requested reasoning depth, mapped per provider (thinking budget tokens
/// for the messages API, `reasoning.effort` for the responses API).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Canonical stop reason mapped from vendor finish reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Refusal,
}

/// Token usage for one adapter invocation, with cost computed from the
/// model's rates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
    /// USD, derived from the model descriptor's cost rates.
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cost += other.cost;
    }

    /// Fill in the cost field from a model's rates.
    pub fn price_with(&mut self, model: &Model) {
        self.cost = model.cost_of(
            self.input_tokens,
            self.output_tokens,
            self.cache_read_tokens,
            self.cache_write_tokens,
        );
    }
}

/// Classification of a stream-ending error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Fatal HTTP failure (4xx auth/invalid request).
    Http,
    /// 429 from the vendor.
    RateLimit,
    /// Network-level failure (connect, reset, timeout) or 5xx.
    Transport,
    /// Malformed vendor chunk. Never retried: data was partially consumed.
    Parse,
    /// The consumer cancelled the stream. Not a failure.
    Cancelled,
}

impl StreamErrorKind {
    /// Whether the agent loop may re-invoke the provider after this error.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Transport)
    }
}

/// Canonical stream event. Produced and consumed within one adapter
/// invocation; never persisted.
///
/// Tagged `type` in JSON; the `Error` variant keeps `kind` as its own
/// field, so the tag must not reuse that name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        model: String,
    },
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    /// Partial tool-call arguments. `name` is present on the first delta of
    /// a call only.
    ToolCallDelta {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments_delta: String,
    },
    /// Boundary of one tool call: full arguments parsed.
    ToolCallEnd {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Done {
        stop_reason: StopReason,
        usage: Usage,
    },
    Error {
        kind: StreamErrorKind,
        message: String,
        retryable: bool,
    },
}

impl StreamEvent {
    #[must_use]
    pub fn error(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }

    /// Whether this event terminates the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Request passed to a provider adapter. The context must already be
/// transformed for the target provider (see [`transform`]).
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub thinking: ThinkingLevel,
    pub max_tokens: u32,
    pub api_key: String,
}

/// Tool declaration sent to the provider.
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: serde_json::Value,
}
