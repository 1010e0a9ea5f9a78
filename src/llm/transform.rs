//! Cross-provider history normalization.
//!
//! A conversation produced against one provider can be replayed against
//! another. Vendors disagree on tool-call id conventions and on whether
//! "thinking" content may appear in history, so before every invocation the
//! history is transformed for the target API.
//!
//! [`transform`] is pure and idempotent: transforming an already-transformed
//! history for the same target is a no-op.

use crate::llm::{ContentBlock, Message};
use crate::model::Api;
use std::collections::{HashMap, HashSet};

/// History is incompatible with the target provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransformError {
    /// A `ToolResult` references a tool-call id that no earlier assistant
    /// message produced.
    OrphanToolResult { tool_call_id: String },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrphanToolResult { tool_call_id } => {
                write!(f, "tool result references unknown tool call: {tool_call_id}")
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// Maximum tool-call id length accepted by the target API.
const fn max_id_len(target: Api) -> usize {
    match target {
        // OpenAI rejects call ids over 40 characters.
        Api::OpenAiCompletions | Api::OpenAiResponses => 40,
        Api::AnthropicMessages | Api::GoogleGenerativeAi => 64,
    }
}

/// Sanitize one tool-call id to the target's charset and length.
fn sanitize_id(id: &str, target: Api) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = if cleaned.is_empty() {
        "call".to_string()
    } else {
        cleaned
    };
    cleaned.chars().take(max_id_len(target)).collect()
}

/// Build a stable old-id to new-id mapping for every tool call in history.
///
/// Sanitization can collide (two long ids sharing a prefix); collisions get
/// a numeric suffix. Ids already valid for the target map to themselves, so
/// re-running the mapping is the identity.
fn id_mapping(messages: &[Message], target: Api) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();

    for message in messages {
        for (id, _, _) in message.tool_calls() {
            if mapping.contains_key(id) {
                continue;
            }
            let mut candidate = sanitize_id(id, target);
            let mut suffix = 2;
            while taken.contains(&candidate) {
                let tail = format!("_{suffix}");
                let keep = max_id_len(target).saturating_sub(tail.len());
                candidate = format!(
                    "{}{tail}",
                    sanitize_id(id, target).chars().take(keep).collect::<String>()
                );
                suffix += 1;
            }
            taken.insert(candidate.clone());
            mapping.insert(id.to_string(), candidate);
        }
    }
    mapping
}

/// Rewrite thinking blocks for the target provider.
///
/// The messages API accepts native thinking blocks, but only ones carrying
/// the signature it issued; unsigned blocks (from another vendor) are
/// dropped. Every other target gets thinking inlined as visible text, which
/// keeps the reasoning in context at the price of exposing it. See
/// DESIGN.md for the policy choice.
fn convert_thinking(block: ContentBlock, target: Api) -> Option<ContentBlock> {
    match block {
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            if thinking.is_empty() {
                return None;
            }
            match target {
                Api::AnthropicMessages => signature.map(|signature| ContentBlock::Thinking {
                    thinking,
                    signature: Some(signature),
                }),
                Api::OpenAiCompletions | Api::OpenAiResponses | Api::GoogleGenerativeAi => {
                    Some(ContentBlock::text(format!(
                        "<thinking>\n{thinking}\n</thinking>"
                    )))
                }
            }
        }
        other => Some(other),
    }
}

/// Normalize a history for the target provider.
///
/// Validates tool-result referential integrity, normalizes tool-call ids to
/// the target's conventions (consistently across calls and their results),
/// and applies the thinking-block policy.
pub fn transform(messages: &[Message], target: Api) -> Result<Vec<Message>, TransformError> {
    // Referential check first: surfaces bad history before any rewriting.
    let mut known_ids: HashSet<&str> = HashSet::new();
    for message in messages {
        for (id, _, _) in message.tool_calls() {
            known_ids.insert(id);
        }
        if let Message::ToolResult { tool_call_id, .. } = message {
            if !known_ids.contains(tool_call_id.as_str()) {
                return Err(TransformError::OrphanToolResult {
                    tool_call_id: tool_call_id.clone(),
                });
            }
        }
    }

    let ids = id_mapping(messages, target);
    let map_id = |id: &str| ids.get(id).cloned().unwrap_or_else(|| id.to_string());

    let transformed = messages
        .iter()
        .map(|message| match message {
            Message::System { content } => Message::System {
                content: content.clone(),
            },
            Message::User { content } => Message::User {
                content: rewrite_blocks(content, target, &map_id),
            },
            Message::Assistant { content } => Message::Assistant {
                content: rewrite_blocks(content, target, &map_id),
            },
            Message::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => Message::ToolResult {
                tool_call_id: map_id(tool_call_id),
                content: rewrite_blocks(content, target, &map_id),
                is_error: *is_error,
            },
        })
        .collect();

    Ok(transformed)
}

fn rewrite_blocks(
    blocks: &[ContentBlock],
    target: Api,
    map_id: &impl Fn(&str) -> String,
) -> Vec<ContentBlock> {
    blocks
        .iter()
        .cloned()
        .filter_map(|block| match block {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some(ContentBlock::ToolCall {
                id: map_id(&id),
                name,
                arguments,
            }),
            other => convert_thinking(other, target),
        })
        .collect()
}
