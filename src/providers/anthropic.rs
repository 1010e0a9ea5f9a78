//! Messages API adapter (SSE).
//!
//! The only protocol in the set with native thinking blocks: thinking
//! arrives as its own content block with `thinking_delta` events, and tool
//! arguments stream as `input_json_delta` fragments correlated by block
//! index.

use crate::llm::{
    ContentBlock, EventStream, Message, StopReason, StreamErrorKind, StreamEvent, StreamRequest,
    ThinkingLevel, Usage,
};
use crate::model::Model;
use crate::providers::{http_client, sse, status_error};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const API_VERSION: &str = "2023-06-01";

pub(crate) fn stream(
    model: &Model,
    request: StreamRequest,
    cancel: &CancellationToken,
) -> EventStream {
    let model = model.clone();
    EventStream::spawn(cancel, move |tx| run(model, request, tx))
}

async fn run(model: Model, request: StreamRequest, tx: mpsc::Sender<StreamEvent>) {
    let api_request = build_request(&model, &request);
    log::debug!(
        "messages request provider={} model={} messages={}",
        model.provider,
        model.id,
        api_request.messages.len()
    );

    let response = match http_client()
        .post(format!("{}/v1/messages", model.base_url))
        .header("x-api-key", &request.api_key)
        .header("anthropic-version", API_VERSION)
        .json(&api_request)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::error(
                    StreamErrorKind::Transport,
                    format!("request failed: {e}"),
                ))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        log::warn!(
            "messages error provider={} status={status}",
            model.provider
        );
        let _ = tx.send(status_error(status, &body)).await;
        return;
    }

    if tx
        .send(StreamEvent::Start {
            model: model.id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let mut body = response.bytes_stream();
    let mut framer = sse::Framer::new();
    let mut state = EventState::new(model);

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::error(
                        StreamErrorKind::Transport,
                        format!("stream error: {e}"),
                    ))
                    .await;
                return;
            }
        };
        for frame in framer.push(&chunk) {
            match state.handle_frame(&frame, &tx).await {
                Flow::Continue => {}
                Flow::Stop => return,
            }
        }
    }
    if let Some(frame) = framer.finish() {
        if let Flow::Stop = state.handle_frame(&frame, &tx).await {
            return;
        }
    }

    if !state.stopped {
        log::warn!("messages stream ended without message_stop");
        let _ = tx
            .send(StreamEvent::error(
                StreamErrorKind::Transport,
                "stream ended without completion",
            ))
            .await;
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Per-index state for an in-flight tool_use block.
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

struct EventState {
    model: Model,
    calls: HashMap<u32, PendingCall>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    stopped: bool,
}

impl EventState {
    fn new(model: Model) -> Self {
        Self {
            model,
            calls: HashMap::new(),
            stop_reason: None,
            usage: Usage::default(),
            stopped: false,
        }
    }

    async fn handle_frame(&mut self, frame: &sse::Frame, tx: &mpsc::Sender<StreamEvent>) -> Flow {
        // Only known event names are parsed; the protocol adds event types
        // over time and unknown ones must pass through harmlessly.
        let known = matches!(
            frame.event.as_deref(),
            Some(
                "message_start"
                    | "content_block_start"
                    | "content_block_delta"
                    | "content_block_stop"
                    | "message_delta"
                    | "message_stop"
                    | "error"
            )
        );
        if !known {
            return Flow::Continue;
        }

        let event: ApiEvent = match serde_json::from_str(&frame.data) {
            Ok(e) => e,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::error(
                        StreamErrorKind::Parse,
                        format!("malformed event: {e}"),
                    ))
                    .await;
                return Flow::Stop;
            }
        };

        match event {
            ApiEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                self.usage.cache_read_tokens =
                    message.usage.cache_read_input_tokens.unwrap_or(0);
                self.usage.cache_write_tokens =
                    message.usage.cache_creation_input_tokens.unwrap_or(0);
                Flow::Continue
            }
            ApiEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let ApiStartedBlock::ToolUse { id, name } = content_block {
                    // First delta for a call carries its name.
                    let event = StreamEvent::ToolCallDelta {
                        id: id.clone(),
                        name: Some(name.clone()),
                        arguments_delta: String::new(),
                    };
                    self.calls.insert(
                        index,
                        PendingCall {
                            id,
                            name,
                            arguments: String::new(),
                        },
                    );
                    if tx.send(event).await.is_err() {
                        return Flow::Stop;
                    }
                }
                Flow::Continue
            }
            ApiEvent::ContentBlockDelta { index, delta } => {
                let event = match delta {
                    ApiBlockDelta::TextDelta { text } => StreamEvent::TextDelta { delta: text },
                    ApiBlockDelta::ThinkingDelta { thinking } => {
                        StreamEvent::ThinkingDelta { delta: thinking }
                    }
                    ApiBlockDelta::SignatureDelta { .. } => return Flow::Continue,
                    ApiBlockDelta::InputJsonDelta { partial_json } => {
                        let Some(call) = self.calls.get_mut(&index) else {
                            return Flow::Continue;
                        };
                        call.arguments.push_str(&partial_json);
                        StreamEvent::ToolCallDelta {
                            id: call.id.clone(),
                            name: None,
                            arguments_delta: partial_json,
                        }
                    }
                };
                if tx.send(event).await.is_err() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            ApiEvent::ContentBlockStop { index } => {
                let Some(call) = self.calls.remove(&index) else {
                    return Flow::Continue;
                };
                let arguments = if call.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&call.arguments) {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = tx
                                .send(StreamEvent::error(
                                    StreamErrorKind::Parse,
                                    format!("malformed tool input for {}: {e}", call.id),
                                ))
                                .await;
                            return Flow::Stop;
                        }
                    }
                };
                let event = StreamEvent::ToolCallEnd {
                    id: call.id,
                    name: call.name,
                    arguments,
                };
                if tx.send(event).await.is_err() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            ApiEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(map_stop_reason(&reason));
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                }
                Flow::Continue
            }
            ApiEvent::MessageStop => {
                self.stopped = true;
                let mut usage = self.usage.clone();
                usage.price_with(&self.model);
                let _ = tx
                    .send(StreamEvent::Done {
                        stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                        usage,
                    })
                    .await;
                Flow::Stop
            }
            ApiEvent::Error { error } => {
                let kind = if error.r#type == "overloaded_error" {
                    StreamErrorKind::Transport
                } else {
                    StreamErrorKind::Http
                };
                let _ = tx.send(StreamEvent::error(kind, error.message)).await;
                Flow::Stop
            }
        }
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "refusal" => StopReason::Refusal,
        _ => StopReason::EndTurn,
    }
}

// ============================================================================
// Request shaping
// ============================================================================

const fn thinking_budget(level: ThinkingLevel) -> Option<u32> {
    match level {
        ThinkingLevel::Off => None,
        ThinkingLevel::Low => Some(2048),
        ThinkingLevel::Medium => Some(8192),
        ThinkingLevel::High => Some(16_384),
    }
}

fn build_request<'a>(model: &'a Model, request: &'a StreamRequest) -> ApiMessagesRequest<'a> {
    let mut system = request.system_prompt.clone().unwrap_or_default();
    let mut messages: Vec<ApiMessage> = Vec::new();

    for message in &request.messages {
        match message {
            // The protocol takes the system prompt out of band.
            Message::System { .. } => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.text());
            }
            Message::User { content } => {
                messages.push(ApiMessage {
                    role: "user",
                    content: map_blocks(content),
                });
            }
            Message::Assistant { content } => {
                messages.push(ApiMessage {
                    role: "assistant",
                    content: map_blocks(content),
                });
            }
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                let block = ApiBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: message.text(),
                    is_error: *is_error,
                };
                // Tool results ride in user messages; consecutive results
                // fold into one so roles keep alternating.
                match messages.last_mut() {
                    Some(last) if last.role == "user" && last.has_tool_results() => {
                        last.content.push(block);
                    }
                    _ => messages.push(ApiMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    let tools: Vec<ApiTool> = request
        .tools
        .iter()
        .map(|t| ApiTool {
            name: &t.name,
            description: &t.description,
            input_schema: &t.parameters,
        })
        .collect();

    let budget = if model.reasoning {
        thinking_budget(request.thinking)
    } else {
        None
    };
    // The thinking budget must fit under max_tokens.
    let max_tokens = match budget {
        Some(budget) => request.max_tokens.max(budget + 1024),
        None => request.max_tokens,
    };

    ApiMessagesRequest {
        model: &model.id,
        max_tokens,
        system: if system.is_empty() {
            None
        } else {
            Some(system)
        },
        messages,
        tools: if tools.is_empty() { None } else { Some(tools) },
        stream: true,
        thinking: budget.map(|budget_tokens| ApiThinking {
            r#type: "enabled",
            budget_tokens,
        }),
    }
}

fn map_blocks(blocks: &[ContentBlock]) -> Vec<ApiBlock> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ApiBlock::Text { text: text.clone() }),
            ContentBlock::Image { media_type, data } => Some(ApiBlock::Image {
                source: ApiImageSource {
                    r#type: "base64",
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
            }),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => signature.as_ref().map(|signature| ApiBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            }),
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some(ApiBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: arguments.clone(),
            }),
        })
        .collect()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ApiMessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool<'a>>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ApiThinking>,
}

#[derive(Serialize)]
struct ApiThinking {
    r#type: &'static str,
    budget_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ApiBlock>,
}

impl ApiMessage {
    fn has_tool_results(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ApiBlock::ToolResult { .. }))
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    Image {
        source: ApiImageSource,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Serialize)]
struct ApiImageSource {
    r#type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a serde_json::Value,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiEvent {
    MessageStart {
        message: ApiMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ApiStartedBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ApiBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: ApiMessageDeltaBody,
        usage: Option<ApiDeltaUsage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
}

#[derive(Deserialize)]
struct ApiMessageStart {
    usage: ApiStartUsage,
}

#[derive(Deserialize)]
struct ApiStartUsage {
    #[serde(default)]
    input_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStartedBlock {
    Text {},
    Thinking {},
    RedactedThinking {},
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct ApiMessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    r#type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;
    use crate::model::{Api, ModelCost};
    use serde_json::json;

    fn sample_model() -> Model {
        Model {
            id: "claude-sonnet-4-5".to_string(),
            name: "Claude Sonnet 4.5".to_string(),
            provider: "anthropic".to_string(),
            api: Api::AnthropicMessages,
            base_url: "https://api.anthropic.com".to_string(),
            reasoning: true,
            input: vec![],
            cost: ModelCost::default(),
            context_window: 200_000,
            max_tokens: 16_384,
        }
    }

    fn sample_request() -> StreamRequest {
        StreamRequest {
            system_prompt: Some("Be terse.".to_string()),
            messages: vec![Message::user("Hello")],
            tools: vec![],
            thinking: ThinkingLevel::Off,
            max_tokens: 4096,
            api_key: "test-key".to_string(),
        }
    }

    async fn drain(mut state: EventState, frames: &[(&str, &str)]) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        for (event, data) in frames {
            let frame = sse::Frame {
                event: Some((*event).to_string()),
                data: (*data).to_string(),
            };
            if let Flow::Stop = state.handle_frame(&frame, &tx).await {
                break;
            }
        }
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn system_prompt_is_out_of_band() {
        let model = sample_model();
        let request = sample_request();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["system"], "Be terse.");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn consecutive_tool_results_fold_into_one_user_message() {
        let mut request = sample_request();
        request.messages = vec![
            Message::Assistant {
                content: vec![
                    ContentBlock::ToolCall {
                        id: "toolu_1".to_string(),
                        name: "read".to_string(),
                        arguments: json!({}),
                    },
                    ContentBlock::ToolCall {
                        id: "toolu_2".to_string(),
                        name: "grep".to_string(),
                        arguments: json!({}),
                    },
                ],
            },
            Message::tool_result("toolu_1", "a", false),
            Message::tool_result("toolu_2", "b", true),
        ];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        assert_eq!(api_request.messages.len(), 2);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["messages"][1]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(json["messages"][1]["content"][1]["tool_use_id"], "toolu_2");
        assert_eq!(json["messages"][1]["content"][1]["is_error"], true);
    }

    #[test]
    fn thinking_budget_raises_max_tokens() {
        let mut request = sample_request();
        request.thinking = ThinkingLevel::High;
        request.max_tokens = 4096;
        let model = sample_model();
        let api_request = build_request(&model, &request);
        assert_eq!(api_request.max_tokens, 16_384 + 1024);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["thinking"]["budget_tokens"], 16_384);
    }

    #[test]
    fn thinking_omitted_for_non_reasoning_models() {
        let mut model = sample_model();
        model.reasoning = false;
        let mut request = sample_request();
        request.thinking = ThinkingLevel::High;
        let api_request = build_request(&model, &request);
        assert!(api_request.thinking.is_none());
        assert_eq!(api_request.max_tokens, 4096);
    }

    #[test]
    fn tools_serialize_with_input_schema() {
        let mut request = sample_request();
        request.tools = vec![ToolSpec {
            name: "read".to_string(),
            description: "read a file".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["tools"][0]["name"], "read");
        assert_eq!(json["tools"][0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn text_and_thinking_deltas_flow_through() {
        let events = drain(
            EventState::new(sample_model()),
            &[
                (
                    "message_start",
                    r#"{"type":"message_start","message":{"usage":{"input_tokens":9}}}"#,
                ),
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
                ),
                (
                    "content_block_stop",
                    r#"{"type":"content_block_stop","index":0}"#,
                ),
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":1,"content_block":{"type":"text"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hi"}}"#,
                ),
                (
                    "message_delta",
                    r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
                ),
                ("message_stop", r#"{"type":"message_stop"}"#),
            ],
        )
        .await;

        assert!(matches!(&events[0], StreamEvent::ThinkingDelta { delta } if delta == "hmm"));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "Hi"));
        match events.last() {
            Some(StreamEvent::Done { stop_reason, usage }) => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                assert_eq!(usage.input_tokens, 9);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_use_block_produces_delta_then_end() {
        let events = drain(
            EventState::new(sample_model()),
            &[
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"read"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
                ),
                (
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"x\"}"}}"#,
                ),
                (
                    "content_block_stop",
                    r#"{"type":"content_block_stop","index":0}"#,
                ),
                (
                    "message_delta",
                    r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":11}}"#,
                ),
                ("message_stop", r#"{"type":"message_stop"}"#),
            ],
        )
        .await;

        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta { id, name: Some(n), .. } if id == "toolu_1" && n == "read"
        ));
        assert!(matches!(
            &events[3],
            StreamEvent::ToolCallEnd { id, arguments, .. }
                if id == "toolu_1" && *arguments == json!({"path": "x"})
        ));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                stop_reason: StopReason::ToolUse,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn empty_tool_input_becomes_empty_object() {
        let events = drain(
            EventState::new(sample_model()),
            &[
                (
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"list"}}"#,
                ),
                (
                    "content_block_stop",
                    r#"{"type":"content_block_stop","index":0}"#,
                ),
            ],
        )
        .await;
        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallEnd { arguments, .. } if *arguments == json!({})
        ));
    }

    #[tokio::test]
    async fn overloaded_error_is_retryable() {
        let events = drain(
            EventState::new(sample_model()),
            &[(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
            )],
        )
        .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::Transport,
                retryable: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn ping_events_are_ignored() {
        let events = drain(
            EventState::new(sample_model()),
            &[("ping", r#"{"type":"ping"}"#)],
        )
        .await;
        assert!(events.is_empty());
    }

    #[test]
    fn unsigned_thinking_blocks_are_not_sent() {
        let blocks = vec![
            ContentBlock::Thinking {
                thinking: "private".to_string(),
                signature: None,
            },
            ContentBlock::text("visible"),
        ];
        let mapped = map_blocks(&blocks);
        assert_eq!(mapped.len(), 1);
    }
}
