//! Chat-completions adapter (SSE).
//!
//! Serves OpenAI itself and the compatible vendor family (zhipu, groq, xai,
//! local inference servers): same protocol, different base URL and provider
//! string. Vendors that expose reasoning do so via `reasoning_content`
//! deltas, which map to thinking deltas here.

use crate::llm::{
    ContentBlock, EventStream, Message, StopReason, StreamErrorKind, StreamEvent, StreamRequest,
    ThinkingLevel, Usage,
};
use crate::model::Model;
use crate::providers::{http_client, sse, status_error};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

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
        "chat-completions request provider={} model={} messages={}",
        model.provider,
        model.id,
        api_request.messages.len()
    );

    let response = match http_client()
        .post(format!("{}/chat/completions", model.base_url))
        .header("Authorization", format!("Bearer {}", request.api_key))
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
            "chat-completions error provider={} status={status}",
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
    let mut state = ChunkState::new(model);

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
            if state.handle_frame(&frame, &tx).await == Flow::Stop {
                return;
            }
        }
    }
    if let Some(frame) = framer.finish() {
        if state.handle_frame(&frame, &tx).await == Flow::Stop {
            return;
        }
    }
    // Connection closed without a [DONE] marker; report what accumulated.
    state.finish(&tx).await;
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One tool call being assembled from index-correlated deltas.
#[derive(Debug)]
struct PendingCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
struct ChunkState {
    model: Model,
    pending: Vec<PendingCall>,
    flushed: bool,
    stop_reason: Option<StopReason>,
    usage: Usage,
    done_sent: bool,
}

impl ChunkState {
    fn new(model: Model) -> Self {
        Self {
            model,
            pending: Vec::new(),
            flushed: false,
            stop_reason: None,
            usage: Usage::default(),
            done_sent: false,
        }
    }

    async fn handle_frame(&mut self, frame: &sse::Frame, tx: &mpsc::Sender<StreamEvent>) -> Flow {
        if frame.data == "[DONE]" {
            if self.flush_calls(tx).await == Flow::Stop {
                return Flow::Stop;
            }
            self.send_done(tx).await;
            return Flow::Stop;
        }

        let chunk: ApiChunk = match serde_json::from_str(&frame.data) {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::error(
                        StreamErrorKind::Parse,
                        format!("malformed chunk: {e}"),
                    ))
                    .await;
                return Flow::Stop;
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
            self.usage.cache_read_tokens = usage
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Flow::Continue;
        };

        if let Some(delta) = choice.delta.reasoning_content {
            if !delta.is_empty()
                && tx.send(StreamEvent::ThinkingDelta { delta }).await.is_err()
            {
                return Flow::Stop;
            }
        }
        if let Some(delta) = choice.delta.content {
            if !delta.is_empty() && tx.send(StreamEvent::TextDelta { delta }).await.is_err() {
                return Flow::Stop;
            }
        }
        if let Some(calls) = choice.delta.tool_calls {
            for call in calls {
                if self.apply_call_delta(call, tx).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
        }
        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(map_finish_reason(&reason));
            if self.flush_calls(tx).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn apply_call_delta(
        &mut self,
        call: ApiToolCallDelta,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Flow {
        let arguments_delta = call
            .function
            .as_ref()
            .and_then(|f| f.arguments.clone())
            .unwrap_or_default();

        let event = if let Some(pending) = self.pending.iter_mut().find(|p| p.index == call.index)
        {
            pending.arguments.push_str(&arguments_delta);
            StreamEvent::ToolCallDelta {
                id: pending.id.clone(),
                name: None,
                arguments_delta,
            }
        } else {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", call.index));
            let name = call
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();
            self.pending.push(PendingCall {
                index: call.index,
                id: id.clone(),
                name: name.clone(),
                arguments: arguments_delta.clone(),
            });
            StreamEvent::ToolCallDelta {
                id,
                name: Some(name),
                arguments_delta,
            }
        };

        if tx.send(event).await.is_err() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    /// Emit `ToolCallEnd` for every assembled call, in call order.
    async fn flush_calls(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Flow {
        if self.flushed {
            return Flow::Continue;
        }
        self.flushed = true;
        for pending in self.pending.drain(..) {
            let arguments = if pending.arguments.is_empty() {
                serde_json::json!({})
            } else {
                match serde_json::from_str(&pending.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::error(
                                StreamErrorKind::Parse,
                                format!("malformed tool arguments for {}: {e}", pending.id),
                            ))
                            .await;
                        return Flow::Stop;
                    }
                }
            };
            let event = StreamEvent::ToolCallEnd {
                id: pending.id,
                name: pending.name,
                arguments,
            };
            if tx.send(event).await.is_err() {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn send_done(&mut self, tx: &mpsc::Sender<StreamEvent>) {
        if self.done_sent {
            return;
        }
        self.done_sent = true;
        let mut usage = self.usage.clone();
        usage.price_with(&self.model);
        let _ = tx
            .send(StreamEvent::Done {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage,
            })
            .await;
    }

    async fn finish(&mut self, tx: &mpsc::Sender<StreamEvent>) {
        if self.flush_calls(tx).await == Flow::Stop {
            return;
        }
        self.send_done(tx).await;
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::Refusal,
        _ => StopReason::EndTurn,
    }
}

// ============================================================================
// Request shaping
// ============================================================================

fn build_request<'a>(model: &'a Model, request: &'a StreamRequest) -> ApiChatRequest<'a> {
    let mut messages = Vec::new();

    if let Some(system) = &request.system_prompt {
        messages.push(ApiMessage {
            role: "system",
            content: Some(ApiContent::Text(system.clone())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in &request.messages {
        match message {
            Message::System { .. } => {
                messages.push(ApiMessage {
                    role: "system",
                    content: Some(ApiContent::Text(message.text())),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Message::User { content } => {
                messages.push(ApiMessage {
                    role: "user",
                    content: Some(user_content(content)),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Message::Assistant { content } => {
                let text = message.text();
                let tool_calls: Vec<ApiToolCall> = content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(ApiToolCall {
                            id: id.clone(),
                            r#type: "function",
                            function: ApiFunctionCall {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                messages.push(ApiMessage {
                    role: "assistant",
                    content: if text.is_empty() {
                        None
                    } else {
                        Some(ApiContent::Text(text))
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                let text = message.text();
                messages.push(ApiMessage {
                    role: "tool",
                    content: Some(ApiContent::Text(if *is_error {
                        format!("Error: {text}")
                    } else {
                        text
                    })),
                    tool_calls: None,
                    tool_call_id: Some(tool_call_id.clone()),
                });
            }
        }
    }

    let tools: Vec<ApiTool> = request
        .tools
        .iter()
        .map(|t| ApiTool {
            r#type: "function",
            function: ApiFunction {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        })
        .collect();

    let reasoning_effort = if model.reasoning {
        match request.thinking {
            ThinkingLevel::Off => None,
            ThinkingLevel::Low => Some("low"),
            ThinkingLevel::Medium => Some("medium"),
            ThinkingLevel::High => Some("high"),
        }
    } else {
        None
    };

    ApiChatRequest {
        model: &model.id,
        messages,
        max_completion_tokens: Some(request.max_tokens),
        tools: if tools.is_empty() { None } else { Some(tools) },
        reasoning_effort,
        stream: true,
        stream_options: ApiStreamOptions {
            include_usage: true,
        },
    }
}

/// Images go out as data-URL content parts; text-only messages stay a plain
/// string since some compatible servers reject the parts form.
fn user_content(blocks: &[ContentBlock]) -> ApiContent {
    let has_image = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::Image { .. }));
    if !has_image {
        let text: String = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        return ApiContent::Text(text);
    }

    let parts = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(ApiPart::Text { text: text.clone() }),
            ContentBlock::Image { media_type, data } => Some(ApiPart::ImageUrl {
                image_url: ApiImageUrl {
                    url: format!("data:{media_type};base64,{data}"),
                },
            }),
            _ => None,
        })
        .collect();
    ApiContent::Parts(parts)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    stream: bool,
    stream_options: ApiStreamOptions,
}

#[derive(Serialize)]
struct ApiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Serialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ApiToolCall {
    id: String,
    r#type: &'static str,
    function: ApiFunctionCall,
}

#[derive(Serialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    r#type: &'static str,
    function: ApiFunction<'a>,
}

#[derive(Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ApiChunk {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiWireUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    #[serde(default)]
    delta: ApiDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ApiDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ApiToolCallDelta>>,
}

#[derive(Deserialize)]
struct ApiToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<ApiFunctionDelta>,
}

#[derive(Deserialize)]
struct ApiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ApiWireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    prompt_tokens_details: Option<ApiPromptDetails>,
}

#[derive(Deserialize)]
struct ApiPromptDetails {
    cached_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;
    use crate::model::{Api, ModelCost};
    use serde_json::json;

    fn sample_model() -> Model {
        Model {
            id: "gpt-4o".to_string(),
            name: "GPT-4o".to_string(),
            provider: "openai".to_string(),
            api: Api::OpenAiCompletions,
            base_url: "https://api.openai.com/v1".to_string(),
            reasoning: false,
            input: vec![],
            cost: ModelCost::default(),
            context_window: 128_000,
            max_tokens: 16_384,
        }
    }

    fn sample_request() -> StreamRequest {
        StreamRequest {
            system_prompt: Some("You are helpful.".to_string()),
            messages: vec![Message::user("Hello")],
            tools: vec![],
            thinking: ThinkingLevel::Off,
            max_tokens: 1024,
            api_key: "test-key".to_string(),
        }
    }

    async fn drain(mut state: ChunkState, frames: &[&str]) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        for data in frames {
            let frame = sse::Frame {
                event: None,
                data: (*data).to_string(),
            };
            if state.handle_frame(&frame, &tx).await == Flow::Stop {
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
    fn request_includes_system_and_stream_options() {
        let model = sample_model();
        let request = sample_request();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let mut request = sample_request();
        request.messages = vec![
            Message::Assistant {
                content: vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "read".to_string(),
                    arguments: json!({"path": "a"}),
                }],
            },
            Message::tool_result("call_1", "contents", false),
        ];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(json["messages"][2]["role"], "tool");
        assert_eq!(json["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn failed_tool_results_are_prefixed() {
        let mut request = sample_request();
        request.messages = vec![
            Message::Assistant {
                content: vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "read".to_string(),
                    arguments: json!({}),
                }],
            },
            Message::tool_result("call_1", "no such file", true),
        ];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["messages"][2]["content"], "Error: no such file");
    }

    #[test]
    fn tool_specs_are_declared_as_functions() {
        let mut request = sample_request();
        request.tools = vec![ToolSpec {
            name: "grep".to_string(),
            description: "search".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "grep");
    }

    #[test]
    fn reasoning_effort_only_for_reasoning_models() {
        let mut request = sample_request();
        request.thinking = ThinkingLevel::High;

        let model = sample_model();
        let api_request = build_request(&model, &request);
        assert!(api_request.reasoning_effort.is_none());

        let mut model = sample_model();
        model.reasoning = true;
        let api_request = build_request(&model, &request);
        assert_eq!(api_request.reasoning_effort, Some("high"));
    }

    #[test]
    fn image_blocks_become_data_url_parts() {
        let content = vec![
            ContentBlock::text("look"),
            ContentBlock::Image {
                media_type: "image/png".to_string(),
                data: "aGk=".to_string(),
            },
        ];
        let json = serde_json::to_value(user_content(&content)).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[1]["image_url"]["url"], "data:image/png;base64,aGk=");
    }

    #[tokio::test]
    async fn text_deltas_flow_through() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[
                r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        )
        .await;
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "Hel"));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "lo"));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn reasoning_content_maps_to_thinking() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#],
        )
        .await;
        assert!(matches!(&events[0], StreamEvent::ThinkingDelta { delta } if delta == "hmm"));
    }

    #[tokio::test]
    async fn tool_call_deltas_accumulate_by_index() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read","arguments":"{\"pa"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"x\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        )
        .await;

        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta { id, name: Some(n), .. } if id == "call_a" && n == "read"
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallDelta { name: None, .. }
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ToolCallEnd { id, name, arguments }
                if id == "call_a" && name == "read" && *arguments == json!({"path": "x"})
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
    async fn malformed_tool_arguments_are_a_parse_error() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read","arguments":"{not json"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        )
        .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::Parse,
                retryable: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn malformed_chunk_is_a_parse_error() {
        let events = drain(ChunkState::new(sample_model()), &["{garbage"]).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::Parse,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn usage_chunk_is_folded_into_done() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[
                r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":4,"prompt_tokens_details":{"cached_tokens":3}}}"#,
                "[DONE]",
            ],
        )
        .await;
        match events.last() {
            Some(StreamEvent::Done { usage, .. }) => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 4);
                assert_eq!(usage.cache_read_tokens, 3);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn length_finish_reason_maps_to_max_tokens() {
        let events = drain(
            ChunkState::new(sample_model()),
            &[
                r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
                "[DONE]",
            ],
        )
        .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                stop_reason: StopReason::MaxTokens,
                ..
            })
        ));
    }
}
