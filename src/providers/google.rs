//! Generative-language API adapter (SSE).
//!
//! The candidate/part shape differs from the other protocols in two ways
//! that matter here: function calls arrive complete (no argument deltas) and
//! carry no ids, so the adapter synthesizes stable ids; and thinking content
//! is a `thought` flag on an ordinary text part.

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
        "generate-content request provider={} model={} contents={}",
        model.provider,
        model.id,
        api_request.contents.len()
    );

    let url = format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        model.base_url, model.id
    );
    let response = match http_client()
        .post(url)
        .header("x-goog-api-key", &request.api_key)
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
            "generate-content error provider={} status={status}",
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
            if !state.handle_frame(&frame, &tx).await {
                return;
            }
        }
    }
    if let Some(frame) = framer.finish() {
        if !state.handle_frame(&frame, &tx).await {
            return;
        }
    }
    state.send_done(&tx).await;
}

struct ChunkState {
    model: Model,
    call_counter: u32,
    saw_tool_call: bool,
    finish_reason: Option<StopReason>,
    usage: Usage,
}

impl ChunkState {
    fn new(model: Model) -> Self {
        Self {
            model,
            call_counter: 0,
            saw_tool_call: false,
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    /// Returns false when the stream must stop.
    async fn handle_frame(&mut self, frame: &sse::Frame, tx: &mpsc::Sender<StreamEvent>) -> bool {
        let chunk: ApiChunk = match serde_json::from_str(&frame.data) {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::error(
                        StreamErrorKind::Parse,
                        format!("malformed chunk: {e}"),
                    ))
                    .await;
                return false;
            }
        };

        if let Some(usage) = chunk.usage_metadata {
            self.usage.input_tokens = usage.prompt_token_count.unwrap_or(0);
            self.usage.output_tokens = usage.candidates_token_count.unwrap_or(0);
            self.usage.cache_read_tokens = usage.cached_content_token_count.unwrap_or(0);
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return true;
        };

        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(text) = part.text {
                    let event = if part.thought.unwrap_or(false) {
                        StreamEvent::ThinkingDelta { delta: text }
                    } else {
                        StreamEvent::TextDelta { delta: text }
                    };
                    if tx.send(event).await.is_err() {
                        return false;
                    }
                }
                if let Some(call) = part.function_call {
                    // No wire id; synthesize one that stays unique within
                    // the turn.
                    self.call_counter += 1;
                    self.saw_tool_call = true;
                    let event = StreamEvent::ToolCallEnd {
                        id: format!("{}_{}", call.name, self.call_counter),
                        name: call.name,
                        arguments: call.args.unwrap_or_else(|| serde_json::json!({})),
                    };
                    if tx.send(event).await.is_err() {
                        return false;
                    }
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(map_finish_reason(&reason));
        }
        true
    }

    async fn send_done(&mut self, tx: &mpsc::Sender<StreamEvent>) {
        let stop_reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            self.finish_reason.unwrap_or(StopReason::EndTurn)
        };
        let mut usage = self.usage.clone();
        usage.price_with(&self.model);
        let _ = tx.send(StreamEvent::Done { stop_reason, usage }).await;
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => StopReason::Refusal,
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

fn build_request<'a>(model: &Model, request: &'a StreamRequest) -> ApiGenerateRequest<'a> {
    // Function responses need the function name, which only the earlier
    // assistant call carries.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for message in &request.messages {
        for (id, name, _) in message.tool_calls() {
            call_names.insert(id, name);
        }
    }

    let mut system_text = request.system_prompt.clone().unwrap_or_default();
    let mut contents: Vec<ApiContent> = Vec::new();

    for message in &request.messages {
        match message {
            Message::System { .. } => {
                if !system_text.is_empty() {
                    system_text.push('\n');
                }
                system_text.push_str(&message.text());
            }
            Message::User { content } => {
                contents.push(ApiContent {
                    role: "user",
                    parts: map_parts(content),
                });
            }
            Message::Assistant { content } => {
                contents.push(ApiContent {
                    role: "model",
                    parts: map_parts(content),
                });
            }
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                let name = call_names
                    .get(tool_call_id.as_str())
                    .copied()
                    .unwrap_or("unknown")
                    .to_string();
                let field = if *is_error { "error" } else { "output" };
                let part = ApiPart::FunctionResponse {
                    function_response: ApiFunctionResponse {
                        name,
                        response: serde_json::json!({ field: message.text() }),
                    },
                };
                match contents.last_mut() {
                    Some(last) if last.role == "user" && last.has_function_responses() => {
                        last.parts.push(part);
                    }
                    _ => contents.push(ApiContent {
                        role: "user",
                        parts: vec![part],
                    }),
                }
            }
        }
    }

    let declarations: Vec<ApiFunctionDeclaration<'a>> = request
        .tools
        .iter()
        .map(|t| ApiFunctionDeclaration {
            name: &t.name,
            description: &t.description,
            parameters: &t.parameters,
        })
        .collect();

    let thinking_config = if model.reasoning {
        thinking_budget(request.thinking).map(|thinking_budget| ApiThinkingConfig {
            thinking_budget,
            include_thoughts: true,
        })
    } else {
        None
    };

    ApiGenerateRequest {
        system_instruction: if system_text.is_empty() {
            None
        } else {
            Some(ApiSystemInstruction {
                parts: vec![ApiPart::Text { text: system_text }],
            })
        },
        contents,
        tools: if declarations.is_empty() {
            None
        } else {
            Some(vec![ApiToolDecl {
                function_declarations: declarations,
            }])
        },
        generation_config: ApiGenerationConfig {
            max_output_tokens: request.max_tokens,
            thinking_config,
        },
    }
}

fn map_parts(blocks: &[ContentBlock]) -> Vec<ApiPart> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ApiPart::Text { text: text.clone() }),
            ContentBlock::Image { media_type, data } => Some(ApiPart::InlineData {
                inline_data: ApiInlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                },
            }),
            // Thinking is inlined as text upstream; anything left is dropped.
            ContentBlock::Thinking { .. } => None,
            ContentBlock::ToolCall {
                name, arguments, ..
            } => Some(ApiPart::FunctionCall {
                function_call: ApiFunctionCall {
                    name: name.clone(),
                    args: Some(arguments.clone()),
                },
            }),
        })
        .collect()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiSystemInstruction>,
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDecl<'a>>>,
    generation_config: ApiGenerationConfig,
}

#[derive(Serialize)]
struct ApiSystemInstruction {
    parts: Vec<ApiPart>,
}

#[derive(Serialize)]
struct ApiContent {
    role: &'static str,
    parts: Vec<ApiPart>,
}

impl ApiContent {
    fn has_function_responses(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ApiPart::FunctionResponse { .. }))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: ApiInlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: ApiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: ApiFunctionResponse,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ApiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiToolDecl<'a> {
    function_declarations: Vec<ApiFunctionDeclaration<'a>>,
}

#[derive(Serialize)]
struct ApiFunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ApiThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiThinkingConfig {
    thinking_budget: u32,
    include_thoughts: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChunk {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    usage_metadata: Option<ApiUsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    content: Option<ApiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiCandidateContent {
    #[serde(default)]
    parts: Vec<ApiCandidatePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidatePart {
    text: Option<String>,
    thought: Option<bool>,
    function_call: Option<ApiWireFunctionCall>,
}

#[derive(Deserialize)]
struct ApiWireFunctionCall {
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    cached_content_token_count: Option<u32>,
}
