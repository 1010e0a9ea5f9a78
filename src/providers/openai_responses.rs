//! Responses API adapter.
//!
//! Deliberately non-incremental: one POST, one parsed body, and a synthetic
//! event sequence replayed from it. Consumers see the same canonical event
//! shape as with the SSE adapters, just delivered all at once.

use crate::llm::{
    ContentBlock, EventStream, Message, StopReason, StreamErrorKind, StreamEvent, StreamRequest,
    ThinkingLevel, Usage,
};
use crate::model::Model;
use crate::providers::{http_client, status_error};
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
        "responses request provider={} model={} items={}",
        model.provider,
        model.id,
        api_request.input.len()
    );

    let response = match http_client()
        .post(format!("{}/responses", model.base_url))
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
    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::error(
                    StreamErrorKind::Transport,
                    format!("failed to read response body: {e}"),
                ))
                .await;
            return;
        }
    };

    if !status.is_success() {
        let body = String::from_utf8_lossy(&body);
        log::warn!(
            "responses error provider={} status={status}",
            model.provider
        );
        let _ = tx.send(status_error(status, &body)).await;
        return;
    }

    let api_response: ApiResponse = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::error(
                    StreamErrorKind::Parse,
                    format!("malformed response: {e}"),
                ))
                .await;
            return;
        }
    };

    for event in replay_events(&model, api_response) {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Translate one complete response body into the canonical event sequence.
fn replay_events(model: &Model, response: ApiResponse) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start {
        model: model.id.clone(),
    }];
    let mut saw_tool_call = false;
    let mut saw_refusal = false;

    for item in response.output {
        match item {
            ApiOutputItem::Message { content } => {
                for part in content {
                    match part {
                        ApiOutputContent::OutputText { text } => {
                            events.push(StreamEvent::TextDelta { delta: text });
                        }
                        ApiOutputContent::Refusal { refusal } => {
                            saw_refusal = true;
                            events.push(StreamEvent::TextDelta { delta: refusal });
                        }
                    }
                }
            }
            ApiOutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let arguments = if arguments.is_empty() {
                    Ok(serde_json::json!({}))
                } else {
                    serde_json::from_str(&arguments)
                };
                match arguments {
                    Ok(arguments) => {
                        saw_tool_call = true;
                        events.push(StreamEvent::ToolCallEnd {
                            id: call_id,
                            name,
                            arguments,
                        });
                    }
                    Err(e) => {
                        events.push(StreamEvent::error(
                            StreamErrorKind::Parse,
                            format!("malformed tool arguments for {call_id}: {e}"),
                        ));
                        return events;
                    }
                }
            }
            ApiOutputItem::Reasoning { summary } => {
                for part in summary {
                    if !part.text.is_empty() {
                        events.push(StreamEvent::ThinkingDelta { delta: part.text });
                    }
                }
            }
            ApiOutputItem::Other => {}
        }
    }

    let stop_reason = if saw_tool_call {
        StopReason::ToolUse
    } else if response
        .incomplete_details
        .as_ref()
        .is_some_and(|d| d.reason.as_deref() == Some("max_output_tokens"))
    {
        StopReason::MaxTokens
    } else if saw_refusal {
        StopReason::Refusal
    } else {
        StopReason::EndTurn
    };

    let mut usage = response.usage.map_or_else(Usage::default, |u| Usage {
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
        cache_read_tokens: u
            .input_tokens_details
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_write_tokens: 0,
        cost: 0.0,
    });
    usage.price_with(model);

    events.push(StreamEvent::Done { stop_reason, usage });
    events
}

// ============================================================================
// Request shaping
// ============================================================================

fn build_request<'a>(model: &'a Model, request: &'a StreamRequest) -> ApiResponsesRequest<'a> {
    let mut input = Vec::new();

    for message in &request.messages {
        match message {
            Message::System { .. } => {
                input.push(ApiInputItem::Message {
                    role: "system",
                    content: vec![ApiInputContent::InputText {
                        text: message.text(),
                    }],
                });
            }
            Message::User { content } => {
                input.push(ApiInputItem::Message {
                    role: "user",
                    content: user_parts(content),
                });
            }
            Message::Assistant { content } => {
                let text = message.text();
                if !text.is_empty() {
                    input.push(ApiInputItem::Message {
                        role: "assistant",
                        content: vec![ApiInputContent::OutputText { text }],
                    });
                }
                for block in content {
                    if let ContentBlock::ToolCall {
                        id,
                        name,
                        arguments,
                    } = block
                    {
                        input.push(ApiInputItem::FunctionCall {
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        });
                    }
                }
            }
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                let text = message.text();
                input.push(ApiInputItem::FunctionCallOutput {
                    call_id: tool_call_id.clone(),
                    output: if *is_error {
                        format!("Error: {text}")
                    } else {
                        text
                    },
                });
            }
        }
    }

    let tools: Vec<ApiTool> = request
        .tools
        .iter()
        .map(|t| ApiTool {
            r#type: "function",
            name: &t.name,
            description: &t.description,
            parameters: &t.parameters,
        })
        .collect();

    let reasoning = if model.reasoning {
        match request.thinking {
            ThinkingLevel::Off => None,
            ThinkingLevel::Low => Some(ApiReasoning { effort: "low" }),
            ThinkingLevel::Medium => Some(ApiReasoning { effort: "medium" }),
            ThinkingLevel::High => Some(ApiReasoning { effort: "high" }),
        }
    } else {
        None
    };

    ApiResponsesRequest {
        model: &model.id,
        instructions: request.system_prompt.as_deref(),
        input,
        max_output_tokens: Some(request.max_tokens),
        tools: if tools.is_empty() { None } else { Some(tools) },
        reasoning,
    }
}

fn user_parts(blocks: &[ContentBlock]) -> Vec<ApiInputContent> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ApiInputContent::InputText { text: text.clone() }),
            ContentBlock::Image { media_type, data } => Some(ApiInputContent::InputImage {
                image_url: format!("data:{media_type};base64,{data}"),
            }),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ApiResponsesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    input: Vec<ApiInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ApiReasoning>,
}

#[derive(Serialize)]
struct ApiReasoning {
    effort: &'static str,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiInputItem {
    Message {
        role: &'static str,
        content: Vec<ApiInputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiInputContent {
    InputText { text: String },
    InputImage { image_url: String },
    OutputText { text: String },
}

#[derive(Serialize)]
struct ApiTool<'a> {
    r#type: &'static str,
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    output: Vec<ApiOutputItem>,
    usage: Option<ApiUsage>,
    incomplete_details: Option<ApiIncompleteDetails>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiOutputItem {
    Message {
        content: Vec<ApiOutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<ApiReasoningSummary>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiOutputContent {
    OutputText { text: String },
    Refusal { refusal: String },
}

#[derive(Deserialize)]
struct ApiReasoningSummary {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    input_tokens_details: Option<ApiInputDetails>,
}

#[derive(Deserialize)]
struct ApiInputDetails {
    cached_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiIncompleteDetails {
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Api, ModelCost};
    use serde_json::json;

    fn sample_model() -> Model {
        Model {
            id: "gpt-5".to_string(),
            name: "GPT-5".to_string(),
            provider: "openai".to_string(),
            api: Api::OpenAiResponses,
            base_url: "https://api.openai.com/v1".to_string(),
            reasoning: true,
            input: vec![],
            cost: ModelCost {
                input: 1.0,
                output: 2.0,
                cache_read: 0.5,
                cache_write: 0.0,
            },
            context_window: 400_000,
            max_tokens: 128_000,
        }
    }

    fn sample_request() -> StreamRequest {
        StreamRequest {
            system_prompt: Some("Be brief.".to_string()),
            messages: vec![Message::user("Hello")],
            tools: vec![],
            thinking: ThinkingLevel::Medium,
            max_tokens: 2048,
            api_key: "test-key".to_string(),
        }
    }

    #[test]
    fn request_uses_instructions_and_reasoning_effort() {
        let model = sample_model();
        let request = sample_request();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["instructions"], "Be brief.");
        assert_eq!(json["reasoning"]["effort"], "medium");
        assert_eq!(json["input"][0]["role"], "user");
        assert_eq!(json["input"][0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn tool_history_becomes_call_and_output_items() {
        let mut request = sample_request();
        request.messages = vec![
            Message::Assistant {
                content: vec![
                    ContentBlock::text("checking"),
                    ContentBlock::ToolCall {
                        id: "call_1".to_string(),
                        name: "read".to_string(),
                        arguments: json!({"path": "x"}),
                    },
                ],
            },
            Message::tool_result("call_1", "contents", false),
        ];
        let model = sample_model();
        let api_request = build_request(&model, &request);
        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["input"][0]["role"], "assistant");
        assert_eq!(json["input"][1]["call_id"], "call_1");
        assert_eq!(json["input"][1]["name"], "read");
        assert_eq!(json["input"][2]["call_id"], "call_1");
        assert_eq!(json["input"][2]["output"], "contents");
    }

    #[test]
    fn replay_text_response() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "Hi there"}]}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4,
                      "input_tokens_details": {"cached_tokens": 2}}
        }))
        .unwrap();

        let events = replay_events(&sample_model(), response);
        assert!(matches!(&events[0], StreamEvent::Start { .. }));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "Hi there"));
        match events.last() {
            Some(StreamEvent::Done { stop_reason, usage }) => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.cache_read_tokens, 2);
                assert!(usage.cost > 0.0);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn replay_function_calls_in_order() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [
                {"type": "function_call", "call_id": "call_a", "name": "read",
                 "arguments": "{\"path\":\"a\"}"},
                {"type": "function_call", "call_id": "call_b", "name": "grep",
                 "arguments": "{}"}
            ]
        }))
        .unwrap();

        let events = replay_events(&sample_model(), response);
        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallEnd { id, .. } if id == "call_a"
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ToolCallEnd { id, .. } if id == "call_b"
        ));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                stop_reason: StopReason::ToolUse,
                ..
            })
        ));
    }

    #[test]
    fn replay_reasoning_summary_as_thinking() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "planning"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "done"}]}
            ]
        }))
        .unwrap();

        let events = replay_events(&sample_model(), response);
        assert!(matches!(&events[1], StreamEvent::ThinkingDelta { delta } if delta == "planning"));
    }

    #[test]
    fn incomplete_max_output_tokens_maps_to_max_tokens() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [],
            "incomplete_details": {"reason": "max_output_tokens"}
        }))
        .unwrap();
        let events = replay_events(&sample_model(), response);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                stop_reason: StopReason::MaxTokens,
                ..
            })
        ));
    }

    #[test]
    fn malformed_function_arguments_end_replay_with_parse_error() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [
                {"type": "function_call", "call_id": "call_a", "name": "read",
                 "arguments": "{broken"}
            ]
        }))
        .unwrap();
        let events = replay_events(&sample_model(), response);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::Parse,
                ..
            })
        ));
    }

    #[test]
    fn unknown_output_items_are_ignored() {
        let response: ApiResponse = serde_json::from_value(json!({
            "output": [
                {"type": "web_search_call", "id": "ws_1"},
                {"type": "message", "content": [{"type": "output_text", "text": "ok"}]}
            ]
        }))
        .unwrap();
        let events = replay_events(&sample_model(), response);
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "ok"));
    }
}
