//! Scripted clients and tools for loop tests.

use super::{EventEmitter, ModelClient};
use crate::events::{AgentEvent, AgentEventEnvelope};
use crate::llm::{
    EventStream, StopReason, StreamEvent, StreamRequest, Usage,
};
use crate::model::{Api, Modality, Model, ModelCost};
use crate::tools::{AgentTool, AgentToolResult, Progress};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub(crate) fn mock_model() -> Model {
    Model {
        id: "mock-1".to_string(),
        name: "Mock 1".to_string(),
        provider: "mock".to_string(),
        api: Api::OpenAiCompletions,
        base_url: "http://localhost:1".to_string(),
        reasoning: false,
        input: vec![Modality::Text],
        cost: ModelCost::default(),
        context_window: 128_000,
        max_tokens: 4096,
    }
}

/// [`ModelClient`] that replays pre-scripted event sequences, one per
/// invocation, and records every request it receives.
pub(crate) struct MockClient {
    model: Model,
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<StreamRequest>>,
}

impl MockClient {
    pub(crate) fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            model: mock_model(),
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelClient for MockClient {
    fn model(&self) -> &Model {
        &self.model
    }

    fn stream(&self, request: StreamRequest, _cancel: &CancellationToken) -> EventStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let events = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![StreamEvent::error(
                crate::llm::StreamErrorKind::Http,
                "mock script exhausted",
            )]
        });
        EventStream::from_events(events)
    }
}

// Script building blocks.

pub(crate) fn text_turn(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start {
            model: "mock-1".to_string(),
        },
        StreamEvent::TextDelta {
            delta: text.to_string(),
        },
        StreamEvent::Done {
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        },
    ]
}

pub(crate) fn tool_turn(calls: Vec<(&str, &str, Value)>) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start {
        model: "mock-1".to_string(),
    }];
    for (id, name, arguments) in calls {
        events.push(StreamEvent::ToolCallEnd {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        });
    }
    events.push(StreamEvent::Done {
        stop_reason: StopReason::ToolUse,
        usage: Usage::default(),
    });
    events
}

pub(crate) fn failed_turn(kind: crate::llm::StreamErrorKind, message: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start {
            model: "mock-1".to_string(),
        },
        StreamEvent::error(kind, message),
    ]
}

// Tools.

/// Echoes its `text` argument back.
pub(crate) struct EchoTool;

#[async_trait]
impl AgentTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
        _progress: Progress,
    ) -> anyhow::Result<AgentToolResult> {
        Ok(AgentToolResult::text(
            arguments["text"].as_str().unwrap_or_default(),
        ))
    }
}

/// Sleeps for a fixed duration, or fails early if cancelled.
pub(crate) struct WaitTool {
    name: String,
    duration: Duration,
}

impl WaitTool {
    pub(crate) fn new(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            duration,
        }
    }
}

#[async_trait]
impl AgentTool for WaitTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Wait, then return"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        _arguments: Value,
        cancel: CancellationToken,
        _progress: Progress,
    ) -> anyhow::Result<AgentToolResult> {
        tokio::select! {
            () = tokio::time::sleep(self.duration) => Ok(AgentToolResult::text("waited")),
            () = cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }
}

/// Panics inside `execute`, for exercising task-failure attribution.
pub(crate) struct PanicTool;

#[async_trait]
impl AgentTool for PanicTool {
    fn name(&self) -> &str {
        "detonate"
    }

    fn description(&self) -> &str {
        "Panic immediately"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        _arguments: Value,
        _cancel: CancellationToken,
        _progress: Progress,
    ) -> anyhow::Result<AgentToolResult> {
        panic!("boom");
    }
}

// Event plumbing.

pub(crate) fn test_emitter() -> (EventEmitter, broadcast::Receiver<AgentEventEnvelope>) {
    let (tx, rx) = broadcast::channel(256);
    (EventEmitter::new(tx), rx)
}

/// Drain everything currently buffered in a broadcast receiver.
pub(crate) fn collect_events(mut rx: broadcast::Receiver<AgentEventEnvelope>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}
