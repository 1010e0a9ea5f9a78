//! Cancellable event streams and delta accumulation.
//!
//! An [`EventStream`] is the single-pass, forward-only sequence of canonical
//! events produced by one provider adapter invocation. Consuming it drives
//! the underlying network read; cancelling it drops the producer's response
//! body, which releases the connection, and ends the stream with
//! `Error { kind: Cancelled }`.

use crate::llm::{ContentBlock, Message, StopReason, StreamErrorKind, StreamEvent, Usage};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel depth between a producer task and the consumer. Small on purpose:
/// a stalled consumer applies backpressure to the network read.
const CHANNEL_CAPACITY: usize = 64;

/// Pull-based, single-consumer sequence of [`StreamEvent`]s.
///
/// Not restartable. The sequence terminates in exactly one `Done` or `Error`
/// event; [`EventStream::next`] returns `None` afterwards.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventStream {
    /// Spawn a producer task and return the stream it feeds.
    ///
    /// The producer future receives the sender and a child cancellation
    /// token. If the stream is cancelled, the producer future is dropped
    /// (releasing its network resources) and a `Cancelled` error event is
    /// emitted as the final event.
    pub fn spawn<F, Fut>(parent: &CancellationToken, producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<StreamEvent>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let work = producer(tx.clone());

        tokio::spawn(async move {
            tokio::select! {
                () = work => {}
                () = task_cancel.cancelled() => {
                    // Dropping `work` drops the in-flight response body.
                    let _ = tx
                        .send(StreamEvent::error(
                            StreamErrorKind::Cancelled,
                            "stream cancelled by consumer",
                        ))
                        .await;
                }
            }
        });

        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    /// Build a stream from a fixed event sequence. Used by the
    /// non-incremental responses adapter and by tests.
    #[must_use]
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let cancel = CancellationToken::new();
        Self::spawn(&cancel, move |tx| async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        })
    }

    /// Next canonical event, or `None` once the terminal event has been
    /// observed.
    ///
    /// A producer that goes away without emitting a terminal event is
    /// reported as a transport error so the invariant (exactly one
    /// `Done`/`Error` per stream) holds for consumers.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Some(event)
            }
            None => {
                self.finished = true;
                Some(StreamEvent::error(
                    StreamErrorKind::Transport,
                    "stream ended without completion",
                ))
            }
        }
    }

    /// Request cancellation. The producer stops within a bounded time and
    /// the stream's final event is `Error { kind: Cancelled }`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// In-flight state for one tool call being accumulated.
#[derive(Debug)]
struct PartialToolCall {
    id: String,
    block_index: usize,
    arguments_json: String,
}

/// Folds a stream's delta events into the final assistant message.
///
/// Block order follows first appearance: interleaved thinking, text, and
/// tool-call content reproduce the order the provider emitted it in.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    blocks: Vec<ContentBlock>,
    partial_calls: Vec<PartialToolCall>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Terminal `Error` events are not folded; the loop
    /// handles them before accumulation.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta } => {
                if let Some(ContentBlock::Text { text }) = self.blocks.last_mut() {
                    text.push_str(delta);
                } else {
                    self.blocks.push(ContentBlock::text(delta.clone()));
                }
            }
            StreamEvent::ThinkingDelta { delta } => {
                if let Some(ContentBlock::Thinking { thinking, .. }) = self.blocks.last_mut() {
                    thinking.push_str(delta);
                } else {
                    self.blocks.push(ContentBlock::Thinking {
                        thinking: delta.clone(),
                        signature: None,
                    });
                }
            }
            StreamEvent::ToolCallDelta {
                id,
                name,
                arguments_delta,
            } => {
                if let Some(partial) = self.partial_calls.iter_mut().find(|p| p.id == *id) {
                    partial.arguments_json.push_str(arguments_delta);
                } else {
                    self.blocks.push(ContentBlock::ToolCall {
                        id: id.clone(),
                        name: name.clone().unwrap_or_default(),
                        arguments: serde_json::Value::Null,
                    });
                    self.partial_calls.push(PartialToolCall {
                        id: id.clone(),
                        block_index: self.blocks.len() - 1,
                        arguments_json: arguments_delta.clone(),
                    });
                }
            }
            StreamEvent::ToolCallEnd {
                id,
                name,
                arguments,
            } => {
                let index = self
                    .partial_calls
                    .iter()
                    .find(|p| p.id == *id)
                    .map(|p| p.block_index);
                match index {
                    Some(index) => {
                        self.blocks[index] = ContentBlock::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        };
                    }
                    None => {
                        // Adapter emitted an end without deltas (complete
                        // call in one chunk).
                        self.blocks.push(ContentBlock::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        });
                    }
                }
            }
            StreamEvent::Done { stop_reason, usage } => {
                self.stop_reason = Some(*stop_reason);
                self.usage = Some(usage.clone());
            }
            StreamEvent::Start { .. } | StreamEvent::Error { .. } => {}
        }
    }

    #[must_use]
    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage.clone().unwrap_or_default()
    }

    /// Tool calls in original call order, as `(id, name, arguments)`.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<(String, String, serde_json::Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.clone(), name.clone(), arguments.clone())),
                _ => None,
            })
            .collect()
    }

    /// Finish accumulation, producing the assistant message.
    #[must_use]
    pub fn into_message(self) -> Message {
        Message::Assistant {
            content: self.blocks,
        }
    }
}
