//! Provider adapters: vendor wire formats in, canonical events out.
//!
//! Each adapter owns one vendor protocol end to end: request shaping, HTTP,
//! frame parsing, and translation into [`StreamEvent`]s. Dispatch is an
//! exhaustive match on [`Api`], so adding a protocol is a compile-visible
//! change everywhere it matters.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod openai_responses;
pub(crate) mod sse;

use crate::llm::{EventStream, StreamErrorKind, StreamEvent, StreamRequest};
use crate::model::{Api, Model};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

/// Open a streaming invocation of `model`.
///
/// Always returns a stream; connection and protocol failures surface as a
/// terminal `Error` event rather than an `Err` return, so callers have one
/// consumption path.
pub fn stream_model(
    model: &Model,
    request: StreamRequest,
    cancel: &CancellationToken,
) -> EventStream {
    match model.api {
        Api::OpenAiCompletions => openai::stream(model, request, cancel),
        Api::OpenAiResponses => openai_responses::stream(model, request, cancel),
        Api::AnthropicMessages => anthropic::stream(model, request, cancel),
        Api::GoogleGenerativeAi => google::stream(model, request, cancel),
    }
}

/// HTTP client for streaming invocations.
///
/// No overall timeout (streams can run for minutes); 30 second connect
/// timeout and TCP keepalive so dead connections are noticed.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .tcp_keepalive(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

/// Map a non-success HTTP status to the terminal error event for the stream.
pub(crate) fn status_error(status: StatusCode, body: &str) -> StreamEvent {
    let kind = if status == StatusCode::TOO_MANY_REQUESTS {
        StreamErrorKind::RateLimit
    } else if status.is_server_error() {
        StreamErrorKind::Transport
    } else {
        StreamErrorKind::Http
    };
    let message = if body.is_empty() {
        format!("status {status}")
    } else {
        format!("status {status}: {body}")
    };
    StreamEvent::error(kind, message)
}
