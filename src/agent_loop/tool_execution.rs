//! Validated, timed, cancellable tool fan-out.
//!
//! All calls requested by one assistant message run concurrently, each in
//! its own task so a panicking tool cannot take its siblings down. Results
//! come back in the original call order regardless of completion order.

use super::EventEmitter;
use crate::events::AgentEvent;
use crate::tools::{AgentTool, Progress, ToolSet};
use futures::future::join_all;
use jsonschema::JSONSchema;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of one tool call, destined for a `ToolResult` history message.
#[derive(Clone, Debug)]
pub(crate) struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolCallRecord {
    fn error(id: &str, name: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            content: message.into(),
            is_error: true,
        }
    }
}

/// Execute every call in `calls` concurrently.
///
/// Per call: arguments are validated against the tool's JSON schema, then
/// `execute` races a timeout (when configured) and the cancellation token.
/// A timeout cancels that call's child token and flags the result; it never
/// affects sibling calls. Failures of any kind become error records, not
/// panics or early returns.
pub(crate) async fn execute_tool_calls(
    tools: &ToolSet,
    calls: Vec<(String, String, Value)>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    emitter: &EventEmitter,
) -> Vec<ToolCallRecord> {
    let mut metas = Vec::with_capacity(calls.len());
    let mut tasks = Vec::with_capacity(calls.len());
    for (id, name, arguments) in calls {
        emitter.emit(AgentEvent::tool_execution_start(
            &id,
            &name,
            arguments.clone(),
        ));
        metas.push((id.clone(), name.clone()));

        let tool = tools.get(&name).cloned();
        let child = cancel.child_token();
        let emitter = emitter.clone();
        tasks.push(tokio::spawn(async move {
            let record = match tool {
                Some(tool) => execute_one(&tool, &id, &name, arguments, child, &emitter, timeout).await,
                None => {
                    warn!("tool call rejected id={id} reason=unknown tool={name}");
                    ToolCallRecord::error(&id, &name, format!("unknown tool: {name}"))
                }
            };
            emitter.emit(AgentEvent::tool_execution_end(
                &record.id,
                &record.name,
                &record.content,
                record.is_error,
            ));
            record
        }));
    }

    let mut records = Vec::with_capacity(metas.len());
    for ((id, name), joined) in metas.into_iter().zip(join_all(tasks).await) {
        match joined {
            Ok(record) => records.push(record),
            Err(join_error) => {
                // The task body converts every failure into a record, so a
                // join error means the tool panicked. The in-task end event
                // never fired; emit it here against the real call so the
                // result answers the model's tool call id.
                warn!("tool task failed id={id} tool={name} error={join_error}");
                let record = ToolCallRecord::error(
                    &id,
                    &name,
                    format!("tool execution panicked: {join_error}"),
                );
                emitter.emit(AgentEvent::tool_execution_end(
                    &record.id,
                    &record.name,
                    &record.content,
                    record.is_error,
                ));
                records.push(record);
            }
        }
    }
    records
}

async fn execute_one(
    tool: &Arc<dyn AgentTool>,
    id: &str,
    name: &str,
    arguments: Value,
    child: CancellationToken,
    emitter: &EventEmitter,
    timeout: Option<Duration>,
) -> ToolCallRecord {
    if let Err(message) = validate_arguments(&tool.parameters(), &arguments) {
        debug!("tool arguments rejected id={id} tool={name}");
        return ToolCallRecord::error(id, name, message);
    }

    let progress = {
        let emitter = emitter.clone();
        let id = id.to_string();
        let name = name.to_string();
        Progress::new(move |message| {
            emitter.emit(AgentEvent::ToolExecutionUpdate {
                id: id.clone(),
                name: name.clone(),
                message,
            });
        })
    };

    let work = tool.execute(id, arguments, child.clone(), progress);
    let result = tokio::select! {
        outcome = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        child.cancel();
                        Err(anyhow::anyhow!(
                            "timed out after {}ms",
                            limit.as_millis()
                        ))
                    }
                },
                None => work.await,
            }
        } => outcome,
        () = child.cancelled() => Err(anyhow::anyhow!("cancelled")),
    };

    match result {
        Ok(output) => ToolCallRecord {
            id: id.to_string(),
            name: name.to_string(),
            content: output.content,
            is_error: false,
        },
        Err(error) => {
            warn!("tool failed id={id} tool={name} error={error}");
            ToolCallRecord::error(id, name, error.to_string())
        }
    }
}

/// Validate `arguments` against a tool's parameter schema.
///
/// A schema that does not compile rejects the call rather than letting
/// unvalidated arguments through.
fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|error| format!("invalid tool parameter schema: {error}"))?;
    if let Err(errors) = compiled.validate(arguments) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(format!("invalid arguments: {}", details.join("; ")));
    }
    Ok(())
}
