//! Tool definition and the tool set.
//!
//! Tools let the model act on the world. This module provides:
//!
//! - [`AgentTool`] trait - define custom tools the model can call
//! - [`AgentToolResult`] - what a tool hands back
//! - [`ToolSet`] - the tools available to one agent
//! - [`Progress`] - handle a running tool reports progress through
//!
//! # Implementing a tool
//!
//! ```ignore
//! use rudder::tools::{AgentTool, AgentToolResult, Progress};
//!
//! struct ReadFile;
//!
//! #[async_trait::async_trait]
//! impl AgentTool for ReadFile {
//!     fn name(&self) -> &str { "read_file" }
//!     fn description(&self) -> &str { "Read a file from disk" }
//!     fn parameters(&self) -> serde_json::Value {
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": { "path": { "type": "string" } },
//!             "required": ["path"]
//!         })
//!     }
//!
//!     async fn execute(
//!         &self,
//!         _tool_call_id: &str,
//!         arguments: serde_json::Value,
//!         _cancel: tokio_util::sync::CancellationToken,
//!         _progress: Progress,
//!     ) -> anyhow::Result<AgentToolResult> {
//!         let path = arguments["path"].as_str().unwrap_or_default();
//!         Ok(AgentToolResult::text(std::fs::read_to_string(path)?))
//!     }
//! }
//! ```

use crate::llm::ToolSpec;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Output of one tool execution.
#[derive(Clone, Debug, Default)]
pub struct AgentToolResult {
    /// Text handed back to the model.
    pub content: String,
    /// Structured payload for the host application; never sent to the model.
    pub details: Option<Value>,
}

impl AgentToolResult {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(content: impl Into<String>, details: Value) -> Self {
        Self {
            content: content.into(),
            details: Some(details),
        }
    }
}

/// Progress handle for long-running tools.
///
/// Cheap to clone; messages surface to subscribers as tool-execution
/// updates. A tool that never reports progress simply ignores it.
#[derive(Clone)]
pub struct Progress {
    report: Arc<dyn Fn(String) + Send + Sync>,
}

impl Progress {
    pub fn new(report: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// A handle that discards all reports.
    #[must_use]
    pub fn sink() -> Self {
        Self::new(|_| {})
    }

    pub fn update(&self, message: impl Into<String>) {
        (self.report)(message.into());
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Progress")
    }
}

/// A tool the model can call.
///
/// `execute` must watch the cancellation token at its await points: when the
/// agent is aborted or the call times out, the token fires and the tool is
/// expected to stop within a bounded time.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the tool's arguments. Arguments are validated against
    /// it before `execute` runs.
    fn parameters(&self) -> Value;

    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
        progress: Progress,
    ) -> Result<AgentToolResult>;

    /// Declaration sent to the provider.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// The tools available to one agent, keyed by name.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentTool>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Declarations for the provider request, sorted by name for a stable
    /// request shape.
    #[must_use]
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

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
            progress: Progress,
        ) -> Result<AgentToolResult> {
            progress.update("echoing");
            Ok(AgentToolResult::text(
                arguments["text"].as_str().unwrap_or_default(),
            ))
        }
    }

    #[test]
    fn tool_set_registers_and_looks_up_by_name() {
        let mut tools = ToolSet::new();
        tools.register(Arc::new(EchoTool));

        assert_eq!(tools.len(), 1);
        assert!(tools.get("echo").is_some());
        assert!(tools.get("missing").is_none());
    }

    #[test]
    fn specs_are_sorted_by_name() {
        struct Named(&'static str);

        #[async_trait]
        impl AgentTool for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                ""
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
            ) -> Result<AgentToolResult> {
                Ok(AgentToolResult::default())
            }
        }

        let mut tools = ToolSet::new();
        tools.register(Arc::new(Named("zeta")));
        tools.register(Arc::new(Named("alpha")));

        let names: Vec<String> = tools.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn execute_reports_progress_and_returns_content() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let progress = Progress::new(move |m| {
            let _ = tx.send(m);
        });

        let result = EchoTool
            .execute(
                "call_1",
                json!({"text": "hi"}),
                CancellationToken::new(),
                progress,
            )
            .await
            .unwrap();

        assert_eq!(result.content, "hi");
        assert_eq!(rx.recv().await.as_deref(), Some("echoing"));
    }

    #[test]
    fn spec_carries_schema() {
        let spec = EchoTool.spec();
        assert_eq!(spec.name, "echo");
        assert_eq!(spec.parameters["required"][0], "text");
    }
}
