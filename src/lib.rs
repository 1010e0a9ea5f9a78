//! Rudder - a multi-vendor LLM streaming client and agent loop.
//!
//! This crate provides:
//! - Streaming clients for the OpenAI completions/responses, Anthropic
//!   messages, and Google generative-AI wire protocols, all normalized to
//!   one canonical event vocabulary
//! - Cross-provider history transformation, so one conversation can move
//!   between vendors mid-stream
//! - An agent loop: model invocation with bounded retry, validated and
//!   cancellable tool fan-out, steering and follow-up queues
//!
//! # Example
//!
//! ```ignore
//! use rudder::{Agent, AgentOptions, Message, Model};
//!
//! let agent = Agent::new(model, AgentOptions {
//!     system_prompt: Some("You are terse.".to_string()),
//!     tools,
//!     ..AgentOptions::default()
//! });
//!
//! let _subscription = agent.subscribe(|envelope| println!("{envelope:?}"));
//! agent.prompt("List the files in /tmp")?;
//! ```

#![forbid(unsafe_code)]

pub mod agent;
pub mod agent_loop;
pub mod events;
pub mod llm;
pub mod model;
pub mod providers;
pub mod tools;

pub use agent::{Agent, AgentError, AgentOptions, Subscription};
pub use agent_loop::{AgentConfig, DrainMode, HttpModelClient, ModelClient};
pub use events::{AgentEvent, AgentEventEnvelope, EndReason, SequenceCounter};
pub use llm::{
    ContentBlock, EventStream, Message, RetryConfig, StopReason, StreamErrorKind, StreamEvent,
    StreamRequest, ThinkingLevel, ToolSpec, Usage,
};
pub use model::{env_api_key, env_key_var, Api, Modality, Model, ModelCost, ModelRegistry};
pub use tools::{AgentTool, AgentToolResult, Progress, ToolSet};
