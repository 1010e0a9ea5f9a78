//! Public agent surface.
//!
//! An [`Agent`] owns one conversation: its history, its tools, and at most
//! one run at a time. Callers start runs with [`Agent::prompt`] or
//! [`Agent::continue_turn`], feed a running agent with [`Agent::steer`],
//! queue input for later with [`Agent::follow_up`], and observe everything
//! through [`Agent::subscribe`].

use crate::agent_loop::{
    self, AgentConfig, EventEmitter, HttpModelClient, MessageQueue, ModelClient, RunContext,
};
use crate::events::AgentEventEnvelope;
use crate::llm::{Message, ThinkingLevel};
use crate::model::{env_api_key, Model};
use crate::tools::ToolSet;
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Subscriber fan-out depth. A subscriber that lags this far behind loses
/// its oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Construction-time options for an [`Agent`].
#[derive(Default)]
pub struct AgentOptions {
    pub system_prompt: Option<String>,
    pub tools: ToolSet,
    pub thinking: ThinkingLevel,
    /// API key for the model's provider. When `None`, the conventional
    /// environment variable (`{PROVIDER}_API_KEY`) is consulted.
    pub api_key: Option<String>,
    pub config: AgentConfig,
}

/// An agent method was called in a state that cannot honor it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AgentError {}

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One conversation with one model and one tool set.
///
/// All methods take `&self`; share an agent across tasks with `Arc`.
pub struct Agent {
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolSet>,
    system_prompt: Option<String>,
    thinking: ThinkingLevel,
    api_key: String,
    config: AgentConfig,
    history: Arc<Mutex<Vec<Message>>>,
    steering: Arc<MessageQueue>,
    follow_up: Arc<MessageQueue>,
    events: broadcast::Sender<AgentEventEnvelope>,
    run: Mutex<Option<ActiveRun>>,
}

impl Agent {
    /// Build an agent that talks to the real provider behind `model`.
    #[must_use]
    pub fn new(model: Model, options: AgentOptions) -> Self {
        let provider = model.provider.clone();
        Self::with_client(Arc::new(HttpModelClient::new(model)), options, &provider)
    }

    /// Build an agent on an explicit [`ModelClient`]. This is the seam used
    /// to substitute a scripted client.
    #[must_use]
    pub fn with_client(
        client: Arc<dyn ModelClient>,
        options: AgentOptions,
        provider: &str,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let api_key = options
            .api_key
            .or_else(|| env_api_key(provider))
            .unwrap_or_default();
        Self {
            client,
            tools: Arc::new(options.tools),
            system_prompt: options.system_prompt,
            thinking: options.thinking,
            api_key,
            config: options.config,
            history: Arc::new(Mutex::new(Vec::new())),
            steering: Arc::new(MessageQueue::new()),
            follow_up: Arc::new(MessageQueue::new()),
            events,
            run: Mutex::new(None),
        }
    }

    /// Start a run from a plain text user message.
    ///
    /// Queued follow-up messages are appended to history behind the prompt.
    /// Fails if a run is already active.
    pub fn prompt(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.prompt_message(Message::user(text))
    }

    /// Start a run from a pre-built message (e.g. one carrying images).
    pub fn prompt_message(&self, message: Message) -> Result<(), AgentError> {
        let mut run = self.lock_run();
        self.ensure_idle(&run)?;

        let mut incoming = vec![message];
        incoming.extend(self.follow_up.drain(self.config.follow_up_drain));
        self.append_history(incoming);
        *run = Some(self.spawn_run());
        Ok(())
    }

    /// Resume the loop on the existing history without new user input.
    ///
    /// Fails if a run is already active or history is empty.
    pub fn continue_turn(&self) -> Result<(), AgentError> {
        let mut run = self.lock_run();
        self.ensure_idle(&run)?;
        if self.history().is_empty() {
            return Err(AgentError::new("nothing to continue: history is empty"));
        }
        *run = Some(self.spawn_run());
        Ok(())
    }

    /// Queue a message the running loop picks up at its next drain point
    /// (after tool execution or after a turn without tool calls).
    pub fn steer(&self, message: Message) {
        self.steering.push(message);
    }

    /// Queue a message for the next [`Agent::prompt`] while idle.
    pub fn follow_up(&self, message: Message) {
        self.follow_up.push(message);
    }

    /// Discard all queued steering and follow-up messages.
    pub fn clear_all_queues(&self) {
        self.steering.clear();
        self.follow_up.clear();
    }

    /// Cancel the active run, if any. The run winds down quickly and ends
    /// with `AgentEnd { outcome: Aborted }`.
    pub fn abort(&self) {
        let run = self.lock_run();
        if let Some(active) = run.as_ref() {
            debug!("abort requested");
            active.cancel.cancel();
        }
    }

    /// Whether a run is currently executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Register `callback` for every event envelope, current and future
    /// runs alike. Dropping the returned [`Subscription`] (or calling
    /// [`Subscription::unsubscribe`]) stops delivery.
    pub fn subscribe(
        &self,
        callback: impl Fn(AgentEventEnvelope) + Send + 'static,
    ) -> Subscription {
        let mut rx = self.events.subscribe();
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_stop.cancelled() => return,
                    received = rx.recv() => match received {
                        Ok(envelope) => callback(envelope),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("subscriber lagged, dropped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
        Subscription { stop }
    }

    /// Snapshot of the conversation history.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn ensure_idle(&self, run: &Option<ActiveRun>) -> Result<(), AgentError> {
        match run {
            Some(active) if !active.task.is_finished() => {
                Err(AgentError::new("a run is already active"))
            }
            _ => Ok(()),
        }
    }

    fn spawn_run(&self) -> ActiveRun {
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            client: self.client.clone(),
            tools: self.tools.clone(),
            history: self.history.clone(),
            steering: self.steering.clone(),
            system_prompt: self.system_prompt.clone(),
            thinking: self.thinking,
            api_key: self.api_key.clone(),
            config: self.config.clone(),
            emitter: EventEmitter::new(self.events.clone()),
            cancel: cancel.clone(),
        };
        ActiveRun {
            cancel,
            task: tokio::spawn(agent_loop::run(ctx)),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append_history(&self, messages: impl IntoIterator<Item = Message>) {
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend(messages);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(active) = self.lock_run().as_ref() {
            active.cancel.cancel();
        }
    }
}

/// Handle for one [`Agent::subscribe`] registration.
pub struct Subscription {
    stop: CancellationToken,
}

impl Subscription {
    /// Stop delivery. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
