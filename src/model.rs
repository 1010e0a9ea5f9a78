//! Model descriptors and the model registry.
//!
//! A [`Model`] is an immutable record describing one deployable model: which
//! vendor API it speaks, what it costs, and what it can accept. Descriptors
//! are owned by a [`ModelRegistry`] value that the caller constructs and
//! passes in explicitly; the core only ever reads them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire protocol family a model is invoked through.
///
/// This is a closed set: adding a vendor protocol means adding a variant and
/// updating every exhaustive match, which keeps provider dispatch reviewable.
/// OpenAI-compatible vendors (zhipu, groq, xai, ...) are `OpenAiCompletions`
/// with their own `provider` string and `base_url`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Api {
    OpenAiCompletions,
    OpenAiResponses,
    AnthropicMessages,
    GoogleGenerativeAi,
}

/// Input modalities a model accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

/// Cost rates in USD per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Immutable descriptor for one model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    /// Vendor model identifier sent on the wire (e.g. `gpt-4o`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Provider identity (e.g. `openai`, `anthropic`, `zhipu`).
    pub provider: String,
    /// Wire protocol family.
    pub api: Api,
    /// API base URL, without a trailing slash.
    pub base_url: String,
    /// Whether the model emits reasoning/thinking content.
    pub reasoning: bool,
    /// Accepted input modalities.
    pub input: Vec<Modality>,
    pub cost: ModelCost,
    pub context_window: u32,
    pub max_tokens: u32,
}

impl Model {
    /// Compute the USD cost of a turn from token counts.
    #[must_use]
    pub fn cost_of(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    ) -> f64 {
        let per_million = |tokens: u32, rate: f64| f64::from(tokens) * rate / 1_000_000.0;
        per_million(input_tokens, self.cost.input)
            + per_million(output_tokens, self.cost.output)
            + per_million(cache_read_tokens, self.cost.cache_read)
            + per_million(cache_write_tokens, self.cost.cache_write)
    }
}

/// Resolve the conventional environment variable holding a provider's API key.
#[must_use]
pub fn env_key_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"))
}

/// Look up a provider's API key from the environment.
#[must_use]
pub fn env_api_key(provider: &str) -> Option<String> {
    std::env::var(env_key_var(provider)).ok()
}

/// Explicit registry of model descriptors, keyed by `provider/id`.
///
/// Never global: construct one, register models, pass it to the agent.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(provider: &str, id: &str) -> String {
        format!("{provider}/{id}")
    }

    /// Register a model descriptor. Replaces any previous entry for the
    /// same provider/id pair.
    pub fn register(&mut self, model: Model) {
        self.models
            .insert(Self::key(&model.provider, &model.id), model);
    }

    #[must_use]
    pub fn get(&self, provider: &str, id: &str) -> Option<&Model> {
        self.models.get(&Self::key(provider, id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }
}
