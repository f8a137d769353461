//! Model client interface and backends.
//!
//! The orchestrator only talks to [`Model`]. Which backend serves a given
//! model name is decided by a [`ModelProvider`].

mod anthropic;
mod chat_completions;
mod provider;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use crate::error::ProviderError;
use crate::items::{InputItem, ModelResponse, OutputItem, message_text};
use crate::schema::OutputSchemaSpec;

pub use crate::handoff::HandoffDefinition;
pub use crate::tools::ToolDefinition;
pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub use chat_completions::{ChatCompletionsConfig, ChatCompletionsModel};
pub use provider::MultiProvider;

/// How much of a model call is recorded in traces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelTracing {
    #[default]
    Disabled,
    Enabled,
    /// Record the call but not its inputs and outputs.
    EnabledWithoutData,
}

impl ModelTracing {
    pub fn is_disabled(self) -> bool {
        self == Self::Disabled
    }

    pub fn include_data(self) -> bool {
        self == Self::Enabled
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    Named(String),
}

/// Sampling and request tuning. `None` leaves the backend default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub tool_choice: Option<ToolChoice>,
    pub parallel_tool_calls: Option<bool>,
    pub max_tokens: Option<u32>,
    pub truncation: Option<String>,
    pub store: Option<bool>,
    pub include_usage: Option<bool>,
    pub reasoning_budget_tokens: Option<u32>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ModelSettings {
    /// `self` with every field that `overrides` sets replaced.
    pub fn resolve(&self, overrides: Option<&ModelSettings>) -> ModelSettings {
        let Some(overrides) = overrides else {
            return self.clone();
        };

        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        ModelSettings {
            temperature: pick(&self.temperature, &overrides.temperature),
            top_p: pick(&self.top_p, &overrides.top_p),
            frequency_penalty: pick(&self.frequency_penalty, &overrides.frequency_penalty),
            presence_penalty: pick(&self.presence_penalty, &overrides.presence_penalty),
            tool_choice: pick(&self.tool_choice, &overrides.tool_choice),
            parallel_tool_calls: pick(&self.parallel_tool_calls, &overrides.parallel_tool_calls),
            max_tokens: pick(&self.max_tokens, &overrides.max_tokens),
            truncation: pick(&self.truncation, &overrides.truncation),
            store: pick(&self.store, &overrides.store),
            include_usage: pick(&self.include_usage, &overrides.include_usage),
            reasoning_budget_tokens: pick(
                &self.reasoning_budget_tokens,
                &overrides.reasoning_budget_tokens,
            ),
            metadata: pick(&self.metadata, &overrides.metadata),
        }
    }
}

/// Reference to a server-side prompt template.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prompt {
    pub id: String,
    pub version: Option<String>,
    pub variables: BTreeMap<String, Value>,
}

/// Everything a backend needs for one model call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelRequest {
    pub system_instructions: Option<String>,
    pub input: Vec<InputItem>,
    pub model_settings: ModelSettings,
    pub tools: Vec<ToolDefinition>,
    pub output_schema: Option<OutputSchemaSpec>,
    pub handoffs: Vec<HandoffDefinition>,
    pub tracing: ModelTracing,
    pub previous_response_id: Option<String>,
    pub prompt: Option<Prompt>,
}

/// Incremental model output. A stream always ends with `Completed`.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelStreamEvent {
    OutputTextDelta { delta: String },
    ReasoningDelta { delta: String },
    Completed(ModelResponse),
}

pub type ModelEventStream = BoxStream<'static, Result<ModelStreamEvent, ProviderError>>;

#[async_trait]
pub trait Model: Send + Sync {
    async fn get_response(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError>;

    /// Defaults to one round trip replayed as deltas.
    async fn stream_response(
        &self,
        request: &ModelRequest,
    ) -> Result<ModelEventStream, ProviderError> {
        let response = self.get_response(request).await?;
        Ok(replay_as_stream(response))
    }
}

/// Emits the text and reasoning of `response` as deltas followed by
/// `Completed(response)`.
pub fn replay_as_stream(response: ModelResponse) -> ModelEventStream {
    let mut events = Vec::new();
    for item in &response.output {
        match item {
            OutputItem::Message { content, .. } => {
                let text = message_text(content);
                if !text.is_empty() {
                    events.push(ModelStreamEvent::OutputTextDelta { delta: text });
                }
            }
            OutputItem::Reasoning { summary, .. } => {
                for part in summary {
                    events.push(ModelStreamEvent::ReasoningDelta {
                        delta: part.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    events.push(ModelStreamEvent::Completed(response));
    stream::iter(events.into_iter().map(Ok)).boxed()
}

/// Drains `events` and returns the response carried by `Completed`.
pub async fn collect_response(mut events: ModelEventStream) -> Result<ModelResponse, ProviderError> {
    while let Some(event) = events.next().await {
        if let ModelStreamEvent::Completed(response) = event? {
            return Ok(response);
        }
    }
    Err(ProviderError::Response(
        "model stream ended without a completed response".to_string(),
    ))
}

/// Resolves model names to clients.
pub trait ModelProvider: Send + Sync {
    /// `None` asks for the provider's default model.
    fn get_model(&self, name: Option<&str>) -> Result<Arc<dyn Model>, ProviderError>;
}

/// An agent's model: either a name resolved through the run's provider, or
/// a concrete client.
#[derive(Clone)]
pub enum ModelRef {
    Name(String),
    Instance(Arc<dyn Model>),
}

impl ModelRef {
    pub fn instance(model: impl Model + 'static) -> Self {
        Self::Instance(Arc::new(model))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Instance(_) => None,
        }
    }
}

impl std::fmt::Debug for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Instance(_) => f.write_str("Instance(..)"),
        }
    }
}

impl From<&str> for ModelRef {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for ModelRef {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<Arc<dyn Model>> for ModelRef {
    fn from(value: Arc<dyn Model>) -> Self {
        Self::Instance(value)
    }
}
