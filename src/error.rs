use thiserror::Error;

use crate::guardrail::{InputGuardrailResult, OutputGuardrailResult};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error(
        "additionalProperties should not be set for object types in strict mode (at {path})"
    )]
    OpenObjectInStrictMode { path: String },
    #[error("could not resolve $ref {reference}")]
    UnresolvedRef { reference: String },
    #[error("plain text output has no JSON schema")]
    PlainTextHasNoSchema,
    #[error("failed to generate schema: {0}")]
    Generation(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("agent configuration error: {0}")]
    Config(String),
    #[error("model behavior error: {0}")]
    ModelBehavior(String),
    #[error("input guardrail {} triggered tripwire", .0.guardrail)]
    InputGuardrailTripwire(Box<InputGuardrailResult>),
    #[error("output guardrail {} triggered tripwire", .0.guardrail)]
    OutputGuardrailTripwire(Box<OutputGuardrailResult>),
    #[error("max turns exceeded ({max_turns})")]
    MaxTurnsExceeded { max_turns: u32 },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
}

impl AgentError {
    pub fn model_behavior(message: impl Into<String>) -> Self {
        Self::ModelBehavior(message.into())
    }

    /// True when the remote model produced output inconsistent with its
    /// contract. Retrying the run may succeed.
    pub fn is_model_behavior(&self) -> bool {
        matches!(
            self,
            Self::ModelBehavior(_) | Self::Tool(ToolError::InvalidArguments { .. })
        )
    }

    pub fn is_guardrail_tripwire(&self) -> bool {
        matches!(
            self,
            Self::InputGuardrailTripwire(_) | Self::OutputGuardrailTripwire(_)
        )
    }
}
