//! Agent runner for Rust.
//!
//! Surface:
//! - `Agent` definitions with tools, handoffs, guardrails and typed output
//! - `Runner::run` and `Runner::run_streamed` entry points
//! - Strict JSON schemas for tool parameters and structured output
//! - `Session` history and batched trace export
//! - Anthropic and Chat Completions backends behind the `Model` trait

pub mod agent;
pub mod context;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod items;
pub mod llm;
pub mod run;
pub mod schema;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod usage;

pub use agent::{
    Agent, AgentBuilder, FunctionToolResult, Instructions, RunHooks, ToolUseBehavior,
    ToolsDecision,
};
pub use context::{Enabled, RunContext};
pub use error::{AgentError, ProviderError, SchemaError, SessionError, ToolError};
pub use guardrail::{
    GuardrailFunctionOutput, InputGuardrail, InputGuardrailResult, OutputGuardrail,
    OutputGuardrailResult,
};
pub use handoff::filters as handoff_filters;
pub use handoff::{AgentRegistry, Handoff, HandoffInputData, HandoffInputFilter};
pub use items::{ContentPart, InputItem, ModelResponse, OutputItem, Role, RunInput, RunItem};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatCompletionsConfig, ChatCompletionsModel, Model,
    ModelProvider, ModelRef, ModelRequest, ModelSettings, ModelStreamEvent, MultiProvider,
    ToolChoice,
};
pub use run::{RunConfig, RunEvent, RunResult, Runner};
pub use schema::OutputType;
pub use session::{MemorySession, Session};
pub use telemetry::TraceProvider;
pub use tools::{
    Computer, ComputerTool, FailureHandling, FunctionTool, HostedTool, Tool, ToolContext,
    ToolOutput,
};
pub use usage::Usage;
