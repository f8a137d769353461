use async_trait::async_trait;
use serde_json::Value;

use crate::context::RunContext;
use crate::items::{InputItem, ModelResponse};
use crate::tools::ToolOutput;

use super::Agent;

/// Lifecycle callbacks. Set on a [`RunConfig`](crate::run::RunConfig) they
/// observe the whole run; set on an [`Agent`] they fire only while that
/// agent is active. Every method defaults to a no-op.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {}

    async fn on_agent_end(&self, _ctx: &RunContext, _agent: &Agent, _output: &Value) {}

    async fn on_handoff(&self, _ctx: &RunContext, _from: &Agent, _to: &Agent) {}

    async fn on_tool_start(&self, _ctx: &RunContext, _agent: &Agent, _tool: &str) {}

    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool: &str,
        _output: &ToolOutput,
    ) {
    }

    async fn on_llm_start(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _system_prompt: Option<&str>,
        _input: &[InputItem],
    ) {
    }

    async fn on_llm_end(&self, _ctx: &RunContext, _agent: &Agent, _response: &ModelResponse) {}
}
