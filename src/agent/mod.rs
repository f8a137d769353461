pub mod graph;
mod hooks;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::error::{AgentError, SchemaError, ToolError};
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::handoff::Handoff;
use crate::llm::{ModelRef, ModelSettings, Prompt};
use crate::run::{RunConfig, Runner};
use crate::schema::OutputType;
use crate::tools::{FunctionTool, Tool, ToolContext, ToolOutput};

pub use hooks::RunHooks;

type InstructionsFn =
    dyn Fn(RunContext, Arc<Agent>) -> BoxFuture<'static, Result<String, AgentError>> + Send + Sync;

/// System prompt of an agent: fixed text, or computed per turn.
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    Dynamic(Arc<InstructionsFn>),
}

impl std::fmt::Debug for Instructions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl Instructions {
    pub fn dynamic<F>(build: F) -> Self
    where
        F: Fn(&RunContext, &Agent) -> String + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(move |ctx, agent| {
            let text = build(&ctx, &agent);
            Box::pin(async move { Ok(text) })
        }))
    }

    pub fn dynamic_async<F, Fut>(build: F) -> Self
    where
        F: Fn(RunContext, Arc<Agent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, AgentError>> + Send + 'static,
    {
        Self::Dynamic(Arc::new(move |ctx, agent| Box::pin(build(ctx, agent))))
    }

    pub async fn resolve(&self, ctx: &RunContext, agent: &Arc<Agent>) -> Result<String, AgentError> {
        match self {
            Self::Static(text) => Ok(text.clone()),
            Self::Dynamic(build) => build(ctx.clone(), Arc::clone(agent)).await,
        }
    }
}

impl From<&str> for Instructions {
    fn from(value: &str) -> Self {
        Self::Static(value.to_string())
    }
}

impl From<String> for Instructions {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

/// Output of one function tool call in a turn, as seen by a tool-use policy.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionToolResult {
    pub tool_name: String,
    pub call_id: String,
    pub output: ToolOutput,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolsDecision {
    /// End the run with this output.
    Final(Value),
    /// Feed the tool outputs back to the model.
    RunAgain,
}

type ToolsResolverFn = dyn Fn(RunContext, Vec<FunctionToolResult>) -> BoxFuture<'static, Result<ToolsDecision, AgentError>>
    + Send
    + Sync;

/// What happens after the function tools of a turn have run.
#[derive(Clone, Default)]
pub enum ToolUseBehavior {
    #[default]
    RunLlmAgain,
    /// The first tool's output becomes the final output.
    StopOnFirstTool,
    /// Stop when any of the named tools was called; its output is final.
    StopAtTools(Vec<String>),
    Custom(Arc<ToolsResolverFn>),
}

impl std::fmt::Debug for ToolUseBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RunLlmAgain => f.write_str("RunLlmAgain"),
            Self::StopOnFirstTool => f.write_str("StopOnFirstTool"),
            Self::StopAtTools(names) => f.debug_tuple("StopAtTools").field(names).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ToolUseBehavior {
    pub fn custom<F, Fut>(resolver: F) -> Self
    where
        F: Fn(RunContext, Vec<FunctionToolResult>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolsDecision, AgentError>> + Send + 'static,
    {
        Self::Custom(Arc::new(move |ctx, results| Box::pin(resolver(ctx, results))))
    }

    pub(crate) async fn decide(
        &self,
        ctx: &RunContext,
        results: &[FunctionToolResult],
    ) -> Result<ToolsDecision, AgentError> {
        if results.is_empty() {
            return Ok(ToolsDecision::RunAgain);
        }
        match self {
            Self::RunLlmAgain => Ok(ToolsDecision::RunAgain),
            Self::StopOnFirstTool => Ok(ToolsDecision::Final(results[0].output.to_value())),
            Self::StopAtTools(names) => Ok(results
                .iter()
                .find(|result| names.contains(&result.tool_name))
                .map_or(ToolsDecision::RunAgain, |result| {
                    ToolsDecision::Final(result.output.to_value())
                })),
            Self::Custom(resolver) => resolver(ctx.clone(), results.to_vec()).await,
        }
    }
}

#[derive(Clone)]
pub struct AgentBuilder {
    name: String,
    handoff_description: Option<String>,
    instructions: Option<Instructions>,
    prompt: Option<Prompt>,
    tools: Vec<Tool>,
    handoffs: Vec<Handoff>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
    output_type: OutputType,
    model: Option<ModelRef>,
    model_settings: ModelSettings,
    tool_use_behavior: ToolUseBehavior,
    reset_tool_choice: bool,
    hooks: Option<Arc<dyn RunHooks>>,
}

impl AgentBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handoff_description: None,
            instructions: None,
            prompt: None,
            tools: Vec::new(),
            handoffs: Vec::new(),
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            output_type: OutputType::text(),
            model: None,
            model_settings: ModelSettings::default(),
            tool_use_behavior: ToolUseBehavior::default(),
            reset_tool_choice: true,
            hooks: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Used in the description of handoffs to this agent.
    pub fn handoff_description(mut self, description: impl Into<String>) -> Self {
        self.handoff_description = Some(description.into());
        self
    }

    pub fn instructions(mut self, instructions: impl Into<Instructions>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn tool(mut self, tool: impl Into<Tool>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn clear_tools(mut self) -> Self {
        self.tools.clear();
        self
    }

    pub fn handoff(mut self, handoff: impl Into<Handoff>) -> Self {
        self.handoffs.push(handoff.into());
        self
    }

    pub fn clear_handoffs(mut self) -> Self {
        self.handoffs.clear();
        self
    }

    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    pub fn output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }

    pub fn model(mut self, model: impl Into<ModelRef>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn tool_use_behavior(mut self, behavior: ToolUseBehavior) -> Self {
        self.tool_use_behavior = behavior;
        self
    }

    /// Whether a forced tool choice is reset to auto once the agent has used
    /// a tool. On by default.
    pub fn reset_tool_choice(mut self, reset: bool) -> Self {
        self.reset_tool_choice = reset;
        self
    }

    pub fn hooks(mut self, hooks: impl RunHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Config("agent name must not be empty".to_string()));
        }

        let mut tool_names = HashSet::new();
        for tool in &self.tools {
            if !tool_names.insert(tool.name()) {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered on agent {}: {}",
                    self.name,
                    tool.name()
                )));
            }
        }

        let computers = self
            .tools
            .iter()
            .filter(|tool| matches!(tool, Tool::Computer(_)))
            .count();
        if computers > 1 {
            return Err(AgentError::Config(format!(
                "agent {} has {computers} computer tools, at most one is supported",
                self.name
            )));
        }

        let mut handoff_names = HashSet::new();
        for handoff in &self.handoffs {
            let name = handoff.tool_name();
            if !handoff_names.insert(name) || tool_names.contains(name) {
                return Err(AgentError::Config(format!(
                    "duplicate handoff tool name on agent {}: {name}",
                    self.name
                )));
            }
        }

        self.output_type.spec()?;

        Ok(Agent {
            name: self.name,
            handoff_description: self.handoff_description,
            instructions: self.instructions,
            prompt: self.prompt,
            tools: self.tools,
            handoffs: self.handoffs,
            input_guardrails: self.input_guardrails,
            output_guardrails: self.output_guardrails,
            output_type: self.output_type,
            model: self.model,
            model_settings: self.model_settings,
            tool_use_behavior: self.tool_use_behavior,
            reset_tool_choice: self.reset_tool_choice,
            hooks: self.hooks,
        })
    }
}

/// Immutable agent configuration. Use [`Agent::clone_with`] for variants.
#[derive(Clone)]
pub struct Agent {
    name: String,
    handoff_description: Option<String>,
    instructions: Option<Instructions>,
    prompt: Option<Prompt>,
    tools: Vec<Tool>,
    handoffs: Vec<Handoff>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
    output_type: OutputType,
    model: Option<ModelRef>,
    model_settings: ModelSettings,
    tool_use_behavior: ToolUseBehavior,
    reset_tool_choice: bool,
    hooks: Option<Arc<dyn RunHooks>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field(
                "tools",
                &self.tools.iter().map(Tool::name).collect::<Vec<_>>(),
            )
            .field(
                "handoffs",
                &self.handoffs.iter().map(Handoff::tool_name).collect::<Vec<_>>(),
            )
            .field("output_type", &self.output_type)
            .field("model", &self.model)
            .field("tool_use_behavior", &self.tool_use_behavior)
            .finish()
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// A builder pre-filled with this agent's configuration.
    pub fn to_builder(&self) -> AgentBuilder {
        AgentBuilder {
            name: self.name.clone(),
            handoff_description: self.handoff_description.clone(),
            instructions: self.instructions.clone(),
            prompt: self.prompt.clone(),
            tools: self.tools.clone(),
            handoffs: self.handoffs.clone(),
            input_guardrails: self.input_guardrails.clone(),
            output_guardrails: self.output_guardrails.clone(),
            output_type: self.output_type.clone(),
            model: self.model.clone(),
            model_settings: self.model_settings.clone(),
            tool_use_behavior: self.tool_use_behavior.clone(),
            reset_tool_choice: self.reset_tool_choice,
            hooks: self.hooks.clone(),
        }
    }

    /// A new agent with `edit` applied on top of this one's configuration.
    pub fn clone_with<F>(&self, edit: F) -> Result<Agent, AgentError>
    where
        F: FnOnce(AgentBuilder) -> AgentBuilder,
    {
        edit(self.to_builder()).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handoff_description(&self) -> Option<&str> {
        self.handoff_description.as_deref()
    }

    pub fn instructions(&self) -> Option<&Instructions> {
        self.instructions.as_ref()
    }

    pub fn prompt(&self) -> Option<&Prompt> {
        self.prompt.as_ref()
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn handoffs(&self) -> &[Handoff] {
        &self.handoffs
    }

    pub fn input_guardrails(&self) -> &[InputGuardrail] {
        &self.input_guardrails
    }

    pub fn output_guardrails(&self) -> &[OutputGuardrail] {
        &self.output_guardrails
    }

    pub fn output_type(&self) -> &OutputType {
        &self.output_type
    }

    pub fn model(&self) -> Option<&ModelRef> {
        self.model.as_ref()
    }

    pub fn model_settings(&self) -> &ModelSettings {
        &self.model_settings
    }

    pub fn tool_use_behavior(&self) -> &ToolUseBehavior {
        &self.tool_use_behavior
    }

    pub fn resets_tool_choice(&self) -> bool {
        self.reset_tool_choice
    }

    pub fn hooks(&self) -> Option<&Arc<dyn RunHooks>> {
        self.hooks.as_ref()
    }

    pub async fn system_prompt(
        self: &Arc<Self>,
        ctx: &RunContext,
    ) -> Result<Option<String>, AgentError> {
        match &self.instructions {
            Some(instructions) => instructions.resolve(ctx, self).await.map(Some),
            None => Ok(None),
        }
    }

    /// Tools offered to the model on this turn.
    pub async fn enabled_tools(&self, ctx: &RunContext) -> Vec<Tool> {
        let mut enabled = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            if tool.is_enabled(ctx, self).await {
                enabled.push(tool.clone());
            }
        }
        enabled
    }

    /// Handoffs offered to the model on this turn.
    pub async fn enabled_handoffs(&self, ctx: &RunContext) -> Vec<Handoff> {
        let mut enabled = Vec::with_capacity(self.handoffs.len());
        for handoff in &self.handoffs {
            if handoff.is_enabled().evaluate(ctx, self).await {
                enabled.push(handoff.clone());
            }
        }
        enabled
    }

    /// Exposes this agent as a function tool taking `{"input": string}`.
    ///
    /// Each call starts a nested run that shares the caller's context values
    /// but keeps its own usage counters. The nested run's final output is the
    /// tool output.
    pub fn as_tool(
        self: &Arc<Self>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<FunctionTool, SchemaError> {
        let agent = Arc::clone(self);
        let tool = FunctionTool::new(name, description).with_schema(json!({
            "type": "object",
            "properties": {
                "input": {"type": "string", "description": "Input for the agent."}
            },
            "required": ["input"],
            "additionalProperties": false,
        }))?;

        Ok(tool.with_handler(move |ctx: ToolContext, args: Value| {
            let agent = Arc::clone(&agent);
            async move {
                let input = args
                    .get("input")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let config = RunConfig {
                    context: ctx.context.fork(),
                    ..RunConfig::default()
                };
                let result = Runner::run(agent, input, config)
                    .await
                    .map_err(|err| ToolError::execution(err.to_string()))?;
                Ok::<ToolOutput, ToolError>(match result.final_output {
                    Value::String(text) => ToolOutput::Text(text),
                    other => ToolOutput::Json(other),
                })
            }
        }))
    }
}
