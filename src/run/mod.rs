//! The run loop: calls the model, executes tools and handoffs, enforces
//! guardrails and repeats until a final output is produced.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::future::{join, join_all};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::agent::{Agent, FunctionToolResult, RunHooks, ToolsDecision};
use crate::context::RunContext;
use crate::error::{AgentError, ProviderError};
use crate::guardrail::{InputGuardrail, InputGuardrailResult, OutputGuardrail, OutputGuardrailResult};
use crate::handoff::{Handoff, HandoffInputData, HandoffInputFilter};
use crate::items::{InputItem, ModelResponse, OutputItem, RunInput, RunItem, last_message_text};
use crate::llm::{
    Model, ModelProvider, ModelRef, ModelRequest, ModelSettings, ModelStreamEvent, ModelTracing,
    MultiProvider, ToolChoice,
};
use crate::session::Session;
use crate::telemetry::{Span, SpanData, SpanError, Trace, TraceProvider};
use crate::tools::{ComputerTool, FunctionTool, Tool, ToolContext, ToolOutput};
use crate::usage::Usage;

const DEFAULT_MAX_TURNS: u32 = 10;
const MULTIPLE_HANDOFFS_MESSAGE: &str = "Multiple handoffs detected, ignoring this one.";

/// Settings for one run.
#[derive(Clone)]
pub struct RunConfig {
    /// Model calls allowed before the run fails with
    /// [`AgentError::MaxTurnsExceeded`].
    pub max_turns: u32,
    pub context: RunContext,
    pub session: Option<Arc<dyn Session>>,
    /// Overrides every agent's model.
    pub model: Option<ModelRef>,
    /// Resolves model names. Defaults to [`MultiProvider::from_env`].
    pub model_provider: Option<Arc<dyn ModelProvider>>,
    /// Applied on top of each agent's settings.
    pub model_settings: Option<ModelSettings>,
    /// Used for handoffs that carry no filter of their own.
    pub handoff_input_filter: Option<HandoffInputFilter>,
    pub input_guardrails: Vec<InputGuardrail>,
    pub output_guardrails: Vec<OutputGuardrail>,
    pub tracing_disabled: bool,
    /// Whether spans record model input/output and tool arguments.
    pub trace_include_sensitive_data: bool,
    pub workflow_name: String,
    pub trace_id: Option<String>,
    pub group_id: Option<String>,
    pub trace_metadata: Option<Value>,
    /// Tracing is a no-op without a provider.
    pub trace_provider: Option<Arc<TraceProvider>>,
    pub hooks: Option<Arc<dyn RunHooks>>,
    pub previous_response_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            context: RunContext::new(),
            session: None,
            model: None,
            model_provider: None,
            model_settings: None,
            handoff_input_filter: None,
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            tracing_disabled: false,
            trace_include_sensitive_data: true,
            workflow_name: "Agent workflow".to_string(),
            trace_id: None,
            group_id: None,
            trace_metadata: None,
            trace_provider: None,
            hooks: None,
            previous_response_id: None,
        }
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("max_turns", &self.max_turns)
            .field("session", &self.session.as_ref().map(|s| s.session_id().to_string()))
            .field("model", &self.model)
            .field("model_settings", &self.model_settings)
            .field("input_guardrails", &self.input_guardrails)
            .field("output_guardrails", &self.output_guardrails)
            .field("tracing_disabled", &self.tracing_disabled)
            .field("workflow_name", &self.workflow_name)
            .finish()
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_session(mut self, session: impl Session + 'static) -> Self {
        self.session = Some(Arc::new(session));
        self
    }

    pub fn with_model_provider(mut self, provider: impl ModelProvider + 'static) -> Self {
        self.model_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_trace_provider(mut self, provider: Arc<TraceProvider>) -> Self {
        self.trace_provider = Some(provider);
        self
    }

    pub fn with_hooks(mut self, hooks: impl RunHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub input: RunInput,
    /// Items generated during the run, after any handoff input filters.
    pub new_items: Vec<RunItem>,
    pub raw_responses: Vec<ModelResponse>,
    /// Shaped by the output type of `last_agent`.
    pub final_output: Value,
    pub input_guardrail_results: Vec<InputGuardrailResult>,
    pub output_guardrail_results: Vec<OutputGuardrailResult>,
    pub last_agent: Arc<Agent>,
    pub context: RunContext,
    pub trace_id: Option<String>,
}

impl RunResult {
    pub fn final_output_as<T: DeserializeOwned>(&self) -> Result<T, AgentError> {
        serde_json::from_value(self.final_output.clone()).map_err(|err| {
            AgentError::Config(format!(
                "final output of {} does not deserialize into {}: {err}",
                self.last_agent.name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// The run's input followed by everything it generated, ready to seed
    /// the next run.
    pub fn to_input_list(&self) -> Vec<InputItem> {
        self.input
            .to_items()
            .into_iter()
            .chain(self.new_items.iter().map(RunItem::to_input_item))
            .collect()
    }

    pub fn last_response_id(&self) -> Option<&str> {
        self.raw_responses
            .last()
            .and_then(|response| response.response_id.as_deref())
    }

    pub fn usage(&self) -> Usage {
        self.context.usage()
    }
}

#[derive(Clone, Debug)]
pub enum RunEvent {
    /// Incremental model output, only emitted by [`Runner::run_streamed`].
    RawModel(ModelStreamEvent),
    Item(RunItem),
    AgentUpdated { agent: Arc<Agent> },
    Completed(Box<RunResult>),
}

pub struct Runner;

impl Runner {
    pub async fn run(
        agent: impl Into<Arc<Agent>>,
        input: impl Into<RunInput>,
        config: RunConfig,
    ) -> Result<RunResult, AgentError> {
        let agent = agent.into();
        let span = info_span!("agent_run", agent = %agent.name(), workflow = %config.workflow_name);

        async move {
            let stream = run_loop(agent, input.into(), config, false);
            futures_util::pin_mut!(stream);

            let mut result = None;
            while let Some(event) = stream.next().await {
                match event? {
                    RunEvent::Completed(completed) => result = Some(*completed),
                    RunEvent::RawModel(_) | RunEvent::Item(_) | RunEvent::AgentUpdated { .. } => {}
                }
            }
            result.ok_or(AgentError::MissingFinalResponse)
        }
        .instrument(span)
        .await
    }

    /// Runs the same loop as [`Runner::run`], forwarding model deltas and
    /// finished items as they happen. The last event is `Completed`.
    pub fn run_streamed(
        agent: impl Into<Arc<Agent>>,
        input: impl Into<RunInput>,
        config: RunConfig,
    ) -> impl Stream<Item = Result<RunEvent, AgentError>> + Send + 'static {
        run_loop(agent.into(), input.into(), config, true)
    }
}

/// Run-level and agent-level hooks, called in that order.
struct Hooks {
    run: Option<Arc<dyn RunHooks>>,
    agent: Option<Arc<dyn RunHooks>>,
}

impl Hooks {
    fn new(run: Option<&Arc<dyn RunHooks>>, agent: &Agent) -> Self {
        Self {
            run: run.cloned(),
            agent: agent.hooks().cloned(),
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn RunHooks>> {
        self.run.iter().chain(&self.agent)
    }

    async fn agent_start(&self, ctx: &RunContext, agent: &Agent) {
        for hooks in self.all() {
            hooks.on_agent_start(ctx, agent).await;
        }
    }

    async fn agent_end(&self, ctx: &RunContext, agent: &Agent, output: &Value) {
        for hooks in self.all() {
            hooks.on_agent_end(ctx, agent, output).await;
        }
    }

    /// Run hooks, then the hooks of the agent receiving control. The source
    /// agent's own hooks are not told.
    async fn handoff(&self, ctx: &RunContext, from: &Agent, to: &Agent) {
        if let Some(hooks) = &self.run {
            hooks.on_handoff(ctx, from, to).await;
        }
        if let Some(hooks) = to.hooks() {
            hooks.on_handoff(ctx, from, to).await;
        }
    }

    async fn tool_start(&self, ctx: &RunContext, agent: &Agent, tool: &str) {
        for hooks in self.all() {
            hooks.on_tool_start(ctx, agent, tool).await;
        }
    }

    async fn tool_end(&self, ctx: &RunContext, agent: &Agent, tool: &str, output: &ToolOutput) {
        for hooks in self.all() {
            hooks.on_tool_end(ctx, agent, tool, output).await;
        }
    }

    async fn llm_start(
        &self,
        ctx: &RunContext,
        agent: &Agent,
        system_prompt: Option<&str>,
        input: &[InputItem],
    ) {
        for hooks in self.all() {
            hooks.on_llm_start(ctx, agent, system_prompt, input).await;
        }
    }

    async fn llm_end(&self, ctx: &RunContext, agent: &Agent, response: &ModelResponse) {
        for hooks in self.all() {
            hooks.on_llm_end(ctx, agent, response).await;
        }
    }
}

/// Model output of one turn sorted into items and pending work.
#[derive(Default)]
struct ProcessedResponse {
    items: Vec<RunItem>,
    functions: Vec<(FunctionTool, String, String)>,
    computer_actions: Vec<(ComputerTool, String, Value)>,
    handoffs: Vec<(Handoff, String, String)>,
}

impl ProcessedResponse {
    fn has_local_work(&self) -> bool {
        !self.functions.is_empty() || !self.computer_actions.is_empty() || !self.handoffs.is_empty()
    }
}

fn process_response(
    agent: &Agent,
    response: &ModelResponse,
    tools: &[Tool],
    handoffs: &[Handoff],
) -> Result<ProcessedResponse, AgentError> {
    let mut processed = ProcessedResponse::default();
    let agent_name = agent.name().to_string();

    for item in &response.output {
        match item {
            OutputItem::Message { id, content } => {
                processed.items.push(RunItem::MessageOutput {
                    agent: agent_name.clone(),
                    id: id.clone(),
                    content: content.clone(),
                });
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                if let Some(handoff) = handoffs.iter().find(|h| h.tool_name() == name) {
                    processed.items.push(RunItem::HandoffCall {
                        agent: agent_name.clone(),
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                        arguments: arguments.clone(),
                    });
                    processed
                        .handoffs
                        .push((handoff.clone(), call_id.clone(), arguments.clone()));
                    continue;
                }

                let tool = tools.iter().find_map(|tool| match tool {
                    Tool::Function(function) if function.name() == name => Some(function),
                    _ => None,
                });
                let Some(tool) = tool else {
                    return Err(AgentError::model_behavior(format!(
                        "tool {name} not found in agent {agent_name}"
                    )));
                };
                processed.items.push(RunItem::ToolCall {
                    agent: agent_name.clone(),
                    call: item.clone(),
                });
                processed
                    .functions
                    .push((tool.clone(), call_id.clone(), arguments.clone()));
            }
            OutputItem::ComputerCall {
                call_id, action, ..
            } => {
                let computer = tools.iter().find_map(|tool| match tool {
                    Tool::Computer(computer) => Some(computer),
                    _ => None,
                });
                let Some(computer) = computer else {
                    return Err(AgentError::model_behavior(format!(
                        "model produced a computer action but agent {agent_name} has no computer tool"
                    )));
                };
                processed.items.push(RunItem::ToolCall {
                    agent: agent_name.clone(),
                    call: item.clone(),
                });
                processed
                    .computer_actions
                    .push((computer.clone(), call_id.clone(), action.clone()));
            }
            OutputItem::HostedToolCall { .. } => {
                processed.items.push(RunItem::ToolCall {
                    agent: agent_name.clone(),
                    call: item.clone(),
                });
            }
            OutputItem::Reasoning { id, summary } => {
                processed.items.push(RunItem::Reasoning {
                    agent: agent_name.clone(),
                    id: id.clone(),
                    summary: summary.clone(),
                });
            }
            OutputItem::Unknown { kind, .. } => {
                debug!(agent = %agent_name, kind = %kind, "passing through unknown output item");
                processed.items.push(RunItem::Raw {
                    agent: agent_name.clone(),
                    item: item.clone(),
                });
            }
        }
    }

    Ok(processed)
}

#[allow(clippy::too_many_arguments)]
async fn invoke_function_tool(
    agent: &Arc<Agent>,
    hooks: &Hooks,
    ctx: &RunContext,
    parent: &Span,
    include_data: bool,
    tool: &FunctionTool,
    call_id: &str,
    arguments: &str,
) -> Result<FunctionToolResult, AgentError> {
    let mut span = parent
        .child(SpanData::Function {
            name: tool.name().to_string(),
            input: include_data.then(|| arguments.to_string()),
            output: None,
        })
        .started();

    hooks.tool_start(ctx, agent, tool.name()).await;
    let tool_ctx = ToolContext {
        context: ctx.clone(),
        tool_name: tool.name().to_string(),
        call_id: call_id.to_string(),
    };
    let output = match tool.invoke(tool_ctx, arguments).await {
        Ok(output) => output,
        Err(err) => {
            error!(tool = %tool.name(), error = %err, "tool failed");
            span.set_error(SpanError::new(format!("Error running tool {}", tool.name())));
            return Err(err.into());
        }
    };
    hooks.tool_end(ctx, agent, tool.name(), &output).await;

    if include_data {
        if let Some(SpanData::Function { output: recorded, .. }) = span.data_mut() {
            *recorded = Some(output.to_model_string());
        }
    }

    Ok(FunctionToolResult {
        tool_name: tool.name().to_string(),
        call_id: call_id.to_string(),
        output,
    })
}

async fn run_computer_action(
    agent: &Arc<Agent>,
    hooks: &Hooks,
    ctx: &RunContext,
    computer: &ComputerTool,
    call_id: &str,
    action: &Value,
) -> Result<RunItem, AgentError> {
    hooks.tool_start(ctx, agent, ComputerTool::NAME).await;
    let image_url = computer.execute(action).await?;
    let output = ToolOutput::Text(image_url.clone());
    hooks.tool_end(ctx, agent, ComputerTool::NAME, &output).await;

    Ok(RunItem::ToolCallOutput {
        agent: agent.name().to_string(),
        call_id: call_id.to_string(),
        output,
        raw: InputItem::ComputerCallOutput {
            call_id: call_id.to_string(),
            image_url,
        },
    })
}

fn tool_output_item(agent: &Agent, call_id: &str, output: ToolOutput) -> RunItem {
    let raw = InputItem::function_output(call_id, output.to_model_string());
    RunItem::ToolCallOutput {
        agent: agent.name().to_string(),
        call_id: call_id.to_string(),
        output,
        raw,
    }
}

async fn run_input_guardrails(
    agent: &Arc<Agent>,
    guardrails: &[InputGuardrail],
    ctx: &RunContext,
    input: &RunInput,
    trace: &Trace,
) -> Result<Vec<InputGuardrailResult>, AgentError> {
    let checks = guardrails.iter().map(|guardrail| {
        let mut span = trace
            .span(SpanData::Guardrail {
                name: guardrail.name().to_string(),
                triggered: false,
            })
            .started();
        async move {
            let result = guardrail
                .run(ctx.clone(), Arc::clone(agent), input.clone())
                .await?;
            if let Some(SpanData::Guardrail { triggered, .. }) = span.data_mut() {
                *triggered = result.output.tripwire_triggered;
            }
            Ok::<_, AgentError>(result)
        }
    });

    let results = join_all(checks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(tripped) = results.iter().find(|r| r.output.tripwire_triggered) {
        warn!(guardrail = %tripped.guardrail, "input guardrail tripwire triggered");
        return Err(AgentError::InputGuardrailTripwire(Box::new(tripped.clone())));
    }
    Ok(results)
}

async fn run_output_guardrails(
    agent: &Arc<Agent>,
    guardrails: &[OutputGuardrail],
    ctx: &RunContext,
    output: &Value,
    trace: &Trace,
) -> Result<Vec<OutputGuardrailResult>, AgentError> {
    let checks = guardrails.iter().map(|guardrail| {
        let mut span = trace
            .span(SpanData::Guardrail {
                name: guardrail.name().to_string(),
                triggered: false,
            })
            .started();
        async move {
            let result = guardrail
                .run(ctx.clone(), Arc::clone(agent), output.clone())
                .await?;
            if let Some(SpanData::Guardrail { triggered, .. }) = span.data_mut() {
                *triggered = result.output.tripwire_triggered;
            }
            Ok::<_, AgentError>(result)
        }
    });

    let results = join_all(checks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(tripped) = results.iter().find(|r| r.output.tripwire_triggered) {
        warn!(guardrail = %tripped.guardrail, "output guardrail tripwire triggered");
        return Err(AgentError::OutputGuardrailTripwire(Box::new(tripped.clone())));
    }
    Ok(results)
}

fn resolve_model(agent: &Agent, config: &RunConfig) -> Result<Arc<dyn Model>, AgentError> {
    let model_ref = config.model.as_ref().or(agent.model());
    if let Some(ModelRef::Instance(model)) = model_ref {
        return Ok(Arc::clone(model));
    }

    let name = model_ref.and_then(ModelRef::name);
    let model = match &config.model_provider {
        Some(provider) => provider.get_model(name)?,
        None => MultiProvider::from_env().get_model(name)?,
    };
    Ok(model)
}

/// Best effort: a failing store is logged and the run continues.
async fn save_to_session(session: Option<&Arc<dyn Session>>, items: Vec<InputItem>) {
    let Some(session) = session else {
        return;
    };
    if items.is_empty() {
        return;
    }
    if let Err(err) = session.add_items(items).await {
        warn!(session = %session.session_id(), error = %err, "failed to persist session items");
    }
}

fn agent_span_data(agent: &Agent, tools: &[Tool], handoffs: &[Handoff]) -> SpanData {
    SpanData::Agent {
        name: agent.name().to_string(),
        handoffs: handoffs.iter().map(|h| h.agent_name().to_string()).collect(),
        tools: tools.iter().map(|t| t.name().to_string()).collect(),
        output_type: Some(agent.output_type().name()),
    }
}

fn run_loop(
    starting_agent: Arc<Agent>,
    input: RunInput,
    config: RunConfig,
    streaming: bool,
) -> impl Stream<Item = Result<RunEvent, AgentError>> + Send + 'static {
    try_stream! {
        // Caller values are shared; usage counts this run only.
        let ctx = config.context.fork();
        let tracing_enabled = !config.tracing_disabled && config.trace_provider.is_some();
        let model_tracing = match (tracing_enabled, config.trace_include_sensitive_data) {
            (false, _) => ModelTracing::Disabled,
            (true, true) => ModelTracing::Enabled,
            (true, false) => ModelTracing::EnabledWithoutData,
        };
        let include_data = model_tracing.include_data();

        let mut trace = match (&config.trace_provider, tracing_enabled) {
            (Some(provider), true) => provider.create_trace(
                config.workflow_name.clone(),
                config.trace_id.clone(),
                config.group_id.clone(),
                config.trace_metadata.clone(),
            ),
            _ => Trace::noop(),
        };
        trace.start();

        let mut input_history = match &config.session {
            Some(session) => session.get_items(None).await?,
            None => Vec::new(),
        };
        input_history.extend(input.to_items());

        let mut current_agent = starting_agent;
        let mut generated_items: Vec<RunItem> = Vec::new();
        let mut raw_responses: Vec<ModelResponse> = Vec::new();
        let mut input_guardrail_results = Vec::new();
        let mut tool_users: HashSet<String> = HashSet::new();
        let mut agent_span = Span::noop();
        let mut agent_started = false;
        let mut turn: u32 = 0;

        info!(agent = %current_agent.name(), max_turns = config.max_turns, "starting run");

        loop {
            let hooks = Hooks::new(config.hooks.as_ref(), &current_agent);
            let tools = current_agent.enabled_tools(&ctx).await;
            let handoffs = current_agent.enabled_handoffs(&ctx).await;

            if !agent_started {
                agent_span.finish();
                agent_span = trace
                    .span(agent_span_data(&current_agent, &tools, &handoffs))
                    .started();
                hooks.agent_start(&ctx, &current_agent).await;
                agent_started = true;
            }

            turn += 1;
            if turn > config.max_turns {
                warn!(agent = %current_agent.name(), max_turns = config.max_turns, "max turns exceeded");
                agent_span.set_error(SpanError::new("Max turns exceeded"));
                Err::<(), AgentError>(AgentError::MaxTurnsExceeded {
                    max_turns: config.max_turns,
                })?;
            }
            debug!(agent = %current_agent.name(), turn, "running turn");

            if turn == 1 {
                let guardrails = config
                    .input_guardrails
                    .iter()
                    .chain(current_agent.input_guardrails())
                    .cloned()
                    .collect::<Vec<_>>();
                let checked = run_input_guardrails(&current_agent, &guardrails, &ctx, &input, &trace).await;
                input_guardrail_results = match checked {
                    Ok(results) => results,
                    Err(err) => {
                        agent_span.set_error(SpanError::new(err.to_string()));
                        Err::<Vec<InputGuardrailResult>, AgentError>(err)?
                    }
                };
                save_to_session(config.session.as_ref(), input.to_items()).await;
            }

            let system_prompt = current_agent.system_prompt(&ctx).await?;
            let output_schema = current_agent.output_type().spec()?;
            let mut settings = current_agent
                .model_settings()
                .resolve(config.model_settings.as_ref());
            if current_agent.resets_tool_choice()
                && tool_users.contains(current_agent.name())
                && matches!(settings.tool_choice, Some(ToolChoice::Required | ToolChoice::Named(_)))
            {
                settings.tool_choice = Some(ToolChoice::Auto);
            }

            let model_input = input_history
                .iter()
                .cloned()
                .chain(generated_items.iter().map(RunItem::to_input_item))
                .collect::<Vec<_>>();
            let model_name = config
                .model
                .as_ref()
                .or(current_agent.model())
                .and_then(ModelRef::name)
                .map(str::to_string);
            let model = resolve_model(&current_agent, &config)?;

            let request = ModelRequest {
                system_instructions: system_prompt.clone(),
                input: model_input,
                model_settings: settings,
                tools: tools.iter().map(Tool::definition).collect(),
                output_schema,
                handoffs: handoffs.iter().map(Handoff::definition).collect(),
                tracing: model_tracing,
                previous_response_id: config.previous_response_id.clone(),
                prompt: current_agent.prompt().cloned(),
            };

            hooks
                .llm_start(&ctx, &current_agent, system_prompt.as_deref(), &request.input)
                .await;
            let mut generation_span = agent_span
                .child(SpanData::Generation {
                    model: model_name,
                    input: include_data.then(|| json!(request.input)),
                    output: None,
                    usage: None,
                })
                .started();

            let fetched: Result<ModelResponse, ProviderError> = if streaming {
                match model.stream_response(&request).await {
                    Ok(mut events) => {
                        let mut outcome = Err(ProviderError::Response(
                            "model stream ended without a completed response".to_string(),
                        ));
                        while let Some(event) = events.next().await {
                            match event {
                                Ok(event) => {
                                    if let ModelStreamEvent::Completed(response) = &event {
                                        outcome = Ok(response.clone());
                                    }
                                    yield RunEvent::RawModel(event);
                                }
                                Err(err) => {
                                    outcome = Err(err);
                                    break;
                                }
                            }
                        }
                        outcome
                    }
                    Err(err) => Err(err),
                }
            } else {
                model.get_response(&request).await
            };

            let response = match fetched {
                Ok(response) => response,
                Err(err) => {
                    error!(agent = %current_agent.name(), error = %err, "model call failed");
                    generation_span.set_error(SpanError::new(err.to_string()));
                    Err::<ModelResponse, AgentError>(err.into())?
                }
            };

            if let Some(SpanData::Generation { output, usage, .. }) = generation_span.data_mut() {
                if include_data {
                    *output = Some(json!(response.to_input_items()));
                }
                *usage = Some(response.usage);
            }
            generation_span.finish();

            ctx.add_usage(&response.usage);
            hooks.llm_end(&ctx, &current_agent, &response).await;
            raw_responses.push(response.clone());

            let processed = process_response(&current_agent, &response, &tools, &handoffs)?;
            for item in &processed.items {
                yield RunEvent::Item(item.clone());
            }
            let potential_final_text = last_message_text(&processed.items);
            let has_local_work = processed.has_local_work();
            let mut turn_items = processed.items;

            if !processed.functions.is_empty() || !processed.computer_actions.is_empty() {
                tool_users.insert(current_agent.name().to_string());
            }

            let function_calls = processed.functions.iter().map(|(tool, call_id, arguments)| {
                invoke_function_tool(
                    &current_agent,
                    &hooks,
                    &ctx,
                    &agent_span,
                    include_data,
                    tool,
                    call_id,
                    arguments,
                )
            });
            let computer_calls = processed.computer_actions.iter().map(|(computer, call_id, action)| {
                run_computer_action(&current_agent, &hooks, &ctx, computer, call_id, action)
            });
            let (function_results, computer_results) = join(join_all(function_calls), join_all(computer_calls))
                .instrument(info_span!("tools", agent = %current_agent.name(), turn))
                .await;
            let function_results = function_results.into_iter().collect::<Result<Vec<_>, _>>()?;
            let computer_items = computer_results.into_iter().collect::<Result<Vec<_>, _>>()?;

            let mut output_items = function_results
                .iter()
                .map(|result| tool_output_item(&current_agent, &result.call_id, result.output.clone()))
                .collect::<Vec<_>>();
            output_items.extend(computer_items);

            if let Some(((handoff, call_id, arguments), extra)) = processed.handoffs.split_first() {
                for (_, ignored_call_id, _) in extra {
                    output_items.push(tool_output_item(
                        &current_agent,
                        ignored_call_id,
                        ToolOutput::Text(MULTIPLE_HANDOFFS_MESSAGE.to_string()),
                    ));
                }

                let mut handoff_span = trace
                    .span(SpanData::Handoff {
                        from_agent: Some(current_agent.name().to_string()),
                        to_agent: Some(handoff.agent_name().to_string()),
                    })
                    .started();
                if !extra.is_empty() {
                    handoff_span.set_error(SpanError::new("Multiple handoffs requested"));
                }

                let next_agent = match handoff.invoke(ctx.clone(), arguments).await {
                    Ok(agent) => agent,
                    Err(err) => {
                        handoff_span.set_error(SpanError::new(err.to_string()));
                        Err::<Arc<Agent>, AgentError>(err)?
                    }
                };
                handoff_span.finish();
                info!(from = %current_agent.name(), to = %next_agent.name(), "handoff");

                hooks.handoff(&ctx, &current_agent, &next_agent).await;

                output_items.push(RunItem::HandoffOutput {
                    source: current_agent.name().to_string(),
                    target: next_agent.name().to_string(),
                    call_id: call_id.clone(),
                    output: json!({ "assistant": next_agent.name() }).to_string(),
                });
                for item in &output_items {
                    yield RunEvent::Item(item.clone());
                }
                turn_items.extend(output_items);
                save_to_session(
                    config.session.as_ref(),
                    turn_items.iter().map(RunItem::to_input_item).collect(),
                )
                .await;

                let filter = handoff
                    .get_input_filter()
                    .or(config.handoff_input_filter.as_ref());
                if let Some(filter) = filter {
                    debug!(to = %next_agent.name(), "applying handoff input filter");
                    let filtered = filter(HandoffInputData {
                        input_history: std::mem::take(&mut input_history),
                        pre_handoff_items: std::mem::take(&mut generated_items),
                        new_items: turn_items,
                    });
                    input_history = filtered.input_history;
                    generated_items = filtered.pre_handoff_items;
                    generated_items.extend(filtered.new_items);
                } else {
                    generated_items.extend(turn_items);
                }

                agent_span.finish();
                current_agent = next_agent;
                agent_started = false;
                yield RunEvent::AgentUpdated {
                    agent: Arc::clone(&current_agent),
                };
                continue;
            }

            for item in &output_items {
                yield RunEvent::Item(item.clone());
            }
            turn_items.extend(output_items);
            save_to_session(
                config.session.as_ref(),
                turn_items.iter().map(RunItem::to_input_item).collect(),
            )
            .await;
            generated_items.extend(turn_items);

            let final_output = match current_agent
                .tool_use_behavior()
                .decide(&ctx, &function_results)
                .await?
            {
                ToolsDecision::Final(value) => Some(value),
                ToolsDecision::RunAgain if has_local_work => None,
                ToolsDecision::RunAgain => {
                    let output_type = current_agent.output_type();
                    if output_type.is_plain_text() {
                        Some(Value::String(potential_final_text.unwrap_or_default()))
                    } else if let Some(text) = potential_final_text {
                        Some(output_type.validate_json(&text)?)
                    } else {
                        None
                    }
                }
            };

            let Some(final_output) = final_output else {
                continue;
            };

            let guardrails = config
                .output_guardrails
                .iter()
                .chain(current_agent.output_guardrails())
                .cloned()
                .collect::<Vec<_>>();
            let checked = run_output_guardrails(&current_agent, &guardrails, &ctx, &final_output, &trace).await;
            let output_guardrail_results = match checked {
                Ok(results) => results,
                Err(err) => {
                    agent_span.set_error(SpanError::new(err.to_string()));
                    Err::<Vec<OutputGuardrailResult>, AgentError>(err)?
                }
            };

            hooks.agent_end(&ctx, &current_agent, &final_output).await;
            agent_span.finish();
            trace.finish();
            info!(agent = %current_agent.name(), turns = turn, "run complete");

            yield RunEvent::Completed(Box::new(RunResult {
                input: input.clone(),
                new_items: generated_items.clone(),
                raw_responses: raw_responses.clone(),
                final_output,
                input_guardrail_results: input_guardrail_results.clone(),
                output_guardrail_results,
                last_agent: Arc::clone(&current_agent),
                context: ctx.clone(),
                trace_id: trace.trace_id().map(str::to_string),
            }));
            return;
        }
    }
}

#[cfg(test)]
mod tests;
