//! Transfers of control between agents, exposed to the model as tools.

pub mod filters;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};

use futures_util::future::BoxFuture;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::agent::Agent;
use crate::context::{Enabled, RunContext};
use crate::error::{AgentError, SchemaError};
use crate::items::{InputItem, RunItem};
use crate::schema::{check_instance, ensure_strict_json_schema};

/// History handed to an input filter when control moves to a new agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandoffInputData {
    /// Input the run started with, including session history.
    pub input_history: Vec<InputItem>,
    /// Items generated before the turn that triggered the handoff.
    pub pre_handoff_items: Vec<RunItem>,
    /// Items generated in the handoff turn, including the handoff call and
    /// its output.
    pub new_items: Vec<RunItem>,
}

impl HandoffInputData {
    /// Model input for the next agent.
    pub fn to_input_items(&self) -> Vec<InputItem> {
        self.input_history
            .iter()
            .cloned()
            .chain(
                self.pre_handoff_items
                    .iter()
                    .chain(&self.new_items)
                    .map(RunItem::to_input_item),
            )
            .collect()
    }
}

pub type HandoffInputFilter = Arc<dyn Fn(HandoffInputData) -> HandoffInputData + Send + Sync>;

type OnHandoffFn = dyn Fn(RunContext, Value) -> BoxFuture<'static, Result<(), AgentError>> + Send + Sync;

/// Handoff description handed to a model backend.
#[derive(Clone, Debug, PartialEq)]
pub struct HandoffDefinition {
    pub tool_name: String,
    pub tool_description: String,
    pub input_json_schema: Value,
    pub agent_name: String,
    pub strict: bool,
}

#[derive(Clone)]
enum HandoffTarget {
    Agent(Arc<Agent>),
    Registry {
        agents: Weak<RwLock<HashMap<String, Arc<Agent>>>>,
        name: String,
    },
}

impl HandoffTarget {
    fn name(&self) -> &str {
        match self {
            Self::Agent(agent) => agent.name(),
            Self::Registry { name, .. } => name,
        }
    }

    fn resolve(&self) -> Result<Arc<Agent>, AgentError> {
        match self {
            Self::Agent(agent) => Ok(Arc::clone(agent)),
            Self::Registry { agents, name } => {
                let agents = agents.upgrade().ok_or_else(|| {
                    AgentError::Config(format!("agent registry for `{name}` was dropped"))
                })?;
                let agents = agents.read().unwrap_or_else(PoisonError::into_inner);
                agents
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AgentError::Config(format!("agent `{name}` is not registered")))
            }
        }
    }
}

#[derive(Clone)]
pub struct Handoff {
    tool_name: String,
    tool_description: String,
    input_json_schema: Value,
    strict: bool,
    takes_input: bool,
    target: HandoffTarget,
    on_handoff: Option<Arc<OnHandoffFn>>,
    input_filter: Option<HandoffInputFilter>,
    enabled: Enabled,
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("tool_name", &self.tool_name)
            .field("agent_name", &self.target.name())
            .field("takes_input", &self.takes_input)
            .field("has_input_filter", &self.input_filter.is_some())
            .finish()
    }
}

static NON_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]").expect("valid regex"));

/// `transfer_to_<name>` with every non-alphanumeric character replaced by
/// `_`, lowercased.
pub fn default_tool_name(agent_name: &str) -> String {
    format!(
        "transfer_to_{}",
        NON_IDENT.replace_all(agent_name, "_").to_lowercase()
    )
}

pub fn default_tool_description(agent_name: &str, handoff_description: Option<&str>) -> String {
    format!(
        "Handoff to the {agent_name} agent to handle the request. {}",
        handoff_description.unwrap_or_default()
    )
    .trim_end()
    .to_string()
}

fn empty_input_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {},
        "required": [],
    })
}

impl Handoff {
    pub fn to(agent: impl Into<Arc<Agent>>) -> Self {
        let agent = agent.into();
        Self {
            tool_name: default_tool_name(agent.name()),
            tool_description: default_tool_description(
                agent.name(),
                agent.handoff_description(),
            ),
            input_json_schema: empty_input_schema(),
            strict: true,
            takes_input: false,
            target: HandoffTarget::Agent(agent),
            on_handoff: None,
            input_filter: None,
            enabled: Enabled::default(),
        }
    }

    /// Runs `callback` before control transfers.
    pub fn on_handoff<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        self.takes_input = false;
        self.input_json_schema = empty_input_schema();
        self.on_handoff = Some(Arc::new(move |ctx, _args| Box::pin(callback(ctx))));
        self
    }

    /// Requires the model to send arguments shaped like `T`, which are
    /// validated and handed to `callback` before control transfers.
    pub fn with_input<T, F, Fut>(mut self, callback: F) -> Result<Self, SchemaError>
    where
        T: JsonSchema + DeserializeOwned + Send + 'static,
        F: Fn(RunContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        let mut schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|err| SchemaError::Generation(err.to_string()))?;
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        self.input_json_schema = ensure_strict_json_schema(schema)?;
        self.takes_input = true;

        let callback = Arc::new(callback);
        self.on_handoff = Some(Arc::new(move |ctx, args| {
            let callback = Arc::clone(&callback);
            Box::pin(async move {
                let input = serde_json::from_value::<T>(args).map_err(|err| {
                    AgentError::model_behavior(format!("invalid handoff input: {err}"))
                })?;
                callback(ctx, input).await
            })
        }));
        Ok(self)
    }

    pub fn tool_name_override(mut self, name: impl Into<String>) -> Self {
        self.tool_name = name.into();
        self
    }

    pub fn tool_description_override(mut self, description: impl Into<String>) -> Self {
        self.tool_description = description.into();
        self
    }

    pub fn input_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(HandoffInputData) -> HandoffInputData + Send + Sync + 'static,
    {
        self.input_filter = Some(Arc::new(filter));
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Enabled>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn tool_description(&self) -> &str {
        &self.tool_description
    }

    pub fn input_json_schema(&self) -> &Value {
        &self.input_json_schema
    }

    pub fn agent_name(&self) -> &str {
        self.target.name()
    }

    /// The receiving agent, without running any callback.
    pub fn target(&self) -> Result<Arc<Agent>, AgentError> {
        self.target.resolve()
    }

    pub fn get_input_filter(&self) -> Option<&HandoffInputFilter> {
        self.input_filter.as_ref()
    }

    pub fn is_enabled(&self) -> &Enabled {
        &self.enabled
    }

    pub fn definition(&self) -> HandoffDefinition {
        HandoffDefinition {
            tool_name: self.tool_name.clone(),
            tool_description: self.tool_description.clone(),
            input_json_schema: self.input_json_schema.clone(),
            agent_name: self.agent_name().to_string(),
            strict: self.strict,
        }
    }

    /// Validates the model's arguments, fires the callback and returns the
    /// agent that takes over.
    pub async fn invoke(
        &self,
        ctx: RunContext,
        raw_arguments: &str,
    ) -> Result<Arc<Agent>, AgentError> {
        if let Some(callback) = &self.on_handoff {
            let args = if self.takes_input {
                self.parse_input(raw_arguments)?
            } else {
                Value::Null
            };
            callback(ctx, args).await?;
        }
        self.target.resolve()
    }

    fn parse_input(&self, raw_arguments: &str) -> Result<Value, AgentError> {
        if raw_arguments.trim().is_empty() {
            return Err(AgentError::model_behavior(format!(
                "handoff {} expects input but none was given",
                self.tool_name
            )));
        }
        let args = serde_json::from_str::<Value>(raw_arguments).map_err(|err| {
            AgentError::model_behavior(format!(
                "invalid JSON in handoff {} arguments: {err}",
                self.tool_name
            ))
        })?;
        check_instance(&self.input_json_schema, &args).map_err(|message| {
            AgentError::model_behavior(format!(
                "handoff {} arguments do not match schema: {message}",
                self.tool_name
            ))
        })?;
        Ok(args)
    }
}

impl From<Arc<Agent>> for Handoff {
    fn from(agent: Arc<Agent>) -> Self {
        Self::to(agent)
    }
}

impl From<Agent> for Handoff {
    fn from(agent: Agent) -> Self {
        Self::to(agent)
    }
}

/// Agents addressed by name, so handoff graphs may contain cycles.
///
/// Handoffs created with [`AgentRegistry::handoff`] look their target up when
/// invoked. The registry must outlive the runs that use it.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<Agent>>>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AgentRegistry")
            .field("agents", &agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent`, replacing any agent with the same name.
    pub fn register(&self, agent: impl Into<Arc<Agent>>) -> Arc<Agent> {
        let agent = agent.into();
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.name().to_string(), Arc::clone(&agent));
        agent
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// A handoff to the agent registered as `name`, resolved on invocation.
    pub fn handoff(&self, name: impl Into<String>) -> Handoff {
        let name = name.into();
        let description = self.get(&name).and_then(|agent| {
            agent.handoff_description().map(str::to_string)
        });
        Handoff {
            tool_name: default_tool_name(&name),
            tool_description: default_tool_description(&name, description.as_deref()),
            input_json_schema: empty_input_schema(),
            strict: true,
            takes_input: false,
            target: HandoffTarget::Registry {
                agents: Arc::downgrade(&self.agents),
                name,
            },
            on_handoff: None,
            input_filter: None,
            enabled: Enabled::default(),
        }
    }
}
