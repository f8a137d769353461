pub mod computer;
pub mod docstring;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::warn;

use crate::context::{Enabled, RunContext};
use crate::error::{SchemaError, ToolError};
use crate::schema::{check_instance, ensure_strict_json_schema, validate_parameters_schema};

pub use computer::{Computer, ComputerAction, ComputerEnvironment, ComputerTool};
pub use docstring::{DocstringStyle, ParsedDocstring, parse_docstring};

/// What a tool hands back to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn to_model_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Json(value) => value.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Json(value) => value.clone(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ToolOutput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Per-invocation data handed to a tool handler.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub context: RunContext,
    pub tool_name: String,
    pub call_id: String,
}

type FailureFn = dyn Fn(&ToolError) -> String + Send + Sync;

/// What happens when a tool invocation fails.
#[derive(Clone, Default)]
pub enum FailureHandling {
    /// Report a short error message back to the model.
    #[default]
    Default,
    /// Report the caller-formatted message back to the model.
    Custom(Arc<FailureFn>),
    /// Propagate the error and end the run.
    Raise,
}

impl FailureHandling {
    pub fn custom<F>(format: F) -> Self
    where
        F: Fn(&ToolError) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(format))
    }
}

impl std::fmt::Debug for FailureHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Raise => f.write_str("Raise"),
        }
    }
}

pub fn default_tool_error_message(err: &ToolError) -> String {
    format!("An error occurred while running the tool. Please try again. Error: {err}")
}

/// Tool description handed to a model backend.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolDefinition {
    Function {
        name: String,
        description: String,
        parameters: Value,
        strict: bool,
    },
    Hosted {
        kind: String,
        config: Value,
    },
    Computer {
        environment: ComputerEnvironment,
        display_width: u32,
        display_height: u32,
    },
}

impl ToolDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::Function { name, .. } => name,
            Self::Hosted { kind, .. } => kind,
            Self::Computer { .. } => ComputerTool::NAME,
        }
    }
}

type ToolHandler =
    dyn Fn(ToolContext, Value) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync;

/// A tool backed by caller code.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    raw_schema: Value,
    params_schema: Value,
    strict: bool,
    handler: Arc<ToolHandler>,
    failure: FailureHandling,
    enabled: Enabled,
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params_schema", &self.params_schema)
            .field("strict", &self.strict)
            .field("failure", &self.failure)
            .finish()
    }
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let raw_schema = json!({
            "type": "object",
            "properties": {},
            "required": [],
            "additionalProperties": false,
        });
        Self {
            name: name.into(),
            description: description.into(),
            params_schema: raw_schema.clone(),
            raw_schema,
            strict: true,
            handler: Arc::new(|_ctx, _args| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
            failure: FailureHandling::Default,
            enabled: Enabled::default(),
        }
    }

    /// A tool whose parameter schema is derived from `A`. Arguments are
    /// deserialized into `A` before `handler` runs.
    pub fn typed<A, F, Fut, O>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Result<Self, SchemaError>
    where
        A: JsonSchema + DeserializeOwned + Send + 'static,
        F: Fn(ToolContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
        O: Into<ToolOutput>,
    {
        let mut schema = serde_json::to_value(schemars::schema_for!(A))
            .map_err(|err| SchemaError::Generation(err.to_string()))?;
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
            obj.entry("properties").or_insert_with(|| json!({}));
        }

        let handler = Arc::new(handler);
        let tool = Self::new(name, description).with_schema(schema)?;
        Ok(tool.with_handler(move |ctx: ToolContext, args: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let parsed = serde_json::from_value::<A>(args).map_err(|err| {
                    ToolError::InvalidArguments {
                        tool: ctx.tool_name.clone(),
                        message: err.to_string(),
                    }
                })?;
                handler(ctx, parsed).await
            }
        }))
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_parameters_schema(&schema)?;
        self.raw_schema = schema;
        self.rebuild_schema()?;
        Ok(self)
    }

    /// Strict mode closes every object and requires every property. Lenient
    /// mode keeps the schema as declared, so defaulted parameters may be
    /// omitted.
    pub fn strict(mut self, strict: bool) -> Result<Self, SchemaError> {
        self.strict = strict;
        self.rebuild_schema()?;
        Ok(self)
    }

    /// Backfills the tool and parameter descriptions from a docstring in
    /// Google, NumPy or Sphinx style.
    pub fn with_docstring(mut self, doc: &str) -> Result<Self, SchemaError> {
        let parsed = parse_docstring(doc);
        if self.description.trim().is_empty() {
            if let Some(description) = parsed.description.clone() {
                self.description = description;
            }
        }
        if let Some(Value::Object(properties)) = self.raw_schema.get_mut("properties") {
            for (param, description) in &parsed.params {
                if let Some(Value::Object(property)) = properties.get_mut(param) {
                    property
                        .entry("description")
                        .or_insert_with(|| Value::String(description.clone()));
                }
            }
        }
        self.rebuild_schema()?;
        Ok(self)
    }

    pub fn with_handler<F, Fut, O>(mut self, handler: F) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
        O: Into<ToolOutput>,
    {
        self.handler = Arc::new(move |ctx, args| {
            let fut = handler(ctx, args);
            Box::pin(async move { fut.await.map(Into::into) })
        });
        self
    }

    pub fn failure_handling(mut self, failure: FailureHandling) -> Self {
        self.failure = failure;
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Enabled>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.params_schema
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_enabled(&self) -> &Enabled {
        &self.enabled
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::Function {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.params_schema.clone(),
            strict: self.strict,
        }
    }

    /// Runs the tool on raw JSON arguments from the model, applying the
    /// configured failure handling.
    pub async fn invoke(
        &self,
        ctx: ToolContext,
        raw_arguments: &str,
    ) -> Result<ToolOutput, ToolError> {
        match self.invoke_unchecked(ctx, raw_arguments).await {
            Ok(output) => Ok(output),
            Err(err) => match &self.failure {
                FailureHandling::Raise => Err(err),
                FailureHandling::Default => {
                    warn!(tool = %self.name, error = %err, "tool failed, reporting to model");
                    Ok(ToolOutput::Text(default_tool_error_message(&err)))
                }
                FailureHandling::Custom(format) => {
                    warn!(tool = %self.name, error = %err, "tool failed, reporting to model");
                    Ok(ToolOutput::Text(format(&err)))
                }
            },
        }
    }

    async fn invoke_unchecked(
        &self,
        ctx: ToolContext,
        raw_arguments: &str,
    ) -> Result<ToolOutput, ToolError> {
        let args = if raw_arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(raw_arguments).map_err(|err| {
                ToolError::InvalidArguments {
                    tool: self.name.clone(),
                    message: format!("invalid JSON input: {err}"),
                }
            })?
        };

        check_instance(&self.params_schema, &args).map_err(|message| {
            ToolError::InvalidArguments {
                tool: self.name.clone(),
                message,
            }
        })?;

        (self.handler)(ctx, args).await
    }

    fn rebuild_schema(&mut self) -> Result<(), SchemaError> {
        self.params_schema = if self.strict {
            ensure_strict_json_schema(self.raw_schema.clone())?
        } else {
            self.raw_schema.clone()
        };
        Ok(())
    }
}

/// A capability executed by the model provider itself.
#[derive(Clone, Debug, PartialEq)]
pub struct HostedTool {
    kind: String,
    config: Value,
}

impl HostedTool {
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    pub fn web_search() -> Self {
        Self::new("web_search", json!({}))
    }

    pub fn file_search(vector_store_ids: Vec<String>) -> Self {
        Self::new(
            "file_search",
            json!({ "vector_store_ids": vector_store_ids }),
        )
    }

    pub fn code_interpreter() -> Self {
        Self::new("code_interpreter", json!({"container": {"type": "auto"}}))
    }

    pub fn name(&self) -> &str {
        &self.kind
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::Hosted {
            kind: self.kind.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Tool {
    Function(FunctionTool),
    Hosted(HostedTool),
    Computer(ComputerTool),
}

impl Tool {
    pub fn name(&self) -> &str {
        match self {
            Self::Function(tool) => tool.name(),
            Self::Hosted(tool) => tool.name(),
            Self::Computer(_) => ComputerTool::NAME,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        match self {
            Self::Function(tool) => tool.definition(),
            Self::Hosted(tool) => tool.definition(),
            Self::Computer(tool) => tool.definition(),
        }
    }

    pub(crate) async fn is_enabled(&self, ctx: &RunContext, agent: &crate::agent::Agent) -> bool {
        match self {
            Self::Function(tool) => tool.enabled.evaluate(ctx, agent).await,
            Self::Hosted(_) | Self::Computer(_) => true,
        }
    }
}

impl From<FunctionTool> for Tool {
    fn from(value: FunctionTool) -> Self {
        Self::Function(value)
    }
}

impl From<HostedTool> for Tool {
    fn from(value: HostedTool) -> Self {
        Self::Hosted(value)
    }
}

impl From<ComputerTool> for Tool {
    fn from(value: ComputerTool) -> Self {
        Self::Computer(value)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn ctx(name: &str) -> ToolContext {
        ToolContext {
            context: RunContext::new(),
            tool_name: name.to_string(),
            call_id: "call_1".to_string(),
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct WeatherArgs {
        city: String,
        #[serde(default)]
        units: Option<String>,
    }

    fn weather_tool() -> FunctionTool {
        FunctionTool::typed("get_weather", "", |_ctx, args: WeatherArgs| async move {
            let units = args.units.unwrap_or_else(|| "metric".to_string());
            Ok::<_, ToolError>(format!("{}: 12 ({units})", args.city))
        })
        .expect("schema")
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = FunctionTool::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(result.is_err());
    }

    #[test]
    fn typed_tools_get_strict_schema_by_default() {
        let tool = weather_tool();
        let schema = tool.json_schema();
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["city", "units"]));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn lenient_mode_keeps_defaulted_parameters_optional() {
        let tool = weather_tool().strict(false).expect("lenient");
        let schema = tool.json_schema();
        assert_eq!(schema["required"], json!(["city"]));
        assert!(schema.get("additionalProperties").is_none());
    }

    #[test]
    fn docstring_backfills_descriptions() {
        let tool = weather_tool()
            .with_docstring(
                "Fetch the weather.\n\nArgs:\n    city: The city to look up.\n    units: Unit system.\n",
            )
            .expect("docstring");

        assert_eq!(tool.description(), "Fetch the weather.");
        assert_eq!(
            tool.json_schema()["properties"]["city"]["description"],
            "The city to look up."
        );
    }

    #[tokio::test]
    async fn typed_tool_invokes_handler() {
        let output = weather_tool()
            .invoke(ctx("get_weather"), r#"{"city": "Oslo", "units": null}"#)
            .await
            .expect("tool runs");
        assert_eq!(output, ToolOutput::Text("Oslo: 12 (metric)".to_string()));
    }

    #[tokio::test]
    async fn malformed_arguments_raise_when_configured() {
        let tool = weather_tool().failure_handling(FailureHandling::Raise);

        let err = tool
            .invoke(ctx("get_weather"), "{not json")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));

        let err = tool
            .invoke(ctx("get_weather"), r#"{"units": "metric"}"#)
            .await
            .expect_err("missing city");
        assert!(err.to_string().contains("city"));
    }

    fn failing_tool() -> FunctionTool {
        FunctionTool::new("fail", "always fail")
            .with_handler(|_ctx, _args| async move {
                Err::<ToolOutput, _>(ToolError::execution("boom"))
            })
    }

    #[tokio::test]
    async fn default_failure_handling_returns_message() {
        let output = failing_tool()
            .invoke(ctx("fail"), "{}")
            .await
            .expect("failure is reported to the model");

        let ToolOutput::Text(message) = output else {
            panic!("expected text output");
        };
        assert!(message.starts_with("An error occurred while running the tool"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn custom_failure_handling_formats_message() {
        let output = failing_tool()
            .failure_handling(FailureHandling::custom(|err| format!("custom: {err}")))
            .invoke(ctx("fail"), "{}")
            .await
            .expect("failure is reported to the model");
        assert_eq!(
            output,
            ToolOutput::Text("custom: tool execution failed: boom".to_string())
        );
    }

    #[tokio::test]
    async fn raise_failure_handling_propagates() {
        let err = failing_tool()
            .failure_handling(FailureHandling::Raise)
            .invoke(ctx("fail"), "{}")
            .await
            .expect_err("must raise");
        assert!(matches!(err, ToolError::Execution(message) if message == "boom"));
    }

    #[tokio::test]
    async fn context_values_reach_the_handler() {
        let tool = FunctionTool::new("read_dep", "read number").with_handler(|ctx, _args| {
            let value = ctx.context.get::<u32>().map(|v| *v).unwrap_or(0);
            async move { Ok::<_, ToolError>(value.to_string()) }
        });

        let mut tool_ctx = ctx("read_dep");
        tool_ctx.context = RunContext::new().with(9_u32);
        let output = tool.invoke(tool_ctx, "").await.expect("tool runs");
        assert_eq!(output, ToolOutput::Text("9".to_string()));
    }
}
