use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::{AgentError, SchemaError};

use super::{check_instance, ensure_strict_json_schema};

/// Key under which non-object output types are wrapped.
pub const WRAPPER_KEY: &str = "response";

/// Describes the shape of an agent's final output and validates model text
/// against it.
pub trait OutputSchema: Send + Sync {
    fn is_plain_text(&self) -> bool;

    fn name(&self) -> String;

    /// Fails for plain-text output; check [`OutputSchema::is_plain_text`] first.
    fn json_schema(&self) -> Result<Value, SchemaError>;

    fn is_strict_json_schema(&self) -> bool;

    /// Parses and validates model output. Every failure is a model-behavior
    /// error.
    fn validate_json(&self, json_str: &str) -> Result<Value, AgentError>;
}

/// Schema descriptor handed to a model backend.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSchemaSpec {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTextOutput;

impl OutputSchema for PlainTextOutput {
    fn is_plain_text(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        "str".to_string()
    }

    fn json_schema(&self) -> Result<Value, SchemaError> {
        Err(SchemaError::PlainTextHasNoSchema)
    }

    fn is_strict_json_schema(&self) -> bool {
        false
    }

    fn validate_json(&self, json_str: &str) -> Result<Value, AgentError> {
        Ok(Value::String(json_str.to_string()))
    }
}

/// Output schema derived from a Rust type via `schemars`.
///
/// `String` is plain text. Types whose schema is not an object with fixed
/// properties (lists, maps, other scalars, enums) are wrapped as
/// `{"response": <schema>}`.
pub struct TypedOutput<T> {
    name: String,
    schema: Value,
    strict: bool,
    wrapped: bool,
    plain_text: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedOutput<T>
where
    T: JsonSchema + DeserializeOwned + Serialize + 'static,
{
    pub fn new(strict: bool) -> Result<Self, SchemaError> {
        let mut schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|err| SchemaError::Generation(err.to_string()))?;
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
        }

        // Only `String` itself is plain text. String enums, `char` and
        // newtypes keep their schema and go through the wrapper.
        let plain_text = TypeId::of::<T>() == TypeId::of::<String>();
        let wrapped = !plain_text && needs_wrapping(&schema);
        if wrapped {
            schema = wrap_schema(schema);
        }
        if strict && !plain_text {
            schema = ensure_strict_json_schema(schema)?;
        }

        Ok(Self {
            name: T::schema_name(),
            schema,
            strict,
            wrapped,
            plain_text,
            _marker: PhantomData,
        })
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }
}

impl<T> OutputSchema for TypedOutput<T>
where
    T: JsonSchema + DeserializeOwned + Serialize + 'static,
{
    fn is_plain_text(&self) -> bool {
        self.plain_text
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn json_schema(&self) -> Result<Value, SchemaError> {
        if self.plain_text {
            return Err(SchemaError::PlainTextHasNoSchema);
        }
        Ok(self.schema.clone())
    }

    fn is_strict_json_schema(&self) -> bool {
        self.strict
    }

    fn validate_json(&self, json_str: &str) -> Result<Value, AgentError> {
        if self.plain_text {
            return Ok(Value::String(json_str.to_string()));
        }

        let parsed = parse_json(json_str, &self.name)?;
        let payload = if self.wrapped {
            unwrap_payload(parsed, &self.name)?
        } else {
            parsed
        };

        let typed = serde_json::from_value::<T>(payload).map_err(|err| {
            AgentError::model_behavior(format!("output does not match {}: {err}", self.name))
        })?;

        serde_json::to_value(typed).map_err(|err| {
            AgentError::model_behavior(format!("failed to re-encode {}: {err}", self.name))
        })
    }
}

/// Output schema given as a raw JSON Schema document, validated with
/// `jsonschema`.
pub struct JsonSchemaOutput {
    name: String,
    schema: Value,
    strict: bool,
}

impl JsonSchemaOutput {
    pub fn new(name: impl Into<String>, schema: Value, strict: bool) -> Result<Self, SchemaError> {
        let schema = if strict {
            ensure_strict_json_schema(schema)?
        } else {
            schema
        };
        if !schema.is_object() {
            return Err(SchemaError::SchemaNotObject);
        }
        Ok(Self {
            name: name.into(),
            schema,
            strict,
        })
    }
}

impl OutputSchema for JsonSchemaOutput {
    fn is_plain_text(&self) -> bool {
        false
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn json_schema(&self) -> Result<Value, SchemaError> {
        Ok(self.schema.clone())
    }

    fn is_strict_json_schema(&self) -> bool {
        self.strict
    }

    fn validate_json(&self, json_str: &str) -> Result<Value, AgentError> {
        let parsed = parse_json(json_str, &self.name)?;
        check_instance(&self.schema, &parsed).map_err(|message| {
            AgentError::model_behavior(format!("output does not match {}: {message}", self.name))
        })?;
        Ok(parsed)
    }
}

/// The declared output type of an agent. Defaults to plain text.
#[derive(Clone)]
pub struct OutputType(Arc<dyn OutputSchema>);

impl Default for OutputType {
    fn default() -> Self {
        Self::text()
    }
}

impl std::fmt::Debug for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputType")
            .field("name", &self.0.name())
            .field("plain_text", &self.0.is_plain_text())
            .finish()
    }
}

impl OutputType {
    pub fn text() -> Self {
        Self(Arc::new(PlainTextOutput))
    }

    /// Strict output schema derived from `T`.
    pub fn of<T>() -> Result<Self, SchemaError>
    where
        T: JsonSchema + DeserializeOwned + Serialize + 'static,
    {
        Ok(Self(Arc::new(TypedOutput::<T>::new(true)?)))
    }

    pub fn of_lenient<T>() -> Result<Self, SchemaError>
    where
        T: JsonSchema + DeserializeOwned + Serialize + 'static,
    {
        Ok(Self(Arc::new(TypedOutput::<T>::new(false)?)))
    }

    pub fn json_schema_named(
        name: impl Into<String>,
        schema: Value,
        strict: bool,
    ) -> Result<Self, SchemaError> {
        Ok(Self(Arc::new(JsonSchemaOutput::new(name, schema, strict)?)))
    }

    pub fn custom(schema: impl OutputSchema + 'static) -> Self {
        Self(Arc::new(schema))
    }

    pub fn is_plain_text(&self) -> bool {
        self.0.is_plain_text()
    }

    pub fn name(&self) -> String {
        self.0.name()
    }

    pub fn json_schema(&self) -> Result<Value, SchemaError> {
        self.0.json_schema()
    }

    pub fn is_strict_json_schema(&self) -> bool {
        self.0.is_strict_json_schema()
    }

    pub fn validate_json(&self, json_str: &str) -> Result<Value, AgentError> {
        self.0.validate_json(json_str)
    }

    /// `None` for plain text.
    pub fn spec(&self) -> Result<Option<OutputSchemaSpec>, SchemaError> {
        if self.is_plain_text() {
            return Ok(None);
        }
        Ok(Some(OutputSchemaSpec {
            name: self.name(),
            schema: self.json_schema()?,
            strict: self.is_strict_json_schema(),
        }))
    }
}

fn needs_wrapping(schema: &Value) -> bool {
    let is_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let has_properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some();
    !(is_object && has_properties)
}

fn wrap_schema(mut inner: Value) -> Value {
    let mut wrapper = Map::new();
    if let Some(obj) = inner.as_object_mut() {
        obj.remove("title");
        for defs_key in ["definitions", "$defs"] {
            if let Some(defs) = obj.remove(defs_key) {
                wrapper.insert(defs_key.to_string(), defs);
            }
        }
    }
    wrapper.insert("type".to_string(), json!("object"));
    wrapper.insert("properties".to_string(), json!({ WRAPPER_KEY: inner }));
    wrapper.insert("required".to_string(), json!([WRAPPER_KEY]));
    wrapper.insert("additionalProperties".to_string(), json!(false));
    Value::Object(wrapper)
}

fn parse_json(json_str: &str, name: &str) -> Result<Value, AgentError> {
    serde_json::from_str::<Value>(json_str).map_err(|err| {
        AgentError::model_behavior(format!("invalid JSON when parsing output for {name}: {err}"))
    })
}

fn unwrap_payload(parsed: Value, name: &str) -> Result<Value, AgentError> {
    let Value::Object(mut obj) = parsed else {
        return Err(AgentError::model_behavior(format!(
            "expected a JSON object wrapping {name}"
        )));
    };
    obj.remove(WRAPPER_KEY).ok_or_else(|| {
        AgentError::model_behavior(format!(
            "could not find key {WRAPPER_KEY} in output for {name}"
        ))
    })
}
