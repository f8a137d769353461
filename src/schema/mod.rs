//! JSON Schema handling for tool parameters and structured agent output.
//!
//! Strict mode constrains a schema so that every object is closed
//! (`additionalProperties: false`) and lists all of its properties as
//! required. Providers that support constrained decoding only accept that
//! subset.

mod output;

use serde_json::{Map, Value, json};

use crate::error::SchemaError;

pub use output::{
    JsonSchemaOutput, OutputSchema, OutputSchemaSpec, OutputType, PlainTextOutput, TypedOutput,
    WRAPPER_KEY,
};

/// Rewrites `schema` into its strict form.
///
/// Object nodes become closed with every property required, `anyOf`/`allOf`
/// branches and array `items` are processed recursively, single-entry
/// `allOf` is flattened into its parent, `default: null` is dropped and a
/// `$ref` with sibling keys is inlined (sibling keys win). An object that
/// sets `additionalProperties` to anything truthy is rejected.
pub fn ensure_strict_json_schema(schema: Value) -> Result<Value, SchemaError> {
    if schema.as_object().is_some_and(Map::is_empty) {
        return Ok(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {},
            "required": [],
        }));
    }

    let root = schema.clone();
    let mut schema = schema;
    make_strict(&mut schema, "root", &root)?;
    Ok(schema)
}

fn make_strict(node: &mut Value, path: &str, root: &Value) -> Result<(), SchemaError> {
    let Some(obj) = node.as_object_mut() else {
        return Ok(());
    };

    for defs_key in ["$defs", "definitions"] {
        if let Some(Value::Object(defs)) = obj.get_mut(defs_key) {
            for (name, def) in defs.iter_mut() {
                make_strict(def, &format!("{path}/{defs_key}/{name}"), root)?;
            }
        }
    }

    if obj.get("type").and_then(Value::as_str) == Some("object") {
        match obj.get("additionalProperties") {
            None => {
                obj.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            Some(value) if is_truthy(value) => {
                return Err(SchemaError::OpenObjectInStrictMode {
                    path: path.to_string(),
                });
            }
            Some(_) => {}
        }
    }

    let mut required = None;
    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        required = Some(
            properties
                .keys()
                .cloned()
                .map(Value::String)
                .collect::<Vec<_>>(),
        );
        for (name, property) in properties.iter_mut() {
            make_strict(property, &format!("{path}/properties/{name}"), root)?;
        }
    }
    if let Some(required) = required {
        obj.insert("required".to_string(), Value::Array(required));
    }

    if let Some(items) = obj.get_mut("items") {
        if items.is_object() {
            make_strict(items, &format!("{path}/items"), root)?;
        }
    }

    if let Some(Value::Array(any_of)) = obj.get_mut("anyOf") {
        for (index, variant) in any_of.iter_mut().enumerate() {
            make_strict(variant, &format!("{path}/anyOf/{index}"), root)?;
        }
    }

    if let Some(Value::Array(all_of)) = obj.get_mut("allOf") {
        if all_of.len() == 1 {
            let mut only = all_of.remove(0);
            make_strict(&mut only, &format!("{path}/allOf/0"), root)?;
            obj.remove("allOf");
            if let Value::Object(entries) = only {
                obj.extend(entries);
            }
        } else {
            for (index, entry) in all_of.iter_mut().enumerate() {
                make_strict(entry, &format!("{path}/allOf/{index}"), root)?;
            }
        }
    }

    if obj.get("default").is_some_and(Value::is_null) {
        obj.remove("default");
    }

    let reference = obj.get("$ref").and_then(Value::as_str).map(str::to_string);
    if let Some(reference) = reference {
        if obj.len() > 1 {
            let Some(Value::Object(resolved)) = resolve_ref(root, &reference) else {
                return Err(SchemaError::UnresolvedRef { reference });
            };
            let mut merged = resolved.clone();
            for (key, value) in obj.iter() {
                merged.insert(key.clone(), value.clone());
            }
            merged.remove("$ref");
            *node = Value::Object(merged);
            return make_strict(node, path, root);
        }
    }

    Ok(())
}

fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    root.pointer(pointer)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(text) => !text.is_empty(),
        Value::Number(_) => true,
    }
}

/// Checks that a tool parameter schema has an object root.
pub(crate) fn validate_parameters_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if required_arr.iter().any(|item| !item.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

/// Validates `instance` against `schema`, returning every violation joined.
pub(crate) fn check_instance(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::Validator::new(schema).map_err(|err| err.to_string())?;
    if validator.is_valid(instance) {
        return Ok(());
    }
    let errors = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(errors.join("; "))
}
