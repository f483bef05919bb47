//! Payload validation against a [`PayloadSchema`].
//!
//! Validation is strict: required fields must be present with the declared
//! type, enumerated fields must hold an allowed value, numeric fields must be
//! within bounds, and keys the schema does not declare are rejected.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::schema::{FieldDefinition, FieldType, FieldValue, PayloadSchema};

/// Field name reported when the payload itself is not an object.
pub const PAYLOAD_FIELD: &str = "payload";

/// A payload that violates its schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}': {reason}")]
pub struct ValidationError {
    /// Offending field
    pub field: String,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Payload whose every field was checked and typed against a schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ValidatedPayload(BTreeMap<String, FieldValue>);

impl ValidatedPayload {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert back to a JSON object.
    pub fn to_json_map(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, FieldValue> {
        self.0
    }
}

/// Validate a JSON object against `schema`.
///
/// Schema fields are checked in declaration order, then undeclared keys in
/// payload order, so the same input always reports the same field.
pub fn validate(
    payload: &Map<String, Value>,
    schema: &PayloadSchema,
) -> Result<ValidatedPayload, ValidationError> {
    let mut validated = BTreeMap::new();

    for def in schema.fields() {
        match payload.get(&def.name) {
            None | Some(Value::Null) => {
                if def.required {
                    return Err(ValidationError::new(&def.name, "required field is missing"));
                }
            }
            Some(value) => {
                let typed = validate_field(def, value)?;
                validated.insert(def.name.clone(), typed);
            }
        }
    }

    for key in payload.keys() {
        if schema.field(key).is_none() {
            return Err(ValidationError::new(key, "field is not defined in the schema"));
        }
    }

    Ok(ValidatedPayload(validated))
}

/// Validate any JSON value, requiring it to be an object first.
pub fn validate_value(
    payload: &Value,
    schema: &PayloadSchema,
) -> Result<ValidatedPayload, ValidationError> {
    match payload {
        Value::Object(map) => validate(map, schema),
        other => Err(ValidationError::new(
            PAYLOAD_FIELD,
            format!("expected an object, got {}", json_type_name(other)),
        )),
    }
}

/// Check one present value against its definition.
fn validate_field(def: &FieldDefinition, value: &Value) -> Result<FieldValue, ValidationError> {
    let typed = to_field_value(def.data_type, value).ok_or_else(|| {
        ValidationError::new(
            &def.name,
            format!("expected {}, got {}", def.data_type, json_type_name(value)),
        )
    })?;

    if def.is_enumerated() && !def.allowed_values.iter().any(|allowed| values_match(allowed, value)) {
        return Err(ValidationError::new(
            &def.name,
            format!(
                "value {} is not one of the allowed values [{}]",
                value,
                def.allowed_values
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }

    if let Some(n) = typed.as_f64() {
        if let Some(min) = def.min {
            if n < min {
                return Err(ValidationError::new(
                    &def.name,
                    format!("value {} is below the minimum {}", value, min),
                ));
            }
        }
        if let Some(max) = def.max {
            if n > max {
                return Err(ValidationError::new(
                    &def.name,
                    format!("value {} is above the maximum {}", value, max),
                ));
            }
        }
    }

    Ok(typed)
}

fn to_field_value(data_type: FieldType, value: &Value) -> Option<FieldValue> {
    match (data_type, value) {
        (FieldType::Integer, Value::Number(n)) => n.as_i64().map(FieldValue::Integer),
        (FieldType::Float, Value::Number(n)) => n.as_f64().map(FieldValue::Float),
        (FieldType::String, Value::String(s)) => Some(FieldValue::String(s.clone())),
        (FieldType::Boolean, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
        (FieldType::Array, Value::Array(a)) => Some(FieldValue::Array(a.clone())),
        (FieldType::Object, Value::Object(o)) => Some(FieldValue::Object(o.clone())),
        _ => None,
    }
}

/// Equality with numbers compared by value, so `1` matches `1.0`.
pub(crate) fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
