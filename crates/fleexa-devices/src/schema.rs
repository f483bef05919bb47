//! Device type schema model.
//!
//! A device type is described as data: the fields its telemetry and alert
//! payloads carry and the actions it accepts. The registry owns these
//! definitions; the validation engine only reads them.
//!
//! ## Example (TOML)
//!
//! ```toml
//! [[device_types]]
//! type_id = "temp-sensor"
//! name = "Temperature Sensor"
//! category = "sensor"
//!
//! [[device_types.telemetry]]
//! name = "temperature"
//! data_type = "float"
//! required = true
//! min = -40.0
//! max = 125.0
//!
//! [[device_types.commands]]
//! action = "SET_INTERVAL"
//!
//! [[device_types.commands.parameters]]
//! name = "interval"
//! data_type = "integer"
//! required = true
//! min = 1.0
//! max = 3600.0
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    /// Any JSON number; integers are accepted.
    Float,
    String,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether `value` has this type. Integers are accepted where a float is declared.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Integer => value.as_i64().is_some(),
            Self::Float => value.is_number(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
            Self::Boolean => write!(f, "boolean"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

/// Descriptor of a single payload field or command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    /// Field name (top-level key of the payload)
    pub name: String,

    /// Declared type; no default, a missing type is a configuration error
    pub data_type: FieldType,

    /// Whether the field must be present
    #[serde(default)]
    pub required: bool,

    /// Allowed discrete values (enumerable fields); empty means unrestricted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,

    /// Minimum value (numeric types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Maximum value (numeric types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Unit of measurement
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldDefinition {
    /// Create an optional field of the given type.
    pub fn new(name: impl Into<String>, data_type: FieldType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
            allowed_values: Vec::new(),
            min: None,
            max: None,
            unit: String::new(),
            description: String::new(),
        }
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set inclusive numeric bounds.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Restrict the field to a set of values.
    pub fn with_allowed_values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_enumerated(&self) -> bool {
        !self.allowed_values.is_empty()
    }
}

/// Ordered set of field definitions describing one payload shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadSchema {
    fields: Vec<FieldDefinition>,
}

impl PayloadSchema {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Self { fields }
    }

    /// Schema that only accepts an empty object.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An action a device type accepts, with its parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDefinition {
    /// Action name as sent on the wire (e.g. "LOCK")
    pub action: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Parameter schema
    #[serde(default)]
    pub parameters: PayloadSchema,
}

impl CommandDefinition {
    /// Create an action that takes no parameters.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            description: String::new(),
            parameters: PayloadSchema::empty(),
        }
    }

    pub fn with_parameter(mut self, parameter: FieldDefinition) -> Self {
        self.parameters.fields.push(parameter);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Complete description of a device type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceTypeSchema {
    /// Device id prefix identifying this type (e.g. "temp-sensor")
    pub type_id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Informational category ("sensor", "actuator")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,

    /// Telemetry payload schema
    #[serde(default)]
    pub telemetry: PayloadSchema,

    /// Alert payload schema; `None` for types that never raise alerts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<PayloadSchema>,

    /// Accepted command actions
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

impl DeviceTypeSchema {
    /// Create a device type with an empty telemetry schema, no alert schema
    /// and no commands.
    pub fn new(type_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            telemetry: PayloadSchema::empty(),
            alerts: None,
            commands: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_telemetry_field(mut self, field: FieldDefinition) -> Self {
        self.telemetry.fields.push(field);
        self
    }

    /// Add an alert field, creating the alert schema if the type had none.
    pub fn with_alert_field(mut self, field: FieldDefinition) -> Self {
        self.alerts.get_or_insert_with(PayloadSchema::empty).fields.push(field);
        self
    }

    pub fn with_command(mut self, command: CommandDefinition) -> Self {
        self.commands.push(command);
        self
    }

    /// Look up an action definition.
    pub fn command(&self, action: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.action == action)
    }

    pub fn has_alerts(&self) -> bool {
        self.alerts.is_some()
    }
}

/// A field value that passed validation, typed by its declared field type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Convert back to JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(v) => Value::from(*v),
            Self::Float(v) => Value::from(*v),
            Self::String(v) => Value::String(v.clone()),
            Self::Boolean(v) => Value::Bool(*v),
            Self::Array(v) => Value::Array(v.clone()),
            Self::Object(v) => Value::Object(v.clone()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}
