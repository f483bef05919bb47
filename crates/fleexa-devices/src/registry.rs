//! Device Type Registry
//!
//! Maps device-type prefixes to their schemas. A [`DeviceTypeRegistry`] is an
//! immutable snapshot: it is validated once when built and never changed
//! afterwards. [`SharedRegistry`] holds the current snapshot behind an
//! atomically swapped pointer, so a reload replaces every schema at once and
//! readers never block or see a half-applied update.
//!
//! ```rust,no_run
//! use fleexa_devices::{DeviceTypeRegistry, SharedRegistry};
//!
//! let registry = SharedRegistry::new(DeviceTypeRegistry::builtin());
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.resolve_type("gas-sensor-07").unwrap(), "gas-sensor");
//!
//! // Later, on a reload signal
//! registry.reload_from_path("config/device_types.toml").unwrap();
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::builtin_types::builtin_device_types;
use crate::schema::{DeviceTypeSchema, FieldDefinition, PayloadSchema};
use crate::validation::{json_type_name, values_match};
use crate::Channel;

/// Identifier of a device type (its device-id prefix).
pub type DeviceTypeId = String;

/// A failed lookup against a loaded registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No registered prefix matches the device id, or the type id is unknown.
    #[error("Device type not found: {0}")]
    NotFound(String),

    /// The type exists but defines no schema for the channel.
    #[error("No {channel} schema defined for device type '{device_type}'")]
    NoSchemaDefined {
        device_type: String,
        channel: Channel,
    },
}

/// Errors building or loading a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A device type definition is inconsistent.
    #[error("Invalid device type definition: {0}")]
    InvalidDefinition(String),

    /// The configuration source could not be read or parsed.
    #[error("Failed to load device types: {0}")]
    Load(String),
}

/// Registry configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub device_types: Vec<DeviceTypeSchema>,
}

/// Immutable snapshot of all known device types.
#[derive(Debug, Clone, Default)]
pub struct DeviceTypeRegistry {
    types: HashMap<DeviceTypeId, DeviceTypeSchema>,
    /// Type ids ordered longest first, for longest-prefix matching
    prefixes: Vec<DeviceTypeId>,
}

impl DeviceTypeRegistry {
    /// Build a registry, validating every definition.
    pub fn new(device_types: Vec<DeviceTypeSchema>) -> Result<Self, RegistryError> {
        let mut types = HashMap::with_capacity(device_types.len());

        for def in device_types {
            validate_definition(&def)?;
            if types.contains_key(&def.type_id) {
                return Err(RegistryError::InvalidDefinition(format!(
                    "duplicate device type '{}'",
                    def.type_id
                )));
            }
            types.insert(def.type_id.clone(), def);
        }

        let mut prefixes: Vec<DeviceTypeId> = types.keys().cloned().collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Self { types, prefixes })
    }

    /// Registry with the built-in device types.
    pub fn builtin() -> Self {
        let types = builtin_device_types();
        let mut prefixes: Vec<DeviceTypeId> = types.iter().map(|t| t.type_id.clone()).collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self {
            types: types.into_iter().map(|t| (t.type_id.clone(), t)).collect(),
            prefixes,
        }
    }

    pub fn from_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        Self::new(config.device_types)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig =
            toml::from_str(content).map_err(|e| RegistryError::Load(e.to_string()))?;
        Self::from_config(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig =
            serde_json::from_str(content).map_err(|e| RegistryError::Load(e.to_string()))?;
        Self::from_config(config)
    }

    /// Load a registry file. `.json` files are read as JSON, anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Load(format!("{}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Resolve the device type of `device_id`.
    ///
    /// A device id has the shape `<type-prefix>-<suffix>`. When several
    /// registered prefixes match, the longest one wins.
    pub fn resolve_type(&self, device_id: &str) -> Result<&str, LookupError> {
        self.prefixes
            .iter()
            .find(|prefix| matches_prefix(device_id, prefix))
            .map(String::as_str)
            .ok_or_else(|| LookupError::NotFound(device_id.to_string()))
    }

    /// Get a device type definition.
    pub fn get(&self, device_type_id: &str) -> Option<&DeviceTypeSchema> {
        self.types.get(device_type_id)
    }

    /// Payload schema for a (device type, channel) pair.
    ///
    /// Commands have one schema per action (see [`Self::commands_for`]), so
    /// the command channel never has a channel-level schema.
    pub fn schema_for(
        &self,
        device_type_id: &str,
        channel: Channel,
    ) -> Result<&PayloadSchema, LookupError> {
        let def = self
            .get(device_type_id)
            .ok_or_else(|| LookupError::NotFound(device_type_id.to_string()))?;

        let schema = match channel {
            Channel::Telemetry => Some(&def.telemetry),
            Channel::Alert => def.alerts.as_ref(),
            Channel::Command => None,
        };

        schema.ok_or_else(|| LookupError::NoSchemaDefined {
            device_type: device_type_id.to_string(),
            channel,
        })
    }

    /// Accepted actions of a device type, mapped to their parameter schemas.
    pub fn commands_for(
        &self,
        device_type_id: &str,
    ) -> Result<BTreeMap<&str, &PayloadSchema>, LookupError> {
        let def = self
            .get(device_type_id)
            .ok_or_else(|| LookupError::NotFound(device_type_id.to_string()))?;

        Ok(def
            .commands
            .iter()
            .map(|c| (c.action.as_str(), &c.parameters))
            .collect())
    }

    /// Registered type ids, longest first.
    pub fn type_ids(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    /// Definitions sorted by type id.
    pub fn device_types(&self) -> Vec<&DeviceTypeSchema> {
        let mut types: Vec<_> = self.types.values().collect();
        types.sort_by(|a, b| a.type_id.cmp(&b.type_id));
        types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// `device_id` is `<prefix>-<suffix>` with a non-empty suffix of ASCII
/// alphanumerics, `-` or `_`.
fn matches_prefix(device_id: &str, prefix: &str) -> bool {
    device_id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| {
            !suffix.is_empty()
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn validate_definition(def: &DeviceTypeSchema) -> Result<(), RegistryError> {
    if def.type_id.is_empty() {
        return Err(RegistryError::InvalidDefinition(
            "type_id cannot be empty".into(),
        ));
    }

    if !def
        .type_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RegistryError::InvalidDefinition(format!(
            "type_id '{}' can only contain alphanumeric, underscore, and hyphen",
            def.type_id
        )));
    }

    if def.type_id.ends_with('-') {
        return Err(RegistryError::InvalidDefinition(format!(
            "type_id '{}' cannot end with a hyphen",
            def.type_id
        )));
    }

    validate_schema(&def.type_id, "telemetry", &def.telemetry)?;
    if let Some(alerts) = &def.alerts {
        validate_schema(&def.type_id, "alerts", alerts)?;
    }

    let mut actions = HashSet::new();
    for command in &def.commands {
        if command.action.is_empty() {
            return Err(RegistryError::InvalidDefinition(format!(
                "device type '{}': command action cannot be empty",
                def.type_id
            )));
        }
        if !actions.insert(command.action.as_str()) {
            return Err(RegistryError::InvalidDefinition(format!(
                "device type '{}': duplicate command action '{}'",
                def.type_id, command.action
            )));
        }
        let scope = format!("command '{}'", command.action);
        validate_schema(&def.type_id, &scope, &command.parameters)?;
    }

    Ok(())
}

fn validate_schema(type_id: &str, scope: &str, schema: &PayloadSchema) -> Result<(), RegistryError> {
    let mut names = HashSet::new();
    for field in schema.fields() {
        if field.name.is_empty() {
            return Err(RegistryError::InvalidDefinition(format!(
                "device type '{}', {}: field name cannot be empty",
                type_id, scope
            )));
        }
        if !names.insert(field.name.as_str()) {
            return Err(RegistryError::InvalidDefinition(format!(
                "device type '{}', {}: duplicate field '{}'",
                type_id, scope, field.name
            )));
        }
        validate_field(field).map_err(|reason| {
            RegistryError::InvalidDefinition(format!(
                "device type '{}', {}, field '{}': {}",
                type_id, scope, field.name, reason
            ))
        })?;
    }
    Ok(())
}

fn validate_field(field: &FieldDefinition) -> Result<(), String> {
    if (field.min.is_some() || field.max.is_some()) && !field.data_type.is_numeric() {
        return Err(format!("bounds are only allowed on numeric fields, not {}", field.data_type));
    }

    if let (Some(min), Some(max)) = (field.min, field.max) {
        if min > max {
            return Err(format!("min ({}) cannot be greater than max ({})", min, max));
        }
    }

    for allowed in &field.allowed_values {
        if !field.data_type.matches(allowed) {
            return Err(format!(
                "allowed value {} ({}) does not match data_type {}",
                allowed,
                json_type_name(allowed),
                field.data_type
            ));
        }
    }

    for (i, a) in field.allowed_values.iter().enumerate() {
        if field.allowed_values[..i].iter().any(|b| values_match(a, b)) {
            return Err(format!("allowed value {} is listed twice", a));
        }
    }

    Ok(())
}

/// Current registry snapshot, replaced atomically on reload.
///
/// Cloning is cheap; clones observe the same snapshot pointer.
#[derive(Clone)]
pub struct SharedRegistry {
    current: Arc<ArcSwap<DeviceTypeRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: DeviceTypeRegistry) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    /// The current snapshot. Callers keep it for the duration of one message
    /// so every lookup sees the same schemas.
    pub fn snapshot(&self) -> Arc<DeviceTypeRegistry> {
        self.current.load_full()
    }

    /// Replace the whole snapshot, returning the previous one.
    pub fn reload(&self, registry: DeviceTypeRegistry) -> Arc<DeviceTypeRegistry> {
        let count = registry.len();
        let previous = self.current.swap(Arc::new(registry));
        tracing::info!(device_types = count, "Device type registry reloaded");
        previous
    }

    /// Load a registry file and swap it in. On error the current snapshot stays.
    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let path = path.as_ref();
        match DeviceTypeRegistry::load(path) {
            Ok(registry) => {
                let count = registry.len();
                self.reload(registry);
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Registry reload failed, keeping current snapshot");
                Err(e)
            }
        }
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(DeviceTypeRegistry::builtin())
    }
}

impl std::fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("device_types", &self.current.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CommandDefinition, FieldType};
    use std::io::Write;

    fn gas_types() -> Vec<DeviceTypeSchema> {
        vec![
            DeviceTypeSchema::new("gas-sensor", "Gas Sensor")
                .with_telemetry_field(FieldDefinition::new("gas_level", FieldType::Integer)),
            DeviceTypeSchema::new("gas-sensor-pro", "Gas Sensor Pro")
                .with_telemetry_field(FieldDefinition::new("gas_level", FieldType::Integer))
                .with_alert_field(FieldDefinition::new("status", FieldType::String)),
        ]
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = DeviceTypeRegistry::new(gas_types()).unwrap();
        assert_eq!(registry.resolve_type("gas-sensor-pro-01").unwrap(), "gas-sensor-pro");
        assert_eq!(registry.resolve_type("gas-sensor-07").unwrap(), "gas-sensor");
    }

    #[test]
    fn test_longest_prefix_independent_of_registration_order() {
        let mut types = gas_types();
        types.reverse();
        let registry = DeviceTypeRegistry::new(types).unwrap();
        assert_eq!(registry.resolve_type("gas-sensor-pro-01").unwrap(), "gas-sensor-pro");
    }

    #[test]
    fn test_resolve_requires_separator_and_suffix() {
        let registry = DeviceTypeRegistry::new(gas_types()).unwrap();
        assert!(matches!(registry.resolve_type("gas-sensor"), Err(LookupError::NotFound(_))));
        assert!(registry.resolve_type("gas-sensor-").is_err());
        assert!(registry.resolve_type("gas-sensorX-01").is_err());
        assert!(registry.resolve_type("gas-sensor-0 1").is_err());
        assert!(registry.resolve_type("").is_err());
        assert!(registry.resolve_type("temp-sensor-01").is_err());
    }

    #[test]
    fn test_no_alert_schema_is_distinct_from_unknown_type() {
        let registry = DeviceTypeRegistry::new(gas_types()).unwrap();

        assert_eq!(
            registry.schema_for("gas-sensor", Channel::Alert).unwrap_err(),
            LookupError::NoSchemaDefined {
                device_type: "gas-sensor".into(),
                channel: Channel::Alert,
            }
        );
        assert!(registry.schema_for("gas-sensor-pro", Channel::Alert).is_ok());
        assert_eq!(
            registry.schema_for("smoke-detector", Channel::Alert).unwrap_err(),
            LookupError::NotFound("smoke-detector".into())
        );
    }

    #[test]
    fn test_command_channel_has_no_channel_schema() {
        let registry = DeviceTypeRegistry::builtin();
        assert!(matches!(
            registry.schema_for("door-actuator", Channel::Command),
            Err(LookupError::NoSchemaDefined { .. })
        ));
    }

    #[test]
    fn test_commands_for() {
        let registry = DeviceTypeRegistry::builtin();
        let commands = registry.commands_for("door-actuator").unwrap();
        assert!(commands.contains_key("LOCK"));
        assert!(commands.contains_key("UNLOCK"));
        assert!(registry.commands_for("nope").is_err());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let types = vec![
            DeviceTypeSchema::new("gas-sensor", "A"),
            DeviceTypeSchema::new("gas-sensor", "B"),
        ];
        assert!(matches!(
            DeviceTypeRegistry::new(types),
            Err(RegistryError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let bad_ids = ["", "gas sensor", "gas-sensor-"];
        for id in bad_ids {
            let result = DeviceTypeRegistry::new(vec![DeviceTypeSchema::new(id, "x")]);
            assert!(result.is_err(), "type id {:?} should be rejected", id);
        }

        let inverted = DeviceTypeSchema::new("temp-sensor", "x").with_telemetry_field(
            FieldDefinition::new("temperature", FieldType::Float).with_range(50.0, -50.0),
        );
        assert!(DeviceTypeRegistry::new(vec![inverted]).is_err());

        let bounded_string = DeviceTypeSchema::new("temp-sensor", "x").with_telemetry_field(
            FieldDefinition::new("unit", FieldType::String).with_range(0.0, 1.0),
        );
        assert!(DeviceTypeRegistry::new(vec![bounded_string]).is_err());

        let mistyped_enum = DeviceTypeSchema::new("temp-sensor", "x").with_telemetry_field(
            FieldDefinition::new("unit", FieldType::String).with_allowed_values([1, 2]),
        );
        assert!(DeviceTypeRegistry::new(vec![mistyped_enum]).is_err());

        let duplicate_field = DeviceTypeSchema::new("temp-sensor", "x")
            .with_telemetry_field(FieldDefinition::new("t", FieldType::Float))
            .with_telemetry_field(FieldDefinition::new("t", FieldType::Float));
        assert!(DeviceTypeRegistry::new(vec![duplicate_field]).is_err());

        let duplicate_action = DeviceTypeSchema::new("door-actuator", "x")
            .with_command(CommandDefinition::new("LOCK"))
            .with_command(CommandDefinition::new("LOCK"));
        assert!(DeviceTypeRegistry::new(vec![duplicate_action]).is_err());
    }

    #[test]
    fn test_builtin_definitions_are_valid() {
        let registry = DeviceTypeRegistry::new(builtin_device_types()).unwrap();
        assert_eq!(registry.len(), DeviceTypeRegistry::builtin().len());
    }

    #[test]
    fn test_from_toml() {
        let registry = DeviceTypeRegistry::from_toml_str(
            r#"
            [[device_types]]
            type_id = "temp-sensor"
            name = "Temperature Sensor"

            [[device_types.telemetry]]
            name = "temperature"
            data_type = "float"
            required = true
            min = -40.0
            max = 125.0

            [[device_types.commands]]
            action = "SET_INTERVAL"

            [[device_types.commands.parameters]]
            name = "interval"
            data_type = "integer"
            required = true
            "#,
        )
        .unwrap();

        let telemetry = registry.schema_for("temp-sensor", Channel::Telemetry).unwrap();
        assert_eq!(telemetry.field("temperature").unwrap().min, Some(-40.0));
        assert!(registry.schema_for("temp-sensor", Channel::Alert).is_err());
        assert_eq!(registry.commands_for("temp-sensor").unwrap().len(), 1);
    }

    #[test]
    fn test_misspelled_key_is_rejected() {
        let err = DeviceTypeRegistry::from_toml_str(
            r#"
            [[device_types]]
            type_id = "temp-sensor"

            [[device_types.telemetry]]
            name = "temperature"
            data_type = "float"
            requried = true
            "#,
        )
        .unwrap_err();
        match err {
            RegistryError::Load(message) => assert!(message.contains("requried"), "{}", message),
            other => panic!("unexpected error: {}", other),
        }

        let err = DeviceTypeRegistry::from_json_str(
            r#"{"device_types": [{"type_id": "smoke-detector", "telemetry": [], "alert": []}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Load(_)));
    }

    #[test]
    fn test_field_without_data_type_is_rejected() {
        let err = DeviceTypeRegistry::from_toml_str(
            r#"
            [[device_types]]
            type_id = "temp-sensor"

            [[device_types.telemetry]]
            name = "temperature"
            required = true
            "#,
        )
        .unwrap_err();
        match err {
            RegistryError::Load(message) => assert!(message.contains("data_type"), "{}", message),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"device_types": [{{"type_id": "door-actuator", "commands": [{{"action": "LOCK"}}]}}]}}"#
        )
        .unwrap();

        let registry = DeviceTypeRegistry::load(file.path()).unwrap();
        assert_eq!(registry.resolve_type("door-actuator-02").unwrap(), "door-actuator");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            DeviceTypeRegistry::load("/nonexistent/types.toml"),
            Err(RegistryError::Load(_))
        ));
    }

    #[test]
    fn test_reload_swaps_whole_snapshot() {
        let shared = SharedRegistry::new(DeviceTypeRegistry::new(gas_types()).unwrap());
        let before = shared.snapshot();

        let previous = shared.reload(DeviceTypeRegistry::builtin());

        assert_eq!(previous.len(), 2);
        // Snapshots taken before the reload are unaffected.
        assert!(before.get("gas-sensor-pro").is_some());
        assert!(shared.snapshot().get("gas-sensor-pro").is_none());
        assert!(shared.snapshot().get("ac-actuator").is_some());
    }

    #[test]
    fn test_failed_reload_keeps_snapshot() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[[device_types]]\ntype_id = \"bad id\"\n").unwrap();

        let shared = SharedRegistry::default();
        let count = shared.snapshot().len();

        assert!(shared.reload_from_path(file.path()).is_err());
        assert_eq!(shared.snapshot().len(), count);
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let small = DeviceTypeRegistry::new(gas_types()).unwrap();
        let shared = SharedRegistry::new(small.clone());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let shared = shared.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let snapshot = shared.snapshot();
                        // Either the two-type snapshot or the builtin one, never a mix.
                        let has_pro = snapshot.get("gas-sensor-pro").is_some();
                        let has_ac = snapshot.get("ac-actuator").is_some();
                        assert!(has_pro != has_ac);
                    }
                });
            }
            for i in 0..100 {
                if i % 2 == 0 {
                    shared.reload(DeviceTypeRegistry::builtin());
                } else {
                    shared.reload(small.clone());
                }
            }
        });
    }
}
