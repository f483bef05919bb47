//! Built-in device types.
//!
//! The same definitions ship as `config/device_types.toml`; deployments that
//! need different bounds or extra types point `device_types_path` at their own
//! file instead of changing code.

use crate::schema::{CommandDefinition, DeviceTypeSchema, FieldDefinition, FieldType};

const SEVERITIES: [&str; 3] = ["LOW", "MEDIUM", "CRITICAL"];

/// Get all built-in device types.
pub fn builtin_device_types() -> Vec<DeviceTypeSchema> {
    vec![
        temp_sensor_type(),
        gas_sensor_type(),
        door_actuator_type(),
        ac_actuator_type(),
    ]
}

fn temp_sensor_type() -> DeviceTypeSchema {
    DeviceTypeSchema::new("temp-sensor", "Temperature Sensor")
        .with_category("sensor")
        .with_description("Periodic temperature and humidity readings")
        .with_telemetry_field(
            FieldDefinition::new("temperature", FieldType::Float)
                .required()
                .with_range(-40.0, 125.0)
                .with_unit("°C"),
        )
        .with_telemetry_field(
            FieldDefinition::new("humidity", FieldType::Float)
                .with_range(0.0, 100.0)
                .with_unit("%"),
        )
        .with_telemetry_field(
            FieldDefinition::new("unit", FieldType::String)
                .with_allowed_values(["celsius", "fahrenheit"]),
        )
        .with_alert_field(
            FieldDefinition::new("status", FieldType::String)
                .required()
                .with_allowed_values(["HIGH_TEMPERATURE", "LOW_TEMPERATURE", "SENSOR_FAULT"]),
        )
        .with_alert_field(
            FieldDefinition::new("severity", FieldType::String).with_allowed_values(SEVERITIES),
        )
        .with_alert_field(
            FieldDefinition::new("temperature", FieldType::Float).with_range(-40.0, 125.0),
        )
        .with_command(
            CommandDefinition::new("SET_INTERVAL")
                .with_description("Change the reporting interval")
                .with_parameter(
                    FieldDefinition::new("interval", FieldType::Integer)
                        .required()
                        .with_range(1.0, 3600.0)
                        .with_unit("s"),
                ),
        )
}

fn gas_sensor_type() -> DeviceTypeSchema {
    let gas_level = || {
        FieldDefinition::new("gas_level", FieldType::Integer)
            .required()
            .with_range(0.0, 10_000.0)
            .with_unit("ppm")
    };
    let status = || {
        FieldDefinition::new("status", FieldType::String)
            .required()
            .with_allowed_values(["NORMAL", "WARNING", "DANGER"])
    };
    let alarm_on = || FieldDefinition::new("alarm_on", FieldType::Boolean).required();

    DeviceTypeSchema::new("gas-sensor", "Gas Sensor")
        .with_category("sensor")
        .with_telemetry_field(gas_level())
        .with_telemetry_field(status())
        .with_telemetry_field(alarm_on())
        .with_alert_field(gas_level())
        .with_alert_field(status())
        .with_alert_field(alarm_on())
        .with_alert_field(
            FieldDefinition::new("severity", FieldType::String).with_allowed_values(SEVERITIES),
        )
        .with_command(CommandDefinition::new("RESET_ALARM").with_description("Clear a latched alarm"))
        .with_command(
            CommandDefinition::new("SILENCE")
                .with_description("Mute the buzzer for a while")
                .with_parameter(
                    FieldDefinition::new("duration", FieldType::Integer)
                        .required()
                        .with_range(1.0, 3600.0)
                        .with_unit("s"),
                ),
        )
}

fn door_actuator_type() -> DeviceTypeSchema {
    let force = || FieldDefinition::new("force", FieldType::Boolean);

    DeviceTypeSchema::new("door-actuator", "Door Lock")
        .with_category("actuator")
        .with_telemetry_field(FieldDefinition::new("locked", FieldType::Boolean).required())
        .with_telemetry_field(FieldDefinition::new("door_open", FieldType::Boolean))
        .with_telemetry_field(
            FieldDefinition::new("battery", FieldType::Integer)
                .with_range(0.0, 100.0)
                .with_unit("%"),
        )
        .with_alert_field(
            FieldDefinition::new("status", FieldType::String)
                .required()
                .with_allowed_values(["FORCED_ENTRY", "LOW_BATTERY", "JAMMED"]),
        )
        .with_alert_field(
            FieldDefinition::new("severity", FieldType::String).with_allowed_values(SEVERITIES),
        )
        .with_command(CommandDefinition::new("LOCK").with_parameter(force()))
        .with_command(CommandDefinition::new("UNLOCK").with_parameter(force()))
}

fn ac_actuator_type() -> DeviceTypeSchema {
    let power = || {
        FieldDefinition::new("power", FieldType::String)
            .required()
            .with_allowed_values(["ON", "OFF"])
    };
    let target_temp = || {
        FieldDefinition::new("target_temp", FieldType::Float)
            .required()
            .with_range(16.0, 30.0)
            .with_unit("°C")
    };
    let mode = || {
        FieldDefinition::new("mode", FieldType::String)
            .required()
            .with_allowed_values(["COOL", "HEAT", "FAN", "AUTO"])
    };

    // No alert schema: air conditioners only report state.
    DeviceTypeSchema::new("ac-actuator", "Air Conditioner")
        .with_category("actuator")
        .with_telemetry_field(power())
        .with_telemetry_field(
            FieldDefinition::new("current_temp", FieldType::Float).with_unit("°C"),
        )
        .with_telemetry_field(target_temp())
        .with_telemetry_field(mode())
        .with_command(
            CommandDefinition::new("SET_STATE")
                .with_description("Set power, target temperature and mode")
                .with_parameter(power())
                .with_parameter(target_temp())
                .with_parameter(mode()),
        )
}
