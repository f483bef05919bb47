//! Message router.
//!
//! The router turns raw `(topic, bytes)` pairs into either a
//! [`ValidatedRecord`] or a [`RejectedMessage`], and caller-built commands into
//! either an [`OutboundCommand`], a duplicate notice or a [`CommandRejection`].
//! It performs no I/O and never retries; acting on the outcome is the caller's
//! job (see [`crate::service::IngestService`]).
//!
//! ## Upstream pipeline
//!
//! 1. Classify the topic (device id, device type, channel).
//! 2. Look up the payload schema for (device type, channel).
//! 3. Parse the envelope and check it belongs to the topic's device.
//! 4. Validate the envelope payload against the schema.
//!
//! The first failing step decides the rejection reason.

use std::sync::Arc;
use std::time::Duration;

use fleexa_core::EngineConfig;
use serde::Serialize;
use serde_json::{json, Value};

use crate::classifier::{classify, parse_topic, topic_for, ClassifyError};
use crate::dispatcher::{
    validate_command, CommandDispatcher, CommandError, CommandRequest, DispatchOutcome,
};
use crate::envelope::{self, ParseError};
use crate::registry::{DeviceTypeRegistry, LookupError, SharedRegistry};
use crate::validation::{validate, ValidatedPayload, ValidationError};
use crate::Channel;

/// A validated upstream message, ready for its sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRecord {
    pub device_id: String,
    pub device_type_id: String,
    pub channel: Channel,
    /// Envelope timestamp (Unix seconds)
    pub timestamp: i64,
    pub payload: ValidatedPayload,
}

/// Why an upstream message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("topic does not match devices/<device-id>/<telemetry|alerts|command>")]
    InvalidTopic,

    #[error("no device type matches device '{0}'")]
    UnknownDeviceType(String),

    #[error("{0}")]
    MalformedEnvelope(String),

    #[error("no {channel} schema defined for device type '{device_type}'")]
    NoSchemaDefined {
        device_type: String,
        channel: Channel,
    },

    #[error(transparent)]
    ValidationError(#[from] ValidationError),
}

impl RejectReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTopic => "invalid_topic",
            Self::UnknownDeviceType(_) => "unknown_device_type",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::NoSchemaDefined { .. } => "no_schema_defined",
            Self::ValidationError(_) => "validation_error",
        }
    }
}

impl From<ClassifyError> for RejectReason {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::InvalidTopic(_) => Self::InvalidTopic,
            ClassifyError::UnknownDeviceType(id) => Self::UnknownDeviceType(id),
        }
    }
}

impl From<ParseError> for RejectReason {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MalformedEnvelope(reason) => Self::MalformedEnvelope(reason),
        }
    }
}

impl From<LookupError> for RejectReason {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound(device_type) => Self::UnknownDeviceType(device_type),
            LookupError::NoSchemaDefined {
                device_type,
                channel,
            } => Self::NoSchemaDefined {
                device_type,
                channel,
            },
        }
    }
}

/// An upstream message that was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message on '{topic}' rejected: {reason}")]
pub struct RejectedMessage {
    pub topic: String,
    pub reason: RejectReason,
}

impl RejectedMessage {
    pub fn new(topic: impl Into<String>, reason: impl Into<RejectReason>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "topic": self.topic,
            "reason": self.reason.code(),
            "detail": self.reason.to_string(),
        });
        if let RejectReason::ValidationError(e) = &self.reason {
            value["field"] = Value::String(e.field.clone());
        }
        value
    }
}

/// Why a command was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("invalid command topic '{0}'")]
    InvalidTopic(String),

    #[error("no device type matches device '{0}'")]
    UnknownDeviceType(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("device type '{device_type}' does not accept action '{action}'")]
    UnknownAction { device_type: String, action: String },

    #[error("invalid parameter '{field}': {reason}")]
    InvalidParameters { field: String, reason: String },
}

impl CommandRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTopic(_) => "invalid_topic",
            Self::UnknownDeviceType(_) => "unknown_device_type",
            Self::MalformedCommand(_) => "malformed_command",
            Self::UnknownAction { .. } => "unknown_action",
            Self::InvalidParameters { .. } => "invalid_parameters",
        }
    }
}

impl From<CommandError> for CommandRejection {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::MalformedCommand(reason) => Self::MalformedCommand(reason),
            CommandError::UnknownDeviceType(id) => Self::UnknownDeviceType(id),
            CommandError::UnknownAction {
                device_type,
                action,
            } => Self::UnknownAction {
                device_type,
                action,
            },
            CommandError::InvalidParameters { field, reason } => {
                Self::InvalidParameters { field, reason }
            }
        }
    }
}

/// A command cleared for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundCommand {
    pub device_id: String,
    pub device_type_id: String,
    /// `devices/<device-id>/command`
    pub topic: String,
    pub request_id: String,
    pub action: String,
    pub parameters: ValidatedPayload,
}

impl OutboundCommand {
    /// Canonical command document `{request_id, action, parameters}`.
    pub fn to_json(&self) -> Value {
        json!({
            "request_id": self.request_id,
            "action": self.action,
            "parameters": self.parameters.to_json_map(),
        })
    }

    /// Bytes to publish on [`Self::topic`].
    pub fn payload(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// The command wrapped as a desired-state document, `{"state": {...}}`.
    pub fn shadow_delta(&self) -> Value {
        json!({ "state": self.to_json() })
    }
}

/// Outcome of a downstream route.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRoute {
    Accepted(OutboundCommand),
    /// The request id was already accepted for this device inside the dedup window.
    Duplicate { device_id: String, request_id: String },
}

impl CommandRoute {
    pub fn outcome(&self) -> DispatchOutcome {
        match self {
            Self::Accepted(_) => DispatchOutcome::Accepted,
            Self::Duplicate { .. } => DispatchOutcome::Duplicate,
        }
    }
}

/// Routes upstream messages and downstream commands against the current
/// registry snapshot.
#[derive(Debug)]
pub struct Router {
    registry: SharedRegistry,
    dispatcher: CommandDispatcher,
    skew_tolerance: Duration,
    max_payload_bytes: usize,
}

impl Router {
    pub fn new(registry: SharedRegistry, config: &EngineConfig) -> Self {
        Self {
            registry,
            dispatcher: CommandDispatcher::from_config(config),
            skew_tolerance: config.skew_tolerance(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Route an upstream message using the wall clock for the skew check.
    pub fn route_upstream(&self, topic: &str, raw: &[u8]) -> Result<ValidatedRecord, RejectedMessage> {
        self.route_upstream_at(topic, raw, chrono::Utc::now().timestamp())
    }

    /// Route an upstream message, with `now` in Unix seconds.
    pub fn route_upstream_at(
        &self,
        topic: &str,
        raw: &[u8],
        now: i64,
    ) -> Result<ValidatedRecord, RejectedMessage> {
        let registry = self.registry.snapshot();
        self.route_with(&registry, topic, raw, now)
            .map_err(|reason| {
                tracing::debug!(topic = %topic, reason = reason.code(), error = %reason, "Upstream message rejected");
                RejectedMessage::new(topic, reason)
            })
    }

    fn route_with(
        &self,
        registry: &DeviceTypeRegistry,
        topic: &str,
        raw: &[u8],
        now: i64,
    ) -> Result<ValidatedRecord, RejectReason> {
        let classified = classify(topic, registry)?;
        let schema = registry.schema_for(&classified.device_type_id, classified.channel)?;

        if raw.len() > self.max_payload_bytes {
            return Err(RejectReason::MalformedEnvelope(format!(
                "payload of {} bytes exceeds the {} byte limit",
                raw.len(),
                self.max_payload_bytes
            )));
        }

        let envelope = envelope::parse(raw)?;
        if envelope.device_id != classified.device_id {
            return Err(RejectReason::MalformedEnvelope(format!(
                "envelope device_id '{}' does not match topic device '{}'",
                envelope.device_id, classified.device_id
            )));
        }
        envelope.check_timestamp(now, self.skew_tolerance)?;

        let payload = validate(&envelope.payload, schema)?;

        Ok(ValidatedRecord {
            device_id: classified.device_id,
            device_type_id: classified.device_type_id,
            channel: classified.channel,
            timestamp: envelope.timestamp,
            payload,
        })
    }

    /// Validate and dedup a command for `device_id`.
    pub fn route_downstream(
        &self,
        request: &CommandRequest,
        device_id: &str,
    ) -> Result<CommandRoute, CommandRejection> {
        let registry = self.registry.snapshot();
        self.route_downstream_with(&registry, request, device_id)
            .inspect_err(|rejection| {
                tracing::debug!(
                    device_id = %device_id,
                    request_id = %request.request_id,
                    reason = rejection.code(),
                    error = %rejection,
                    "Command rejected"
                );
            })
    }

    fn route_downstream_with(
        &self,
        registry: &Arc<DeviceTypeRegistry>,
        request: &CommandRequest,
        device_id: &str,
    ) -> Result<CommandRoute, CommandRejection> {
        if request.request_id.is_empty() {
            return Err(CommandRejection::MalformedCommand(
                "request_id cannot be empty".into(),
            ));
        }

        let device_type_id = registry
            .resolve_type(device_id)
            .map_err(|_| CommandRejection::UnknownDeviceType(device_id.to_string()))?;

        let command = validate_command(registry, device_type_id, &request.action, &request.parameters)?;

        match self.dispatcher.dispatch(&request.request_id, device_id, &command) {
            DispatchOutcome::Accepted => Ok(CommandRoute::Accepted(OutboundCommand {
                device_id: device_id.to_string(),
                device_type_id: command.device_type_id,
                topic: topic_for(device_id, Channel::Command),
                request_id: request.request_id.clone(),
                action: command.action,
                parameters: command.parameters,
            })),
            DispatchOutcome::Duplicate => Ok(CommandRoute::Duplicate {
                device_id: device_id.to_string(),
                request_id: request.request_id.clone(),
            }),
        }
    }

    /// Route a raw command published on `devices/<device-id>/command`.
    pub fn route_command(&self, topic: &str, raw: &[u8]) -> Result<CommandRoute, CommandRejection> {
        let (device_id, channel) =
            parse_topic(topic).map_err(|_| CommandRejection::InvalidTopic(topic.to_string()))?;
        if channel != Channel::Command {
            return Err(CommandRejection::InvalidTopic(topic.to_string()));
        }

        if raw.len() > self.max_payload_bytes {
            return Err(CommandRejection::MalformedCommand(format!(
                "payload of {} bytes exceeds the {} byte limit",
                raw.len(),
                self.max_payload_bytes
            )));
        }

        let request = CommandRequest::parse(raw)?;
        self.route_downstream(&request, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn router() -> Router {
        Router::new(SharedRegistry::default(), &EngineConfig::default())
    }

    fn envelope(device_id: &str, payload: Value) -> Vec<u8> {
        json!({
            "device_id": device_id,
            "timestamp": NOW,
            "type": "sensor",
            "payload": payload,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_lookup_errors_keep_their_reason() {
        assert_eq!(
            RejectReason::from(LookupError::NotFound("smoke-detector".into())),
            RejectReason::UnknownDeviceType("smoke-detector".into())
        );
        assert_eq!(
            RejectReason::from(LookupError::NoSchemaDefined {
                device_type: "ac-actuator".into(),
                channel: Channel::Alert,
            })
            .code(),
            "no_schema_defined"
        );
    }

    #[test]
    fn test_route_telemetry() {
        let raw = envelope("temp-sensor-01", json!({"temperature": 21.5, "humidity": 40}));
        let record = router()
            .route_upstream_at("devices/temp-sensor-01/telemetry", &raw, NOW)
            .unwrap();

        assert_eq!(record.device_id, "temp-sensor-01");
        assert_eq!(record.device_type_id, "temp-sensor");
        assert_eq!(record.channel, Channel::Telemetry);
        assert_eq!(record.timestamp, NOW);
        assert_eq!(record.payload.len(), 2);
    }

    #[test]
    fn test_rejection_reasons() {
        let router = router();
        let valid = envelope("temp-sensor-01", json!({"temperature": 21.5}));

        let cases: Vec<(&str, Vec<u8>, &str)> = vec![
            ("devices/temp-sensor-01/status", valid.clone(), "invalid_topic"),
            ("devices/fridge-01/telemetry", valid.clone(), "unknown_device_type"),
            ("devices/temp-sensor-01/telemetry", b"{}".to_vec(), "malformed_envelope"),
            ("devices/ac-actuator-03/alerts", envelope("ac-actuator-03", json!({})), "no_schema_defined"),
            (
                "devices/temp-sensor-01/telemetry",
                envelope("temp-sensor-01", json!({"temperature": 500})),
                "validation_error",
            ),
        ];

        for (topic, raw, code) in cases {
            let rejected = router.route_upstream_at(topic, &raw, NOW).unwrap_err();
            assert_eq!(rejected.topic, topic);
            assert_eq!(rejected.reason.code(), code, "{}", rejected);
        }
    }

    #[test]
    fn test_device_id_must_match_topic() {
        let raw = envelope("temp-sensor-02", json!({"temperature": 21.5}));
        let rejected = router()
            .route_upstream_at("devices/temp-sensor-01/telemetry", &raw, NOW)
            .unwrap_err();
        assert!(matches!(rejected.reason, RejectReason::MalformedEnvelope(_)));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let raw = envelope("temp-sensor-01", json!({"temperature": 21.5}));
        let router = router();
        let topic = "devices/temp-sensor-01/telemetry";

        assert!(router.route_upstream_at(topic, &raw, NOW - 300).is_ok());
        let rejected = router.route_upstream_at(topic, &raw, NOW - 301).unwrap_err();
        assert_eq!(rejected.reason.code(), "malformed_envelope");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let config = EngineConfig {
            max_payload_bytes: 16,
            ..EngineConfig::default()
        };
        let router = Router::new(SharedRegistry::default(), &config);
        let raw = envelope("temp-sensor-01", json!({"temperature": 21.5}));

        let rejected = router
            .route_upstream_at("devices/temp-sensor-01/telemetry", &raw, NOW)
            .unwrap_err();
        assert!(rejected.reason.to_string().contains("byte limit"));
    }

    #[test]
    fn test_upstream_on_command_topic_has_no_schema() {
        let raw = envelope("door-actuator-02", json!({}));
        let rejected = router()
            .route_upstream_at("devices/door-actuator-02/command", &raw, NOW)
            .unwrap_err();
        assert_eq!(
            rejected.reason,
            RejectReason::NoSchemaDefined {
                device_type: "door-actuator".into(),
                channel: Channel::Command,
            }
        );
    }

    #[test]
    fn test_rejection_json_names_field() {
        let raw = envelope("gas-sensor-07", json!({"gas_level": 5, "status": "NORMAL"}));
        let rejected = router()
            .route_upstream_at("devices/gas-sensor-07/telemetry", &raw, NOW)
            .unwrap_err();

        let value = rejected.to_json();
        assert_eq!(value["reason"], "validation_error");
        assert_eq!(value["field"], "alarm_on");
    }

    #[test]
    fn test_route_downstream() {
        let router = router();
        let request = CommandRequest::new("req-9", "SET_INTERVAL").with_param("interval", 30);

        let CommandRoute::Accepted(outbound) = router.route_downstream(&request, "temp-sensor-01").unwrap() else {
            panic!("expected accepted command");
        };
        assert_eq!(outbound.topic, "devices/temp-sensor-01/command");
        assert_eq!(outbound.device_type_id, "temp-sensor");

        let payload: Value = serde_json::from_slice(&outbound.payload()).unwrap();
        assert_eq!(payload, json!({"request_id": "req-9", "action": "SET_INTERVAL", "parameters": {"interval": 30}}));
        assert_eq!(outbound.shadow_delta()["state"], payload);

        let again = router.route_downstream(&request, "temp-sensor-01").unwrap();
        assert_eq!(again.outcome(), DispatchOutcome::Duplicate);
    }

    #[test]
    fn test_rejected_command_does_not_consume_request_id() {
        let router = router();
        let bad = CommandRequest::new("req-3", "SILENCE");
        assert!(matches!(
            router.route_downstream(&bad, "gas-sensor-07"),
            Err(CommandRejection::InvalidParameters { .. })
        ));

        let good = bad.clone().with_param("duration", 120);
        assert_eq!(
            router.route_downstream(&good, "gas-sensor-07").unwrap().outcome(),
            DispatchOutcome::Accepted
        );
    }

    #[test]
    fn test_route_command_topic_checks() {
        let router = router();
        let raw = br#"{"request_id":"r","action":"LOCK","parameters":{}}"#;

        assert!(matches!(
            router.route_command("devices/door-actuator-02/telemetry", raw),
            Err(CommandRejection::InvalidTopic(_))
        ));
        assert!(matches!(
            router.route_command("devices/window-01/command", raw),
            Err(CommandRejection::UnknownDeviceType(_))
        ));
        assert!(matches!(
            router.route_command("devices/door-actuator-02/command", b"{}"),
            Err(CommandRejection::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_reload_is_visible_to_router() {
        let router = router();
        let raw = envelope("fridge-01", json!({}));
        let topic = "devices/fridge-01/telemetry";
        assert!(router.route_upstream_at(topic, &raw, NOW).is_err());

        let registry = DeviceTypeRegistry::new(vec![crate::schema::DeviceTypeSchema::new("fridge", "Fridge")]).unwrap();
        router.registry().reload(registry);
        assert!(router.route_upstream_at(topic, &raw, NOW).is_ok());
    }
}
