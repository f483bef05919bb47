//! Upstream envelope codec.
//!
//! Every telemetry and alert message is wrapped as
//! `{"device_id": ..., "timestamp": ..., "type": ..., "payload": {...}}`.
//! The codec checks this structure only; the payload is interpreted later by
//! the validation engine once the device type and channel are known.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl ParseError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope(reason.into())
    }
}

/// Standard upstream wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub device_id: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Informational payload category ("sensor", "actuator")
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(
        device_id: impl Into<String>,
        timestamp: i64,
        kind: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            kind: kind.into(),
            payload,
        }
    }

    /// Reject timestamps more than `skew_tolerance` ahead of `now` (Unix seconds).
    pub fn check_timestamp(&self, now: i64, skew_tolerance: Duration) -> Result<(), ParseError> {
        let skew = i64::try_from(skew_tolerance.as_secs()).unwrap_or(i64::MAX);
        if self.timestamp > now.saturating_add(skew) {
            return Err(ParseError::malformed(format!(
                "timestamp {} is more than {}s in the future",
                self.timestamp, skew
            )));
        }
        Ok(())
    }
}

/// Parse a raw envelope.
///
/// Unknown top-level fields are ignored; a missing or mistyped required field
/// rejects the whole envelope.
pub fn parse(raw: &[u8]) -> Result<Envelope, ParseError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ParseError::malformed(format!("invalid JSON: {}", e)))?;

    let Value::Object(mut obj) = value else {
        return Err(ParseError::malformed("envelope must be a JSON object"));
    };

    let device_id = match obj.remove("device_id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::String(_)) => return Err(ParseError::malformed("device_id cannot be empty")),
        Some(_) => return Err(ParseError::malformed("device_id must be a string")),
        None => return Err(ParseError::malformed("missing field 'device_id'")),
    };

    let timestamp = match obj.remove("timestamp") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(ts) if ts >= 0 => ts,
            Some(_) => return Err(ParseError::malformed("timestamp cannot be negative")),
            None if n.as_u64().is_some() => {
                return Err(ParseError::malformed("timestamp out of range"))
            }
            None => return Err(ParseError::malformed("timestamp must be an integer")),
        },
        Some(_) => return Err(ParseError::malformed("timestamp must be an integer")),
        None => return Err(ParseError::malformed("missing field 'timestamp'")),
    };

    let kind = match obj.remove("type") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(ParseError::malformed("type must be a string")),
        None => return Err(ParseError::malformed("missing field 'type'")),
    };

    let payload = match obj.remove("payload") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ParseError::malformed("payload must be an object")),
        None => return Err(ParseError::malformed("missing field 'payload'")),
    };

    Ok(Envelope {
        device_id,
        timestamp,
        kind,
        payload,
    })
}

/// Serialize an envelope to JSON bytes.
pub fn serialize(envelope: &Envelope) -> Vec<u8> {
    let mut obj = Map::with_capacity(4);
    obj.insert("device_id".into(), Value::String(envelope.device_id.clone()));
    obj.insert("timestamp".into(), Value::from(envelope.timestamp));
    obj.insert("type".into(), Value::String(envelope.kind.clone()));
    obj.insert("payload".into(), Value::Object(envelope.payload.clone()));
    Value::Object(obj).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[test]
    fn test_parse_valid() {
        let env = parse(&raw(json!({
            "device_id": "temp-sensor-01",
            "timestamp": 1_700_000_000,
            "type": "sensor",
            "payload": {"temperature": 21.5}
        })))
        .unwrap();

        assert_eq!(env.device_id, "temp-sensor-01");
        assert_eq!(env.timestamp, 1_700_000_000);
        assert_eq!(env.kind, "sensor");
        assert_eq!(env.payload["temperature"], json!(21.5));
    }

    #[test]
    fn test_round_trip() {
        let mut payload = Map::new();
        payload.insert("locked".into(), json!(true));
        payload.insert("battery".into(), json!(87));
        let env = Envelope::new("door-actuator-02", 42, "actuator", payload);

        assert_eq!(parse(&serialize(&env)).unwrap(), env);
    }

    #[test]
    fn test_extra_fields_ignored() {
        let env = parse(&raw(json!({
            "device_id": "gas-sensor-07",
            "timestamp": 0,
            "type": "sensor",
            "payload": {},
            "firmware": "1.2.3"
        })));
        assert!(env.is_ok());
    }

    #[test]
    fn test_missing_or_mistyped_fields_rejected() {
        let base = json!({
            "device_id": "gas-sensor-07",
            "timestamp": 10,
            "type": "sensor",
            "payload": {}
        });

        for field in ["device_id", "timestamp", "type", "payload"] {
            let mut missing = base.clone();
            missing.as_object_mut().unwrap().remove(field);
            let err = parse(&raw(missing)).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }

        let cases = [
            ("device_id", json!(7)),
            ("device_id", json!("")),
            ("timestamp", json!("10")),
            ("timestamp", json!(10.5)),
            ("timestamp", json!(-1)),
            ("type", json!(null)),
            ("payload", json!([1, 2])),
        ];
        for (field, value) in cases {
            let mut bad = base.clone();
            bad[field] = value;
            assert!(
                matches!(parse(&raw(bad)), Err(ParseError::MalformedEnvelope(_))),
                "{} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_not_an_object() {
        assert!(parse(b"[]").is_err());
        assert!(parse(b"not json").is_err());
        assert!(parse(b"").is_err());
    }

    #[test]
    fn test_check_timestamp() {
        let env = Envelope::new("temp-sensor-01", 1_000, "sensor", Map::new());
        let skew = Duration::from_secs(60);

        assert!(env.check_timestamp(1_000, skew).is_ok());
        assert!(env.check_timestamp(940, skew).is_ok());
        assert!(env.check_timestamp(939, skew).is_err());
        // Old timestamps are fine.
        assert!(env.check_timestamp(1_000_000, skew).is_ok());
    }
}
