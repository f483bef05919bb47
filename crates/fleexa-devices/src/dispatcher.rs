//! Command validation and dispatch deduplication.
//!
//! Commands are checked against the action's parameter schema before they
//! reach the transport, so a device never receives an action it does not
//! support. Accepted commands then pass through a [`DedupWindow`] keyed by
//! `(device_id, request_id)`: client retries inside the window are reported
//! as [`DispatchOutcome::Duplicate`] and never delivered twice.
//!
//! ## Window policy
//!
//! The window is fixed per key and measured from the first acceptance; a
//! duplicate does not extend it. Once the window has elapsed the same key is
//! accepted again. Expired keys are purged when the window fills up and on
//! [`DedupWindow::purge_expired`]. If the window is still full after purging,
//! the oldest key is evicted.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::registry::DeviceTypeRegistry;
use crate::validation::{validate, ValidatedPayload};

/// Command validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The wire payload is not a `{request_id, action, parameters}` object.
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Unknown device type '{0}'")]
    UnknownDeviceType(String),

    /// The device type does not accept this action.
    #[error("Unknown action '{action}' for device type '{device_type}'")]
    UnknownAction { device_type: String, action: String },

    /// A parameter is missing or violates the action's schema.
    #[error("Invalid parameter '{field}': {reason}")]
    InvalidParameters { field: String, reason: String },
}

/// Downstream command as sent by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Caller-chosen idempotency key
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(request_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            action: action.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Parse the command wire format `{request_id, action, parameters}`.
    pub fn parse(raw: &[u8]) -> Result<Self, CommandError> {
        let malformed = |reason: &str| CommandError::MalformedCommand(reason.to_string());

        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| CommandError::MalformedCommand(format!("invalid JSON: {}", e)))?;
        let Value::Object(mut obj) = value else {
            return Err(malformed("command must be a JSON object"));
        };

        let request_id = match obj.remove("request_id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => return Err(malformed("request_id cannot be empty")),
            Some(_) => return Err(malformed("request_id must be a string")),
            None => return Err(malformed("missing field 'request_id'")),
        };

        let action = match obj.remove("action") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => return Err(malformed("action cannot be empty")),
            Some(_) => return Err(malformed("action must be a string")),
            None => return Err(malformed("missing field 'action'")),
        };

        let parameters = match obj.remove("parameters") {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(malformed("parameters must be an object")),
            None => return Err(malformed("missing field 'parameters'")),
        };

        Ok(Self {
            request_id,
            action,
            parameters,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(3);
        obj.insert("request_id".into(), Value::String(self.request_id.clone()));
        obj.insert("action".into(), Value::String(self.action.clone()));
        obj.insert("parameters".into(), Value::Object(self.parameters.clone()));
        Value::Object(obj)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

/// A command whose action and parameters passed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedCommand {
    pub device_type_id: String,
    pub action: String,
    pub parameters: ValidatedPayload,
}

/// Validate an action and its parameters against a device type.
pub fn validate_command(
    registry: &DeviceTypeRegistry,
    device_type_id: &str,
    action: &str,
    parameters: &Map<String, Value>,
) -> Result<ValidatedCommand, CommandError> {
    let commands = registry
        .commands_for(device_type_id)
        .map_err(|_| CommandError::UnknownDeviceType(device_type_id.to_string()))?;

    let schema = commands.get(action).ok_or_else(|| CommandError::UnknownAction {
        device_type: device_type_id.to_string(),
        action: action.to_string(),
    })?;

    let parameters = validate(parameters, schema).map_err(|e| CommandError::InvalidParameters {
        field: e.field,
        reason: e.reason,
    })?;

    Ok(ValidatedCommand {
        device_type_id: device_type_id.to_string(),
        action: action.to_string(),
        parameters,
    })
}

/// Result of handing a validated command to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// First sighting of the request id inside the window; deliver it.
    Accepted,
    /// Already accepted inside the window; do not deliver again.
    Duplicate,
}

type DedupKey = (String, String);

/// Time and size bounded set of recently accepted `(device_id, request_id)` pairs.
#[derive(Debug)]
pub struct DedupWindow {
    entries: DashMap<DedupKey, Instant>,
    window: Duration,
    max_entries: usize,
}

impl DedupWindow {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            max_entries: max_entries.max(1),
        }
    }

    /// Atomically record the key. Returns `true` for exactly one caller per
    /// key and window, `false` for every repeat inside it.
    pub fn check_and_insert(&self, device_id: &str, request_id: &str) -> bool {
        let now = Instant::now();
        let key = (device_id.to_string(), request_id.to_string());

        // A live key is a duplicate whatever the fill level; it must never
        // be evicted to make room for itself.
        if self.is_live(&key, now) {
            return false;
        }

        if self.entries.len() >= self.max_entries {
            self.make_room(now, &key);
        }

        // The shard lock is held across the check and the insert.
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.window {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Remove a key so the same request id is accepted again, e.g. after the
    /// transport failed to deliver it.
    pub fn forget(&self, device_id: &str, request_id: &str) -> bool {
        self.entries
            .remove(&(device_id.to_string(), request_id.to_string()))
            .is_some()
    }

    pub fn contains(&self, device_id: &str, request_id: &str) -> bool {
        self.is_live(&(device_id.to_string(), request_id.to_string()), Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) < self.window);
        before.saturating_sub(self.entries.len())
    }

    fn is_live(&self, key: &DedupKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|seen| now.saturating_duration_since(*seen) < self.window)
    }

    /// Evict until there is room for `incoming`, which is never evicted itself.
    fn make_room(&self, now: Instant, incoming: &DedupKey) {
        self.purge_expired_at(now);

        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .filter(|entry| entry.key() != incoming)
                .min_by_key(|entry| *entry.value())
                .map(|entry| (entry.key().clone(), *entry.value()));

            let Some((key, seen)) = oldest else {
                break;
            };

            tracing::warn!(
                device_id = %key.0,
                request_id = %key.1,
                capacity = self.max_entries,
                "Dedup window full, evicting oldest entry before its window expired"
            );
            self.entries.remove_if(&key, |_, v| *v == seen);
        }
    }
}

/// Validated commands in, dispatch decisions out.
#[derive(Debug)]
pub struct CommandDispatcher {
    window: DedupWindow,
}

impl CommandDispatcher {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window: DedupWindow::new(window, max_entries),
        }
    }

    pub fn from_config(config: &fleexa_core::EngineConfig) -> Self {
        Self::new(config.dedup_window(), config.dedup_max_entries)
    }

    /// Decide whether `command` should be delivered to `device_id`.
    pub fn dispatch(
        &self,
        request_id: &str,
        device_id: &str,
        command: &ValidatedCommand,
    ) -> DispatchOutcome {
        if self.window.check_and_insert(device_id, request_id) {
            tracing::debug!(
                device_id = %device_id,
                request_id = %request_id,
                action = %command.action,
                "Command accepted for dispatch"
            );
            DispatchOutcome::Accepted
        } else {
            tracing::debug!(
                device_id = %device_id,
                request_id = %request_id,
                "Duplicate command suppressed"
            );
            DispatchOutcome::Duplicate
        }
    }

    /// Undo an acceptance whose delivery failed, so a retry is not
    /// reported as a duplicate.
    pub fn release(&self, request_id: &str, device_id: &str) -> bool {
        self.window.forget(device_id, request_id)
    }

    pub fn dedup_window(&self) -> &DedupWindow {
        &self.window
    }
}
