//! Routing events published by the ingest layer.

use serde::{Deserialize, Serialize};

/// Channel a routed message belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telemetry,
    Alert,
    Command,
}

impl ChannelKind {
    /// Last segment of the topic carrying this channel.
    pub fn topic_segment(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Alert => "alerts",
            Self::Command => "command",
        }
    }

    /// Inverse of [`ChannelKind::topic_segment`]. Matching is exact.
    pub fn from_topic_segment(segment: &str) -> Option<Self> {
        match segment {
            "telemetry" => Some(Self::Telemetry),
            "alerts" => Some(Self::Alert),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Telemetry => write!(f, "telemetry"),
            Self::Alert => write!(f, "alert"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Outcome of routing a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoutingEvent {
    /// An upstream message was validated and handed to its sink.
    RecordAccepted {
        device_id: String,
        device_type: String,
        channel: ChannelKind,
        timestamp: i64,
    },
    /// An upstream message was rejected.
    MessageRejected {
        topic: String,
        /// Stable reason code, e.g. `validation_error`.
        reason: String,
        detail: String,
    },
    /// A command passed validation and was handed to the transport.
    CommandAccepted {
        device_id: String,
        request_id: String,
        action: String,
    },
    /// A command repeated a request id inside the dedup window.
    CommandDuplicate {
        device_id: String,
        request_id: String,
    },
    /// A command was rejected before dispatch.
    CommandRejected {
        device_id: String,
        request_id: String,
        reason: String,
        detail: String,
    },
    /// A sink or the transport failed to take a routed item.
    DeliveryFailed {
        device_id: String,
        target: String,
        error: String,
    },
    /// The device type registry snapshot was replaced.
    RegistryReloaded { device_types: usize },
}

impl RoutingEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RecordAccepted { .. } => "RecordAccepted",
            Self::MessageRejected { .. } => "MessageRejected",
            Self::CommandAccepted { .. } => "CommandAccepted",
            Self::CommandDuplicate { .. } => "CommandDuplicate",
            Self::CommandRejected { .. } => "CommandRejected",
            Self::DeliveryFailed { .. } => "DeliveryFailed",
            Self::RegistryReloaded { .. } => "RegistryReloaded",
        }
    }

    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            Self::CommandAccepted { .. } | Self::CommandDuplicate { .. } | Self::CommandRejected { .. }
        )
    }

    /// Device the event refers to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::RecordAccepted { device_id, .. }
            | Self::CommandAccepted { device_id, .. }
            | Self::CommandDuplicate { device_id, .. }
            | Self::CommandRejected { device_id, .. }
            | Self::DeliveryFailed { device_id, .. } => Some(device_id),
            Self::MessageRejected { .. } | Self::RegistryReloaded { .. } => None,
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Component that published the event.
    pub source: String,
    /// Unix timestamp in milliseconds.
    pub published_at: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            published_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RoutingEvent::CommandDuplicate {
            device_id: "door-actuator-02".into(),
            request_id: "req-1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CommandDuplicate");
        assert_eq!(json["request_id"], "req-1");
    }

    #[test]
    fn test_topic_segments() {
        for channel in [ChannelKind::Telemetry, ChannelKind::Alert, ChannelKind::Command] {
            assert_eq!(
                ChannelKind::from_topic_segment(channel.topic_segment()),
                Some(channel)
            );
        }
        assert_eq!(ChannelKind::from_topic_segment("alert"), None);
        assert_eq!(ChannelKind::from_topic_segment("Telemetry"), None);
    }

    #[test]
    fn test_classification_helpers() {
        let rejected = RoutingEvent::MessageRejected {
            topic: "devices/x/y".into(),
            reason: "invalid_topic".into(),
            detail: String::new(),
        };
        assert!(!rejected.is_command_event());
        assert_eq!(rejected.device_id(), None);
    }
}
