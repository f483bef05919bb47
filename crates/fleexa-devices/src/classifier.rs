//! Topic classification.
//!
//! Topics follow `devices/<device-id>/<channel>` where the channel segment is
//! exactly `telemetry`, `alerts` or `command`.

use serde::Serialize;

use crate::registry::DeviceTypeRegistry;
use crate::Channel;

/// Root segment of every device topic.
pub const TOPIC_ROOT: &str = "devices";

/// Classification failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    /// The topic does not follow the device topic grammar.
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    /// The device id matches no registered type prefix.
    #[error("Unknown device type for device '{0}'")]
    UnknownDeviceType(String),
}

/// Identity and channel derived from a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedTopic {
    pub device_id: String,
    pub device_type_id: String,
    pub channel: Channel,
}

/// Split a topic into device id and channel without consulting the registry.
pub fn parse_topic(topic: &str) -> Result<(&str, Channel), ClassifyError> {
    let invalid = || ClassifyError::InvalidTopic(topic.to_string());

    let mut segments = topic.split('/');
    let (Some(root), Some(device_id), Some(segment), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(invalid());
    };

    if root != TOPIC_ROOT || device_id.is_empty() {
        return Err(invalid());
    }

    let channel = Channel::from_topic_segment(segment).ok_or_else(invalid)?;
    Ok((device_id, channel))
}

/// Classify a topic, resolving the device type through `registry`.
pub fn classify(topic: &str, registry: &DeviceTypeRegistry) -> Result<ClassifiedTopic, ClassifyError> {
    let (device_id, channel) = parse_topic(topic)?;

    let device_type_id = registry
        .resolve_type(device_id)
        .map_err(|_| ClassifyError::UnknownDeviceType(device_id.to_string()))?;

    Ok(ClassifiedTopic {
        device_id: device_id.to_string(),
        device_type_id: device_type_id.to_string(),
        channel,
    })
}

/// Build the topic for a device and channel.
pub fn topic_for(device_id: &str, channel: Channel) -> String {
    format!("{}/{}/{}", TOPIC_ROOT, device_id, channel.topic_segment())
}
