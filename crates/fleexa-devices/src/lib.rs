//! Fleexa Message Validation and Routing
//!
//! This crate validates messages from a heterogeneous IoT device fleet and
//! routes them to their sinks. Device types are described as data in a
//! registry; nothing in the engine branches on a particular device type.
//!
//! ## Architecture
//!
//! - **Envelope codec** (`envelope`): parses the upstream
//!   `{device_id, timestamp, type, payload}` wrapper
//! - **DeviceTypeRegistry** (`registry`): device-id prefix to telemetry, alert
//!   and command schemas, held in an atomically swapped snapshot
//! - **Classifier** (`classifier`): `devices/<id>/<channel>` topics to device
//!   identity and channel
//! - **Validation engine** (`validation`): strict payload checks against a schema
//! - **CommandDispatcher** (`dispatcher`): command validation and request-id
//!   deduplication
//! - **Router** (`router`): orchestrates the above and returns a definite
//!   outcome for every message
//! - **IngestService** (`service`): hands router outcomes to sinks and the
//!   transport, publishes routing events
//!
//! ```rust,no_run
//! use fleexa_core::EngineConfig;
//! use fleexa_devices::{Router, SharedRegistry};
//!
//! let router = Router::new(SharedRegistry::default(), &EngineConfig::default());
//! let raw = br#"{"device_id":"gas-sensor-07","timestamp":1700000000,"type":"sensor",
//!     "payload":{"gas_level":950,"status":"DANGER","alarm_on":true}}"#;
//! let record = router.route_upstream("devices/gas-sensor-07/alerts", raw).unwrap();
//! assert_eq!(record.device_type_id, "gas-sensor");
//! ```

pub mod builtin_types;
pub mod classifier;
pub mod dispatcher;
pub mod envelope;
pub mod registry;
pub mod router;
pub mod schema;
pub mod service;
pub mod sinks;
pub mod validation;

/// Message channel, shared with routing events.
pub use fleexa_core::ChannelKind as Channel;

pub use builtin_types::builtin_device_types;
pub use classifier::{classify, parse_topic, topic_for, ClassifiedTopic, ClassifyError};
pub use dispatcher::{
    validate_command, CommandDispatcher, CommandError, CommandRequest, DedupWindow,
    DispatchOutcome, ValidatedCommand,
};
pub use envelope::{Envelope, ParseError};
pub use registry::{
    DeviceTypeId, DeviceTypeRegistry, LookupError, RegistryConfig, RegistryError, SharedRegistry,
};
pub use router::{
    CommandRejection, CommandRoute, OutboundCommand, RejectReason, RejectedMessage, Router,
    ValidatedRecord,
};
pub use schema::{
    CommandDefinition, DeviceTypeSchema, FieldDefinition, FieldType, FieldValue, PayloadSchema,
};
pub use service::{
    CommandLogSink, CommandOutcome, CommandTransport, InboundMessage, InboundOutcome,
    IngestService, RecordSink, ServiceError, ServiceStats, SinkError, TransportError,
};
pub use sinks::{
    DeviceState, DeviceStateCache, MemoryCommandLog, MemoryRecordSink, MemoryTransport,
    PublishedMessage,
};
pub use validation::{validate, validate_value, ValidatedPayload, ValidationError};
