//! In-memory sink and transport implementations.
//!
//! Used by the CLI replay command and by tests. Production deployments plug
//! their own storage writers and broker clients in through the traits in
//! [`crate::service`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::router::{OutboundCommand, ValidatedRecord};
use crate::service::{CommandLogSink, CommandTransport, RecordSink, SinkError, TransportError};
use crate::validation::ValidatedPayload;

/// Collects every record written to it.
#[derive(Debug)]
pub struct MemoryRecordSink {
    name: String,
    records: RwLock<Vec<ValidatedRecord>>,
}

impl MemoryRecordSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(Vec::new()),
        }
    }

    pub async fn records(&self) -> Vec<ValidatedRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &ValidatedRecord) -> Result<(), SinkError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

/// Command log kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCommandLog {
    commands: RwLock<Vec<OutboundCommand>>,
}

impl MemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commands(&self) -> Vec<OutboundCommand> {
        self.commands.read().await.clone()
    }
}

#[async_trait]
impl CommandLogSink for MemoryCommandLog {
    async fn log(&self, command: &OutboundCommand) -> Result<(), SinkError> {
        self.commands.write().await.push(command.clone());
        Ok(())
    }
}

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Transport that records publishes instead of sending them.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    published: RwLock<Vec<PublishedMessage>>,
    disconnected: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the broker connection.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl CommandTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(topic.to_string()));
        }
        self.published.write().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Latest reported state of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_type_id: String,
    /// Timestamp of the telemetry the state came from
    pub timestamp: i64,
    pub state: ValidatedPayload,
}

/// Latest validated telemetry per device.
///
/// Out-of-order deliveries never overwrite newer state.
#[derive(Debug, Default)]
pub struct DeviceStateCache {
    states: DashMap<String, DeviceState>,
}

impl DeviceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a telemetry record. Returns `false` if a newer state was kept.
    pub fn update(&self, record: &ValidatedRecord) -> bool {
        let next = DeviceState {
            device_type_id: record.device_type_id.clone(),
            timestamp: record.timestamp,
            state: record.payload.clone(),
        };

        let mut entry = self
            .states
            .entry(record.device_id.clone())
            .or_insert_with(|| next.clone());
        if entry.timestamp > record.timestamp {
            return false;
        }
        *entry = next;
        true
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.states.get(device_id).map(|s| s.clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
