//! Ingest service: the transport-facing layer around the [`Router`].
//!
//! The router only decides; this service acts on its decisions. Validated
//! records go to the telemetry or alert sink, accepted commands go to the
//! command log and then the transport, and every outcome is counted and
//! published on the event bus. Collaborator failures are returned to the
//! caller as [`ServiceError`]; rejections are ordinary outcomes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fleexa_core::{EventBus, RoutingEvent, SharedEventBus};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatcher::CommandRequest;
use crate::registry::RegistryError;
use crate::router::{
    CommandRejection, CommandRoute, OutboundCommand, RejectedMessage, Router, ValidatedRecord,
};
use crate::sinks::DeviceStateCache;
use crate::Channel;

/// Default number of inbound messages processed at once by [`IngestService::run`].
pub const DEFAULT_CONCURRENCY: usize = 16;

const EVENT_SOURCE: &str = "ingest";

/// Sink failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Write failed: {0}")]
    Write(String),
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected (topic '{0}')")]
    NotConnected(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Errors surfaced to the caller of the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Sink '{sink}' failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error("Command transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Destination for validated telemetry or alert records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Name used in logs and events.
    fn name(&self) -> &str {
        "records"
    }

    async fn write(&self, record: &ValidatedRecord) -> Result<(), SinkError>;
}

/// Audit log of dispatched commands.
#[async_trait]
pub trait CommandLogSink: Send + Sync {
    async fn log(&self, command: &OutboundCommand) -> Result<(), SinkError>;
}

/// Outbound half of the pub/sub transport.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// A raw message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Result of handling one upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Accepted(ValidatedRecord),
    Rejected(RejectedMessage),
}

impl InboundOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Result of submitting one command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Logged and published.
    Accepted(OutboundCommand),
    /// Suppressed by the dedup window.
    Duplicate { device_id: String, request_id: String },
    Rejected(CommandRejection),
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub telemetry_accepted: u64,
    pub alerts_accepted: u64,
    /// Upstream rejections by reason code
    pub rejected: BTreeMap<String, u64>,
    pub commands_accepted: u64,
    pub commands_duplicate: u64,
    pub commands_rejected: u64,
    pub sink_failures: u64,
}

impl ServiceStats {
    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

#[derive(Debug, Default)]
struct Counters {
    telemetry_accepted: AtomicU64,
    alerts_accepted: AtomicU64,
    rejected: DashMap<&'static str, u64>,
    commands_accepted: AtomicU64,
    commands_duplicate: AtomicU64,
    commands_rejected: AtomicU64,
    sink_failures: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, code: &'static str) {
        *self.rejected.entry(code).or_insert(0) += 1;
    }

    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            telemetry_accepted: self.telemetry_accepted.load(Ordering::Relaxed),
            alerts_accepted: self.alerts_accepted.load(Ordering::Relaxed),
            rejected: self
                .rejected
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            commands_accepted: self.commands_accepted.load(Ordering::Relaxed),
            commands_duplicate: self.commands_duplicate.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes inbound traffic and submitted commands to their collaborators.
pub struct IngestService {
    router: Arc<Router>,
    telemetry_sink: Arc<dyn RecordSink>,
    alert_sink: Arc<dyn RecordSink>,
    command_log: Arc<dyn CommandLogSink>,
    transport: Arc<dyn CommandTransport>,
    event_bus: SharedEventBus,
    state_cache: Option<Arc<DeviceStateCache>>,
    concurrency: usize,
    counters: Counters,
}

impl IngestService {
    pub fn new(
        router: Arc<Router>,
        telemetry_sink: Arc<dyn RecordSink>,
        alert_sink: Arc<dyn RecordSink>,
        command_log: Arc<dyn CommandLogSink>,
        transport: Arc<dyn CommandTransport>,
    ) -> Self {
        Self {
            router,
            telemetry_sink,
            alert_sink,
            command_log,
            transport,
            event_bus: Arc::new(EventBus::new()),
            state_cache: None,
            concurrency: DEFAULT_CONCURRENCY,
            counters: Counters::default(),
        }
    }

    /// Publish outcomes on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Keep the latest telemetry of every device in `cache`.
    pub fn with_state_cache(mut self, cache: Arc<DeviceStateCache>) -> Self {
        self.state_cache = Some(cache);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn state_cache(&self) -> Option<&Arc<DeviceStateCache>> {
        self.state_cache.as_ref()
    }

    pub fn stats(&self) -> ServiceStats {
        self.counters.snapshot()
    }

    /// Route one upstream message and hand the record to its sink.
    pub async fn handle_inbound(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<InboundOutcome, ServiceError> {
        let record = match self.router.route_upstream(topic, payload) {
            Ok(record) => record,
            Err(rejected) => {
                tracing::warn!(
                    topic = %topic,
                    reason = rejected.reason.code(),
                    "Rejected upstream message: {}",
                    rejected.reason
                );
                self.counters.reject(rejected.reason.code());
                self.event_bus.publish(
                    RoutingEvent::MessageRejected {
                        topic: rejected.topic.clone(),
                        reason: rejected.reason.code().to_string(),
                        detail: rejected.reason.to_string(),
                    },
                    EVENT_SOURCE,
                );
                return Ok(InboundOutcome::Rejected(rejected));
            }
        };

        // The router never produces command records.
        let sink = match record.channel {
            Channel::Alert => &self.alert_sink,
            Channel::Telemetry | Channel::Command => &self.telemetry_sink,
        };

        if let Err(e) = sink.write(&record).await {
            tracing::error!(
                device_id = %record.device_id,
                sink = sink.name(),
                error = %e,
                "Failed to write record"
            );
            Counters::incr(&self.counters.sink_failures);
            self.event_bus.publish(
                RoutingEvent::DeliveryFailed {
                    device_id: record.device_id.clone(),
                    target: sink.name().to_string(),
                    error: e.to_string(),
                },
                EVENT_SOURCE,
            );
            return Err(ServiceError::Sink {
                sink: sink.name().to_string(),
                source: e,
            });
        }

        match record.channel {
            Channel::Alert => Counters::incr(&self.counters.alerts_accepted),
            _ => {
                Counters::incr(&self.counters.telemetry_accepted);
                if let Some(cache) = &self.state_cache {
                    cache.update(&record);
                }
            }
        }

        tracing::debug!(
            device_id = %record.device_id,
            device_type = %record.device_type_id,
            channel = %record.channel,
            "Record accepted"
        );
        self.event_bus.publish(
            RoutingEvent::RecordAccepted {
                device_id: record.device_id.clone(),
                device_type: record.device_type_id.clone(),
                channel: record.channel,
                timestamp: record.timestamp,
            },
            EVENT_SOURCE,
        );

        Ok(InboundOutcome::Accepted(record))
    }

    /// Validate a command for `device_id`, then publish and log it.
    ///
    /// Duplicates are neither published nor logged. If publishing fails the
    /// request id is released and nothing is logged, so the caller can retry
    /// it. If only the log write fails the command was delivered and the
    /// request id stays taken.
    pub async fn submit_command(
        &self,
        device_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutcome, ServiceError> {
        let outbound = match self.router.route_downstream(request, device_id) {
            Ok(CommandRoute::Accepted(outbound)) => outbound,
            Ok(CommandRoute::Duplicate {
                device_id,
                request_id,
            }) => {
                tracing::info!(device_id = %device_id, request_id = %request_id, "Duplicate command ignored");
                Counters::incr(&self.counters.commands_duplicate);
                self.event_bus.publish(
                    RoutingEvent::CommandDuplicate {
                        device_id: device_id.clone(),
                        request_id: request_id.clone(),
                    },
                    EVENT_SOURCE,
                );
                return Ok(CommandOutcome::Duplicate {
                    device_id,
                    request_id,
                });
            }
            Err(rejection) => {
                tracing::warn!(
                    device_id = %device_id,
                    request_id = %request.request_id,
                    reason = rejection.code(),
                    "Rejected command: {}",
                    rejection
                );
                Counters::incr(&self.counters.commands_rejected);
                self.event_bus.publish(
                    RoutingEvent::CommandRejected {
                        device_id: device_id.to_string(),
                        request_id: request.request_id.clone(),
                        reason: rejection.code().to_string(),
                        detail: rejection.to_string(),
                    },
                    EVENT_SOURCE,
                );
                return Ok(CommandOutcome::Rejected(rejection));
            }
        };

        if let Err(e) = self.transport.publish(&outbound.topic, outbound.payload()).await {
            // Nothing reached the device; a retry must be delivered.
            self.router
                .dispatcher()
                .release(&outbound.request_id, &outbound.device_id);
            self.report_delivery_failure(&outbound, &outbound.topic, &e.to_string());
            return Err(e.into());
        }

        // The device has the command now, so the request id stays in the
        // window and a retry is answered as a duplicate.
        if let Err(e) = self.command_log.log(&outbound).await {
            Counters::incr(&self.counters.sink_failures);
            self.report_delivery_failure(&outbound, "command_log", &e.to_string());
            return Err(ServiceError::Sink {
                sink: "command_log".to_string(),
                source: e,
            });
        }

        tracing::info!(
            device_id = %outbound.device_id,
            request_id = %outbound.request_id,
            action = %outbound.action,
            "Command dispatched"
        );
        Counters::incr(&self.counters.commands_accepted);
        self.event_bus.publish(
            RoutingEvent::CommandAccepted {
                device_id: outbound.device_id.clone(),
                request_id: outbound.request_id.clone(),
                action: outbound.action.clone(),
            },
            EVENT_SOURCE,
        );

        Ok(CommandOutcome::Accepted(outbound))
    }

    fn report_delivery_failure(&self, outbound: &OutboundCommand, target: &str, error: &str) {
        tracing::error!(
            device_id = %outbound.device_id,
            request_id = %outbound.request_id,
            target = %target,
            error = %error,
            "Command delivery failed"
        );
        self.event_bus.publish(
            RoutingEvent::DeliveryFailed {
                device_id: outbound.device_id.clone(),
                target: target.to_string(),
                error: error.to_string(),
            },
            EVENT_SOURCE,
        );
    }

    /// Drain `receiver`, handling up to `concurrency` messages at once.
    ///
    /// Errors are logged per message and never stop the loop. Returns when
    /// the channel is closed.
    pub async fn run(&self, receiver: mpsc::Receiver<InboundMessage>) {
        tracing::info!(concurrency = self.concurrency, "Ingest service started");

        let messages = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        messages
            .for_each_concurrent(self.concurrency, |msg| async move {
                if let Err(e) = self.handle_inbound(&msg.topic, &msg.payload).await {
                    tracing::warn!(topic = %msg.topic, error = %e, "Failed to handle inbound message");
                }
            })
            .await;

        tracing::info!("Ingest service stopped: channel closed");
    }

    /// Reload the registry from `path`. On failure the current snapshot stays.
    pub fn reload_registry(&self, path: impl AsRef<Path>) -> Result<usize, ServiceError> {
        let count = self.router.registry().reload_from_path(path)?;
        self.event_bus
            .publish(RoutingEvent::RegistryReloaded { device_types: count }, EVENT_SOURCE);
        Ok(count)
    }
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("telemetry_sink", &self.telemetry_sink.name())
            .field("alert_sink", &self.alert_sink.name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SharedRegistry;
    use crate::sinks::{MemoryCommandLog, MemoryRecordSink, MemoryTransport};
    use fleexa_core::EngineConfig;
    use serde_json::json;

    struct Harness {
        service: IngestService,
        telemetry: Arc<MemoryRecordSink>,
        alerts: Arc<MemoryRecordSink>,
        log: Arc<MemoryCommandLog>,
        transport: Arc<MemoryTransport>,
    }

    fn harness() -> Harness {
        let router = Arc::new(Router::new(SharedRegistry::default(), &EngineConfig::default()));
        let telemetry = Arc::new(MemoryRecordSink::new("telemetry"));
        let alerts = Arc::new(MemoryRecordSink::new("alerts"));
        let log = Arc::new(MemoryCommandLog::new());
        let transport = Arc::new(MemoryTransport::new());
        let service = IngestService::new(
            router,
            telemetry.clone(),
            alerts.clone(),
            log.clone(),
            transport.clone(),
        )
        .with_state_cache(Arc::new(DeviceStateCache::new()));

        Harness {
            service,
            telemetry,
            alerts,
            log,
            transport,
        }
    }

    fn envelope(device_id: &str, payload: serde_json::Value) -> Vec<u8> {
        json!({
            "device_id": device_id,
            "timestamp": chrono::Utc::now().timestamp(),
            "type": "sensor",
            "payload": payload,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_records_go_to_channel_sinks() {
        let h = harness();
        let mut events = h.service.event_bus().subscribe();

        let outcome = h
            .service
            .handle_inbound(
                "devices/gas-sensor-07/alerts",
                &envelope("gas-sensor-07", json!({"gas_level": 950, "status": "DANGER", "alarm_on": true})),
            )
            .await
            .unwrap();
        assert!(outcome.is_accepted());

        h.service
            .handle_inbound(
                "devices/temp-sensor-01/telemetry",
                &envelope("temp-sensor-01", json!({"temperature": 19.0})),
            )
            .await
            .unwrap();

        assert_eq!(h.alerts.len().await, 1);
        assert_eq!(h.telemetry.len().await, 1);

        let stats = h.service.stats();
        assert_eq!(stats.alerts_accepted, 1);
        assert_eq!(stats.telemetry_accepted, 1);

        // Alerts do not touch the state cache.
        let cache = h.service.state_cache().unwrap();
        assert_eq!(cache.device_ids(), ["temp-sensor-01"]);

        let (event, _) = events.recv().await.unwrap();
        assert_eq!(event.type_name(), "RecordAccepted");
    }

    #[tokio::test]
    async fn test_rejections_are_counted_not_errors() {
        let h = harness();
        let outcome = h
            .service
            .handle_inbound("devices/ac-actuator-03/alerts", &envelope("ac-actuator-03", json!({})))
            .await
            .unwrap();

        assert!(matches!(outcome, InboundOutcome::Rejected(_)));
        assert_eq!(h.service.stats().rejected.get("no_schema_defined"), Some(&1));
        assert!(h.telemetry.is_empty().await && h.alerts.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_command_not_published_twice() {
        let h = harness();
        let request = CommandRequest::new("req-1", "LOCK");

        let first = h.service.submit_command("door-actuator-02", &request).await.unwrap();
        let second = h.service.submit_command("door-actuator-02", &request).await.unwrap();

        assert!(matches!(first, CommandOutcome::Accepted(_)));
        assert!(matches!(second, CommandOutcome::Duplicate { .. }));
        assert_eq!(h.transport.published().await.len(), 1);
        assert_eq!(h.log.commands().await.len(), 1);

        let stats = h.service.stats();
        assert_eq!((stats.commands_accepted, stats.commands_duplicate), (1, 1));
    }

    #[tokio::test]
    async fn test_failed_delivery_can_be_retried() {
        let h = harness();
        let request = CommandRequest::new("req-7", "UNLOCK");

        h.transport.set_connected(false);
        let err = h.service.submit_command("door-actuator-02", &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Transport(TransportError::NotConnected(_))));

        h.transport.set_connected(true);
        let outcome = h.service.submit_command("door-actuator-02", &request).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Accepted(_)));
        assert_eq!(h.transport.published().await.len(), 1);
    }

    struct BrokenLog;

    #[async_trait]
    impl CommandLogSink for BrokenLog {
        async fn log(&self, _command: &OutboundCommand) -> Result<(), SinkError> {
            Err(SinkError::Write("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_unpublished_command_is_not_logged() {
        let h = harness();
        let request = CommandRequest::new("req-8", "LOCK");

        h.transport.set_connected(false);
        assert!(h.service.submit_command("door-actuator-02", &request).await.is_err());
        assert!(h.log.commands().await.is_empty());

        h.transport.set_connected(true);
        h.service.submit_command("door-actuator-02", &request).await.unwrap();
        let logged = h.log.commands().await;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].request_id, "req-8");
    }

    #[tokio::test]
    async fn test_log_failure_after_publish_keeps_request_id() {
        let transport = Arc::new(MemoryTransport::new());
        let service = IngestService::new(
            Arc::new(Router::new(SharedRegistry::default(), &EngineConfig::default())),
            Arc::new(MemoryRecordSink::new("telemetry")),
            Arc::new(MemoryRecordSink::new("alerts")),
            Arc::new(BrokenLog),
            transport.clone(),
        );
        let request = CommandRequest::new("req-9", "UNLOCK");

        let err = service.submit_command("door-actuator-02", &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Sink { ref sink, .. } if sink == "command_log"));

        let retry = service.submit_command("door-actuator-02", &request).await.unwrap();
        assert!(matches!(retry, CommandOutcome::Duplicate { .. }));
        assert_eq!(transport.published().await.len(), 1);
        assert_eq!(service.stats().sink_failures, 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);

        for i in 0..5 {
            let id = format!("temp-sensor-{:02}", i);
            let topic = format!("devices/{}/telemetry", id);
            tx.send(InboundMessage::new(topic, envelope(&id, json!({"temperature": 20})))).await.unwrap();
        }
        tx.send(InboundMessage::new("bogus", b"{}".to_vec())).await.unwrap();
        drop(tx);

        h.service.run(rx).await;

        let stats = h.service.stats();
        assert_eq!(stats.telemetry_accepted, 5);
        assert_eq!(stats.total_rejected(), 1);
    }

    #[tokio::test]
    async fn test_reload_registry_failure_keeps_snapshot() {
        let h = harness();
        assert!(h.service.reload_registry("/nonexistent/types.toml").is_err());
        assert_eq!(h.service.router().registry().snapshot().len(), 4);
    }
}
