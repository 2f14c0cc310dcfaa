// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller: composition root and ingest pipeline.
//!
//! A [`Controller`] explicitly constructs every component — store,
//! registry, event processor, dispatcher, message log, rule engine,
//! router — and hands handles downward; there is no process-wide state.
//! Inbound messages flow: message log → topic parse → route classify →
//! decode → schema check → owning component. Decode-level errors are
//! dropped and counted here, never propagated to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::codec::{self, Decoded, Envelope};
use crate::command::{
    Changeset, CommandDispatcher, CommandHandle, CommandOptions, CommandRecord, CommandSpec,
    ExecutionMode, GroupDispatch,
};
use crate::config::ControllerConfig;
use crate::error::{ChangesetError, CommandError, Error, PayloadError};
use crate::event::{ControllerEvent, EventBus, EventProcessor};
use crate::msglog::{Direction, LogEntry, LogQuery, MessageLog};
use crate::registry::{
    DeviceFilter, DeviceRecord, DeviceRegistry, IdentityImport, IdentityUpdate, ImportOutcome,
};
use crate::router::{Route, SubscriptionRouter};
use crate::rules::{Rule, RuleEngine};
use crate::schema::SchemaValidator;
use crate::storage::SharedStore;
use crate::topic::{DeviceAddress, GroupAddress, ParsedTopic, parse_topic};
use crate::transport::{InboundMessage, MqttTransport, OutboundMessage, TransportHandles};

/// Ingest-side counters. Decode errors drop and count; they never fail
/// the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Messages handed to the pipeline.
    pub ingested: u64,
    /// Dropped: topic failed the grammar.
    pub topic_malformed: u64,
    /// Dropped: payload failed envelope decoding.
    pub payload_malformed: u64,
    /// Dropped: strict-mode schema rejection.
    pub payload_rejected: u64,
    /// Passed through with validation errors (lenient mode).
    pub validation_flagged: u64,
    /// Storage write-through failures during ingest.
    pub storage_errors: u64,
}

struct ControllerInner {
    config: ControllerConfig,
    clock: SharedClock,
    bus: EventBus,
    validator: Arc<SchemaValidator>,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventProcessor>,
    dispatcher: CommandDispatcher,
    rules: RuleEngine,
    msglog: MessageLog,
    router: SubscriptionRouter,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    transport: Mutex<Option<MqttTransport>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ingested: AtomicU64,
    topic_malformed: AtomicU64,
    payload_malformed: AtomicU64,
    payload_rejected: AtomicU64,
    validation_flagged: AtomicU64,
    storage_errors: AtomicU64,
}

/// The diagnostic messaging controller. Cheaply cloneable.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("devices", &self.inner.registry.device_count())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Composes a controller over the given store and clock.
    ///
    /// Background maintenance (message-log writer and purger, silent
    /// sweeper, rule engine) starts immediately; the MQTT transport does
    /// not connect until [`connect`](Self::connect). Messages can be fed
    /// by hand through [`ingest`](Self::ingest), which is what the
    /// simulator and the test suite do.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for bad exclusion globs
    /// or subscription patterns.
    pub fn new(
        config: ControllerConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self, Error> {
        let bus = EventBus::new();
        let validator = Arc::new(SchemaValidator::new(config.validation));
        let msglog = MessageLog::new(store.clone(), clock.clone(), config.msglog.clone())?;
        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            config.registry.clone(),
        ));
        let events = Arc::new(EventProcessor::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
        ));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.effective_outbound_capacity());
        let dispatcher = CommandDispatcher::new(
            outbound_tx.clone(),
            registry.clone(),
            store.clone(),
            clock.clone(),
            bus.clone(),
            config.dispatcher.clone(),
        );
        let rules = RuleEngine::new(dispatcher.clone(), bus.clone(), clock.clone());
        let router = SubscriptionRouter::new(&config.transport.subscriptions)
            .map_err(|e| Error::InvalidConfiguration(format!("subscription patterns: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.extend(msglog.spawn_tasks(shutdown_rx.clone()));
        tasks.push(registry.clone().spawn_sweeper(shutdown_rx.clone()));
        tasks.extend(rules.spawn_tasks(shutdown_rx));

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                clock,
                bus,
                validator,
                registry,
                events,
                dispatcher,
                rules,
                msglog,
                router,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                transport: Mutex::new(None),
                shutdown: shutdown_tx,
                tasks: Mutex::new(tasks),
                ingested: AtomicU64::new(0),
                topic_malformed: AtomicU64::new(0),
                payload_malformed: AtomicU64::new(0),
                payload_rejected: AtomicU64::new(0),
                validation_flagged: AtomicU64::new(0),
                storage_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Loads persisted device records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the scan fails.
    pub fn load_persisted(&self) -> Result<usize, Error> {
        Ok(self.inner.registry.load_persisted()?)
    }

    /// Takes ownership of the outbound publish queue without starting
    /// the transport.
    ///
    /// For embeddings that supply their own transport (the simulator,
    /// the test suite): drain this receiver and feed replies back
    /// through [`ingest`](Self::ingest). Once taken,
    /// [`connect`](Self::connect) is unavailable.
    #[must_use]
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.inner.outbound_rx.lock().take()
    }

    /// Connects the MQTT transport and starts the ingest loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] for configuration problems, or
    /// [`Error::InvalidConfiguration`] when called twice.
    pub fn connect(&self) -> Result<MqttTransport, Error> {
        let inner = &self.inner;
        let outbound_rx = inner
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidConfiguration("transport already started".to_string()))?;

        let TransportHandles {
            transport,
            inbound,
            tasks,
        } = MqttTransport::start(
            inner.config.transport.clone(),
            inner.clock.clone(),
            inner.msglog.clone(),
            outbound_rx,
            inner.shutdown.subscribe(),
        )?;

        let ingest_task = {
            let controller = self.clone();
            let mut inbound = inbound;
            let mut shutdown = inner.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = inbound.recv() => match message {
                            Some(message) => controller.ingest(&message),
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut task_store = inner.tasks.lock();
        task_store.extend(tasks);
        task_store.push(ingest_task);
        drop(task_store);

        *inner.transport.lock() = Some(transport.clone());
        Ok(transport)
    }

    /// Runs one inbound message through the full pipeline. Synchronous
    /// and non-blocking: every handler enqueues onto its own queue.
    pub fn ingest(&self, message: &InboundMessage) {
        let inner = &self.inner;
        inner.ingested.fetch_add(1, Ordering::Relaxed);
        inner.msglog.record(
            &message.topic,
            &message.payload,
            message.qos,
            message.retained,
            Direction::In,
        );

        let parsed = match parse_topic(&message.topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                inner.topic_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %message.topic, error = %e, "Dropping malformed topic");
                return;
            }
        };

        let route = SubscriptionRouter::classify(&parsed);
        let ParsedTopic::Device(address) = parsed else {
            return; // group requests are our own downlink, log-only
        };
        if route == Route::LogOnly {
            return;
        }

        let decoded = match codec::decode(&address.channel, &message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                inner.payload_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %message.topic, error = %e, "Dropping malformed payload");
                return;
            }
        };

        // Schema validation; never gates LWT or command correlation.
        let validation_flagged = match self.validate(&decoded) {
            Ok(flagged) => {
                if flagged {
                    inner.validation_flagged.fetch_add(1, Ordering::Relaxed);
                }
                flagged
            }
            Err(e) => {
                inner.payload_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %message.topic, error = %e, "Payload rejected by schema");
                return;
            }
        };

        match route {
            Route::Registry => {
                self.apply_to_registry(&address.addr, &decoded, validation_flagged);
            }
            Route::Events => {
                self.apply_to_registry(&address.addr, &decoded, validation_flagged);
                if let Decoded::Event {
                    event_type,
                    envelope,
                    report,
                } = &decoded
                {
                    if let Err(e) =
                        inner
                            .events
                            .process(&address.addr, event_type, envelope, report)
                    {
                        inner.storage_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "Event persistence failed");
                    }
                }
            }
            Route::CommandReply => {
                self.apply_to_registry(&address.addr, &decoded, validation_flagged);
                match decoded {
                    Decoded::CmdAck(ack) => inner.dispatcher.handle_ack(&address.addr, ack),
                    Decoded::CmdResult(result) => {
                        inner.dispatcher.handle_result(&address.addr, result);
                    }
                    _ => {}
                }
            }
            Route::LogOnly => {}
        }
    }

    fn validate(&self, decoded: &Decoded) -> Result<bool, PayloadError> {
        match envelope_of(decoded) {
            Some(envelope) => self
                .inner
                .validator
                .check(&envelope.schema.to_string(), &envelope.payload),
            None => Ok(false),
        }
    }

    fn apply_to_registry(&self, addr: &DeviceAddress, decoded: &Decoded, flagged: bool) {
        if let Err(e) = self.inner.registry.ingest(addr, decoded, flagged) {
            self.inner.storage_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(device = %addr, error = %e, "Device record write-through failed");
        }
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Lists device records matching the filter.
    #[must_use]
    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.inner.registry.list(filter)
    }

    /// Returns one device record.
    #[must_use]
    pub fn get_device(&self, addr: &DeviceAddress) -> Option<DeviceRecord> {
        self.inner.registry.get(addr)
    }

    /// Applies a manual identity update.
    ///
    /// # Errors
    ///
    /// See [`DeviceRegistry::set_identity`].
    pub fn set_identity(&self, addr: &DeviceAddress, update: IdentityUpdate) -> Result<(), Error> {
        self.inner.registry.set_identity(addr, update)
    }

    /// Bulk identity import with per-row outcomes.
    pub fn import_identities(&self, rows: Vec<IdentityImport>) -> Vec<ImportOutcome> {
        self.inner.registry.import_identities(rows)
    }

    /// Submits a command.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::submit`].
    pub fn submit_command(
        &self,
        device: DeviceAddress,
        op: impl Into<String>,
        args: Value,
        options: CommandOptions,
    ) -> Result<CommandHandle, CommandError> {
        self.inner.dispatcher.submit(device, op, args, options)
    }

    /// Submits a group downlink.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::submit_group`].
    pub fn submit_group(
        &self,
        group: &GroupAddress,
        members: &[DeviceAddress],
        op: impl Into<String>,
        args: Value,
        options: CommandOptions,
    ) -> Result<GroupDispatch, CommandError> {
        self.inner
            .dispatcher
            .submit_group(group, members, op, args, options)
    }

    /// Returns a command record.
    #[must_use]
    pub fn get_command(&self, cmd_id: &str) -> Option<CommandRecord> {
        self.inner.dispatcher.get(cmd_id)
    }

    /// Requests cancellation of a command.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::cancel`].
    pub fn cancel_command(&self, cmd_id: &str) -> Result<(), CommandError> {
        self.inner.dispatcher.cancel(cmd_id)
    }

    /// Creates a changeset in draft status.
    pub fn create_changeset(
        &self,
        description: impl Into<String>,
        commands: Vec<CommandSpec>,
        rollback_commands: Vec<CommandSpec>,
        session_id: Option<String>,
    ) -> Changeset {
        self.inner
            .dispatcher
            .create_changeset(description, commands, rollback_commands, session_id)
    }

    /// Executes a changeset.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::execute_changeset`].
    pub async fn execute_changeset(
        &self,
        changeset_id: &str,
        mode: ExecutionMode,
    ) -> Result<Changeset, ChangesetError> {
        self.inner
            .dispatcher
            .execute_changeset(changeset_id, mode)
            .await
    }

    /// Rolls back a changeset.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::rollback_changeset`].
    pub async fn rollback_changeset(
        &self,
        changeset_id: &str,
    ) -> Result<Changeset, ChangesetError> {
        self.inner.dispatcher.rollback_changeset(changeset_id).await
    }

    /// Returns a changeset snapshot.
    #[must_use]
    pub fn get_changeset(&self, changeset_id: &str) -> Option<Changeset> {
        self.inner.dispatcher.get_changeset(changeset_id)
    }

    /// Queries the message log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the scan fails.
    pub fn query_msglog(&self, filter: &LogQuery, limit: usize) -> Result<Vec<LogEntry>, Error> {
        Ok(self.inner.msglog.query(filter, limit)?)
    }

    /// Loads (or replaces) a rule.
    pub fn load_rule(&self, rule: Rule) {
        self.inner.rules.load_rule(rule);
    }

    /// Fires a rule by hand.
    ///
    /// # Errors
    ///
    /// See [`RuleEngine::trigger`].
    pub async fn trigger_rule(&self, rule_id: &str) -> Result<Option<Changeset>, Error> {
        self.inner.rules.trigger(rule_id).await
    }

    /// Arms or disarms a rule.
    ///
    /// # Errors
    ///
    /// See [`RuleEngine::set_enabled`].
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), Error> {
        self.inner.rules.set_enabled(rule_id, enabled)
    }

    /// Subscribes to the controller event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.bus.subscribe()
    }

    /// Registers a payload schema for validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if the definition does not compile.
    pub fn register_schema(
        &self,
        schema_id: impl Into<String>,
        definition: &Value,
    ) -> Result<(), Error> {
        Ok(self.inner.validator.register(schema_id, definition)?)
    }

    /// Returns the ingest counters.
    #[must_use]
    pub fn ingest_stats(&self) -> IngestStats {
        let inner = &self.inner;
        IngestStats {
            ingested: inner.ingested.load(Ordering::Relaxed),
            topic_malformed: inner.topic_malformed.load(Ordering::Relaxed),
            payload_malformed: inner.payload_malformed.load(Ordering::Relaxed),
            payload_rejected: inner.payload_rejected.load(Ordering::Relaxed),
            validation_flagged: inner.validation_flagged.load(Ordering::Relaxed),
            storage_errors: inner.storage_errors.load(Ordering::Relaxed),
        }
    }

    /// Returns the message log handle.
    #[must_use]
    pub fn msglog(&self) -> &MessageLog {
        &self.inner.msglog
    }

    /// Returns the transport handle once [`connect`](Self::connect) ran.
    #[must_use]
    pub fn transport(&self) -> Option<MqttTransport> {
        self.inner.transport.lock().clone()
    }

    /// Returns the configured subscription router.
    #[must_use]
    pub fn router(&self) -> &SubscriptionRouter {
        &self.inner.router
    }

    /// Signals shutdown to every background task and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Extracts the envelope from decoded variants that carry one.
fn envelope_of(decoded: &Decoded) -> Option<&Envelope> {
    match decoded {
        Decoded::State { envelope, .. }
        | Decoded::Attr { envelope, .. }
        | Decoded::Telemetry { envelope, .. }
        | Decoded::Event { envelope, .. }
        | Decoded::Topology { envelope, .. }
        | Decoded::Diagnostics { envelope, .. } => Some(envelope),
        Decoded::Lwt(_)
        | Decoded::CmdAck(_)
        | Decoded::CmdResult(_)
        | Decoded::Unknown { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn inbound(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: 1,
            retained: false,
        }
    }

    fn setup() -> (Controller, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let controller = Controller::new(
            ControllerConfig::new(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        (controller, clock)
    }

    #[tokio::test]
    async fn ingest_state_reaches_registry() {
        let (controller, _) = setup();
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/state",
            r#"{"schema":"state/1.0","ts":"2024-08-13T08:00:00.000Z","payload":{"health":"ok","uptime_s":10,"cpu_usage":20}}"#,
        ));

        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        let record = controller.get_device(&addr).unwrap();
        assert_eq!(record.state.unwrap().report.cpu_usage, Some(20.0));
        assert_eq!(controller.ingest_stats().ingested, 1);
    }

    #[tokio::test]
    async fn malformed_topic_is_counted_not_fatal() {
        let (controller, _) = setup();
        controller.ingest(&inbound("not/an/rtk/topic", "{}"));
        controller.ingest(&inbound("rtk/v1/office/floor1/UPPERCASE/state", "{}"));

        let stats = controller.ingest_stats();
        assert_eq!(stats.topic_malformed, 2);
        assert_eq!(stats.payload_malformed, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_not_fatal() {
        let (controller, _) = setup();
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/state",
            "{not json",
        ));
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/state",
            r#"{"ts":"2024-08-13T08:00:00.000Z","payload":{}}"#,
        ));

        assert_eq!(controller.ingest_stats().payload_malformed, 2);
        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        assert!(controller.get_device(&addr).is_none());
    }

    #[tokio::test]
    async fn event_flows_to_processor_and_bus() {
        let (controller, _) = setup();
        let mut rx = controller.subscribe();

        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/evt/link-down",
            r#"{"schema":"evt.link_down/1.0","ts":"2024-08-13T08:00:00.000Z","payload":{"severity":"error","message":"uplink lost"}}"#,
        ));

        let mut saw_event = false;
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::EventIngested(record) = event {
                assert_eq!(record.event_type, "link-down");
                saw_event = true;
            }
        }
        assert!(saw_event);
    }

    #[tokio::test]
    async fn own_cmd_req_is_log_only() {
        let (controller, _) = setup();
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/cmd/req",
            r#"{"id":"x","op":"light.set"}"#,
        ));

        // Not an error, and no device record was created.
        let stats = controller.ingest_stats();
        assert_eq!(stats.topic_malformed + stats.payload_malformed, 0);
        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        assert!(controller.get_device(&addr).is_none());
    }

    #[tokio::test]
    async fn strict_validation_rejects() {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let controller = Controller::new(
            ControllerConfig {
                validation: crate::schema::ValidationMode::Strict,
                ..ControllerConfig::new()
            },
            Arc::new(MemoryStore::new()),
            clock,
        )
        .unwrap();

        controller
            .register_schema(
                "state/1.0",
                &serde_json::json!({
                    "type": "object",
                    "required": ["health"]
                }),
            )
            .unwrap();

        // Valid payload flows.
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/state",
            r#"{"schema":"state/1.0","ts":"2024-08-13T08:00:00.000Z","payload":{"health":"ok"}}"#,
        ));
        // Invalid payload is rejected.
        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/state",
            r#"{"schema":"state/1.0","ts":"2024-08-13T08:00:01.000Z","payload":{"uptime_s":1}}"#,
        ));

        let stats = controller.ingest_stats();
        assert_eq!(stats.payload_rejected, 1);

        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        let record = controller.get_device(&addr).unwrap();
        assert_eq!(record.state.unwrap().report.health.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn lwt_bypasses_validation() {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let controller = Controller::new(
            ControllerConfig {
                validation: crate::schema::ValidationMode::Strict,
                ..ControllerConfig::new()
            },
            Arc::new(MemoryStore::new()),
            clock,
        )
        .unwrap();

        controller.ingest(&inbound(
            "rtk/v1/office/floor1/aabbccddeeff/lwt",
            r#"{"status":"online","ts":"2024-08-13T08:00:00.000Z"}"#,
        ));

        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        assert_eq!(
            controller.get_device(&addr).unwrap().liveness.online,
            crate::registry::OnlineState::Online
        );
    }

    #[tokio::test]
    async fn shutdown_stops_tasks() {
        let (controller, _) = setup();
        controller.shutdown().await;
    }
}
