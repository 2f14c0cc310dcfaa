// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command dispatcher: correlated request/ack/result with retries and
//! changesets.
//!
//! Each submitted command runs as its own cancellable task that owns the
//! ack and result timers. Inbound `cmd/ack` / `cmd/res` messages are
//! routed to the task through a fine-grained correlation map keyed by
//! `(id, device)`, which lets group downlinks share one wire id across
//! members. Only the ack phase retries; the republished payload carries
//! the same id, so devices deduplicate. Terminal results are immutable
//! and survive in the record map and the store for idempotent
//! resubmission.

mod changeset;
mod record;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::clock::SharedClock;
use crate::codec::{CmdAck, CmdRequest, CmdResult, Expect, SchemaId};
use crate::error::CommandError;
use crate::event::{ControllerEvent, EventBus};
use crate::registry::{DeviceRegistry, OnlineState};
use crate::storage::{SharedStore, keys, store_json};
use crate::topic::{Channel, CommandLeg, DeviceAddress, GroupAddress};
use crate::transport::OutboundMessage;

pub use changeset::{
    Changeset, ChangesetStatus, CommandSpec, ExecutionMode, GroupDispatch, GroupMember,
};
pub use record::{CmdId, CommandOptions, CommandRecord, CommandStatus, RetryPolicy};

/// What to do when the target device is not known to be online.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Refuse submission with [`CommandError::DeviceOffline`].
    #[default]
    Refuse,
    /// Submit anyway and let the broker queue the request.
    Queue,
}

/// Dispatcher configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default ack-phase retry policy (3 retries, 500 ms, ×2, cap 5 s).
    pub retry: RetryPolicy,
    /// Default result-phase deadline. Default 10 s.
    pub result_timeout: Duration,
    /// Default wire `timeout_ms` hint. Default 5000.
    pub timeout_ms: u64,
    /// Behavior towards devices with an authoritative offline LWT.
    pub offline_policy: OfflinePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            result_timeout: Duration::from_secs(10),
            timeout_ms: 5000,
            offline_policy: OfflinePolicy::default(),
        }
    }
}

/// Read-only capability and liveness queries the dispatcher needs from
/// the registry. A trait seam so the two components share no mutable
/// state.
pub trait CapabilitySource: Send + Sync {
    /// Checks that the device declares `op` and the cache is fresh.
    ///
    /// # Errors
    ///
    /// See [`DeviceRegistry::check_capability`].
    fn check_capability(&self, addr: &DeviceAddress, op: &str) -> Result<(), CommandError>;

    /// Returns the device's liveness, if known.
    fn online_state(&self, addr: &DeviceAddress) -> Option<OnlineState>;

    /// Counts a dispatched command on the device record.
    fn record_dispatch(&self, addr: &DeviceAddress);
}

impl CapabilitySource for DeviceRegistry {
    fn check_capability(&self, addr: &DeviceAddress, op: &str) -> Result<(), CommandError> {
        DeviceRegistry::check_capability(self, addr, op)
    }

    fn online_state(&self, addr: &DeviceAddress) -> Option<OnlineState> {
        DeviceRegistry::online_state(self, addr)
    }

    fn record_dispatch(&self, addr: &DeviceAddress) {
        self.record_command_dispatch(addr);
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Commands submitted (including group members).
    pub submitted: u64,
    /// Commands that completed successfully.
    pub completed: u64,
    /// Commands that ended failed, timeout, or cancelled.
    pub failed: u64,
    /// Acks/results that arrived after termination and were ignored.
    pub late_replies: u64,
}

/// A handle to a submitted command.
///
/// The handle observes the record through a watch channel; it can be
/// polled for snapshots or awaited for the terminal record.
#[derive(Debug)]
pub struct CommandHandle {
    cmd_id: CmdId,
    device: DeviceAddress,
    rx: watch::Receiver<CommandRecord>,
}

impl CommandHandle {
    /// Returns the correlation id.
    #[must_use]
    pub fn id(&self) -> &CmdId {
        &self.cmd_id
    }

    /// Returns the target device.
    #[must_use]
    pub fn device(&self) -> &DeviceAddress {
        &self.device
    }

    /// Returns the current record snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CommandRecord {
        self.rx.borrow().clone()
    }

    /// Waits for the terminal record.
    pub async fn wait(&mut self) -> CommandRecord {
        loop {
            {
                let record = self.rx.borrow();
                if record.is_terminal() {
                    return record.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                // Driver gone; the last observed value is all there is.
                return self.rx.borrow().clone();
            }
        }
    }
}

/// An inbound correlated reply.
#[derive(Debug, Clone)]
enum Reply {
    Ack(CmdAck),
    Result(CmdResult),
}

struct CommandSlot {
    record: parking_lot::Mutex<CommandRecord>,
    notify: watch::Sender<CommandRecord>,
    cancel: watch::Sender<bool>,
}

type CorrKey = (String, DeviceAddress);

struct DispatcherInner {
    slots: DashMap<CorrKey, Arc<CommandSlot>>,
    inflight: DashMap<CorrKey, mpsc::Sender<Reply>>,
    targets_by_id: DashMap<String, Vec<DeviceAddress>>,
    changesets: changeset::ChangesetStore,
    outbound: mpsc::Sender<OutboundMessage>,
    capabilities: Arc<dyn CapabilitySource>,
    store: SharedStore,
    clock: SharedClock,
    bus: EventBus,
    config: DispatcherConfig,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    late_replies: AtomicU64,
}

/// The command dispatcher. Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("inflight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        outbound: mpsc::Sender<OutboundMessage>,
        capabilities: Arc<dyn CapabilitySource>,
        store: SharedStore,
        clock: SharedClock,
        bus: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                slots: DashMap::new(),
                inflight: DashMap::new(),
                targets_by_id: DashMap::new(),
                changesets: changeset::ChangesetStore::new(),
                outbound,
                capabilities,
                store,
                clock,
                bus,
                config,
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                late_replies: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let inner = &self.inner;
        DispatcherStats {
            submitted: inner.submitted.load(Ordering::Relaxed),
            completed: inner.completed.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            late_replies: inner.late_replies.load(Ordering::Relaxed),
        }
    }

    /// Submits a command to one device.
    ///
    /// Resubmitting with the same caller-provided id returns a handle to
    /// the existing record without publishing again; a terminal record is
    /// observed immediately.
    ///
    /// # Errors
    ///
    /// Fails synchronously with a [`CommandError`] for capability,
    /// liveness, or serialization problems; nothing is published then.
    pub fn submit(
        &self,
        device: DeviceAddress,
        op: impl Into<String>,
        args: Value,
        options: CommandOptions,
    ) -> Result<CommandHandle, CommandError> {
        let op = op.into();
        let inner = &self.inner;

        let cmd_id = options.id.clone().unwrap_or_else(CmdId::generate);
        let key = (cmd_id.as_str().to_string(), device.clone());

        // Idempotency: a known id returns the recorded state, republishing
        // nothing. Caller retries are therefore safe.
        if let Some(slot) = inner.slots.get(&key) {
            tracing::debug!(cmd_id = %cmd_id, "Resubmission of known id, returning existing record");
            return Ok(CommandHandle {
                cmd_id,
                device,
                rx: slot.notify.subscribe(),
            });
        }

        inner.capabilities.check_capability(&device, &op)?;
        if inner.capabilities.online_state(&device) == Some(OnlineState::Offline)
            && inner.config.offline_policy == OfflinePolicy::Refuse
        {
            return Err(CommandError::DeviceOffline(device.device_id.to_string()));
        }

        let timeout_ms = options.timeout_ms.unwrap_or(inner.config.timeout_ms);
        let now = inner.clock.now();

        let mut record = CommandRecord::new(
            cmd_id.clone(),
            device.clone(),
            op.clone(),
            args.clone(),
            options.expect,
            timeout_ms,
            now,
        );
        record.changeset_id = options.changeset_id.clone();
        record.trace = options.trace.clone();

        let request = build_request(&record, now)?;
        let payload = request
            .to_vec()
            .map_err(|e| CommandError::Serialization(e.to_string()))?;
        let topic = device.topic(&Channel::Command(CommandLeg::Request));

        let plan = DrivePlan {
            expect: options.expect,
            retry: options.retry.unwrap_or(inner.config.retry),
            result_timeout: options.result_timeout.unwrap_or(inner.config.result_timeout),
            republish: true,
            topic,
            payload,
        };

        let handle = self.install_and_drive(key, record, plan);
        inner.capabilities.record_dispatch(&device);
        Ok(handle)
    }

    /// Submits one operation to a device group: a single publish on the
    /// group topic, one member record per supplied member, all sharing
    /// the wire id and a generated `group_id`.
    ///
    /// Group requests are not republished: members that already executed
    /// must not see the request again.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the member list is empty or the request
    /// cannot be serialized.
    pub fn submit_group(
        &self,
        group: &GroupAddress,
        members: &[DeviceAddress],
        op: impl Into<String>,
        args: Value,
        options: CommandOptions,
    ) -> Result<GroupDispatch, CommandError> {
        let op = op.into();
        let inner = &self.inner;
        if members.is_empty() {
            return Err(CommandError::Rejected("empty group member list".to_string()));
        }

        let cmd_id = options.id.clone().unwrap_or_else(CmdId::generate);
        let group_id = uuid::Uuid::new_v4().simple().to_string();
        let timeout_ms = options.timeout_ms.unwrap_or(inner.config.timeout_ms);
        let now = inner.clock.now();

        // One wire request for all members.
        let mut probe = CommandRecord::new(
            cmd_id.clone(),
            members[0].clone(),
            op.clone(),
            args.clone(),
            options.expect,
            timeout_ms,
            now,
        );
        probe.trace = options.trace.clone();
        let payload = build_request(&probe, now)?
            .to_vec()
            .map_err(|e| CommandError::Serialization(e.to_string()))?;

        let mut handles = Vec::with_capacity(members.len());
        for member in members {
            let key = (cmd_id.as_str().to_string(), member.clone());
            if inner.slots.contains_key(&key) {
                return Err(CommandError::Rejected(format!(
                    "id {cmd_id} already in flight for {member}"
                )));
            }
            let mut record = CommandRecord::new(
                cmd_id.clone(),
                member.clone(),
                op.clone(),
                args.clone(),
                options.expect,
                timeout_ms,
                now,
            );
            record.group_id = Some(group_id.clone());
            record.trace = options.trace.clone();

            let plan = DrivePlan {
                expect: options.expect,
                retry: options.retry.unwrap_or(inner.config.retry),
                result_timeout: options
                    .result_timeout
                    .unwrap_or(inner.config.result_timeout),
                republish: false,
                // The group publish happens once below; member plans
                // publish nothing themselves.
                topic: String::new(),
                payload: Vec::new(),
            };
            let handle = self.install_and_drive(key, record, plan);
            inner.capabilities.record_dispatch(member);
            handles.push(GroupMember {
                device: member.clone(),
                handle,
            });
        }

        // The single group publish.
        let message = OutboundMessage {
            topic: group.request_topic(),
            payload,
            qos: 1,
            retain: false,
        };
        if inner.outbound.try_send(message).is_err() {
            tracing::warn!(group = %group.request_topic(), "Outbound queue unavailable for group publish");
        }

        Ok(GroupDispatch {
            cmd_id,
            group_id,
            members: handles,
        })
    }

    /// Returns the record for an id targeting exactly one device.
    #[must_use]
    pub fn get(&self, cmd_id: &str) -> Option<CommandRecord> {
        let targets = self.inner.targets_by_id.get(cmd_id)?;
        match targets.as_slice() {
            [device] => {
                let key = (cmd_id.to_string(), device.clone());
                self.inner
                    .slots
                    .get(&key)
                    .map(|slot| slot.record.lock().clone())
            }
            _ => None,
        }
    }

    /// Returns every member record for an id (group downlinks).
    #[must_use]
    pub fn get_all(&self, cmd_id: &str) -> Vec<CommandRecord> {
        let Some(targets) = self.inner.targets_by_id.get(cmd_id) else {
            return Vec::new();
        };
        targets
            .iter()
            .filter_map(|device| {
                let key = (cmd_id.to_string(), device.clone());
                self.inner
                    .slots
                    .get(&key)
                    .map(|slot| slot.record.lock().clone())
            })
            .collect()
    }

    /// Requests cancellation of every in-flight record under this id.
    ///
    /// Records that already reached a terminal state are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownDevice`] if the id is unknown.
    pub fn cancel(&self, cmd_id: &str) -> Result<(), CommandError> {
        let targets = self
            .inner
            .targets_by_id
            .get(cmd_id)
            .ok_or_else(|| CommandError::UnknownDevice(cmd_id.to_string()))?
            .clone();
        for device in targets {
            let key = (cmd_id.to_string(), device);
            if let Some(slot) = self.inner.slots.get(&key) {
                let _ = slot.cancel.send(true);
            }
        }
        Ok(())
    }

    /// Routes an inbound `cmd/ack` to its command task.
    pub fn handle_ack(&self, device: &DeviceAddress, ack: CmdAck) {
        self.route_reply(device, ack.id.clone(), Reply::Ack(ack));
    }

    /// Routes an inbound `cmd/res` to its command task. Results arriving
    /// after termination are ignored and counted.
    pub fn handle_result(&self, device: &DeviceAddress, result: CmdResult) {
        self.route_reply(device, result.id.clone(), Reply::Result(result));
    }

    fn route_reply(&self, device: &DeviceAddress, id: String, reply: Reply) {
        let key = (id, device.clone());
        let Some(sender) = self.inner.inflight.get(&key).map(|s| s.clone()) else {
            self.inner.late_replies.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cmd_id = %key.0, device = %device, "Ignoring reply for terminal or unknown command");
            return;
        };
        if sender.try_send(reply).is_err() {
            tracing::warn!(cmd_id = %key.0, "Correlation queue full, dropping reply");
        }
    }

    fn install_and_drive(
        &self,
        key: CorrKey,
        record: CommandRecord,
        plan: DrivePlan,
    ) -> CommandHandle {
        let inner = &self.inner;
        let cmd_id = record.cmd_id.clone();
        let device = record.device.clone();

        let (notify, rx) = watch::channel(record.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(16);

        let slot = Arc::new(CommandSlot {
            record: parking_lot::Mutex::new(record),
            notify,
            cancel: cancel_tx,
        });

        inner.slots.insert(key.clone(), Arc::clone(&slot));
        inner.inflight.insert(key.clone(), reply_tx);
        inner
            .targets_by_id
            .entry(key.0.clone())
            .or_default()
            .push(key.1.clone());
        inner.submitted.fetch_add(1, Ordering::Relaxed);

        self.persist_slot(&slot);

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.drive(key, slot, plan, reply_rx, cancel_rx).await;
        });

        CommandHandle {
            cmd_id,
            device,
            rx,
        }
    }

    /// The per-command task: owns the ack and result timers, releases its
    /// correlation entry on exit.
    async fn drive(
        self,
        key: CorrKey,
        slot: Arc<CommandSlot>,
        plan: DrivePlan,
        mut reply_rx: mpsc::Receiver<Reply>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let inner = &self.inner;
        let device = key.1.clone();

        let terminal = 'machine: {
            // ---- ack phase ----
            let mut attempt: u32 = 0;
            let first_result: Option<CmdResult> = loop {
                if plan.republish || attempt == 0 {
                    attempt += 1;
                    if !plan.topic.is_empty() {
                        let message = OutboundMessage {
                            topic: plan.topic.clone(),
                            payload: plan.payload.clone(),
                            qos: 1,
                            retain: false,
                        };
                        if inner.outbound.send(message).await.is_err() {
                            break 'machine Terminal::LocalFailure(
                                CommandError::OutboundUnavailable,
                            );
                        }
                    }
                    self.mark_sent(&slot, attempt);
                    tracing::debug!(cmd_id = %key.0, device = %device, attempt, "Published command request");
                }

                if plan.expect == Expect::None {
                    break 'machine Terminal::Completed(None);
                }

                let wait = plan.retry.backoff_for_attempt(attempt);
                tokio::select! {
                    reply = reply_rx.recv() => match reply {
                        Some(Reply::Ack(ack)) => {
                            if ack.accepted {
                                self.mark_acked(&slot);
                                if plan.expect == Expect::Ack {
                                    break 'machine Terminal::Completed(None);
                                }
                                break None;
                            }
                            break 'machine Terminal::DeviceRejected(ack.err);
                        }
                        // A result can overtake a lost ack; treat it as an
                        // implicit ack and process it in the result phase.
                        Some(Reply::Result(result)) => {
                            self.mark_acked(&slot);
                            if plan.expect == Expect::Ack {
                                break 'machine Terminal::Completed(None);
                            }
                            break Some(result);
                        }
                        None => break 'machine Terminal::LocalFailure(
                            CommandError::OutboundUnavailable,
                        ),
                    },
                    () = tokio::time::sleep(wait) => {
                        if !plan.republish || attempt > plan.retry.max_retries {
                            break 'machine Terminal::AckTimeout(attempt);
                        }
                        tracing::debug!(cmd_id = %key.0, attempt, "Ack timer expired, republishing");
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break 'machine Terminal::Cancelled;
                        }
                    }
                }
            };

            // ---- result phase ----
            let mut pending = first_result;
            loop {
                let reply = match pending.take() {
                    Some(result) => Some(Reply::Result(result)),
                    None => {
                        tokio::select! {
                            reply = reply_rx.recv() => reply,
                            () = tokio::time::sleep(plan.result_timeout) => {
                                break 'machine Terminal::ResultTimeout;
                            }
                            _ = cancel_rx.changed() => {
                                if *cancel_rx.borrow() {
                                    break 'machine Terminal::Cancelled;
                                }
                                continue;
                            }
                        }
                    }
                };

                match reply {
                    Some(Reply::Result(result)) if result.is_progress() => {
                        // Progress extends the deadline by restarting the
                        // result timer on the next loop turn.
                        self.mark_progress(&slot, &result);
                    }
                    Some(Reply::Result(result)) => {
                        if result.ok {
                            break 'machine Terminal::Completed(Some(result));
                        }
                        break 'machine Terminal::DeviceFailed(result);
                    }
                    // Duplicate acks during the result phase are noise.
                    Some(Reply::Ack(_)) => {}
                    None => {
                        break 'machine Terminal::LocalFailure(CommandError::OutboundUnavailable);
                    }
                }
            }
        };

        self.finish(&key, &slot, terminal).await;
    }

    fn mark_sent(&self, slot: &CommandSlot, attempt: u32) {
        let snapshot = {
            let mut record = slot.record.lock();
            record.attempts = attempt;
            if record.status == CommandStatus::Pending {
                record.status = CommandStatus::Sent;
                record.sent_at = Some(self.inner.clock.now());
            }
            record.clone()
        };
        let _ = slot.notify.send(snapshot);
        self.persist_slot(slot);
    }

    fn mark_acked(&self, slot: &CommandSlot) {
        let snapshot = {
            let mut record = slot.record.lock();
            if record.status == CommandStatus::Sent {
                record.status = CommandStatus::Acked;
                record.acked_at = Some(self.inner.clock.now());
            }
            record.clone()
        };
        let _ = slot.notify.send(snapshot);
        self.persist_slot(slot);
    }

    fn mark_progress(&self, slot: &CommandSlot, result: &CmdResult) {
        let snapshot = {
            let mut record = slot.record.lock();
            record.progress = result.progress.clone();
            record.clone()
        };
        tracing::debug!(cmd_id = %snapshot.cmd_id, progress = ?snapshot.progress, "Command progress");
        let _ = slot.notify.send(snapshot);
    }

    async fn finish(&self, key: &CorrKey, slot: &CommandSlot, terminal: Terminal) {
        let inner = &self.inner;
        // Stop correlation first: replies from here on are late.
        inner.inflight.remove(key);

        let now = inner.clock.now();
        let snapshot = {
            let mut record = slot.record.lock();
            if record.is_terminal() {
                return;
            }
            record.completed_at = Some(now);
            match terminal {
                Terminal::Completed(result) => {
                    record.status = CommandStatus::Completed;
                    record.ok = Some(true);
                    if let Some(result) = result {
                        record.result = result.result;
                        record.execution = result.execution;
                        record.metadata = result.metadata;
                    }
                }
                Terminal::DeviceRejected(err) => {
                    record.status = CommandStatus::Failed;
                    record.ok = Some(false);
                    record.failure = Some("rejected".to_string());
                    record.err = err;
                }
                Terminal::DeviceFailed(result) => {
                    record.status = CommandStatus::Failed;
                    record.ok = Some(false);
                    record.err = result.err;
                    record.execution = result.execution;
                    record.metadata = result.metadata;
                }
                Terminal::AckTimeout(attempts) => {
                    record.status = CommandStatus::Timeout;
                    record.attempts = attempts;
                    record.failure = Some("ack timeout".to_string());
                }
                Terminal::ResultTimeout => {
                    record.status = CommandStatus::Timeout;
                    record.failure = Some("result timeout".to_string());
                }
                Terminal::Cancelled => {
                    record.status = CommandStatus::Cancelled;
                    record.failure = Some("cancelled".to_string());
                }
                Terminal::LocalFailure(err) => {
                    record.status = CommandStatus::Failed;
                    record.failure = Some(err.to_string());
                }
            }
            record.clone()
        };

        match snapshot.status {
            CommandStatus::Completed => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Best effort: tell the device to stop work we no longer want.
        if snapshot.status == CommandStatus::Cancelled {
            self.publish_cancel_op(&snapshot).await;
        }

        tracing::info!(
            cmd_id = %snapshot.cmd_id,
            device = %snapshot.device,
            status = %snapshot.status,
            "Command finished"
        );
        let _ = slot.notify.send(snapshot.clone());
        self.persist_slot(slot);
        inner.bus.publish(ControllerEvent::CommandFinished {
            cmd_id: snapshot.cmd_id.as_str().to_string(),
            addr: snapshot.device.clone(),
            status: snapshot.status,
        });
    }

    async fn publish_cancel_op(&self, record: &CommandRecord) {
        let inner = &self.inner;
        if inner
            .capabilities
            .check_capability(&record.device, "cmd.cancel")
            .is_err()
        {
            return;
        }
        let Ok(schema) = SchemaId::new("cmd.cancel", 1, 0) else {
            return;
        };
        let request = CmdRequest {
            id: CmdId::generate().as_str().to_string(),
            op: "cmd.cancel".to_string(),
            schema,
            args: serde_json::json!({ "id": record.cmd_id.as_str() }),
            timeout_ms: record.timeout_ms,
            expect: Expect::None,
            reply_to: None,
            ts: inner.clock.now(),
            trace: record.trace.clone(),
        };
        let Ok(payload) = request.to_vec() else {
            return;
        };
        let message = OutboundMessage {
            topic: record.device.topic(&Channel::Command(CommandLeg::Request)),
            payload,
            qos: 1,
            retain: false,
        };
        let _ = inner.outbound.send(message).await;
    }

    fn persist_slot(&self, slot: &CommandSlot) {
        let record = slot.record.lock().clone();
        let key = keys::command(record.cmd_id.as_str());
        if let Err(e) = store_json(self.inner.store.as_ref(), &key, &record) {
            tracing::warn!(cmd_id = %record.cmd_id, error = %e, "Failed to persist command record");
        }
    }
}

enum Terminal {
    Completed(Option<CmdResult>),
    DeviceRejected(Option<crate::codec::ErrorInfo>),
    DeviceFailed(CmdResult),
    AckTimeout(u32),
    ResultTimeout,
    Cancelled,
    LocalFailure(CommandError),
}

struct DrivePlan {
    expect: Expect,
    retry: RetryPolicy,
    result_timeout: Duration,
    republish: bool,
    topic: String,
    payload: Vec<u8>,
}

fn build_request(
    record: &CommandRecord,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<CmdRequest, CommandError> {
    let schema_name = format!("cmd.{}", record.op.replace('.', "_"));
    let schema = SchemaId::new(schema_name, 1, 0)
        .map_err(|e| CommandError::Serialization(e.to_string()))?;
    Ok(CmdRequest {
        id: record.cmd_id.as_str().to_string(),
        op: record.op.clone(),
        schema,
        args: record.args.clone(),
        timeout_ms: record.timeout_ms,
        expect: record.expect,
        reply_to: None,
        ts: now,
        trace: record.trace.clone(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{CapabilitySource, CommandError, DeviceAddress, OnlineState};

    /// Capability source that accepts everything and reports online.
    #[derive(Debug, Default)]
    pub struct OpenGate;

    impl CapabilitySource for OpenGate {
        fn check_capability(&self, _: &DeviceAddress, _: &str) -> Result<(), CommandError> {
            Ok(())
        }

        fn online_state(&self, _: &DeviceAddress) -> Option<OnlineState> {
            Some(OnlineState::Online)
        }

        fn record_dispatch(&self, _: &DeviceAddress) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use test_support::OpenGate;

    fn addr() -> DeviceAddress {
        DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap()
    }

    fn setup(
        config: DispatcherConfig,
    ) -> (
        CommandDispatcher,
        mpsc::Receiver<OutboundMessage>,
        Arc<MemoryStore>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let dispatcher = CommandDispatcher::new(
            tx,
            Arc::new(OpenGate),
            store.clone(),
            clock,
            EventBus::new(),
            config,
        );
        (dispatcher, rx, store)
    }

    fn ack_for(req: &CmdRequest, accepted: bool) -> CmdAck {
        CmdAck {
            id: req.id.clone(),
            ts: Utc::now(),
            accepted,
            err: None,
        }
    }

    fn final_result(id: &str, ok: bool) -> CmdResult {
        CmdResult {
            id: id.to_string(),
            ts: Utc::now(),
            ok,
            result: Some(serde_json::json!({"done": true})),
            progress: None,
            err: if ok {
                None
            } else {
                Some(crate::codec::ErrorInfo {
                    code: "E_FAIL".to_string(),
                    msg: "failed".to_string(),
                })
            },
            execution: None,
            metadata: None,
            trace: None,
        }
    }

    fn parse_outbound(message: &OutboundMessage) -> CmdRequest {
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_ack_then_result() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(
                addr(),
                "light.set",
                serde_json::json!({"on": true, "brightness": 80}),
                CommandOptions::default(),
            )
            .unwrap();

        let published = outbound.recv().await.unwrap();
        assert!(published.topic.ends_with("/cmd/req"));
        let req = parse_outbound(&published);
        assert_eq!(req.op, "light.set");
        assert_eq!(req.schema.to_string(), "cmd.light_set/1.0");

        dispatcher.handle_ack(&addr(), ack_for(&req, true));
        dispatcher.handle_result(&addr(), final_result(&req.id, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.ok, Some(true));
        assert_eq!(record.result.unwrap()["done"], true);
        assert!(record.sent_at.is_some());
        assert!(record.acked_at.is_some());
        assert!(record.completed_at.is_some());
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_ack_republishes_same_id() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();

        let first = parse_outbound(&outbound.recv().await.unwrap());
        // Ack never arrives; 500 ms later the same payload goes out again.
        let second = parse_outbound(&outbound.recv().await.unwrap());
        assert_eq!(first.id, second.id);
        assert_eq!(first.args, second.args);

        // Device acks the retry and completes.
        dispatcher.handle_ack(&addr(), ack_for(&second, true));
        dispatcher.handle_result(&addr(), final_result(&second.id, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_after_retries() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();

        // Initial publish + 3 retries.
        for _ in 0..4 {
            assert!(outbound.recv().await.is_some());
        }

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Timeout);
        assert_eq!(record.attempts, 4);
        assert!(record.acked_at.is_none());
        assert!(matches!(
            record.terminal_error(),
            Some(CommandError::AckTimeout { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_ack_is_terminal() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());

        let mut ack = ack_for(&req, false);
        ack.err = Some(crate::codec::ErrorInfo {
            code: "busy".to_string(),
            msg: "device busy".to_string(),
        });
        dispatcher.handle_ack(&addr(), ack);

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.err.unwrap().code, "busy");

        // No republish happened.
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn result_timeout_is_terminal() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig {
            result_timeout: Duration::from_secs(2),
            ..DispatcherConfig::default()
        });

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Timeout);
        assert!(record.acked_at.is_some());
        assert!(matches!(
            record.terminal_error(),
            Some(CommandError::ResultTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_extends_result_deadline() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig {
            result_timeout: Duration::from_secs(2),
            ..DispatcherConfig::default()
        });

        let mut handle = dispatcher
            .submit(addr(), "fw.update", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));

        // Three progress reports, each ~1.5 s apart: without the deadline
        // extension the 2 s result timer would have fired.
        for pct in [25, 50, 75] {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let mut progress = final_result(&req.id, true);
            progress.progress = Some(crate::codec::Progress::Percent(f64::from(pct)));
            dispatcher.handle_result(&addr(), progress);
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        dispatcher.handle_result(&addr(), final_result(&req.id, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(
            record.progress,
            Some(crate::codec::Progress::Percent(75.0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_terminal_is_ignored() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));
        dispatcher.handle_result(&addr(), final_result(&req.id, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);

        // A contradictory late result must not mutate the record.
        dispatcher.handle_result(&addr(), final_result(&req.id, false));
        tokio::task::yield_now().await;

        let after = dispatcher.get(&req.id).unwrap();
        assert_eq!(after.status, CommandStatus::Completed);
        assert_eq!(after.ok, Some(true));
        assert_eq!(dispatcher.stats().late_replies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_id_resubmission_is_idempotent() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());
        let id = CmdId::from_caller("11112222333344445555666677778888");

        let mut handle = dispatcher
            .submit(
                addr(),
                "light.set",
                serde_json::json!({}),
                CommandOptions {
                    id: Some(id.clone()),
                    ..CommandOptions::default()
                },
            )
            .unwrap();

        let req = parse_outbound(&outbound.recv().await.unwrap());
        assert_eq!(req.id, id.as_str());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));
        dispatcher.handle_result(&addr(), final_result(&req.id, true));
        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);

        // Resubmit with the same id: no new publish, the recorded result
        // comes back.
        let mut second = dispatcher
            .submit(
                addr(),
                "light.set",
                serde_json::json!({}),
                CommandOptions {
                    id: Some(id),
                    ..CommandOptions::default()
                },
            )
            .unwrap();
        let replay = second.wait().await;
        assert_eq!(replay.status, CommandStatus::Completed);
        assert!(outbound.try_recv().is_err());
        assert_eq!(dispatcher.stats().submitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_non_terminal() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());

        dispatcher.cancel(&req.id).unwrap();
        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Cancelled);
        assert!(matches!(
            record.terminal_error(),
            Some(CommandError::Cancelled)
        ));

        // Cancelling again (terminal) changes nothing.
        dispatcher.cancel(&req.id).unwrap();
        assert_eq!(
            dispatcher.get(&req.id).unwrap().status,
            CommandStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expect_none_completes_after_publish() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(
                addr(),
                "buzzer.beep",
                serde_json::json!({}),
                CommandOptions {
                    expect: Expect::None,
                    ..CommandOptions::default()
                },
            )
            .unwrap();

        assert!(outbound.recv().await.is_some());
        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn expect_ack_completes_on_ack() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(
                addr(),
                "light.set",
                serde_json::json!({}),
                CommandOptions {
                    expect: Expect::Ack,
                    ..CommandOptions::default()
                },
            )
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert!(record.acked_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn result_before_ack_counts_as_implicit_ack() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());

        // The ack is lost entirely; the final result still resolves it.
        dispatcher.handle_result(&addr(), final_result(&req.id, true));

        let record = handle.wait().await;
        assert_eq!(record.status, CommandStatus::Completed);
        assert!(record.acked_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn group_dispatch_correlates_per_member() {
        let (dispatcher, mut outbound, _) = setup(DispatcherConfig::default());
        let group = GroupAddress::new("office", "floor1", "lights").unwrap();
        let member_a = DeviceAddress::new("office", "floor1", "aabbccddee01").unwrap();
        let member_b = DeviceAddress::new("office", "floor1", "aabbccddee02").unwrap();

        let mut dispatch = dispatcher
            .submit_group(
                &group,
                &[member_a.clone(), member_b.clone()],
                "light.set",
                serde_json::json!({"on": false}),
                CommandOptions::default(),
            )
            .unwrap();

        // Exactly one publish, on the group topic.
        let published = outbound.recv().await.unwrap();
        assert_eq!(published.topic, "rtk/v1/office/floor1/group/lights/cmd/req");
        let req = parse_outbound(&published);
        assert!(outbound.try_recv().is_err());

        // Each member replies on its own topic with the shared id.
        dispatcher.handle_ack(&member_a, ack_for(&req, true));
        dispatcher.handle_result(&member_a, final_result(&req.id, true));
        dispatcher.handle_ack(&member_b, ack_for(&req, true));
        dispatcher.handle_result(&member_b, final_result(&req.id, false));

        let mut statuses = Vec::new();
        for member in &mut dispatch.members {
            statuses.push(member.handle.wait().await.status);
        }
        assert_eq!(statuses, vec![CommandStatus::Completed, CommandStatus::Failed]);

        let records = dispatcher.get_all(req.id.as_str());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.group_id.is_some()));
        // A shared id across two members is not a unicast record.
        assert!(dispatcher.get(&req.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_persisted() {
        let (dispatcher, mut outbound, store) = setup(DispatcherConfig::default());

        let mut handle = dispatcher
            .submit(addr(), "light.set", serde_json::json!({}), CommandOptions::default())
            .unwrap();
        let req = parse_outbound(&outbound.recv().await.unwrap());
        dispatcher.handle_ack(&addr(), ack_for(&req, true));
        dispatcher.handle_result(&addr(), final_result(&req.id, true));
        handle.wait().await;

        let key = keys::command(&req.id);
        let stored: CommandRecord = crate::storage::load_json(store.as_ref(), &key)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
    }
}
