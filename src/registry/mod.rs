// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry: identity, state, attributes, capabilities, liveness.
//!
//! The registry exclusively owns device records. Each record sits behind
//! its own `parking_lot::RwLock` inside a concurrent map, so per-device
//! updates never contend across devices and no lock is held across a
//! suspension point. Records are written through to the store after
//! every applied change; identity survives restarts, while reloaded
//! liveness is advisory until fresh traffic or an LWT arrives.

mod device;
mod identity;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::codec::Decoded;
use crate::error::{CommandError, Error, StorageError};
use crate::event::{ControllerEvent, EventBus};
use crate::storage::{SharedStore, keys, store_json};
use crate::topic::DeviceAddress;

pub use device::{
    ApplyOutcome, AttrSnapshot, CapabilityCache, DeviceCounters, DeviceIdentity, DeviceRecord,
    Liveness, OnlineState, OpaqueSnapshot, StateSnapshot,
};
pub use identity::{
    DetectedIdentity, DetectionRule, IdentityDetector, IdentityHints, default_rules,
};

/// Registry configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Silence span after which liveness degrades to unknown.
    /// Default 120 s (3 × the default state publish interval, floored).
    pub offline_threshold: Duration,
    /// How often the silent sweeper runs. Default 30 s.
    pub sweep_interval: Duration,
    /// Capability cache TTL used by the dispatcher. Default 24 h.
    pub capability_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            offline_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            capability_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Filter for [`DeviceRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Only devices in this tenant.
    pub tenant: Option<String>,
    /// Only devices in this site.
    pub site: Option<String>,
    /// Only devices with this identity type.
    pub device_type: Option<String>,
    /// Only devices in this liveness state.
    pub online: Option<OnlineState>,
    /// Only devices carrying this tag.
    pub tag: Option<String>,
}

impl DeviceFilter {
    fn matches(&self, record: &DeviceRecord) -> bool {
        if let Some(tenant) = &self.tenant {
            if &record.addr.tenant != tenant {
                return false;
            }
        }
        if let Some(site) = &self.site {
            if &record.addr.site != site {
                return false;
            }
        }
        if let Some(device_type) = &self.device_type {
            if record.identity.device_type.as_ref() != Some(device_type) {
                return false;
            }
        }
        if let Some(online) = self.online {
            if record.liveness.online != online {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.identity.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// Manual identity update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    /// New friendly name.
    pub friendly_name: Option<String>,
    /// New device type.
    pub device_type: Option<String>,
    /// New manufacturer.
    pub manufacturer: Option<String>,
    /// New model.
    pub model: Option<String>,
    /// New location.
    pub location: Option<String>,
    /// New owner.
    pub owner: Option<String>,
    /// Replacement tag list.
    pub tags: Option<Vec<String>>,
}

/// One row of a bulk identity import.
#[derive(Debug, Clone)]
pub struct IdentityImport {
    /// Tenant identifier.
    pub tenant: String,
    /// Site identifier.
    pub site: String,
    /// Device id (12 lowercase hex).
    pub device_id: String,
    /// The identity fields to apply.
    pub update: IdentityUpdate,
}

/// Per-row outcome of a bulk import.
#[derive(Debug)]
pub struct ImportOutcome {
    /// The row's device id as given.
    pub device_id: String,
    /// Success, or the failure reason.
    pub result: Result<(), Error>,
}

/// The device registry.
pub struct DeviceRegistry {
    devices: DashMap<DeviceAddress, Arc<RwLock<DeviceRecord>>>,
    store: SharedStore,
    clock: SharedClock,
    bus: EventBus,
    detector: IdentityDetector,
    config: RegistryConfig,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Creates a registry with the built-in detection rules.
    #[must_use]
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        bus: EventBus,
        config: RegistryConfig,
    ) -> Self {
        Self {
            devices: DashMap::new(),
            store,
            clock,
            bus,
            detector: IdentityDetector::with_default_rules(),
            config,
        }
    }

    /// Replaces the detection rule set.
    #[must_use]
    pub fn with_detector(mut self, detector: IdentityDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Returns the configured capability TTL.
    #[must_use]
    pub const fn capability_ttl(&self) -> Duration {
        self.config.capability_ttl
    }

    /// Loads persisted device records.
    ///
    /// Reloaded liveness is advisory: the load instant becomes the
    /// sweeper's reference floor.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the scan fails. Individual unreadable
    /// records are skipped with a warning.
    pub fn load_persisted(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let mut loaded = 0;
        for (key, bytes) in self.store.scan(keys::DEVICE_PREFIX, None, None)? {
            match serde_json::from_slice::<DeviceRecord>(&bytes) {
                Ok(mut record) => {
                    record.loaded_at = Some(now);
                    self.devices
                        .insert(record.addr.clone(), Arc::new(RwLock::new(record)));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable device record");
                }
            }
        }
        tracing::info!(loaded, "Loaded device records");
        Ok(loaded)
    }

    /// Returns the number of known devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns a snapshot of one device record.
    #[must_use]
    pub fn get(&self, addr: &DeviceAddress) -> Option<DeviceRecord> {
        self.devices.get(addr).map(|entry| entry.read().clone())
    }

    /// Lists device records matching the filter.
    #[must_use]
    pub fn list(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter_map(|entry| {
                let record = entry.value().read();
                filter.matches(&record).then(|| record.clone())
            })
            .collect();
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }

    /// Returns the device's liveness, if known.
    #[must_use]
    pub fn online_state(&self, addr: &DeviceAddress) -> Option<OnlineState> {
        self.devices
            .get(addr)
            .map(|entry| entry.read().liveness.online)
    }

    /// Applies a decoded inbound message to the owning device record.
    ///
    /// Creates the record on first contact (an LWT with no prior state is
    /// a valid first contact). The record is written through to the store
    /// after every change.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write-through fails; the in-memory
    /// record is already updated in that case.
    pub fn ingest(
        &self,
        addr: &DeviceAddress,
        decoded: &Decoded,
        has_validation_errors: bool,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let entry = self.ensure_device(addr);

        let (outcome, snapshot) = {
            let mut record = entry.write();
            let outcome = match decoded {
                Decoded::Lwt(lwt) => record.apply_lwt(lwt, now),
                Decoded::State { envelope, report } => {
                    let mut outcome = record.touch(envelope.ts, now);
                    outcome.snapshot_replaced =
                        record.apply_state(envelope.ts, report.clone(), has_validation_errors);
                    outcome
                }
                Decoded::Attr { envelope, report } => {
                    let mut outcome = record.touch(envelope.ts, now);
                    outcome.snapshot_replaced = record.apply_attr(
                        envelope.ts,
                        report.clone(),
                        has_validation_errors,
                        now,
                    );
                    outcome
                }
                Decoded::Telemetry { envelope, .. } => record.touch(envelope.ts, now),
                Decoded::Event { envelope, .. } => {
                    let outcome = record.touch(envelope.ts, now);
                    record.counters.events += 1;
                    outcome
                }
                Decoded::CmdAck(ack) => record.touch(ack.ts, now),
                Decoded::CmdResult(res) => record.touch(res.ts, now),
                Decoded::Topology { kind, envelope } => {
                    let outcome = record.touch(envelope.ts, now);
                    record.apply_topology(
                        kind.as_str(),
                        OpaqueSnapshot {
                            ts: envelope.ts,
                            schema: envelope.schema.to_string(),
                            payload: envelope.payload.clone(),
                        },
                    );
                    outcome
                }
                Decoded::Diagnostics { kind, envelope } => {
                    let outcome = record.touch(envelope.ts, now);
                    record.apply_diagnostics(
                        kind,
                        OpaqueSnapshot {
                            ts: envelope.ts,
                            schema: envelope.schema.to_string(),
                            payload: envelope.payload.clone(),
                        },
                    );
                    outcome
                }
                Decoded::Unknown { .. } => record.touch(now, now),
            };
            (outcome, record.clone())
        };

        if outcome.went_online {
            self.bus.publish(ControllerEvent::DeviceOnline {
                addr: addr.clone(),
                ts: snapshot.liveness.transition_ts,
            });
        }
        if outcome.went_offline {
            self.bus.publish(ControllerEvent::DeviceOffline {
                addr: addr.clone(),
                ts: snapshot.liveness.transition_ts,
                reason: snapshot
                    .liveness
                    .last_will
                    .as_ref()
                    .and_then(|lwt| lwt.reason.clone()),
            });
        }

        self.persist(&snapshot)
    }

    /// Increments the command counter for a device.
    pub fn record_command_dispatch(&self, addr: &DeviceAddress) {
        if let Some(entry) = self.devices.get(addr) {
            entry.write().counters.commands += 1;
        }
    }

    /// Checks whether the device declares support for `op` and the
    /// capability cache is fresh.
    ///
    /// # Errors
    ///
    /// - [`CommandError::UnknownDevice`] when the device is not registered;
    /// - [`CommandError::CapabilityExpired`] when the cache is missing or
    ///   older than the TTL;
    /// - [`CommandError::CapabilityUnsupported`] when `op` is absent.
    pub fn check_capability(&self, addr: &DeviceAddress, op: &str) -> Result<(), CommandError> {
        let entry = self
            .devices
            .get(addr)
            .ok_or_else(|| CommandError::UnknownDevice(addr.to_string()))?;
        let record = entry.read();

        let caps = record.capabilities.as_ref().ok_or_else(|| {
            CommandError::CapabilityExpired {
                device: addr.device_id.to_string(),
                age_secs: u64::MAX,
            }
        })?;

        let age = self.clock.now() - caps.refreshed_at;
        let ttl = chrono::Duration::from_std(self.config.capability_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        if age > ttl {
            return Err(CommandError::CapabilityExpired {
                device: addr.device_id.to_string(),
                age_secs: age.num_seconds().max(0).unsigned_abs(),
            });
        }

        if !caps.capabilities.contains_key(op) {
            return Err(CommandError::CapabilityUnsupported {
                device: addr.device_id.to_string(),
                op: op.to_string(),
            });
        }
        Ok(())
    }

    /// Applies a manual identity update. Manual entries always win over
    /// auto-detected ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] for unknown devices or a storage
    /// error if the write-through fails.
    pub fn set_identity(&self, addr: &DeviceAddress, update: IdentityUpdate) -> Result<(), Error> {
        let entry = self.devices.get(addr).ok_or(Error::DeviceNotFound)?;
        let snapshot = {
            let mut record = entry.write();
            apply_identity_update(&mut record.identity, update);
            record.identity.auto_detected = false;
            record.identity.confidence = None;
            record.clone()
        };
        drop(entry);
        self.persist(&snapshot)?;
        Ok(())
    }

    /// Bulk identity import with per-row outcomes. Rows for unknown
    /// devices create the record (identity is durable even before first
    /// contact).
    pub fn import_identities(&self, rows: Vec<IdentityImport>) -> Vec<ImportOutcome> {
        rows.into_iter()
            .map(|row| {
                let device_id = row.device_id.clone();
                let result = self.import_row(row);
                ImportOutcome { device_id, result }
            })
            .collect()
    }

    fn import_row(&self, row: IdentityImport) -> Result<(), Error> {
        let addr = DeviceAddress::new(row.tenant, row.site, row.device_id)?;
        let entry = self.ensure_device(&addr);
        let snapshot = {
            let mut record = entry.write();
            apply_identity_update(&mut record.identity, row.update);
            record.identity.auto_detected = false;
            record.identity.confidence = None;
            record.clone()
        };
        self.persist(&snapshot)?;
        Ok(())
    }

    /// Runs identity auto-detection for a device. Does nothing when the
    /// record carries manual identity.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write-through fails.
    pub fn auto_detect(
        &self,
        addr: &DeviceAddress,
        hints: &IdentityHints,
    ) -> Result<Option<DetectedIdentity>, Error> {
        let entry = self.devices.get(addr).ok_or(Error::DeviceNotFound)?;

        let detected = {
            let record = entry.read();
            if record.identity.is_manual() {
                return Ok(None);
            }
            self.detector.detect(&addr.device_id, hints)
        };

        let Some(detected) = detected else {
            return Ok(None);
        };

        let snapshot = {
            let mut record = entry.write();
            // A stronger earlier detection sticks.
            if record
                .identity
                .confidence
                .is_some_and(|existing| existing >= detected.confidence)
            {
                return Ok(Some(detected));
            }
            record.identity.device_type = Some(detected.device_type.clone());
            record.identity.manufacturer = detected.manufacturer.clone();
            record.identity.auto_detected = true;
            record.identity.confidence = Some(detected.confidence);
            record.clone()
        };
        drop(entry);
        self.persist(&snapshot)?;
        Ok(Some(detected))
    }

    /// Degrades liveness to unknown for devices silent past the
    /// threshold and emits `device.silent` for each.
    ///
    /// Returns the affected addresses.
    pub fn sweep_silent(&self) -> Vec<DeviceAddress> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.offline_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut silent = Vec::new();
        for entry in &self.devices {
            let mut record = entry.value().write();
            if record.liveness.online == OnlineState::Online
                && now - record.liveness_floor() > threshold
            {
                record.liveness.online = OnlineState::Unknown;
                silent.push((record.addr.clone(), record.clone()));
            }
        }

        let mut addrs = Vec::with_capacity(silent.len());
        for (addr, snapshot) in silent {
            tracing::info!(device = %addr, "Device went silent");
            self.bus.publish(ControllerEvent::DeviceSilent {
                addr: addr.clone(),
                last_seen: snapshot.liveness.last_seen,
            });
            if let Err(e) = self.persist(&snapshot) {
                tracing::warn!(device = %addr, error = %e, "Failed to persist silent transition");
            }
            addrs.push(addr);
        }
        addrs
    }

    /// Spawns the periodic silent sweeper.
    #[must_use]
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.sweep_silent();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn ensure_device(&self, addr: &DeviceAddress) -> Arc<RwLock<DeviceRecord>> {
        if let Some(entry) = self.devices.get(addr) {
            return Arc::clone(entry.value());
        }
        let created = Arc::new(RwLock::new(DeviceRecord::new(addr.clone(), self.clock.now())));
        let entry = self
            .devices
            .entry(addr.clone())
            .or_insert_with(|| Arc::clone(&created));
        let arc = Arc::clone(entry.value());
        drop(entry);
        if Arc::ptr_eq(&arc, &created) {
            tracing::debug!(device = %addr, "Registered new device");
            self.bus
                .publish(ControllerEvent::DeviceAdded { addr: addr.clone() });
        }
        arc
    }

    fn persist(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        store_json(self.store.as_ref(), &keys::device(&record.addr), record)
    }
}

fn apply_identity_update(identity: &mut DeviceIdentity, update: IdentityUpdate) {
    if let Some(name) = update.friendly_name {
        identity.friendly_name = Some(name);
    }
    if let Some(device_type) = update.device_type {
        identity.device_type = Some(device_type);
    }
    if let Some(manufacturer) = update.manufacturer {
        identity.manufacturer = Some(manufacturer);
    }
    if let Some(model) = update.model {
        identity.model = Some(model);
    }
    if let Some(location) = update.location {
        identity.location = Some(location);
    }
    if let Some(owner) = update.owner {
        identity.owner = Some(owner);
    }
    if let Some(tags) = update.tags {
        identity.tags = tags;
    }
}
