// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device records and their transition rules.
//!
//! The transition logic lives on [`DeviceRecord`] as pure methods so the
//! invariants (monotonic `last_seen`, strictly-greater-`ts` snapshot
//! replacement, LWT timestamp arbitration) are testable without the
//! registry plumbing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{AttrReport, CapabilityDecl, LwtState, LwtStatus, StateReport, ts_format};
use crate::topic::DeviceAddress;

/// Device liveness as tracked by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineState {
    /// Traffic or an online LWT was seen recently.
    Online,
    /// An offline LWT is authoritative.
    Offline,
    /// Nothing was heard within the offline threshold.
    #[default]
    Unknown,
}

/// Device identity fields. Manual entries always win over auto-detected
/// ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Operator- or detector-assigned display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    /// Device category (`router`, `sensor`, `client`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Manufacturer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Physical location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Whether the identity came from the detection pipeline.
    #[serde(default)]
    pub auto_detected: bool,
    /// Detection confidence, if auto-detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DeviceIdentity {
    /// Returns `true` if an operator set any field by hand.
    #[must_use]
    pub fn is_manual(&self) -> bool {
        !self.auto_detected
            && (self.friendly_name.is_some()
                || self.device_type.is_some()
                || self.manufacturer.is_some()
                || self.model.is_some()
                || self.location.is_some()
                || self.owner.is_some()
                || !self.tags.is_empty())
    }
}

/// Liveness tracking fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liveness {
    /// Current liveness.
    pub online: OnlineState,
    /// Last time any traffic was observed.
    #[serde(with = "ts_format")]
    pub last_seen: DateTime<Utc>,
    /// First time any traffic was observed.
    #[serde(with = "ts_format")]
    pub first_seen: DateTime<Utc>,
    /// Timestamp that established the current `online` value; used to
    /// arbitrate between out-of-order LWT messages and device traffic.
    #[serde(with = "ts_format")]
    pub transition_ts: DateTime<Utc>,
    /// Snapshot of the last applied LWT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_will: Option<LwtStatus>,
}

/// The retained `state` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Device-side timestamp of the snapshot.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// The decoded report.
    pub report: StateReport,
    /// Lenient-mode validation marker.
    #[serde(default)]
    pub has_validation_errors: bool,
}

/// The retained `attr` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrSnapshot {
    /// Device-side timestamp of the snapshot.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// The decoded report.
    pub report: AttrReport,
    /// Lenient-mode validation marker.
    #[serde(default)]
    pub has_validation_errors: bool,
}

/// Capability cache derived from `attr.capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCache {
    /// Declared capabilities keyed by operation name.
    pub capabilities: HashMap<String, CapabilityDecl>,
    /// When the cache was last refreshed (ingest side); drives the
    /// dispatcher's staleness check.
    #[serde(with = "ts_format")]
    pub refreshed_at: DateTime<Utc>,
}

/// An opaque-by-schema retained blob (topology, diagnostics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueSnapshot {
    /// Device-side timestamp.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Schema id the payload was published under.
    pub schema: String,
    /// The raw payload; consumers introspect by schema name.
    pub payload: Value,
}

/// Per-device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounters {
    /// Events ingested from this device.
    pub events: u64,
    /// Commands dispatched to this device.
    pub commands: u64,
}

/// One device record, owned exclusively by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// The device address. Immutable.
    pub addr: DeviceAddress,
    /// Identity fields.
    #[serde(default)]
    pub identity: DeviceIdentity,
    /// Liveness tracking.
    pub liveness: Liveness,
    /// Retained state snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSnapshot>,
    /// Retained attribute snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<AttrSnapshot>,
    /// Capability cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityCache>,
    /// Topology blobs keyed by sub-type segment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub topology: HashMap<String, OpaqueSnapshot>,
    /// Diagnostics blobs keyed by kind segment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub diagnostics: HashMap<String, OpaqueSnapshot>,
    /// Counters.
    #[serde(default)]
    pub counters: DeviceCounters,
    /// When this record was loaded from storage after a restart. Not
    /// persisted; the silent sweeper uses it as a liveness floor so a
    /// reloaded record is advisory until fresh traffic arrives.
    #[serde(skip)]
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Outcome of applying an inbound message to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    /// The retained snapshot (state/attr/...) was replaced.
    pub snapshot_replaced: bool,
    /// Liveness flipped to online.
    pub went_online: bool,
    /// Liveness flipped to offline.
    pub went_offline: bool,
}

impl DeviceRecord {
    /// Creates an empty record for a device first seen at `now`.
    #[must_use]
    pub fn new(addr: DeviceAddress, now: DateTime<Utc>) -> Self {
        Self {
            addr,
            identity: DeviceIdentity::default(),
            liveness: Liveness {
                online: OnlineState::Unknown,
                last_seen: now,
                first_seen: now,
                transition_ts: DateTime::UNIX_EPOCH,
                last_will: None,
            },
            state: None,
            attrs: None,
            capabilities: None,
            topology: HashMap::new(),
            diagnostics: HashMap::new(),
            counters: DeviceCounters::default(),
            loaded_at: None,
        }
    }

    /// Marks traffic from the device: `last_seen` advances monotonically
    /// and liveness flips to online when the message timestamp beats the
    /// timestamp that established the current liveness value.
    pub fn touch(&mut self, message_ts: DateTime<Utc>, ingest_now: DateTime<Utc>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if ingest_now > self.liveness.last_seen {
            self.liveness.last_seen = ingest_now;
        }
        if message_ts > self.liveness.transition_ts {
            if self.liveness.online != OnlineState::Online {
                outcome.went_online = true;
            }
            self.liveness.online = OnlineState::Online;
            self.liveness.transition_ts = message_ts;
        }
        outcome
    }

    /// Applies an LWT. The LWT is authoritative for liveness, arbitrated
    /// by timestamp: an offline older than the timestamp that established
    /// the current state is discarded.
    pub fn apply_lwt(&mut self, lwt: &LwtStatus, ingest_now: DateTime<Utc>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if ingest_now > self.liveness.last_seen {
            self.liveness.last_seen = ingest_now;
        }
        if lwt.ts <= self.liveness.transition_ts {
            tracing::debug!(
                device = %self.addr,
                lwt_ts = %lwt.ts,
                current_ts = %self.liveness.transition_ts,
                "Discarding stale LWT"
            );
            return outcome;
        }

        let next = match lwt.status {
            LwtState::Online => OnlineState::Online,
            LwtState::Offline => OnlineState::Offline,
        };
        match (self.liveness.online, next) {
            (OnlineState::Online, OnlineState::Offline) => outcome.went_offline = true,
            (OnlineState::Offline | OnlineState::Unknown, OnlineState::Online) => {
                outcome.went_online = true;
            }
            (OnlineState::Unknown, OnlineState::Offline) => outcome.went_offline = true,
            _ => {}
        }
        self.liveness.online = next;
        self.liveness.transition_ts = lwt.ts;
        self.liveness.last_will = Some(lwt.clone());
        outcome
    }

    /// Replaces the state snapshot if the incoming `ts` is strictly
    /// greater than the stored one.
    pub fn apply_state(
        &mut self,
        ts: DateTime<Utc>,
        report: StateReport,
        has_validation_errors: bool,
    ) -> bool {
        if let Some(current) = &self.state {
            if ts <= current.ts {
                tracing::debug!(
                    device = %self.addr,
                    incoming = %ts,
                    stored = %current.ts,
                    "Discarding stale state snapshot"
                );
                return false;
            }
        }
        self.state = Some(StateSnapshot {
            ts,
            report,
            has_validation_errors,
        });
        true
    }

    /// Replaces the attr snapshot (same strictly-greater rule) and
    /// refreshes the capability cache.
    pub fn apply_attr(
        &mut self,
        ts: DateTime<Utc>,
        report: AttrReport,
        has_validation_errors: bool,
        ingest_now: DateTime<Utc>,
    ) -> bool {
        if let Some(current) = &self.attrs {
            if ts <= current.ts {
                tracing::debug!(
                    device = %self.addr,
                    incoming = %ts,
                    stored = %current.ts,
                    "Discarding stale attr snapshot"
                );
                return false;
            }
        }
        self.capabilities = Some(CapabilityCache {
            capabilities: report.capabilities.clone(),
            refreshed_at: ingest_now,
        });
        self.attrs = Some(AttrSnapshot {
            ts,
            report,
            has_validation_errors,
        });
        true
    }

    /// Stores a topology blob under its sub-type segment.
    pub fn apply_topology(&mut self, key: &str, snapshot: OpaqueSnapshot) {
        self.topology.insert(key.to_string(), snapshot);
    }

    /// Stores a diagnostics blob under its kind segment.
    pub fn apply_diagnostics(&mut self, kind: &str, snapshot: OpaqueSnapshot) {
        self.diagnostics.insert(kind.to_string(), snapshot);
    }

    /// The reference instant the silent sweeper compares against: fresh
    /// traffic, or the restart floor for reloaded records.
    #[must_use]
    pub fn liveness_floor(&self) -> DateTime<Utc> {
        match self.loaded_at {
            Some(loaded) => self.liveness.last_seen.max(loaded),
            None => self.liveness.last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, sec).unwrap()
    }

    fn addr() -> DeviceAddress {
        DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap()
    }

    fn state_report(cpu: f64) -> StateReport {
        StateReport {
            health: Some("ok".to_string()),
            cpu_usage: Some(cpu),
            ..StateReport::default()
        }
    }

    #[test]
    fn touch_advances_last_seen_monotonically() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        rec.touch(t(10), t(10));
        assert_eq!(rec.liveness.last_seen, t(10));

        // An ingest timestamp in the past never rewinds last_seen.
        rec.touch(t(5), t(5));
        assert_eq!(rec.liveness.last_seen, t(10));
    }

    #[test]
    fn touch_marks_online() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        let outcome = rec.touch(t(1), t(1));
        assert!(outcome.went_online);
        assert_eq!(rec.liveness.online, OnlineState::Online);
    }

    #[test]
    fn state_snapshot_strictly_greater_ts() {
        let mut rec = DeviceRecord::new(addr(), t(0));

        assert!(rec.apply_state(t(0), state_report(20.0), false));
        assert!(rec.apply_state(t(30), state_report(25.0), false));
        assert_eq!(rec.state.as_ref().unwrap().report.cpu_usage, Some(25.0));

        // Late-arriving older snapshot is discarded.
        assert!(!rec.apply_state(t(15), state_report(99.0), false));
        assert_eq!(rec.state.as_ref().unwrap().report.cpu_usage, Some(25.0));

        // Equal ts is also discarded (strictly greater required).
        assert!(!rec.apply_state(t(30), state_report(99.0), false));
        assert_eq!(rec.state.as_ref().unwrap().ts, t(30));
    }

    #[test]
    fn attr_refreshes_capability_cache() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        let mut report = AttrReport::default();
        report
            .capabilities
            .insert("wifi.set_power".to_string(), CapabilityDecl::default());

        assert!(rec.apply_attr(t(1), report, false, t(2)));
        let caps = rec.capabilities.as_ref().unwrap();
        assert!(caps.capabilities.contains_key("wifi.set_power"));
        assert_eq!(caps.refreshed_at, t(2));
    }

    #[test]
    fn lwt_offline_then_newer_traffic_flips_online() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        rec.apply_lwt(
            &LwtStatus {
                status: LwtState::Offline,
                ts: t(10),
                reason: None,
            },
            t(10),
        );
        assert_eq!(rec.liveness.online, OnlineState::Offline);

        // Traffic with ts <= T does not flip liveness.
        rec.touch(t(10), t(11));
        assert_eq!(rec.liveness.online, OnlineState::Offline);

        // Traffic with ts > T does.
        let outcome = rec.touch(t(11), t(12));
        assert!(outcome.went_online);
        assert_eq!(rec.liveness.online, OnlineState::Online);
    }

    #[test]
    fn stale_offline_lwt_is_discarded() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        // Device publishes retained online LWT at T1.
        rec.apply_lwt(
            &LwtStatus {
                status: LwtState::Online,
                ts: t(20),
                reason: None,
            },
            t(20),
        );
        assert_eq!(rec.liveness.online, OnlineState::Online);

        // Broker emits the will with an older T0: must be ignored.
        let outcome = rec.apply_lwt(
            &LwtStatus {
                status: LwtState::Offline,
                ts: t(10),
                reason: Some("stale will".to_string()),
            },
            t(21),
        );
        assert!(!outcome.went_offline);
        assert_eq!(rec.liveness.online, OnlineState::Online);

        // A newer offline applies.
        let outcome = rec.apply_lwt(
            &LwtStatus {
                status: LwtState::Offline,
                ts: t(30),
                reason: None,
            },
            t(30),
        );
        assert!(outcome.went_offline);
        assert_eq!(rec.liveness.online, OnlineState::Offline);
        assert_eq!(
            rec.liveness.last_will.as_ref().unwrap().status,
            LwtState::Offline
        );
    }

    #[test]
    fn lwt_creates_liveness_without_state() {
        // An LWT with no prior state is a valid liveness update on an
        // empty record.
        let mut rec = DeviceRecord::new(addr(), t(0));
        let outcome = rec.apply_lwt(
            &LwtStatus {
                status: LwtState::Online,
                ts: t(1),
                reason: None,
            },
            t(1),
        );
        assert!(outcome.went_online);
        assert!(rec.state.is_none());
        assert!(rec.attrs.is_none());
    }

    #[test]
    fn identity_manual_flag() {
        let mut identity = DeviceIdentity::default();
        assert!(!identity.is_manual());

        identity.friendly_name = Some("living room ap".to_string());
        assert!(identity.is_manual());

        identity.auto_detected = true;
        assert!(!identity.is_manual());
    }

    #[test]
    fn liveness_floor_uses_load_time() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        rec.liveness.last_seen = t(5);
        assert_eq!(rec.liveness_floor(), t(5));

        rec.loaded_at = Some(t(40));
        assert_eq!(rec.liveness_floor(), t(40));
    }

    #[test]
    fn record_serde_round_trip_tolerates_unknown_fields() {
        let mut rec = DeviceRecord::new(addr(), t(0));
        rec.apply_state(t(1), state_report(10.0), false);

        let mut value = serde_json::to_value(&rec).unwrap();
        value["field_from_the_future"] = serde_json::json!(true);

        let back: DeviceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.addr, rec.addr);
        assert_eq!(back.state, rec.state);
    }
}
