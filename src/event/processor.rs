// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event normalization, deduplication, and persistence.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::SharedClock;
use crate::codec::{Envelope, EventReport, ts_format, ts_format_opt};
use crate::error::StorageError;
use crate::storage::{SharedStore, keys, store_json};
use crate::topic::DeviceAddress;

use super::{ControllerEvent, EventBus};

/// Window within which repeated events are suppressed.
const DEDUP_WINDOW_SECS: i64 = 300;

/// Normalized event severity. Preserved verbatim from the device when
/// recognized; unknown values coerce to `info` with a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    #[default]
    Info,
    /// Needs attention eventually.
    Warning,
    /// Something failed.
    Error,
    /// Something failed and service is affected.
    Critical,
}

impl Severity {
    /// Parses a raw severity string, coercing unknown values to `info`.
    ///
    /// Returns the severity and whether coercion happened.
    #[must_use]
    pub fn parse_lossy(raw: Option<&str>) -> (Self, bool) {
        match raw {
            None => (Self::Info, false),
            Some(raw) => raw.parse().map_or((Self::Info, true), |s| (s, false)),
        }
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A normalized, persisted device event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Processor-assigned identifier (32 hex chars).
    pub event_id: String,
    /// The reporting device.
    pub device: DeviceAddress,
    /// Event type from the topic.
    pub event_type: String,
    /// Normalized severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Structured event data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Device-side timestamp.
    #[serde(with = "ts_format")]
    pub ts_device: DateTime<Utc>,
    /// Ingest-side timestamp.
    #[serde(with = "ts_format")]
    pub ts_ingest: DateTime<Utc>,
    /// Whether processing finished.
    pub processed: bool,
    /// When processing finished.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    /// Events accepted, persisted and published.
    pub processed: u64,
    /// Events suppressed by the dedup window.
    pub duplicates: u64,
    /// Events whose severity was coerced to `info`.
    pub coerced_severity: u64,
}

type DedupKey = (DeviceAddress, String, DateTime<Utc>);

/// Normalizes decoded events, deduplicates, persists, and publishes.
///
/// Processing is idempotent on `(device, event_type, ts_device)`: within
/// the dedup window a repeat of that key is dropped.
pub struct EventProcessor {
    store: SharedStore,
    clock: SharedClock,
    bus: EventBus,
    seen: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    processed: AtomicU64,
    duplicates: AtomicU64,
    coerced: AtomicU64,
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessor")
            .field("seen", &self.seen.lock().len())
            .finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Creates an event processor.
    #[must_use]
    pub fn new(store: SharedStore, clock: SharedClock, bus: EventBus) -> Self {
        Self {
            store,
            clock,
            bus,
            seen: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            coerced: AtomicU64::new(0),
        }
    }

    /// Processes one decoded event.
    ///
    /// Returns the persisted record, or `None` if the event was a
    /// duplicate within the dedup window.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if persistence fails; the event is not
    /// published in that case.
    pub fn process(
        &self,
        device: &DeviceAddress,
        event_type: &str,
        envelope: &Envelope,
        report: &EventReport,
    ) -> Result<Option<EventRecord>, StorageError> {
        let now = self.clock.now();
        let key = (device.clone(), event_type.to_string(), envelope.ts);

        {
            let mut seen = self.seen.lock();
            let window = Duration::seconds(DEDUP_WINDOW_SECS);
            seen.retain(|_, first_seen| now - *first_seen < window);
            if seen.contains_key(&key) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device = %device,
                    event_type = %event_type,
                    "Suppressing duplicate event"
                );
                return Ok(None);
            }
            seen.insert(key, now);
        }

        let (severity, coerced) = Severity::parse_lossy(report.severity.as_deref());
        if coerced {
            self.coerced.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                device = %device,
                event_type = %event_type,
                raw = ?report.severity,
                "Unknown event severity, coercing to info"
            );
        }

        let record = EventRecord {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            device: device.clone(),
            event_type: event_type.to_string(),
            severity,
            message: report.message.clone().unwrap_or_default(),
            data: report.data.clone(),
            ts_device: envelope.ts,
            ts_ingest: now,
            processed: true,
            processed_at: Some(now),
        };

        store_json(
            self.store.as_ref(),
            &keys::event(record.ts_ingest, &record.event_id),
            &record,
        )?;

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(ControllerEvent::EventIngested(record.clone()));
        Ok(Some(record))
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> EventStats {
        EventStats {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            coerced_severity: self.coerced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    use crate::clock::{Clock, ManualClock};
    use crate::storage::{KeyValueStore, MemoryStore};

    fn setup() -> (EventProcessor, Arc<MemoryStore>, Arc<ManualClock>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let bus = EventBus::new();
        let proc = EventProcessor::new(store.clone(), clock.clone(), bus.clone());
        (proc, store, clock, bus)
    }

    fn addr() -> DeviceAddress {
        DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap()
    }

    fn envelope(ts: DateTime<Utc>) -> Envelope {
        Envelope::new(
            "evt.link_down/1.0".parse().unwrap(),
            ts,
            serde_json::json!({}),
        )
    }

    fn report(severity: &str) -> EventReport {
        EventReport {
            severity: Some(severity.to_string()),
            message: Some("uplink lost".to_string()),
            data: Some(serde_json::json!({"port": 3})),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn process_persists_and_counts() {
        let (proc, store, clock, _bus) = setup();
        let record = proc
            .process(&addr(), "link-down", &envelope(clock.now()), &report("warning"))
            .unwrap()
            .unwrap();

        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.message, "uplink lost");
        assert!(record.processed);
        assert_eq!(store.scan("event/", None, None).unwrap().len(), 1);
        assert_eq!(proc.stats().processed, 1);
    }

    #[tokio::test]
    async fn process_publishes_on_bus() {
        let (proc, _store, clock, bus) = setup();
        let mut rx = bus.subscribe();

        proc.process(&addr(), "link-down", &envelope(clock.now()), &report("error"))
            .unwrap();

        let ControllerEvent::EventIngested(record) = rx.recv().await.unwrap() else {
            panic!("expected EventIngested");
        };
        assert_eq!(record.severity, Severity::Error);
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let (proc, store, clock, _bus) = setup();
        let ts = clock.now();

        assert!(proc
            .process(&addr(), "link-down", &envelope(ts), &report("warning"))
            .unwrap()
            .is_some());
        assert!(proc
            .process(&addr(), "link-down", &envelope(ts), &report("warning"))
            .unwrap()
            .is_none());

        assert_eq!(proc.stats().duplicates, 1);
        assert_eq!(store.scan("event/", None, None).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_after_window_is_processed_again() {
        let (proc, _store, clock, _bus) = setup();
        let ts = clock.now();

        assert!(proc
            .process(&addr(), "link-down", &envelope(ts), &report("warning"))
            .unwrap()
            .is_some());

        clock.advance(Duration::seconds(DEDUP_WINDOW_SECS + 1));
        assert!(proc
            .process(&addr(), "link-down", &envelope(ts), &report("warning"))
            .unwrap()
            .is_some());
        assert_eq!(proc.stats().duplicates, 0);
    }

    #[test]
    fn different_ts_device_is_not_a_duplicate() {
        let (proc, _store, clock, _bus) = setup();
        let ts = clock.now();

        proc.process(&addr(), "link-down", &envelope(ts), &report("warning"))
            .unwrap();
        let later = envelope(ts + Duration::seconds(1));
        assert!(proc
            .process(&addr(), "link-down", &later, &report("warning"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn unknown_severity_coerces_to_info() {
        let (proc, _store, clock, _bus) = setup();
        let record = proc
            .process(&addr(), "boot", &envelope(clock.now()), &report("catastrophic"))
            .unwrap()
            .unwrap();

        assert_eq!(record.severity, Severity::Info);
        assert_eq!(proc.stats().coerced_severity, 1);
    }

    #[test]
    fn missing_severity_defaults_to_info_without_warning() {
        let (proc, _store, clock, _bus) = setup();
        let mut r = report("info");
        r.severity = None;
        let record = proc
            .process(&addr(), "boot", &envelope(clock.now()), &r)
            .unwrap()
            .unwrap();

        assert_eq!(record.severity, Severity::Info);
        assert_eq!(proc.stats().coerced_severity, 0);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(Severity::parse_lossy(Some("critical")), (Severity::Critical, false));
        assert_eq!(Severity::parse_lossy(Some("fatal")), (Severity::Info, true));
    }

    #[test]
    fn event_record_round_trips() {
        let (proc, store, clock, _bus) = setup();
        let record = proc
            .process(&addr(), "boot", &envelope(clock.now()), &report("info"))
            .unwrap()
            .unwrap();

        let key = keys::event(record.ts_ingest, &record.event_id);
        let loaded: EventRecord = crate::storage::load_json(store.as_ref(), &key)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }
}
