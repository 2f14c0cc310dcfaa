// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message codec: raw bytes + topic address in, tagged decoded records out.
//!
//! Decoding is total for recognizable JSON: malformed JSON or missing
//! required envelope fields yield [`PayloadError`] naming the offending
//! field, while an unknown or MAJOR-incompatible `schema` yields
//! [`Decoded::Unknown`] with the raw bytes preserved for the message log.

mod envelope;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;
use crate::topic::{Channel, CommandLeg, TopologyKind};

pub use envelope::{Envelope, SchemaId, Trace, format_ts, parse_ts, ts_format, ts_format_opt};

use chrono::{DateTime, Utc};

/// Online/offline discriminator used by LWT payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LwtState {
    /// The device announced a live connection.
    Online,
    /// The broker (or the device, gracefully) announced disconnection.
    Offline,
}

/// The LWT payload. Retained; not wrapped in an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwtStatus {
    /// Liveness announced by this message.
    pub status: LwtState,
    /// When the transition happened.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Optional free-form reason (`"keepalive timeout"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decoded `state/*` snapshot payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    /// Device-declared health summary (`"ok"`, `"degraded"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    /// Seconds since boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<u64>,
    /// CPU usage percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    /// Memory usage percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_usage: Option<f64>,
    /// Network interface summary, schema-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<Value>,
    /// Remaining schema-specific fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A single capability declared in `attr.capabilities`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    /// Capability version, used for staleness detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Expected response time hint in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Remaining capability metadata, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Decoded `attr` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrReport {
    /// Hardware version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    /// Firmware version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    /// Declared capabilities keyed by operation name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capabilities: HashMap<String, CapabilityDecl>,
    /// Remaining schema-specific fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Decoded `evt/*` payload.
///
/// The severity is kept as the raw string here; the event processor owns
/// normalization (unknown severities coerce to `info` with a warning).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    /// Raw severity string as sent by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Human-readable event message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured event data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Remaining schema-specific fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Device-reported error detail in acks and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code (see the error taxonomy mapping).
    pub code: String,
    /// Human-readable message.
    pub msg: String,
}

/// Progress reported in a partial `cmd/res`: numeric 0-100 or a phase name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    /// Percentage complete.
    Percent(f64),
    /// Named execution phase.
    Phase(String),
}

/// Decoded `cmd/ack` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdAck {
    /// Correlation id, identical to the request id.
    pub id: String,
    /// Device-side timestamp.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Whether the device accepted the request.
    pub accepted: bool,
    /// Error detail when `accepted` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorInfo>,
}

/// Execution metadata attached to a final `cmd/res`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Wall time the device spent executing, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    /// Whether the device answered from a cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_used: Option<bool>,
    /// Device-side rollback hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_info: Option<Value>,
    /// Remaining metadata, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Decoded `cmd/res` payload (final or progress).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdResult {
    /// Correlation id, identical to the request id.
    pub id: String,
    /// Device-side timestamp.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Whether execution succeeded. Ignored for progress messages.
    pub ok: bool,
    /// Operation result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Progress marker; presence makes this a non-final message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Error detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorInfo>,
    /// Execution metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionInfo>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Correlation identifiers echoed by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
}

impl CmdResult {
    /// Returns `true` if this message carries progress rather than a
    /// terminal outcome.
    #[must_use]
    pub const fn is_progress(&self) -> bool {
        self.progress.is_some()
    }
}

/// What the caller expects back from a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expect {
    /// Fire-and-forget: terminal after publish.
    None,
    /// Terminal once the device acks.
    Ack,
    /// Terminal once the device delivers a final result.
    #[default]
    Result,
}

/// Wire form of a `cmd/req` publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdRequest {
    /// Dispatcher-generated correlation id (32 hex chars).
    pub id: String,
    /// Operation name (`wifi.set_power`, ...).
    pub op: String,
    /// Typed payload identifier, `cmd.<op>/1.0`.
    pub schema: SchemaId,
    /// Operation arguments.
    pub args: Value,
    /// Overall timeout hint for the device, in milliseconds.
    pub timeout_ms: u64,
    /// What the controller expects back.
    pub expect: Expect,
    /// Optional override topic for the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Controller-side timestamp.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Correlation identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
}

impl CmdRequest {
    /// Encodes the request to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Json`] if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(PayloadError::Json)
    }
}

/// A decoded inbound message, tagged by channel and `schema`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Retained state snapshot.
    State {
        /// The decoded envelope.
        envelope: Envelope,
        /// The typed report parsed from the payload.
        report: StateReport,
    },
    /// Retained attribute snapshot.
    Attr {
        /// The decoded envelope.
        envelope: Envelope,
        /// The typed report parsed from the payload.
        report: AttrReport,
    },
    /// Liveness transition.
    Lwt(LwtStatus),
    /// Metric sample; the payload stays schema-opaque.
    Telemetry {
        /// The metric segment from the topic.
        metric: String,
        /// The decoded envelope.
        envelope: Envelope,
    },
    /// Device event.
    Event {
        /// The event type segment from the topic.
        event_type: String,
        /// The decoded envelope.
        envelope: Envelope,
        /// The typed report parsed from the payload.
        report: EventReport,
    },
    /// Command acknowledgment.
    CmdAck(CmdAck),
    /// Command result or progress.
    CmdResult(CmdResult),
    /// Topology report; the payload stays schema-opaque.
    Topology {
        /// Discovery or connections.
        kind: TopologyKind,
        /// The decoded envelope.
        envelope: Envelope,
    },
    /// Vendor diagnostics; the payload stays schema-opaque.
    Diagnostics {
        /// The diagnostics kind segment from the topic.
        kind: String,
        /// The decoded envelope.
        envelope: Envelope,
    },
    /// Unknown or MAJOR-incompatible schema; raw bytes preserved.
    Unknown {
        /// The schema id if one could be read.
        schema: Option<String>,
        /// The raw payload for the message log.
        raw: Vec<u8>,
    },
}

/// Schema MAJOR this core implements for the built-in payload types.
const SUPPORTED_MAJOR: u32 = 1;

/// Decodes raw payload bytes for a channel.
///
/// # Errors
///
/// Returns [`PayloadError`] only for malformed JSON or missing required
/// fields. Unknown schemas decode to [`Decoded::Unknown`].
pub fn decode(channel: &Channel, bytes: &[u8]) -> Result<Decoded, PayloadError> {
    match channel {
        Channel::Lwt => decode_lwt(bytes).map(Decoded::Lwt),
        Channel::Command(CommandLeg::Ack) => {
            let ack: CmdAck = typed_from_slice(bytes)?;
            Ok(Decoded::CmdAck(ack))
        }
        Channel::Command(CommandLeg::Result) => {
            let res: CmdResult = typed_from_slice(bytes)?;
            Ok(Decoded::CmdResult(res))
        }
        Channel::Command(CommandLeg::Request) => {
            // The controller does not consume its own requests; keep the
            // bytes for the message log.
            Ok(Decoded::Unknown {
                schema: None,
                raw: bytes.to_vec(),
            })
        }
        Channel::State => {
            let envelope = Envelope::from_slice(bytes)?;
            if !schema_supported(&envelope, "state") {
                return Ok(opaque(envelope, bytes));
            }
            let report = payload_as(&envelope, "state payload")?;
            Ok(Decoded::State { envelope, report })
        }
        Channel::Attr => {
            let envelope = Envelope::from_slice(bytes)?;
            if !schema_supported(&envelope, "attr") {
                return Ok(opaque(envelope, bytes));
            }
            let report = payload_as(&envelope, "attr payload")?;
            Ok(Decoded::Attr { envelope, report })
        }
        Channel::Telemetry { metric } => {
            let envelope = Envelope::from_slice(bytes)?;
            Ok(Decoded::Telemetry {
                metric: metric.clone(),
                envelope,
            })
        }
        Channel::Event { event_type } => {
            let envelope = Envelope::from_slice(bytes)?;
            let report = payload_as(&envelope, "event payload")?;
            Ok(Decoded::Event {
                event_type: event_type.clone(),
                envelope,
                report,
            })
        }
        Channel::Topology(kind) => {
            let envelope = Envelope::from_slice(bytes)?;
            Ok(Decoded::Topology {
                kind: *kind,
                envelope,
            })
        }
        Channel::Diagnostics { kind } => {
            let envelope = Envelope::from_slice(bytes)?;
            Ok(Decoded::Diagnostics {
                kind: kind.clone(),
                envelope,
            })
        }
    }
}

/// Decodes an LWT payload, naming missing fields.
///
/// # Errors
///
/// Returns [`PayloadError`] for malformed JSON or missing `status`/`ts`.
pub fn decode_lwt(bytes: &[u8]) -> Result<LwtStatus, PayloadError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(ref map) = value else {
        return Err(PayloadError::InvalidField {
            field: "lwt",
            message: "top level is not a JSON object".to_string(),
        });
    };
    if !map.contains_key("status") {
        return Err(PayloadError::MissingField("status"));
    }
    if !map.contains_key("ts") {
        return Err(PayloadError::MissingField("ts"));
    }
    serde_json::from_value(value).map_err(|e| PayloadError::InvalidField {
        field: "status",
        message: e.to_string(),
    })
}

fn typed_from_slice<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(ref map) = value else {
        return Err(PayloadError::InvalidField {
            field: "payload",
            message: "top level is not a JSON object".to_string(),
        });
    };
    if !map.contains_key("id") {
        return Err(PayloadError::MissingField("id"));
    }
    serde_json::from_value(value).map_err(|e| PayloadError::InvalidField {
        field: "payload",
        message: e.to_string(),
    })
}

fn schema_supported(envelope: &Envelope, expected_name: &str) -> bool {
    let schema = &envelope.schema;
    if schema.name() != expected_name || schema.major() != SUPPORTED_MAJOR {
        tracing::warn!(
            schema = %schema,
            expected = %format!("{expected_name}/{SUPPORTED_MAJOR}.x"),
            "Passing through payload with unsupported schema as opaque"
        );
        return false;
    }
    true
}

fn opaque(envelope: Envelope, bytes: &[u8]) -> Decoded {
    Decoded::Unknown {
        schema: Some(envelope.schema.to_string()),
        raw: bytes.to_vec(),
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(
    envelope: &Envelope,
    field: &'static str,
) -> Result<T, PayloadError> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| PayloadError::InvalidField {
        field,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state_bytes(ts: &str, cpu: u32) -> Vec<u8> {
        format!(
            r#"{{"schema":"state/1.0","ts":"{ts}","payload":{{"health":"ok","uptime_s":10,"cpu_usage":{cpu}}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn decode_state() {
        let decoded = decode(&Channel::State, &state_bytes("2024-08-13T08:00:00.000Z", 20)).unwrap();
        let Decoded::State { envelope, report } = decoded else {
            panic!("expected state");
        };
        assert_eq!(envelope.schema.to_string(), "state/1.0");
        assert_eq!(report.health.as_deref(), Some("ok"));
        assert_eq!(report.uptime_s, Some(10));
        assert_eq!(report.cpu_usage, Some(20.0));
    }

    #[test]
    fn decode_state_minor_bump_is_compatible() {
        let raw = br#"{"schema":"state/1.7","ts":"2024-08-13T08:00:00.000Z","payload":{"health":"ok","future_field":1}}"#;
        let decoded = decode(&Channel::State, raw).unwrap();
        let Decoded::State { report, .. } = decoded else {
            panic!("expected state");
        };
        assert_eq!(report.health.as_deref(), Some("ok"));
        assert_eq!(report.extra["future_field"], 1);
    }

    #[test]
    fn decode_state_major_bump_is_opaque() {
        let raw = br#"{"schema":"state/2.0","ts":"2024-08-13T08:00:00.000Z","payload":{}}"#;
        let decoded = decode(&Channel::State, raw).unwrap();
        let Decoded::Unknown { schema, raw: kept } = decoded else {
            panic!("expected unknown");
        };
        assert_eq!(schema.as_deref(), Some("state/2.0"));
        assert_eq!(kept, raw.to_vec());
    }

    #[test]
    fn decode_unknown_schema_name_is_opaque() {
        let raw =
            br#"{"schema":"vendor.custom/1.0","ts":"2024-08-13T08:00:00.000Z","payload":{}}"#;
        let decoded = decode(&Channel::State, raw).unwrap();
        assert!(matches!(decoded, Decoded::Unknown { .. }));
    }

    #[test]
    fn decode_attr_with_capabilities() {
        let raw = br#"{
            "schema": "attr/1.0",
            "ts": "2024-08-13T08:00:00.000Z",
            "payload": {
                "fw_version": "3.2.1",
                "capabilities": {
                    "wifi.set_power": {"version": "1.0", "response_time_ms": 500},
                    "light.set": {"version": "1.1"}
                }
            }
        }"#;
        let decoded = decode(&Channel::Attr, raw).unwrap();
        let Decoded::Attr { report, .. } = decoded else {
            panic!("expected attr");
        };
        assert_eq!(report.fw_version.as_deref(), Some("3.2.1"));
        assert_eq!(report.capabilities.len(), 2);
        assert_eq!(
            report.capabilities["wifi.set_power"].response_time_ms,
            Some(500)
        );
    }

    #[test]
    fn decode_lwt_payload() {
        let raw = br#"{"status":"offline","ts":"2024-08-13T08:00:00.000Z","reason":"keepalive timeout"}"#;
        let lwt = decode_lwt(raw).unwrap();
        assert_eq!(lwt.status, LwtState::Offline);
        assert_eq!(lwt.reason.as_deref(), Some("keepalive timeout"));
    }

    #[test]
    fn decode_lwt_names_missing_status() {
        let raw = br#"{"ts":"2024-08-13T08:00:00.000Z"}"#;
        assert!(matches!(
            decode_lwt(raw).unwrap_err(),
            PayloadError::MissingField("status")
        ));
    }

    #[test]
    fn decode_cmd_ack() {
        let raw = br#"{"id":"00112233445566778899aabbccddeeff","ts":"2024-08-13T08:00:00.200Z","accepted":true}"#;
        let decoded = decode(&Channel::Command(CommandLeg::Ack), raw).unwrap();
        let Decoded::CmdAck(ack) = decoded else {
            panic!("expected ack");
        };
        assert!(ack.accepted);
        assert!(ack.err.is_none());
    }

    #[test]
    fn decode_cmd_ack_rejected() {
        let raw = br#"{"id":"00112233445566778899aabbccddeeff","ts":"2024-08-13T08:00:00.200Z","accepted":false,"err":{"code":"busy","msg":"device busy"}}"#;
        let Decoded::CmdAck(ack) = decode(&Channel::Command(CommandLeg::Ack), raw).unwrap() else {
            panic!("expected ack");
        };
        assert!(!ack.accepted);
        assert_eq!(ack.err.unwrap().code, "busy");
    }

    #[test]
    fn decode_cmd_result_final() {
        let raw = br#"{
            "id": "00112233445566778899aabbccddeeff",
            "ts": "2024-08-13T08:00:01.000Z",
            "ok": true,
            "result": {"on": true, "brightness": 80},
            "execution": {"time_ms": 340, "cache_used": false}
        }"#;
        let Decoded::CmdResult(res) = decode(&Channel::Command(CommandLeg::Result), raw).unwrap()
        else {
            panic!("expected result");
        };
        assert!(res.ok);
        assert!(!res.is_progress());
        assert_eq!(res.result.unwrap()["brightness"], 80);
        assert_eq!(res.execution.unwrap().time_ms, Some(340));
    }

    #[test]
    fn decode_cmd_result_progress_forms() {
        let numeric = br#"{"id":"x1","ts":"2024-08-13T08:00:01.000Z","ok":true,"progress":42}"#;
        let Decoded::CmdResult(res) = decode(&Channel::Command(CommandLeg::Result), numeric).unwrap()
        else {
            panic!("expected result");
        };
        assert_eq!(res.progress, Some(Progress::Percent(42.0)));
        assert!(res.is_progress());

        let phase =
            br#"{"id":"x1","ts":"2024-08-13T08:00:01.000Z","ok":true,"progress":"flashing"}"#;
        let Decoded::CmdResult(res) = decode(&Channel::Command(CommandLeg::Result), phase).unwrap()
        else {
            panic!("expected result");
        };
        assert_eq!(res.progress, Some(Progress::Phase("flashing".to_string())));
    }

    #[test]
    fn decode_cmd_result_missing_id() {
        let raw = br#"{"ts":"2024-08-13T08:00:01.000Z","ok":true}"#;
        assert!(matches!(
            decode(&Channel::Command(CommandLeg::Result), raw).unwrap_err(),
            PayloadError::MissingField("id")
        ));
    }

    #[test]
    fn decode_event() {
        let raw = br#"{
            "schema": "evt.link_down/1.0",
            "ts": "2024-08-13T08:00:00.000Z",
            "payload": {"severity": "warning", "message": "uplink lost", "data": {"port": 3}}
        }"#;
        let decoded = decode(
            &Channel::Event {
                event_type: "link-down".to_string(),
            },
            raw,
        )
        .unwrap();
        let Decoded::Event {
            event_type, report, ..
        } = decoded
        else {
            panic!("expected event");
        };
        assert_eq!(event_type, "link-down");
        assert_eq!(report.severity.as_deref(), Some("warning"));
        assert_eq!(report.data.unwrap()["port"], 3);
    }

    #[test]
    fn decode_telemetry_stays_opaque() {
        let raw = br#"{
            "schema": "telemetry.wifi/1.0",
            "ts": "2024-08-13T08:00:00.000Z",
            "payload": {"rssi": -61}
        }"#;
        let decoded = decode(
            &Channel::Telemetry {
                metric: "wifi".to_string(),
            },
            raw,
        )
        .unwrap();
        let Decoded::Telemetry { metric, envelope } = decoded else {
            panic!("expected telemetry");
        };
        assert_eq!(metric, "wifi");
        assert_eq!(envelope.payload["rssi"], -61);
    }

    #[test]
    fn decode_malformed_json_is_an_error() {
        assert!(decode(&Channel::State, b"{oops").is_err());
        assert!(decode(&Channel::Command(CommandLeg::Ack), b"]").is_err());
        assert!(decode_lwt(b"not json").is_err());
    }

    #[test]
    fn cmd_request_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap();
        let req = CmdRequest {
            id: "00112233445566778899aabbccddeeff".to_string(),
            op: "light.set".to_string(),
            schema: "cmd.light_set/1.0".parse().unwrap(),
            args: serde_json::json!({"on": true, "brightness": 80}),
            timeout_ms: 5000,
            expect: Expect::Result,
            reply_to: None,
            ts,
            trace: None,
        };
        let bytes = req.to_vec().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["op"], "light.set");
        assert_eq!(value["expect"], "result");
        assert_eq!(value["ts"], "2024-08-13T08:00:00.000Z");
        assert!(value.get("reply_to").is_none());

        let back: CmdRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn expect_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Expect::None).unwrap(), "\"none\"");
        assert_eq!(serde_json::to_string(&Expect::Ack).unwrap(), "\"ack\"");
        assert_eq!(serde_json::to_string(&Expect::Result).unwrap(), "\"result\"");
    }
}
