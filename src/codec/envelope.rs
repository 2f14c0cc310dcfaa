// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The JSON payload envelope shared by every enveloped message type.
//!
//! ```json
//! {
//!   "schema": "state/1.0",
//!   "ts": "2024-08-13T08:00:00.000Z",
//!   "trace": { "req_id": "...", "session_id": "..." },
//!   "payload": { ... }
//! }
//! ```
//!
//! Unknown top-level fields are ignored for forward compatibility.
//! Timestamps are UTC ISO-8601 with millisecond precision and a trailing
//! `Z`; encoding always produces exactly that form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;

/// A typed payload identifier: `name/MAJOR.MINOR`.
///
/// Same MAJOR is compatible; a differing MAJOR is passed through as
/// opaque by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaId {
    name: String,
    major: u32,
    minor: u32,
}

impl SchemaId {
    /// Creates a schema id from parts.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidSchemaId`] if the name fails the
    /// `[a-z][a-z0-9._]*` grammar.
    pub fn new(name: impl Into<String>, major: u32, minor: u32) -> Result<Self, PayloadError> {
        let name = name.into();
        if !is_valid_schema_name(&name) {
            return Err(PayloadError::InvalidSchemaId(name));
        }
        Ok(Self { name, major, minor })
    }

    /// Returns the schema name (the part before the slash).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the major version.
    #[must_use]
    pub const fn major(&self) -> u32 {
        self.major
    }

    /// Returns the minor version.
    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }

    /// Returns `true` if the other id has the same name and MAJOR.
    #[must_use]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.name == other.name && self.major == other.major
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.name, self.major, self.minor)
    }
}

impl FromStr for SchemaId {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PayloadError::InvalidSchemaId(s.to_string());

        let (name, version) = s.split_once('/').ok_or_else(err)?;
        if !is_valid_schema_name(name) {
            return Err(err());
        }
        let (major, minor) = version.split_once('.').ok_or_else(err)?;
        let major: u32 = major.parse().map_err(|_| err())?;
        let minor: u32 = minor.parse().map_err(|_| err())?;

        Ok(Self {
            name: name.to_string(),
            major,
            minor,
        })
    }
}

impl TryFrom<String> for SchemaId {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaId> for String {
    fn from(id: SchemaId) -> Self {
        id.to_string()
    }
}

/// Returns `true` if the value matches `[a-z][a-z0-9._]*`.
fn is_valid_schema_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

/// Correlation identifiers carried end-to-end through the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Request identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// Correlation identifier shared across related requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Distributed trace identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Trace {
    /// Returns `true` if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.req_id.is_none()
            && self.correlation_id.is_none()
            && self.session_id.is_none()
            && self.trace_id.is_none()
    }
}

/// Serde adapter enforcing the wire timestamp format.
pub mod ts_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as UTC ISO-8601 with millisecond precision and `Z`.
    ///
    /// # Errors
    ///
    /// Never fails for valid `DateTime<Utc>` values.
    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Deserializes an ISO-8601 UTC timestamp with a trailing `Z`.
    ///
    /// # Errors
    ///
    /// Fails if the string is not parseable or not anchored to UTC.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_ts(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional wire timestamps.
pub mod ts_format_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes `Some` as the wire format, `None` as JSON null.
    ///
    /// # Errors
    ///
    /// Never fails for valid values.
    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => {
                serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an optional wire timestamp.
    ///
    /// # Errors
    ///
    /// Fails if a present string is not parseable.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            Some(s) => super::parse_ts(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Parses a wire timestamp, requiring UTC anchoring (`Z`).
///
/// # Errors
///
/// Returns [`PayloadError::InvalidTimestamp`] for anything that is not
/// ISO-8601 UTC with a trailing `Z`.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, PayloadError> {
    if !value.ends_with('Z') {
        return Err(PayloadError::InvalidTimestamp(value.to_string()));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PayloadError::InvalidTimestamp(value.to_string()))
}

/// Formats a timestamp in the wire format (millisecond precision, `Z`).
#[must_use]
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The payload envelope carried by every enveloped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Typed payload identifier.
    pub schema: SchemaId,
    /// Device-side timestamp.
    #[serde(with = "ts_format")]
    pub ts: DateTime<Utc>,
    /// Optional correlation identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    /// Schema-specific payload.
    pub payload: Value,
}

impl Envelope {
    /// Creates an envelope without trace identifiers.
    #[must_use]
    pub fn new(schema: SchemaId, ts: DateTime<Utc>, payload: Value) -> Self {
        Self {
            schema,
            ts,
            trace: None,
            payload,
        }
    }

    /// Decodes an envelope from raw bytes.
    ///
    /// Unknown top-level fields are ignored. Required fields are checked
    /// individually so the error can name the offending field.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] naming the missing or malformed field.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(map) = value else {
            return Err(PayloadError::InvalidField {
                field: "envelope",
                message: "top level is not a JSON object".to_string(),
            });
        };

        let schema = map
            .get("schema")
            .ok_or(PayloadError::MissingField("schema"))?
            .as_str()
            .ok_or(PayloadError::InvalidField {
                field: "schema",
                message: "not a string".to_string(),
            })?
            .parse::<SchemaId>()?;

        let ts_raw = map
            .get("ts")
            .ok_or(PayloadError::MissingField("ts"))?
            .as_str()
            .ok_or(PayloadError::InvalidField {
                field: "ts",
                message: "not a string".to_string(),
            })?;
        let ts = parse_ts(ts_raw)?;

        let trace = match map.get("trace") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value::<Trace>(v.clone()).map_err(|e| {
                PayloadError::InvalidField {
                    field: "trace",
                    message: e.to_string(),
                }
            })?),
        };

        let payload = map
            .get("payload")
            .cloned()
            .ok_or(PayloadError::MissingField("payload"))?;

        Ok(Self {
            schema,
            ts,
            trace,
            payload,
        })
    }

    /// Encodes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Json`] if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(PayloadError::Json)
    }
}
