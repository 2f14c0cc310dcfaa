// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic codec for the versioned `rtk` topic hierarchy.
//!
//! Topic structure:
//! ```text
//! rtk/v1/<tenant>/<site>/<device_id>/state
//! rtk/v1/<tenant>/<site>/<device_id>/attr
//! rtk/v1/<tenant>/<site>/<device_id>/lwt
//! rtk/v1/<tenant>/<site>/<device_id>/telemetry/<metric>
//! rtk/v1/<tenant>/<site>/<device_id>/evt/<event_type>
//! rtk/v1/<tenant>/<site>/<device_id>/cmd/{req|ack|res}
//! rtk/v1/<tenant>/<site>/<device_id>/topology/{discovery|connections}
//! rtk/v1/<tenant>/<site>/<device_id>/diagnostics/<kind>
//! rtk/v1/<tenant>/<site>/group/<group_id>/cmd/req
//! ```
//!
//! The grammar is strict: segments are case-sensitive, trailing slashes
//! are rejected, `tenant`/`site` must match `[a-z0-9][a-z0-9-]*`, and
//! `device_id` must be a lowercase 12-hex-digit MAC without separators.
//! Wildcards (`+`, `#`) are accepted only in [`TopicFilter`] subscription
//! patterns, never in parsed or composed publication topics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TopicError;

/// Root segment of every topic in the hierarchy.
pub const TOPIC_ROOT: &str = "rtk";

/// Protocol version segment understood by this core.
pub const PROTOCOL_VERSION: &str = "v1";

/// A device identifier: the device MAC as 12 lowercase hex digits,
/// no separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id, validating the 12-hex grammar.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError::InvalidDeviceId`] if the value is not exactly
    /// 12 lowercase hexadecimal digits.
    pub fn new(value: impl Into<String>) -> Result<Self, TopicError> {
        let value = value.into();
        if is_valid_device_id(&value) {
            Ok(Self(value))
        } else {
            Err(TopicError::InvalidDeviceId(value))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// The `(tenant, site, device_id)` tuple identifying a device uniquely
/// in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Administrative scope identifier.
    pub tenant: String,
    /// Physical scope identifier.
    pub site: String,
    /// The device MAC.
    pub device_id: DeviceId,
}

impl DeviceAddress {
    /// Creates a device address, validating every component.
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] if the tenant, site or device id fails
    /// its grammar.
    pub fn new(
        tenant: impl Into<String>,
        site: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, TopicError> {
        let tenant = validated_identifier("tenant", tenant.into())?;
        let site = validated_identifier("site", site.into())?;
        let device_id = DeviceId::new(device_id)?;
        Ok(Self {
            tenant,
            site,
            device_id,
        })
    }

    /// Composes the topic for a channel on this device.
    #[must_use]
    pub fn topic(&self, channel: &Channel) -> String {
        let base = format!(
            "{TOPIC_ROOT}/{PROTOCOL_VERSION}/{}/{}/{}/{}",
            self.tenant,
            self.site,
            self.device_id,
            channel.message_type()
        );
        match channel.sub_type() {
            Some(sub) => format!("{base}/{sub}"),
            None => base,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.site, self.device_id)
    }
}

/// A group downlink address. Groups only carry command requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupAddress {
    /// Administrative scope identifier.
    pub tenant: String,
    /// Physical scope identifier.
    pub site: String,
    /// Group identifier, same grammar as tenant/site.
    pub group_id: String,
}

impl GroupAddress {
    /// Creates a group address, validating every component.
    ///
    /// # Errors
    ///
    /// Returns a [`TopicError`] if any identifier fails its grammar.
    pub fn new(
        tenant: impl Into<String>,
        site: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            tenant: validated_identifier("tenant", tenant.into())?,
            site: validated_identifier("site", site.into())?,
            group_id: validated_identifier("group", group_id.into())?,
        })
    }

    /// Composes the group command-request topic.
    #[must_use]
    pub fn request_topic(&self) -> String {
        format!(
            "{TOPIC_ROOT}/{PROTOCOL_VERSION}/{}/{}/group/{}/cmd/req",
            self.tenant, self.site, self.group_id
        )
    }
}

/// Command correlation leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLeg {
    /// Controller-to-device request (`cmd/req`).
    #[serde(rename = "req")]
    Request,
    /// Device acknowledgment (`cmd/ack`).
    Ack,
    /// Device result (`cmd/res`).
    #[serde(rename = "res")]
    Result,
}

impl CommandLeg {
    /// Returns the wire segment for this leg.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "req",
            Self::Ack => "ack",
            Self::Result => "res",
        }
    }
}

/// Topology report kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    /// Neighbor discovery report.
    Discovery,
    /// Link/connection report.
    Connections,
}

impl TopologyKind {
    /// Returns the wire segment for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Connections => "connections",
        }
    }
}

/// The message-type channel of a topic, including its sub-type where the
/// grammar requires one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Retained device state snapshot.
    State,
    /// Retained device attributes (hw/fw versions, capabilities).
    Attr,
    /// Last-will liveness topic (retained).
    Lwt,
    /// Periodic metric samples.
    Telemetry {
        /// The metric name segment.
        metric: String,
    },
    /// Device events.
    Event {
        /// The event type segment.
        event_type: String,
    },
    /// Command correlation traffic.
    Command(CommandLeg),
    /// Topology reports.
    Topology(TopologyKind),
    /// Vendor diagnostics, opaque beyond the kind segment.
    Diagnostics {
        /// The diagnostics kind segment.
        kind: String,
    },
}

impl Channel {
    /// Returns the message-type segment.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Attr => "attr",
            Self::Lwt => "lwt",
            Self::Telemetry { .. } => "telemetry",
            Self::Event { .. } => "evt",
            Self::Command(_) => "cmd",
            Self::Topology(_) => "topology",
            Self::Diagnostics { .. } => "diagnostics",
        }
    }

    /// Returns the sub-type segment, if this channel carries one.
    #[must_use]
    pub fn sub_type(&self) -> Option<&str> {
        match self {
            Self::State | Self::Attr | Self::Lwt => None,
            Self::Telemetry { metric } => Some(metric),
            Self::Event { event_type } => Some(event_type),
            Self::Command(leg) => Some(leg.as_str()),
            Self::Topology(kind) => Some(kind.as_str()),
            Self::Diagnostics { kind } => Some(kind),
        }
    }

    /// Returns `true` for channels whose payloads are broker-retained.
    #[must_use]
    pub const fn is_retained(&self) -> bool {
        matches!(self, Self::State | Self::Attr | Self::Lwt)
    }
}

/// A fully parsed publication topic addressing a single device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    /// The device the topic addresses.
    pub addr: DeviceAddress,
    /// The channel (message type + sub-type).
    pub channel: Channel,
}

impl TopicAddress {
    /// Composes the wire topic string.
    #[must_use]
    pub fn topic(&self) -> String {
        self.addr.topic(&self.channel)
    }
}

/// A parsed inbound topic: either a device publication or a group
/// command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// A per-device topic.
    Device(TopicAddress),
    /// A group command-request topic.
    Group(GroupAddress),
}

/// Parses a publication topic into its address.
///
/// # Errors
///
/// Returns a [`TopicError`] describing the first grammar violation.
/// Wildcards are rejected; use [`TopicFilter`] for subscription patterns.
pub fn parse_topic(topic: &str) -> Result<ParsedTopic, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();

    if segments.iter().any(|s| s.is_empty()) {
        return Err(TopicError::Malformed(
            "empty segment (leading, trailing or double slash)".to_string(),
        ));
    }
    if segments
        .iter()
        .any(|s| s.contains('+') || s.contains('#'))
    {
        return Err(TopicError::WildcardInPublication);
    }
    if segments.len() < 6 {
        return Err(TopicError::Malformed(format!(
            "expected at least 6 segments, got {}",
            segments.len()
        )));
    }

    if segments[0] != TOPIC_ROOT {
        return Err(TopicError::WrongRoot);
    }
    if segments[1] != PROTOCOL_VERSION {
        return Err(TopicError::UnsupportedVersion(segments[1].to_string()));
    }

    let tenant = validated_identifier("tenant", segments[2].to_string())?;
    let site = validated_identifier("site", segments[3].to_string())?;

    // Group downlink: rtk/v1/<tenant>/<site>/group/<group_id>/cmd/req
    if segments[4] == "group" {
        if segments.len() != 8 || segments[6] != "cmd" || segments[7] != "req" {
            return Err(TopicError::Malformed(
                "group topics only carry cmd/req".to_string(),
            ));
        }
        let group_id = validated_identifier("group", segments[5].to_string())?;
        return Ok(ParsedTopic::Group(GroupAddress {
            tenant,
            site,
            group_id,
        }));
    }

    let device_id = DeviceId::new(segments[4])?;
    let channel = parse_channel(segments[5], segments.get(6).copied(), segments.len())?;

    Ok(ParsedTopic::Device(TopicAddress {
        addr: DeviceAddress {
            tenant,
            site,
            device_id,
        },
        channel,
    }))
}

/// Parses the message-type and optional sub-type segments.
fn parse_channel(
    message_type: &str,
    sub_type: Option<&str>,
    segment_count: usize,
) -> Result<Channel, TopicError> {
    let expect_len = |want: usize, kind: &'static str| {
        if segment_count == want {
            Ok(())
        } else if segment_count < want {
            Err(TopicError::MissingSubType(kind))
        } else {
            Err(TopicError::Malformed(format!(
                "too many segments for message type {kind}"
            )))
        }
    };

    match message_type {
        "state" => {
            expect_len(6, "state")?;
            Ok(Channel::State)
        }
        "attr" => {
            expect_len(6, "attr")?;
            Ok(Channel::Attr)
        }
        "lwt" => {
            expect_len(6, "lwt")?;
            Ok(Channel::Lwt)
        }
        "telemetry" => {
            expect_len(7, "telemetry")?;
            Ok(Channel::Telemetry {
                metric: sub_type.unwrap_or_default().to_string(),
            })
        }
        "evt" => {
            expect_len(7, "evt")?;
            Ok(Channel::Event {
                event_type: sub_type.unwrap_or_default().to_string(),
            })
        }
        "cmd" => {
            expect_len(7, "cmd")?;
            match sub_type {
                Some("req") => Ok(Channel::Command(CommandLeg::Request)),
                Some("ack") => Ok(Channel::Command(CommandLeg::Ack)),
                Some("res") => Ok(Channel::Command(CommandLeg::Result)),
                Some(other) => Err(TopicError::InvalidSubType {
                    kind: "cmd",
                    value: other.to_string(),
                }),
                None => Err(TopicError::MissingSubType("cmd")),
            }
        }
        "topology" => {
            expect_len(7, "topology")?;
            match sub_type {
                Some("discovery") => Ok(Channel::Topology(TopologyKind::Discovery)),
                Some("connections") => Ok(Channel::Topology(TopologyKind::Connections)),
                Some(other) => Err(TopicError::InvalidSubType {
                    kind: "topology",
                    value: other.to_string(),
                }),
                None => Err(TopicError::MissingSubType("topology")),
            }
        }
        "diagnostics" => {
            expect_len(7, "diagnostics")?;
            Ok(Channel::Diagnostics {
                kind: sub_type.unwrap_or_default().to_string(),
            })
        }
        other => Err(TopicError::UnknownMessageType(other.to_string())),
    }
}

/// Returns `true` if the value matches `[a-z0-9][a-z0-9-]*`.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Returns `true` if the value is exactly 12 lowercase hex digits.
#[must_use]
pub fn is_valid_device_id(value: &str) -> bool {
    value.len() == 12
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn validated_identifier(kind: &'static str, value: String) -> Result<String, TopicError> {
    if is_valid_identifier(&value) {
        Ok(value)
    } else {
        Err(TopicError::InvalidIdentifier { kind, value })
    }
}

/// A subscription pattern with MQTT wildcard semantics.
///
/// `+` matches exactly one segment; `#` matches zero or more trailing
/// segments and may only appear as the final segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    segments: Vec<FilterSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterSegment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

impl TopicFilter {
    /// Creates a filter, validating wildcard placement.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError::Malformed`] for empty segments, `#` in a
    /// non-final position, or wildcards mixed into a literal segment.
    pub fn new(pattern: impl Into<String>) -> Result<Self, TopicError> {
        let pattern = pattern.into();
        let raw: Vec<&str> = pattern.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (i, seg) in raw.iter().enumerate() {
            if seg.is_empty() {
                return Err(TopicError::Malformed(
                    "empty segment in subscription pattern".to_string(),
                ));
            }
            match *seg {
                "+" => segments.push(FilterSegment::SingleLevel),
                "#" => {
                    if i != raw.len() - 1 {
                        return Err(TopicError::Malformed(
                            "# must be the final segment".to_string(),
                        ));
                    }
                    segments.push(FilterSegment::MultiLevel);
                }
                literal => {
                    if literal.contains('+') || literal.contains('#') {
                        return Err(TopicError::Malformed(format!(
                            "wildcard inside literal segment {literal:?}"
                        )));
                    }
                    segments.push(FilterSegment::Literal(literal.to_string()));
                }
            }
        }

        Ok(Self { pattern, segments })
    }

    /// Returns the pattern string as given.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns `true` if the concrete topic matches this filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let topic_segs: Vec<&str> = topic.split('/').collect();
        let mut ti = 0;

        for (fi, seg) in self.segments.iter().enumerate() {
            match seg {
                FilterSegment::MultiLevel => {
                    // `#` also matches the parent level itself.
                    debug_assert_eq!(fi, self.segments.len() - 1);
                    return true;
                }
                FilterSegment::SingleLevel => {
                    if ti >= topic_segs.len() {
                        return false;
                    }
                    ti += 1;
                }
                FilterSegment::Literal(lit) => {
                    if ti >= topic_segs.len() || topic_segs[ti] != lit {
                        return false;
                    }
                    ti += 1;
                }
            }
        }

        ti == topic_segs.len()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Returns the pattern matching every topic under the hierarchy root.
#[must_use]
pub fn filter_all() -> String {
    format!("{TOPIC_ROOT}/{PROTOCOL_VERSION}/#")
}

/// Returns the pattern matching every topic for one site.
#[must_use]
pub fn filter_site(tenant: &str, site: &str) -> String {
    format!("{TOPIC_ROOT}/{PROTOCOL_VERSION}/{tenant}/{site}/+/#")
}

/// Returns the pattern matching command acks and results for one site.
#[must_use]
pub fn filter_site_command_replies(tenant: &str, site: &str) -> Vec<String> {
    vec![
        format!("{TOPIC_ROOT}/{PROTOCOL_VERSION}/{tenant}/{site}/+/cmd/ack"),
        format!("{TOPIC_ROOT}/{PROTOCOL_VERSION}/{tenant}/{site}/+/cmd/res"),
    ]
}
