// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity auto-detection.
//!
//! The detector matches MAC OUI prefixes, hostname patterns, DHCP vendor
//! strings, and user agents against a rule set. Each match carries a
//! confidence score; a record with manual identity fields is never
//! overwritten by the detector.

use serde::{Deserialize, Serialize};

use crate::topic::DeviceId;

/// Signals the detector matches against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityHints {
    /// Device hostname, if known.
    pub hostname: Option<String>,
    /// DHCP vendor class identifier, if observed.
    pub dhcp_vendor: Option<String>,
    /// HTTP user agent, if observed.
    pub user_agent: Option<String>,
}

/// One detection rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRule {
    /// Rule name, recorded on matches for troubleshooting.
    pub name: String,
    /// OUI prefixes (first 6 hex digits of the MAC, lowercase).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oui_prefixes: Vec<String>,
    /// Case-insensitive hostname substrings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostname_patterns: Vec<String>,
    /// Case-insensitive DHCP vendor substrings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dhcp_vendor_patterns: Vec<String>,
    /// Case-insensitive user-agent substrings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_agent_patterns: Vec<String>,
    /// Device type assigned on match.
    pub device_type: String,
    /// Manufacturer assigned on match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Base confidence of this rule (0.0 - 1.0).
    pub confidence: f64,
}

/// A successful detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedIdentity {
    /// Device type from the matching rule.
    pub device_type: String,
    /// Manufacturer from the matching rule.
    pub manufacturer: Option<String>,
    /// Effective confidence: the rule confidence scaled by how many of
    /// its signal categories matched.
    pub confidence: f64,
    /// Name of the matching rule.
    pub rule: String,
}

/// Matches identity hints against a rule set.
#[derive(Debug, Clone, Default)]
pub struct IdentityDetector {
    rules: Vec<DetectionRule>,
}

impl IdentityDetector {
    /// Creates a detector over the given rules.
    #[must_use]
    pub fn new(rules: Vec<DetectionRule>) -> Self {
        Self { rules }
    }

    /// Creates a detector with the built-in rule set.
    #[must_use]
    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    /// Returns the number of loaded rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Runs detection, returning the best-scoring match, if any.
    #[must_use]
    pub fn detect(&self, device_id: &DeviceId, hints: &IdentityHints) -> Option<DetectedIdentity> {
        let oui = &device_id.as_str()[..6];
        let hostname = hints.hostname.as_deref().map(str::to_ascii_lowercase);
        let dhcp_vendor = hints.dhcp_vendor.as_deref().map(str::to_ascii_lowercase);
        let user_agent = hints.user_agent.as_deref().map(str::to_ascii_lowercase);

        let mut best: Option<DetectedIdentity> = None;
        for rule in &self.rules {
            let mut categories = 0u32;
            let mut matched = 0u32;

            if !rule.oui_prefixes.is_empty() {
                categories += 1;
                if rule.oui_prefixes.iter().any(|p| oui == p.as_str()) {
                    matched += 1;
                }
            }
            if !rule.hostname_patterns.is_empty() {
                categories += 1;
                if let Some(h) = &hostname {
                    if rule
                        .hostname_patterns
                        .iter()
                        .any(|p| h.contains(&p.to_ascii_lowercase()))
                    {
                        matched += 1;
                    }
                }
            }
            if !rule.dhcp_vendor_patterns.is_empty() {
                categories += 1;
                if let Some(v) = &dhcp_vendor {
                    if rule
                        .dhcp_vendor_patterns
                        .iter()
                        .any(|p| v.contains(&p.to_ascii_lowercase()))
                    {
                        matched += 1;
                    }
                }
            }
            if !rule.user_agent_patterns.is_empty() {
                categories += 1;
                if let Some(ua) = &user_agent {
                    if rule
                        .user_agent_patterns
                        .iter()
                        .any(|p| ua.contains(&p.to_ascii_lowercase()))
                    {
                        matched += 1;
                    }
                }
            }

            if matched == 0 || categories == 0 {
                continue;
            }

            let confidence = rule.confidence * f64::from(matched) / f64::from(categories);
            if best.as_ref().is_none_or(|b| confidence > b.confidence) {
                best = Some(DetectedIdentity {
                    device_type: rule.device_type.clone(),
                    manufacturer: rule.manufacturer.clone(),
                    confidence,
                    rule: rule.name.clone(),
                });
            }
        }

        if let Some(found) = &best {
            tracing::debug!(
                device = %device_id,
                rule = %found.rule,
                confidence = found.confidence,
                "Identity detected"
            );
        }
        best
    }
}

/// The built-in rule set covering common home-network vendors.
#[must_use]
pub fn default_rules() -> Vec<DetectionRule> {
    vec![
        DetectionRule {
            name: "espressif-sensor".to_string(),
            oui_prefixes: vec!["240ac4".to_string(), "30aea4".to_string(), "a4cf12".to_string()],
            hostname_patterns: vec!["esp-".to_string(), "esp32".to_string()],
            device_type: "sensor".to_string(),
            manufacturer: Some("Espressif".to_string()),
            confidence: 0.8,
            ..DetectionRule::default()
        },
        DetectionRule {
            name: "tplink-router".to_string(),
            oui_prefixes: vec!["50c7bf".to_string(), "f4f26d".to_string()],
            hostname_patterns: vec!["tplink".to_string(), "archer".to_string()],
            dhcp_vendor_patterns: vec!["tp-link".to_string()],
            device_type: "router".to_string(),
            manufacturer: Some("TP-Link".to_string()),
            confidence: 0.85,
            ..DetectionRule::default()
        },
        DetectionRule {
            name: "ubiquiti-ap".to_string(),
            oui_prefixes: vec!["24a43c".to_string(), "788a20".to_string()],
            hostname_patterns: vec!["unifi".to_string(), "ubnt".to_string()],
            device_type: "access-point".to_string(),
            manufacturer: Some("Ubiquiti".to_string()),
            confidence: 0.85,
            ..DetectionRule::default()
        },
        DetectionRule {
            name: "generic-client".to_string(),
            hostname_patterns: vec!["iphone".to_string(), "android".to_string(), "macbook".to_string()],
            user_agent_patterns: vec!["mozilla".to_string()],
            device_type: "client".to_string(),
            manufacturer: None,
            confidence: 0.5,
            ..DetectionRule::default()
        },
    ]
}
