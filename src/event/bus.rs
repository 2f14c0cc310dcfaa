// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller-scoped event bus.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::command::{ChangesetStatus, CommandStatus};
use crate::topic::DeviceAddress;

use super::EventRecord;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events published on the controller bus.
///
/// These notify subscribers about device lifecycle transitions, ingested
/// device events, and command/changeset completion. Subscribers include
/// the rule engine and any operator surface that wants live updates.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A device record was created.
    DeviceAdded {
        /// The new device.
        addr: DeviceAddress,
    },

    /// A device transitioned to online.
    DeviceOnline {
        /// The device.
        addr: DeviceAddress,
        /// Timestamp of the transition (device side where known).
        ts: DateTime<Utc>,
    },

    /// A device transitioned to offline (LWT).
    DeviceOffline {
        /// The device.
        addr: DeviceAddress,
        /// Timestamp of the transition.
        ts: DateTime<Utc>,
        /// Broker- or device-supplied reason.
        reason: Option<String>,
    },

    /// No traffic was seen within the offline threshold; liveness is
    /// now unknown (`device.silent`).
    DeviceSilent {
        /// The device.
        addr: DeviceAddress,
        /// When traffic was last seen.
        last_seen: DateTime<Utc>,
    },

    /// A device event passed normalization and dedup.
    EventIngested(EventRecord),

    /// A command reached a terminal state.
    CommandFinished {
        /// The correlation id.
        cmd_id: String,
        /// The target device.
        addr: DeviceAddress,
        /// The terminal status.
        status: CommandStatus,
    },

    /// A changeset finished executing or rolling back.
    ChangesetFinished {
        /// The changeset id.
        changeset_id: String,
        /// The final status.
        status: ChangesetStatus,
    },

    /// A rule fired and submitted a changeset.
    RuleFired {
        /// The rule id.
        rule_id: String,
        /// The changeset it submitted.
        changeset_id: String,
    },
}

/// Broadcast bus distributing [`ControllerEvent`]s to subscribers.
///
/// Each subscriber receives its own copy of every event published after
/// it subscribed. A slow subscriber loses oldest events
/// (`RecvError::Lagged`) rather than stalling publishers.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a bus with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event to all subscribers.
    ///
    /// Events published with no subscribers are silently discarded.
    pub fn publish(&self, event: ControllerEvent) {
        // Ignore errors (no subscribers or channel closed).
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
