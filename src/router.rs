// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription router.
//!
//! Holds the configured subscription patterns and classifies parsed
//! inbound topics into handler classes by message type. Classification is
//! pure and synchronous; the handlers behind each class enqueue work on
//! their own queues and never block the ingest loop.

use crate::error::TopicError;
use crate::topic::{Channel, CommandLeg, ParsedTopic, TopicFilter};

/// Handler class an inbound topic routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Device-owned traffic: state, attr, lwt, telemetry, topology,
    /// diagnostics. Flows to the device registry.
    Registry,
    /// Device events: flows to the registry (liveness) and the event
    /// processor.
    Events,
    /// Command acks and results: flows to the dispatcher's correlation
    /// map (and the registry for liveness).
    CommandReply,
    /// Our own downlink traffic looped back by a broad subscription;
    /// recorded in the message log only.
    LogOnly,
}

/// The configured subscription set plus the classification table.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRouter {
    filters: Vec<TopicFilter>,
}

impl SubscriptionRouter {
    /// Creates a router over the given subscription patterns.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError`] if a pattern is not a valid MQTT filter.
    pub fn new<I, S>(patterns: I) -> Result<Self, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let filters = patterns
            .into_iter()
            .map(|p| TopicFilter::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    /// Returns the subscription patterns, in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(TopicFilter::pattern)
    }

    /// Returns the number of configured patterns.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if any configured pattern matches the topic.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| f.matches(topic))
    }

    /// Classifies a parsed topic into its handler class.
    #[must_use]
    pub fn classify(parsed: &ParsedTopic) -> Route {
        match parsed {
            ParsedTopic::Group(_) => Route::LogOnly,
            ParsedTopic::Device(address) => match &address.channel {
                Channel::State
                | Channel::Attr
                | Channel::Lwt
                | Channel::Telemetry { .. }
                | Channel::Topology(_)
                | Channel::Diagnostics { .. } => Route::Registry,
                Channel::Event { .. } => Route::Events,
                Channel::Command(CommandLeg::Ack | CommandLeg::Result) => Route::CommandReply,
                Channel::Command(CommandLeg::Request) => Route::LogOnly,
            },
        }
    }
}
