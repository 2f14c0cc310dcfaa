// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller configuration.
//!
//! Plain structs with documented defaults; loading them from files is a
//! concern of the embedding application, not this core.

use crate::command::DispatcherConfig;
use crate::msglog::MsgLogConfig;
use crate::registry::RegistryConfig;
use crate::schema::ValidationMode;
use crate::transport::TransportConfig;

/// Top-level configuration composing every component's settings.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// MQTT adapter settings.
    pub transport: TransportConfig,
    /// Device registry settings.
    pub registry: RegistryConfig,
    /// Command dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Message log settings.
    pub msglog: MsgLogConfig,
    /// Schema validation mode.
    pub validation: ValidationMode,
    /// Outbound publish queue capacity. Default 256.
    pub outbound_capacity: usize,
}

impl ControllerConfig {
    /// Returns a config with every component at its documented default
    /// and the outbound queue sized at 256.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outbound_capacity: 256,
            ..Self::default()
        }
    }

    /// Returns the effective outbound capacity, guarding the zero value
    /// a `Default`-constructed config carries.
    #[must_use]
    pub fn effective_outbound_capacity(&self) -> usize {
        if self.outbound_capacity == 0 {
            256
        } else {
            self.outbound_capacity
        }
    }
}
