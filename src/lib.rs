// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `rtk_core` - the diagnostic messaging core for RTK home-network
//! controllers.
//!
//! This library ingests telemetry, state and event traffic from IoT,
//! network and client devices over a versioned MQTT topic hierarchy,
//! maintains device liveness and identity, and drives correlated
//! request/response command dispatch with at-most-once execution,
//! timeout/retry, and changeset-scoped rollback.
//!
//! # Architecture
//!
//! ```text
//!   MQTT broker
//!       │ inbound                         outbound │
//!       ▼                                          │
//!  MqttTransport ──► ingest loop ──► SubscriptionRouter
//!       │                │                │
//!   MessageLog ◄─────────┤      ┌─────────┼──────────────┐
//!                        ▼      ▼         ▼              ▼
//!                  Message codec    DeviceRegistry  EventProcessor
//!                        │               ▲                │
//!                        ▼               │ capabilities   ▼
//!                 CommandDispatcher ─────┘            EventBus
//!                        ▲                                │
//!                   RuleEngine ◄──────────────────────────┘
//! ```
//!
//! Every component is explicitly constructed by the [`Controller`] and
//! receives its collaborators as handles; there are no process-wide
//! registries. Cross-component notifications travel over a single
//! broadcast [`event::EventBus`].
//!
//! # Quick start
//!
//! ```no_run
//! use rtk_core::{Controller, ControllerConfig};
//! use rtk_core::storage::RedbStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rtk_core::Result<()> {
//!     let mut config = ControllerConfig::new();
//!     config.transport.host = "192.168.1.10".to_string();
//!
//!     let store = Arc::new(RedbStore::open("controller.redb")?);
//!     let controller = Controller::new(config, store, rtk_core::clock::system_clock())?;
//!     controller.load_persisted()?;
//!     controller.connect()?;
//!
//!     // React to device lifecycle and command completion.
//!     let mut events = controller.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Command dispatch
//!
//! ```no_run
//! use rtk_core::command::CommandOptions;
//! use rtk_core::topic::DeviceAddress;
//!
//! # async fn example(controller: rtk_core::Controller) -> rtk_core::Result<()> {
//! let bulb = DeviceAddress::new("office", "floor1", "aabbccddeeff")?;
//! let mut handle = controller.submit_command(
//!     bulb,
//!     "light.set",
//!     serde_json::json!({"on": true, "brightness": 80}),
//!     CommandOptions::default(),
//! )?;
//! let record = handle.wait().await;
//! println!("finished: {:?}", record.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Feeding messages by hand
//!
//! The transport is optional: a simulator or test can take the outbound
//! queue with [`Controller::take_outbound`] and push inbound traffic
//! through [`Controller::ingest`], exercising the full pipeline without
//! a broker.

pub mod clock;
pub mod codec;
pub mod command;
mod config;
mod controller;
pub mod error;
pub mod event;
pub mod msglog;
pub mod registry;
pub mod router;
pub mod rules;
pub mod schema;
pub mod storage;
pub mod topic;
pub mod transport;

pub use config::ControllerConfig;
pub use controller::{Controller, IngestStats};
pub use error::{
    ChangesetError, CommandError, Error, PayloadError, Result, StorageError, TopicError,
    TransportError,
};
