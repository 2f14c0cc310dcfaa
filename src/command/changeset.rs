// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Changesets: grouped commands with rollback.
//!
//! A changeset groups commands, an optional list of inverse commands,
//! and the execution results. Execution is sequential (stop at first
//! failure) or parallel (all submitted concurrently). Rollback replays
//! the inverses of the successfully completed commands in reverse
//! submission order as a sequential pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Expect, ts_format, ts_format_opt};
use crate::error::{ChangesetError, CommandError};
use crate::event::ControllerEvent;
use crate::storage::{keys, store_json};
use crate::topic::DeviceAddress;

use super::record::{CmdId, CommandOptions, CommandRecord, CommandStatus};
use super::{CommandDispatcher, CommandHandle};

/// Changeset lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetStatus {
    /// Created, commands not yet submitted.
    Draft,
    /// Queued for execution.
    Pending,
    /// Commands are running.
    Executing,
    /// Every command completed successfully.
    Completed,
    /// At least one command did not complete.
    Failed,
    /// Rollback finished successfully.
    RolledBack,
    /// Rollback ran but at least one inverse failed.
    RollbackFailed,
}

impl ChangesetStatus {
    /// Returns `true` when execution or rollback can no longer proceed.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::RolledBack | Self::RollbackFailed)
    }
}

impl std::fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}

/// Execution mode for a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Each command waits for the previous terminal state; the first
    /// failure stops the changeset.
    Sequential,
    /// All commands are submitted concurrently.
    Parallel,
}

/// One command inside a changeset (or rollback list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Target device.
    pub device: DeviceAddress,
    /// Operation name.
    pub op: String,
    /// Operation arguments.
    pub args: Value,
    /// Expected reply depth.
    #[serde(default)]
    pub expect: Expect,
    /// Wire timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CommandSpec {
    /// Creates a spec expecting a result.
    #[must_use]
    pub fn new(device: DeviceAddress, op: impl Into<String>, args: Value) -> Self {
        Self {
            device,
            op: op.into(),
            args,
            expect: Expect::Result,
            timeout_ms: None,
        }
    }
}

/// A changeset record, owned exclusively by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Identifier (32 hex chars).
    pub changeset_id: String,
    /// Operator-supplied description.
    pub description: String,
    /// Lifecycle status.
    pub status: ChangesetStatus,
    /// The commands, in submission order.
    pub commands: Vec<CommandSpec>,
    /// Execution results, aligned with `commands` up to the stop point.
    #[serde(default)]
    pub results: Vec<CommandRecord>,
    /// Inverse commands, aligned index-wise with `commands`.
    #[serde(default)]
    pub rollback_commands: Vec<CommandSpec>,
    /// Rollback results, in rollback submission order.
    #[serde(default)]
    pub rollback_results: Vec<CommandRecord>,
    /// Creation instant.
    #[serde(with = "ts_format")]
    pub created_at: DateTime<Utc>,
    /// When execution finished.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// When rollback finished.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Operator session that created the changeset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A member of a group dispatch.
#[derive(Debug)]
pub struct GroupMember {
    /// The member device.
    pub device: DeviceAddress,
    /// Handle to the member's command record.
    pub handle: CommandHandle,
}

/// The result of [`CommandDispatcher::submit_group`].
#[derive(Debug)]
pub struct GroupDispatch {
    /// The shared wire id.
    pub cmd_id: CmdId,
    /// The shared group correlation id.
    pub group_id: String,
    /// Per-member handles.
    pub members: Vec<GroupMember>,
}

struct ChangesetSlot {
    data: parking_lot::Mutex<Changeset>,
    /// Held for the duration of an execute or rollback; `try_lock`
    /// failure surfaces as `ConcurrentOperation`.
    running: tokio::sync::Mutex<()>,
}

pub(super) struct ChangesetStore {
    sets: DashMap<String, Arc<ChangesetSlot>>,
}

impl ChangesetStore {
    pub(super) fn new() -> Self {
        Self {
            sets: DashMap::new(),
        }
    }
}

impl CommandDispatcher {
    /// Creates a changeset in `draft` status.
    pub fn create_changeset(
        &self,
        description: impl Into<String>,
        commands: Vec<CommandSpec>,
        rollback_commands: Vec<CommandSpec>,
        session_id: Option<String>,
    ) -> Changeset {
        let changeset = Changeset {
            changeset_id: uuid::Uuid::new_v4().simple().to_string(),
            description: description.into(),
            status: ChangesetStatus::Draft,
            commands,
            results: Vec::new(),
            rollback_commands,
            rollback_results: Vec::new(),
            created_at: self.inner.clock.now(),
            executed_at: None,
            rolled_back_at: None,
            session_id,
        };

        self.inner.changesets.sets.insert(
            changeset.changeset_id.clone(),
            Arc::new(ChangesetSlot {
                data: parking_lot::Mutex::new(changeset.clone()),
                running: tokio::sync::Mutex::new(()),
            }),
        );
        self.persist_changeset(&changeset);
        tracing::debug!(changeset_id = %changeset.changeset_id, "Created changeset");
        changeset
    }

    /// Returns a snapshot of a changeset.
    #[must_use]
    pub fn get_changeset(&self, changeset_id: &str) -> Option<Changeset> {
        self.inner
            .changesets
            .sets
            .get(changeset_id)
            .map(|slot| slot.data.lock().clone())
    }

    /// Executes a changeset.
    ///
    /// # Errors
    ///
    /// - [`ChangesetError::NotFound`] for unknown ids;
    /// - [`ChangesetError::ConcurrentOperation`] while another execute or
    ///   rollback runs;
    /// - [`ChangesetError::InvalidStatus`] unless the status is `draft`
    ///   or `pending`.
    pub async fn execute_changeset(
        &self,
        changeset_id: &str,
        mode: ExecutionMode,
    ) -> Result<Changeset, ChangesetError> {
        let slot = self.changeset_slot(changeset_id)?;
        let _running = slot
            .running
            .try_lock()
            .map_err(|_| ChangesetError::ConcurrentOperation(changeset_id.to_string()))?;

        let commands = {
            let mut data = slot.data.lock();
            match data.status {
                ChangesetStatus::Draft | ChangesetStatus::Pending => {}
                status => {
                    return Err(ChangesetError::InvalidStatus {
                        id: changeset_id.to_string(),
                        status: status.to_string(),
                        expected: "draft or pending",
                    });
                }
            }
            data.status = ChangesetStatus::Executing;
            data.results.clear();
            data.commands.clone()
        };
        self.persist_snapshot(&slot);

        let results = match mode {
            ExecutionMode::Sequential => self.run_sequential(changeset_id, &commands, true).await,
            ExecutionMode::Parallel => self.run_parallel(changeset_id, &commands).await,
        };

        let all_completed = results.len() == commands.len()
            && results.iter().all(|r| r.status == CommandStatus::Completed);

        let snapshot = {
            let mut data = slot.data.lock();
            data.results = results;
            data.executed_at = Some(self.inner.clock.now());
            data.status = if all_completed {
                ChangesetStatus::Completed
            } else {
                ChangesetStatus::Failed
            };
            data.clone()
        };
        self.persist_changeset(&snapshot);
        tracing::info!(
            changeset_id = %changeset_id,
            status = %snapshot.status,
            commands = snapshot.commands.len(),
            executed = snapshot.results.len(),
            "Changeset execution finished"
        );
        self.inner.bus.publish(ControllerEvent::ChangesetFinished {
            changeset_id: changeset_id.to_string(),
            status: snapshot.status,
        });
        Ok(snapshot)
    }

    /// Rolls back a changeset.
    ///
    /// Permitted once every command is terminal and the changeset ended
    /// `completed` or `failed`. Inverses of the successfully completed
    /// commands run in reverse submission order as a sequential pass.
    ///
    /// # Errors
    ///
    /// - [`ChangesetError::NotFound`] / [`ChangesetError::ConcurrentOperation`]
    ///   as for execution;
    /// - [`ChangesetError::InvalidStatus`] unless `completed` or `failed`;
    /// - [`ChangesetError::Conflict`] if any command is non-terminal;
    /// - [`ChangesetError::NoRollbackCommands`] without a rollback list;
    /// - [`ChangesetError::RollbackFailed`] when at least one inverse did
    ///   not complete (the changeset records which ones succeeded).
    pub async fn rollback_changeset(
        &self,
        changeset_id: &str,
    ) -> Result<Changeset, ChangesetError> {
        let slot = self.changeset_slot(changeset_id)?;
        let _running = slot
            .running
            .try_lock()
            .map_err(|_| ChangesetError::ConcurrentOperation(changeset_id.to_string()))?;

        let inverses: Vec<CommandSpec> = {
            let data = slot.data.lock();
            match data.status {
                ChangesetStatus::Completed | ChangesetStatus::Failed => {}
                status => {
                    return Err(ChangesetError::InvalidStatus {
                        id: changeset_id.to_string(),
                        status: status.to_string(),
                        expected: "completed or failed",
                    });
                }
            }
            if data.results.iter().any(|r| !r.is_terminal()) {
                return Err(ChangesetError::Conflict(changeset_id.to_string()));
            }
            if data.rollback_commands.is_empty() {
                return Err(ChangesetError::NoRollbackCommands(changeset_id.to_string()));
            }

            // Invert only the commands that completed, newest first.
            data.results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.status == CommandStatus::Completed)
                .filter_map(|(i, _)| data.rollback_commands.get(i).cloned())
                .rev()
                .collect()
        };

        let rollback_results = self.run_sequential(changeset_id, &inverses, false).await;
        let failed = rollback_results
            .iter()
            .filter(|r| r.status != CommandStatus::Completed)
            .count()
            + inverses.len().saturating_sub(rollback_results.len());

        let snapshot = {
            let mut data = slot.data.lock();
            data.rollback_results = rollback_results;
            data.rolled_back_at = Some(self.inner.clock.now());
            data.status = if failed == 0 {
                ChangesetStatus::RolledBack
            } else {
                ChangesetStatus::RollbackFailed
            };
            data.clone()
        };
        self.persist_changeset(&snapshot);
        tracing::info!(
            changeset_id = %changeset_id,
            status = %snapshot.status,
            "Changeset rollback finished"
        );
        self.inner.bus.publish(ControllerEvent::ChangesetFinished {
            changeset_id: changeset_id.to_string(),
            status: snapshot.status,
        });

        if failed == 0 {
            Ok(snapshot)
        } else {
            Err(ChangesetError::RollbackFailed {
                id: changeset_id.to_string(),
                failed,
            })
        }
    }

    async fn run_sequential(
        &self,
        changeset_id: &str,
        specs: &[CommandSpec],
        stop_on_failure: bool,
    ) -> Vec<CommandRecord> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let record = match self.submit_spec(changeset_id, spec) {
                Ok(mut handle) => handle.wait().await,
                Err(err) => self.synthetic_failure(changeset_id, spec, &err),
            };
            let failed = record.status != CommandStatus::Completed;
            results.push(record);
            if failed && stop_on_failure {
                break;
            }
        }
        results
    }

    async fn run_parallel(&self, changeset_id: &str, specs: &[CommandSpec]) -> Vec<CommandRecord> {
        let mut pending = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.submit_spec(changeset_id, spec) {
                Ok(handle) => pending.push(Ok(handle)),
                Err(err) => pending.push(Err(self.synthetic_failure(changeset_id, spec, &err))),
            }
        }

        let mut results = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Ok(mut handle) => results.push(handle.wait().await),
                Err(record) => results.push(record),
            }
        }
        results
    }

    fn submit_spec(
        &self,
        changeset_id: &str,
        spec: &CommandSpec,
    ) -> Result<CommandHandle, CommandError> {
        self.submit(
            spec.device.clone(),
            spec.op.clone(),
            spec.args.clone(),
            CommandOptions {
                expect: spec.expect,
                timeout_ms: spec.timeout_ms,
                changeset_id: Some(changeset_id.to_string()),
                ..CommandOptions::default()
            },
        )
    }

    fn synthetic_failure(
        &self,
        changeset_id: &str,
        spec: &CommandSpec,
        err: &CommandError,
    ) -> CommandRecord {
        let now = self.inner.clock.now();
        let mut record = CommandRecord::new(
            CmdId::generate(),
            spec.device.clone(),
            spec.op.clone(),
            spec.args.clone(),
            spec.expect,
            spec.timeout_ms.unwrap_or(self.inner.config.timeout_ms),
            now,
        );
        record.changeset_id = Some(changeset_id.to_string());
        record.status = CommandStatus::Failed;
        record.completed_at = Some(now);
        record.failure = Some(err.to_string());
        record
    }

    fn changeset_slot(&self, changeset_id: &str) -> Result<Arc<ChangesetSlot>, ChangesetError> {
        self.inner
            .changesets
            .sets
            .get(changeset_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| ChangesetError::NotFound(changeset_id.to_string()))
    }

    fn persist_snapshot(&self, slot: &ChangesetSlot) {
        let snapshot = slot.data.lock().clone();
        self.persist_changeset(&snapshot);
    }

    fn persist_changeset(&self, changeset: &Changeset) {
        let key = keys::changeset(&changeset.changeset_id);
        if let Err(e) = store_json(self.inner.store.as_ref(), &key, changeset) {
            tracing::warn!(
                changeset_id = %changeset.changeset_id,
                error = %e,
                "Failed to persist changeset"
            );
        }
    }
}
