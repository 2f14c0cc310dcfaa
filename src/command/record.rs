// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command records and the per-command state machine data.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{ErrorInfo, Expect, ExecutionInfo, Progress, Trace, ts_format, ts_format_opt};
use crate::error::CommandError;
use crate::topic::DeviceAddress;

/// A command correlation identifier.
///
/// Dispatcher-generated ids are 16 random bytes rendered as 32 hex
/// characters; callers may supply their own id to make retries
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CmdId(String);

impl CmdId {
    /// Generates a fresh collision-resistant id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wraps a caller-provided id.
    #[must_use]
    pub fn from_caller(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Created, not yet published.
    Pending,
    /// Published, awaiting ack.
    Sent,
    /// Acked, awaiting result.
    Acked,
    /// Finished successfully. Terminal.
    Completed,
    /// Device rejected or reported failure. Terminal.
    Failed,
    /// Ack or result budget exhausted. Terminal.
    Timeout,
    /// Cancelled before termination. Terminal.
    Cancelled,
}

impl CommandStatus {
    /// Returns `true` for terminal states. Terminal results are
    /// immutable.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Ack-phase retry policy. Only the ack phase retries; result timeouts
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Republish attempts after the first publish. Default 3.
    pub max_retries: u32,
    /// Wait before the first republish. Default 500 ms.
    pub initial_backoff: Duration,
    /// Backoff multiplier per attempt. Default 2.0.
    pub multiplier: f64,
    /// Backoff ceiling. Default 5 s.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Returns the ack wait for a publish attempt (1-based).
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(16);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// What the controller expects back. Default `result`.
    pub expect: Expect,
    /// Overall timeout hint placed in the wire request. Defaults to the
    /// dispatcher's configured default.
    pub timeout_ms: Option<u64>,
    /// Result-phase deadline. Defaults to the dispatcher's configured
    /// default; each progress message restarts it.
    pub result_timeout: Option<Duration>,
    /// Ack-phase retry policy override.
    pub retry: Option<RetryPolicy>,
    /// Caller-provided id for idempotent resubmission.
    pub id: Option<CmdId>,
    /// Changeset this command belongs to.
    pub changeset_id: Option<String>,
    /// Correlation identifiers to stamp on the request.
    pub trace: Option<Trace>,
}

/// One command record, owned exclusively by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Correlation id.
    pub cmd_id: CmdId,
    /// Target device.
    pub device: DeviceAddress,
    /// Operation name.
    pub op: String,
    /// Operation arguments.
    pub args: Value,
    /// Expected reply depth.
    pub expect: Expect,
    /// Wire timeout hint.
    pub timeout_ms: u64,
    /// Owning changeset, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset_id: Option<String>,
    /// Shared group correlation, for group downlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Correlation identifiers stamped on the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,

    /// Lifecycle status.
    pub status: CommandStatus,
    /// Publish attempts so far.
    #[serde(default)]
    pub attempts: u32,

    /// When the record was created.
    #[serde(with = "ts_format")]
    pub created_at: DateTime<Utc>,
    /// First publish instant.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Ack instant.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
    /// Terminal instant.
    #[serde(default, with = "ts_format_opt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Device-reported success, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Device-reported result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Latest progress marker, for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Device-reported error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorInfo>,
    /// Device execution metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionInfo>,
    /// Device free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// The typed failure handed to the submitter, for local failures
    /// (timeouts, cancellation, transport).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl CommandRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn new(
        cmd_id: CmdId,
        device: DeviceAddress,
        op: String,
        args: Value,
        expect: Expect,
        timeout_ms: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cmd_id,
            device,
            op,
            args,
            expect,
            timeout_ms,
            changeset_id: None,
            group_id: None,
            trace: None,
            status: CommandStatus::Pending,
            attempts: 0,
            created_at,
            sent_at: None,
            acked_at: None,
            completed_at: None,
            ok: None,
            result: None,
            progress: None,
            err: None,
            execution: None,
            metadata: None,
            failure: None,
        }
    }

    /// Returns `true` once the record reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the typed error a submitter should see for a terminal
    /// non-success, if any.
    #[must_use]
    pub fn terminal_error(&self) -> Option<CommandError> {
        match self.status {
            CommandStatus::Completed => None,
            CommandStatus::Failed => Some(match &self.err {
                Some(err) => CommandError::Device {
                    code: err.code.clone(),
                    message: err.msg.clone(),
                },
                None => CommandError::Rejected(
                    self.failure.clone().unwrap_or_else(|| "unknown".to_string()),
                ),
            }),
            CommandStatus::Timeout => Some(match self.acked_at {
                Some(_) => CommandError::ResultTimeout {
                    device: self.device.device_id.to_string(),
                    timeout_ms: self.timeout_ms,
                },
                None => CommandError::AckTimeout {
                    device: self.device.device_id.to_string(),
                    attempts: self.attempts,
                },
            }),
            CommandStatus::Cancelled => Some(CommandError::Cancelled),
            CommandStatus::Pending | CommandStatus::Sent | CommandStatus::Acked => None,
        }
    }
}
