// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `rtk_core` library.
//!
//! This module provides the error hierarchy for failures across the core:
//! topic grammar, payload decoding, schema validation, command dispatch,
//! changeset execution, persistence, and transport.

use thiserror::Error;

/// The main error type for this library.
///
/// This enum encompasses all errors that can surface from the diagnostic
/// messaging core. Decode-level errors (`Topic`, `Payload`) are normally
/// dropped and counted at the ingest boundary rather than propagated;
/// command and changeset errors are always returned to the submitter.
#[derive(Debug, Error)]
pub enum Error {
    /// A topic string failed the grammar.
    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    /// A payload failed envelope decoding or schema validation.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// A command submission or execution failed.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// A changeset operation failed.
    #[error("changeset error: {0}")]
    Changeset(#[from] ChangesetError),

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport-level communication failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Device was not found in the registry.
    #[error("device not found")]
    DeviceNotFound,

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors related to the topic grammar.
///
/// These occur when parsing inbound topics or composing publication
/// topics. At the ingest boundary they are counted and the message is
/// dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic does not start with the expected root segment.
    #[error("topic does not start with the rtk root")]
    WrongRoot,

    /// The protocol version segment is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// A tenant or site segment failed the identifier grammar.
    #[error("invalid {kind} identifier: {value:?}")]
    InvalidIdentifier {
        /// Which segment failed (`tenant`, `site`, `group`).
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// The device id segment is not 12 lowercase hex characters.
    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    /// The message-type segment is not recognized.
    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    /// A message type that requires a sub-type segment is missing one.
    #[error("message type {0} requires a sub-type segment")]
    MissingSubType(&'static str),

    /// The sub-type segment is not valid for its message type.
    #[error("invalid sub-type {value:?} for message type {kind}")]
    InvalidSubType {
        /// The message type segment.
        kind: &'static str,
        /// The offending sub-type.
        value: String,
    },

    /// The topic has too few or too many segments, or an empty segment.
    #[error("malformed topic structure: {0}")]
    Malformed(String),

    /// A wildcard appeared in a publication topic.
    #[error("wildcard segment in publication topic")]
    WildcardInPublication,
}

/// Errors related to payload decoding and validation.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required envelope field is missing.
    #[error("missing envelope field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field {field}: {message}")]
    InvalidField {
        /// The field that failed to decode.
        field: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The `schema` field does not match `name/MAJOR.MINOR`.
    #[error("invalid schema id: {0:?}")]
    InvalidSchemaId(String),

    /// The `ts` field is not UTC ISO-8601 with a trailing `Z`.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// Strict-mode schema validation rejected the payload.
    #[error("payload rejected by schema {schema}: {} violation(s)", violations.len())]
    Rejected {
        /// The schema the payload was validated against.
        schema: String,
        /// Validation violations, one message per failed check.
        violations: Vec<String>,
    },

    /// A registered schema definition failed to compile.
    #[error("schema {schema} failed to compile: {message}")]
    SchemaCompile {
        /// The schema being registered.
        schema: String,
        /// Compiler diagnostic.
        message: String,
    },
}

/// Errors returned to command submitters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The target device's capability cache is older than the TTL.
    #[error("capability cache for {device} is stale ({age_secs} s old)")]
    CapabilityExpired {
        /// The target device id.
        device: String,
        /// Age of the capability cache in seconds.
        age_secs: u64,
    },

    /// The target device does not declare support for the operation.
    #[error("device {device} does not support operation {op}")]
    CapabilityUnsupported {
        /// The target device id.
        device: String,
        /// The requested operation.
        op: String,
    },

    /// The target device is not known to the registry.
    #[error("device {0} is not registered")]
    UnknownDevice(String),

    /// The target device is offline and the dispatcher refuses queueing.
    #[error("device {0} is offline")]
    DeviceOffline(String),

    /// No ack arrived within the budget after exhausting retries.
    #[error("no ack from {device} after {attempts} attempt(s)")]
    AckTimeout {
        /// The target device id.
        device: String,
        /// Total publish attempts made.
        attempts: u32,
    },

    /// No result arrived within the result budget.
    #[error("no result from {device} within {timeout_ms} ms")]
    ResultTimeout {
        /// The target device id.
        device: String,
        /// The configured result timeout.
        timeout_ms: u64,
    },

    /// The device reported a failure.
    #[error("device error {code}: {message}")]
    Device {
        /// Device-supplied error code.
        code: String,
        /// Device-supplied error message.
        message: String,
    },

    /// The device rejected the request in its ack.
    #[error("request rejected by device: {0}")]
    Rejected(String),

    /// The command was cancelled before reaching a terminal state.
    #[error("command cancelled")]
    Cancelled,

    /// The command payload failed serialization before publish.
    #[error("request serialization failed: {0}")]
    Serialization(String),

    /// The outbound queue to the transport is closed or full.
    #[error("outbound channel unavailable")]
    OutboundUnavailable,
}

/// Errors related to changeset execution and rollback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangesetError {
    /// The changeset id is not known.
    #[error("changeset {0} not found")]
    NotFound(String),

    /// The changeset is not in a status that permits the operation.
    #[error("changeset {id} is {status}, expected {expected}")]
    InvalidStatus {
        /// The changeset id.
        id: String,
        /// The current status.
        status: String,
        /// The status(es) the operation requires.
        expected: &'static str,
    },

    /// Rollback was requested while commands are still non-terminal.
    #[error("changeset {0} has non-terminal commands")]
    Conflict(String),

    /// Another execute or rollback is already running on this changeset.
    #[error("concurrent operation on changeset {0}")]
    ConcurrentOperation(String),

    /// The changeset has no rollback commands.
    #[error("changeset {0} has no rollback commands")]
    NoRollbackCommands(String),

    /// One or more inverse commands failed during rollback.
    #[error("rollback of changeset {id} failed: {failed} inverse command(s) unsuccessful")]
    RollbackFailed {
        /// The changeset id.
        id: String,
        /// Number of inverse commands that did not complete.
        failed: usize,
    },
}

/// Errors related to persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Opening or creating the database failed.
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Beginning a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Opening a table failed.
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    /// A read or write inside a transaction failed.
    #[error("backend storage error: {0}")]
    Backend(#[from] redb::StorageError),

    /// Committing a transaction failed.
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// A persisted record failed JSON (de)serialization.
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors related to the MQTT transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// MQTT client operation failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The adapter is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// Invalid broker address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_error_display() {
        let err = TopicError::InvalidDeviceId("AABBCC".to_string());
        assert_eq!(err.to_string(), "invalid device id: \"AABBCC\"");
    }

    #[test]
    fn error_from_topic_error() {
        let err: Error = TopicError::WrongRoot.into();
        assert!(matches!(err, Error::Topic(TopicError::WrongRoot)));
    }

    #[test]
    fn payload_error_display() {
        let err = PayloadError::MissingField("schema");
        assert_eq!(err.to_string(), "missing envelope field: schema");
    }

    #[test]
    fn rejected_counts_violations() {
        let err = PayloadError::Rejected {
            schema: "state/1.0".to_string(),
            violations: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "payload rejected by schema state/1.0: 2 violation(s)"
        );
    }

    #[test]
    fn command_error_display() {
        let err = CommandError::CapabilityExpired {
            device: "aabbccddeeff".to_string(),
            age_secs: 90000,
        };
        assert_eq!(
            err.to_string(),
            "capability cache for aabbccddeeff is stale (90000 s old)"
        );
    }

    #[test]
    fn changeset_error_display() {
        let err = ChangesetError::ConcurrentOperation("cs-1".to_string());
        assert_eq!(err.to_string(), "concurrent operation on changeset cs-1");
    }
}
