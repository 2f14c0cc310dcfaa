// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage facade: an ordered byte-key KV contract over an embedded store.
//!
//! Keys are namespaced per record kind (see [`keys`]); time-ordered
//! namespaces use the wire timestamp format so lexicographic order is
//! chronological order, which lets retention sweeps delete by range scan.
//!
//! The facade is deliberately thin: transactions are short and the
//! backing engine ([`redb`]) is supplied, not implemented, here.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// A single operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or replace a key.
    Put {
        /// The record key.
        key: String,
        /// The serialized record.
        value: Vec<u8>,
    },
    /// Remove a key (missing keys are fine).
    Delete {
        /// The record key.
        key: String,
    },
}

/// An ordered set of operations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put operation.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    /// Appends a delete operation.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered byte-key KV contract shared by every persisting component.
pub trait KeyValueStore: Send + Sync {
    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Inserts or replaces a key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Removes a key. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Scans keys under a prefix in lexicographic order.
    ///
    /// `start` (if given, and greater than the prefix) positions the scan
    /// mid-range; `limit` bounds the number of returned entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn scan(
        &self,
        prefix: &str,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails; no partial batch
    /// is ever visible.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Reads and JSON-decodes a record, tolerating unknown fields.
///
/// # Errors
///
/// Returns [`StorageError`] on backend or deserialization failure.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// JSON-encodes and writes a record.
///
/// # Errors
///
/// Returns [`StorageError`] on backend or serialization failure.
pub fn store_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    record: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(record)?;
    store.set(key, &bytes)
}

/// The redb-backed store.
#[derive(Debug)]
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Opens (or creates) a database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path)?;
        // Ensure the table exists so first reads do not special-case.
        let txn = db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.commit()?;
        Ok(Self { db })
    }
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let value = table.get(key)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn scan(
        &self,
        prefix: &str,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;

        let from = match start {
            Some(s) if s > prefix => s,
            _ => prefix,
        };
        let limit = limit.unwrap_or(usize::MAX);

        let mut out = Vec::new();
        for item in table.range(from..)? {
            let (key, value) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_str(), value.as_slice())?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

/// An in-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared handle to an empty store.
    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns `true` if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan(
        &self,
        prefix: &str,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let from = match start {
            Some(s) if s > prefix => s.to_string(),
            _ => prefix.to_string(),
        };
        let limit = limit.unwrap_or(usize::MAX);
        let map = self.map.read();
        Ok(map
            .range(from..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Key builders for the persisted namespaces.
pub mod keys {
    use chrono::{DateTime, Utc};

    use crate::codec::format_ts;
    use crate::topic::DeviceAddress;

    /// Prefix of device records.
    pub const DEVICE_PREFIX: &str = "device/";
    /// Prefix of event records.
    pub const EVENT_PREFIX: &str = "event/";
    /// Prefix of command records.
    pub const COMMAND_PREFIX: &str = "cmd/";
    /// Prefix of changeset records.
    pub const CHANGESET_PREFIX: &str = "changeset/";
    /// Prefix of message-log entries.
    pub const MSGLOG_PREFIX: &str = "msglog/";

    /// `device/{tenant}/{site}/{device_id}`
    #[must_use]
    pub fn device(addr: &DeviceAddress) -> String {
        format!(
            "{DEVICE_PREFIX}{}/{}/{}",
            addr.tenant, addr.site, addr.device_id
        )
    }

    /// `event/{ts_ingest}/{event_id}` — time-ordered for retention scans.
    #[must_use]
    pub fn event(ts_ingest: DateTime<Utc>, event_id: &str) -> String {
        format!("{EVENT_PREFIX}{}/{event_id}", format_ts(ts_ingest))
    }

    /// `cmd/{cmd_id}`
    #[must_use]
    pub fn command(cmd_id: &str) -> String {
        format!("{COMMAND_PREFIX}{cmd_id}")
    }

    /// `changeset/{changeset_id}`
    #[must_use]
    pub fn changeset(changeset_id: &str) -> String {
        format!("{CHANGESET_PREFIX}{changeset_id}")
    }

    /// `msglog/{ts_ingest}/{seq}` — time-ordered for retention scans.
    #[must_use]
    pub fn msglog(ts_ingest: DateTime<Utc>, seq: u64) -> String {
        format!("{MSGLOG_PREFIX}{}/{seq:012}", format_ts(ts_ingest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    use crate::topic::DeviceAddress;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a/1", b"one").unwrap();
        store.set("a/2", b"two").unwrap();
        store.set("b/1", b"other").unwrap();

        assert_eq!(store.get("a/1").unwrap(), Some(b"one".to_vec()));

        let scanned = store.scan("a/", None, None).unwrap();
        assert_eq!(
            scanned,
            vec![
                ("a/1".to_string(), b"one".to_vec()),
                ("a/2".to_string(), b"two".to_vec()),
            ]
        );

        // Positioned scan.
        let from_two = store.scan("a/", Some("a/2"), None).unwrap();
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].0, "a/2");

        // Limited scan.
        let limited = store.scan("a/", None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);

        store.delete("a/1").unwrap();
        assert_eq!(store.get("a/1").unwrap(), None);
        // Deleting again is fine.
        store.delete("a/1").unwrap();

        let mut batch = WriteBatch::new();
        batch.put("c/1", b"c1".to_vec());
        batch.put("c/2", b"c2".to_vec());
        batch.delete("a/2");
        store.write_batch(batch).unwrap();

        assert_eq!(store.get("a/2").unwrap(), None);
        assert_eq!(store.get("c/1").unwrap(), Some(b"c1".to_vec()));
        assert_eq!(store.get("c/2").unwrap(), Some(b"c2".to_vec()));
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn redb_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn redb_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("k", b"v").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn json_helpers_tolerate_unknown_fields() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Slim {
            name: String,
        }

        let store = MemoryStore::new();
        store
            .set("r", br#"{"name":"x","removed_field":42}"#)
            .unwrap();

        let loaded: Slim = load_json(&store, "r").unwrap().unwrap();
        assert_eq!(loaded.name, "x");

        store_json(&store, "r2", &Slim { name: "y".into() }).unwrap();
        let back: Slim = load_json(&store, "r2").unwrap().unwrap();
        assert_eq!(back.name, "y");
    }

    #[test]
    fn key_namespaces() {
        let addr = DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap();
        assert_eq!(keys::device(&addr), "device/office/floor1/aabbccddeeff");

        let ts = Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap();
        assert_eq!(
            keys::event(ts, "ev-1"),
            "event/2024-08-13T08:00:00.000Z/ev-1"
        );
        assert_eq!(keys::command("abc"), "cmd/abc");
        assert_eq!(keys::changeset("cs"), "changeset/cs");
        assert_eq!(
            keys::msglog(ts, 7),
            "msglog/2024-08-13T08:00:00.000Z/000000000007"
        );
    }

    #[test]
    fn time_ordered_keys_sort_chronologically() {
        let t1 = Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 30).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        assert!(keys::msglog(t1, 0) < keys::msglog(t2, 0));
        assert!(keys::msglog(t2, 999) < keys::msglog(t3, 0));
    }
}
