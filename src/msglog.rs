// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded, append-only, time-indexed log of inbound and outbound traffic.
//!
//! Entries are queued by the ingest path and drained by a single writer
//! task that batches them into atomic store writes. The queue is bounded:
//! on overflow the oldest queued entries are dropped and a counter is
//! incremented, so a slow store can never stall ingest. A purge task
//! periodically deletes entries older than the retention window using the
//! time-ordered key namespace.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::codec::ts_format;
use crate::error::{Error, StorageError};
use crate::storage::{SharedStore, WriteBatch, keys};

/// Message-log configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct MsgLogConfig {
    /// How long entries are kept. Default 3600 s.
    pub retention: Duration,
    /// How often the purge task sweeps. Default 60 s.
    pub purge_interval: Duration,
    /// Queue high-water mark; oldest entries drop beyond it. Default 1024.
    pub queue_capacity: usize,
    /// Maximum entries per store batch. Default 64.
    pub batch_size: usize,
    /// Topic globs that are never recorded.
    pub exclude_topics: Vec<String>,
}

impl Default for MsgLogConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(60),
            queue_capacity: 1024,
            batch_size: 64,
            exclude_topics: Vec::new(),
        }
    }
}

/// Traffic direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the broker.
    In,
    /// Published by this controller.
    Out,
}

/// One logged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number, unique within this process.
    pub id: u64,
    /// Ingest-side timestamp.
    #[serde(with = "ts_format")]
    pub ts_ingest: DateTime<Utc>,
    /// The full topic.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// QoS the message was seen/published with.
    pub qos: u8,
    /// Whether the broker retain flag was set.
    pub retained: bool,
    /// Traffic direction.
    pub direction: Direction,
    /// Payload size in bytes.
    pub size: usize,
}

/// Query filter for [`MessageLog::query`].
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Only entries whose topic contains this substring.
    pub topic_contains: Option<String>,
    /// Only entries in this direction.
    pub direction: Option<Direction>,
    /// Only entries at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only entries before this instant.
    pub until: Option<DateTime<Utc>>,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Entries accepted into the queue.
    pub recorded: u64,
    /// Entries dropped at the queue boundary.
    pub dropped: u64,
    /// Entries skipped by the exclusion list.
    pub excluded: u64,
    /// Store write failures (batches, not entries).
    pub write_errors: u64,
}

struct LogInner {
    queue: Mutex<VecDeque<LogEntry>>,
    notify: Notify,
    store: SharedStore,
    clock: SharedClock,
    config: MsgLogConfig,
    exclude: GlobSet,
    seq: AtomicU64,
    recorded: AtomicU64,
    dropped: AtomicU64,
    excluded: AtomicU64,
    write_errors: AtomicU64,
}

/// Bounded retention log of protocol traffic.
///
/// Cheaply cloneable; all clones share the same queue and counters.
#[derive(Clone)]
pub struct MessageLog {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog")
            .field("queued", &self.inner.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl MessageLog {
    /// Creates a message log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if an exclusion glob fails
    /// to compile.
    pub fn new(store: SharedStore, clock: SharedClock, config: MsgLogConfig) -> Result<Self, Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_topics {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::InvalidConfiguration(format!("bad exclusion glob {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("exclusion globs: {e}")))?;

        Ok(Self {
            inner: Arc::new(LogInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                store,
                clock,
                config,
                exclude,
                seq: AtomicU64::new(0),
                recorded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                excluded: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
            }),
        })
    }

    /// Posts an entry. Non-blocking: overflow drops the oldest queued
    /// entry, exclusion-listed topics are skipped entirely.
    pub fn record(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retained: bool,
        direction: Direction,
    ) {
        let inner = &self.inner;
        if inner.exclude.is_match(topic) {
            inner.excluded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let entry = LogEntry {
            id: inner.seq.fetch_add(1, Ordering::Relaxed),
            ts_ingest: inner.clock.now(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retained,
            direction,
            size: payload.len(),
        };

        {
            let mut queue = inner.queue.lock();
            if queue.len() >= inner.config.queue_capacity {
                queue.pop_front();
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(entry);
        }
        inner.recorded.fetch_add(1, Ordering::Relaxed);
        inner.notify.notify_one();
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let inner = &self.inner;
        LogStats {
            recorded: inner.recorded.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            excluded: inner.excluded.load(Ordering::Relaxed),
            write_errors: inner.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Spawns the writer and purge tasks. Both stop when `shutdown`
    /// observes `true`; the writer drains the queue first.
    #[must_use]
    pub fn spawn_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let writer = {
            let log = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = log.inner.notify.notified() => log.drain(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                log.drain();
                                break;
                            }
                        }
                    }
                }
            })
        };

        let purger = {
            let log = self.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(log.inner.config.purge_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it.
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = log.purge_expired() {
                                tracing::warn!(error = %e, "Message log purge failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        vec![writer, purger]
    }

    /// Drains the queue into the store in batches.
    fn drain(&self) {
        let inner = &self.inner;
        loop {
            let entries: Vec<LogEntry> = {
                let mut queue = inner.queue.lock();
                let take = queue.len().min(inner.config.batch_size);
                queue.drain(..take).collect()
            };
            if entries.is_empty() {
                return;
            }

            let mut batch = WriteBatch::new();
            for entry in &entries {
                match serde_json::to_vec(entry) {
                    Ok(bytes) => {
                        batch.put(keys::msglog(entry.ts_ingest, entry.id), bytes);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize log entry");
                    }
                }
            }
            if let Err(e) = inner.store.write_batch(batch) {
                inner.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, count = entries.len(), "Message log batch write failed");
            }
        }
    }

    /// Waits until every queued entry has been written.
    ///
    /// Intended for tests and shutdown paths.
    pub async fn flush(&self) {
        self.inner.notify.notify_one();
        while !self.inner.queue.lock().is_empty() {
            self.inner.notify.notify_one();
            tokio::task::yield_now().await;
        }
        // One more yield so an in-flight batch write finishes.
        tokio::task::yield_now().await;
    }

    /// Deletes entries older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if a scan or delete batch fails.
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let inner = &self.inner;
        let retention = chrono::Duration::from_std(inner.config.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let cutoff = inner.clock.now() - retention;
        let cutoff_key = keys::msglog(cutoff, 0);

        let mut removed = 0;
        loop {
            let page = inner.store.scan(keys::MSGLOG_PREFIX, None, Some(512))?;
            let expired: Vec<String> = page
                .into_iter()
                .map(|(k, _)| k)
                .take_while(|k| k.as_str() < cutoff_key.as_str())
                .collect();
            if expired.is_empty() {
                break;
            }
            let page_len = expired.len();

            let mut batch = WriteBatch::new();
            for key in expired {
                batch.delete(key);
            }
            inner.store.write_batch(batch)?;
            removed += page_len;

            if page_len < 512 {
                break;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Purged expired message-log entries");
        }
        Ok(removed)
    }

    /// Queries stored entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the scan fails.
    pub fn query(&self, filter: &LogQuery, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        let start = filter.since.map(|since| keys::msglog(since, 0));
        let until_key = filter.until.map(|until| keys::msglog(until, 0));

        let mut out = Vec::new();
        let mut cursor: Option<String> = start;
        'scan: loop {
            let page =
                self.inner
                    .store
                    .scan(keys::MSGLOG_PREFIX, cursor.as_deref(), Some(512))?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for (key, bytes) in page {
                if let Some(until) = &until_key {
                    if key.as_str() >= until.as_str() {
                        break 'scan;
                    }
                }
                cursor = Some(next_key(&key));
                let entry: LogEntry = match serde_json::from_slice(&bytes) {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping unreadable log entry");
                        continue;
                    }
                };
                if let Some(dir) = filter.direction {
                    if entry.direction != dir {
                        continue;
                    }
                }
                if let Some(substr) = &filter.topic_contains {
                    if !entry.topic.contains(substr.as_str()) {
                        continue;
                    }
                }
                out.push(entry);
                if out.len() >= limit {
                    break 'scan;
                }
            }

            if page_len < 512 {
                break;
            }
        }
        Ok(out)
    }
}

/// Returns the smallest key strictly greater than `key`.
fn next_key(key: &str) -> String {
    let mut next = key.to_string();
    next.push('\u{0}');
    next
}
