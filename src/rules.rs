// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schedule/rule engine.
//!
//! Rules expand time- and event-based triggers into command bundles, each
//! submitted to the dispatcher as a changeset. Evaluation is single-flight
//! per rule: a rule that is already firing skips re-entry. The engine's
//! contract ends at "submit changesets and react to completion events";
//! cron grammars and condition DSLs live outside the core.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::command::{Changeset, CommandDispatcher, CommandSpec, ExecutionMode};
use crate::error::{ChangesetError, Error};
use crate::event::{ControllerEvent, EventBus, Severity};

/// What causes a rule to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleTrigger {
    /// Fires when at least `every` has elapsed since the last firing
    /// (or since the rule was loaded).
    Interval {
        /// The minimum period between firings.
        every: Duration,
    },
    /// Fires on matching ingested device events.
    Event {
        /// Event type to match (exact).
        event_type: String,
        /// Minimum severity, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_severity: Option<Severity>,
    },
}

/// One rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule identifier.
    pub rule_id: String,
    /// Display name.
    pub name: String,
    /// Whether automatic triggers are armed.
    pub enabled: bool,
    /// The trigger.
    pub trigger: RuleTrigger,
    /// How the resulting changeset executes.
    pub mode: ExecutionMode,
    /// The command bundle.
    pub commands: Vec<CommandSpec>,
    /// Inverse commands for rollback.
    #[serde(default)]
    pub rollback_commands: Vec<CommandSpec>,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleStats {
    /// Changesets submitted by rule firings.
    pub fired: u64,
    /// Firings skipped because the rule was already running.
    pub skipped: u64,
}

struct RuleState {
    rule: parking_lot::RwLock<Rule>,
    firing: AtomicBool,
    last_fired: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

struct EngineInner {
    rules: DashMap<String, Arc<RuleState>>,
    dispatcher: CommandDispatcher,
    bus: EventBus,
    clock: SharedClock,
    tick_interval: Duration,
    fired: AtomicU64,
    skipped: AtomicU64,
}

/// The rule engine. Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.inner.rules.len())
            .finish_non_exhaustive()
    }
}

impl RuleEngine {
    /// Creates a rule engine.
    #[must_use]
    pub fn new(dispatcher: CommandDispatcher, bus: EventBus, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                rules: DashMap::new(),
                dispatcher,
                bus,
                clock,
                tick_interval: Duration::from_secs(1),
                fired: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Loads (or replaces) a rule. The interval timer starts at load, so
    /// a new rule first fires one full period later.
    pub fn load_rule(&self, rule: Rule) {
        tracing::debug!(rule_id = %rule.rule_id, name = %rule.name, "Loaded rule");
        self.inner.rules.insert(
            rule.rule_id.clone(),
            Arc::new(RuleState {
                rule: parking_lot::RwLock::new(rule),
                firing: AtomicBool::new(false),
                last_fired: parking_lot::Mutex::new(Some(self.inner.clock.now())),
            }),
        );
    }

    /// Removes a rule. Returns `true` if it existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.inner.rules.remove(rule_id).is_some()
    }

    /// Arms or disarms a rule's automatic triggers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for unknown rules.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), Error> {
        let state = self
            .inner
            .rules
            .get(rule_id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown rule {rule_id}")))?;
        state.rule.write().enabled = enabled;
        Ok(())
    }

    /// Returns a snapshot of a rule.
    #[must_use]
    pub fn get_rule(&self, rule_id: &str) -> Option<Rule> {
        self.inner
            .rules
            .get(rule_id)
            .map(|state| state.rule.read().clone())
    }

    /// Returns the number of loaded rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.inner.rules.len()
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> RuleStats {
        RuleStats {
            fired: self.inner.fired.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
        }
    }

    /// Fires a rule by hand, regardless of `enabled`.
    ///
    /// Returns `None` when the firing was skipped because the rule is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for unknown rules, or the
    /// changeset error from execution.
    pub async fn trigger(&self, rule_id: &str) -> Result<Option<Changeset>, Error> {
        let state = self
            .inner
            .rules
            .get(rule_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown rule {rule_id}")))?;
        self.fire(&state).await.map_err(Error::Changeset)
    }

    /// Spawns the scheduler and event-reaction tasks.
    #[must_use]
    pub fn spawn_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let scheduler = {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.inner.tick_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.evaluate_intervals(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let reactor = {
            let engine = self.clone();
            let mut shutdown = shutdown;
            let mut events = engine.inner.bus.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(ControllerEvent::EventIngested(record)) => {
                                engine.evaluate_event(&record.event_type, record.severity);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "Rule engine lagged behind the event bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        vec![scheduler, reactor]
    }

    /// Checks every interval rule and fires the due ones.
    fn evaluate_intervals(&self) {
        let now = self.inner.clock.now();
        for entry in &self.inner.rules {
            let state = Arc::clone(entry.value());
            let due = {
                let rule = state.rule.read();
                if !rule.enabled {
                    continue;
                }
                let RuleTrigger::Interval { every } = &rule.trigger else {
                    continue;
                };
                let every = chrono::Duration::from_std(*every)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                state
                    .last_fired
                    .lock()
                    .is_none_or(|last| now - last >= every)
            };
            if due {
                let engine = self.clone();
                tokio::spawn(async move {
                    let _ = engine.fire(&state).await;
                });
            }
        }
    }

    /// Fires every enabled event rule matching the ingested event.
    fn evaluate_event(&self, event_type: &str, severity: Severity) {
        for entry in &self.inner.rules {
            let state = Arc::clone(entry.value());
            let matches = {
                let rule = state.rule.read();
                if !rule.enabled {
                    continue;
                }
                match &rule.trigger {
                    RuleTrigger::Event {
                        event_type: want,
                        min_severity,
                    } => want == event_type && min_severity.is_none_or(|min| severity >= min),
                    RuleTrigger::Interval { .. } => false,
                }
            };
            if matches {
                let engine = self.clone();
                tokio::spawn(async move {
                    let _ = engine.fire(&state).await;
                });
            }
        }
    }

    /// Fires one rule: creates the changeset and executes it. Re-entry
    /// while a previous firing runs is skipped.
    async fn fire(&self, state: &RuleState) -> Result<Option<Changeset>, ChangesetError> {
        if state.firing.swap(true, Ordering::AcqRel) {
            self.inner.skipped.fetch_add(1, Ordering::Relaxed);
            let rule_id = state.rule.read().rule_id.clone();
            tracing::debug!(rule_id = %rule_id, "Rule already firing, skipping re-entry");
            return Ok(None);
        }

        let result = self.fire_locked(state).await;
        state.firing.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn fire_locked(&self, state: &RuleState) -> Result<Changeset, ChangesetError> {
        let (rule_id, name, mode, commands, rollback) = {
            let rule = state.rule.read();
            (
                rule.rule_id.clone(),
                rule.name.clone(),
                rule.mode,
                rule.commands.clone(),
                rule.rollback_commands.clone(),
            )
        };
        *state.last_fired.lock() = Some(self.inner.clock.now());

        let changeset = self.inner.dispatcher.create_changeset(
            format!("rule: {name}"),
            commands,
            rollback,
            None,
        );
        self.inner.fired.fetch_add(1, Ordering::Relaxed);
        tracing::info!(rule_id = %rule_id, changeset_id = %changeset.changeset_id, "Rule fired");
        self.inner.bus.publish(ControllerEvent::RuleFired {
            rule_id,
            changeset_id: changeset.changeset_id.clone(),
        });

        self.inner
            .dispatcher
            .execute_changeset(&changeset.changeset_id, mode)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use crate::clock::ManualClock;
    use crate::codec::{CmdAck, CmdRequest, CmdResult};
    use crate::command::test_support::OpenGate;
    use crate::command::{ChangesetStatus, DispatcherConfig, RetryPolicy};
    use crate::storage::MemoryStore;
    use crate::topic::{DeviceAddress, ParsedTopic, parse_topic};
    use crate::transport::OutboundMessage;

    fn device() -> DeviceAddress {
        DeviceAddress::new("office", "floor1", "aabbccddeeff").unwrap()
    }

    struct Harness {
        engine: RuleEngine,
        clock: Arc<ManualClock>,
        executed: Arc<Mutex<Vec<String>>>,
        bus: EventBus,
    }

    fn setup(respond: bool) -> Harness {
        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(64);
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 8, 13, 8, 0, 0).unwrap(),
        ));
        let dispatcher = CommandDispatcher::new(
            tx,
            Arc::new(OpenGate),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            bus.clone(),
            DispatcherConfig {
                retry: RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                },
                ..DispatcherConfig::default()
            },
        );

        let executed = Arc::new(Mutex::new(Vec::new()));
        {
            let dispatcher = dispatcher.clone();
            let executed = executed.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if !respond {
                        continue;
                    }
                    let req: CmdRequest = serde_json::from_slice(&message.payload).unwrap();
                    let ParsedTopic::Device(address) = parse_topic(&message.topic).unwrap() else {
                        continue;
                    };
                    let addr = address.addr;
                    executed.lock().push(req.op.clone());
                    dispatcher.handle_ack(
                        &addr,
                        CmdAck {
                            id: req.id.clone(),
                            ts: Utc::now(),
                            accepted: true,
                            err: None,
                        },
                    );
                    dispatcher.handle_result(
                        &addr,
                        CmdResult {
                            id: req.id,
                            ts: Utc::now(),
                            ok: true,
                            result: None,
                            progress: None,
                            err: None,
                            execution: None,
                            metadata: None,
                            trace: None,
                        },
                    );
                }
            });
        }

        let engine = RuleEngine::new(dispatcher, bus.clone(), clock.clone());
        Harness {
            engine,
            clock,
            executed,
            bus,
        }
    }

    fn reboot_rule(trigger: RuleTrigger) -> Rule {
        Rule {
            rule_id: "r-1".to_string(),
            name: "nightly reboot".to_string(),
            enabled: true,
            trigger,
            mode: ExecutionMode::Sequential,
            commands: vec![CommandSpec::new(
                device(),
                "system.reboot",
                serde_json::json!({}),
            )],
            rollback_commands: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_executes_changeset() {
        let h = setup(true);
        h.engine.load_rule(reboot_rule(RuleTrigger::Interval {
            every: Duration::from_secs(3600),
        }));

        let changeset = h.engine.trigger("r-1").await.unwrap().unwrap();
        assert_eq!(changeset.status, ChangesetStatus::Completed);
        assert_eq!(*h.executed.lock(), vec!["system.reboot"]);
        assert_eq!(h.engine.stats().fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_unknown_rule() {
        let h = setup(true);
        assert!(h.engine.trigger("nope").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rule_fired_event_is_published() {
        let h = setup(true);
        let mut rx = h.bus.subscribe();
        h.engine.load_rule(reboot_rule(RuleTrigger::Interval {
            every: Duration::from_secs(3600),
        }));

        h.engine.trigger("r-1").await.unwrap().unwrap();

        let mut fired = false;
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::RuleFired { rule_id, .. } = event {
                assert_eq!(rule_id, "r-1");
                fired = true;
            }
        }
        assert!(fired);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_skips_reentry() {
        // No responder: commands hang until their result timeout, so the
        // first firing stays active while we re-trigger.
        let h = setup(false);
        h.engine.load_rule(reboot_rule(RuleTrigger::Interval {
            every: Duration::from_secs(3600),
        }));

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.trigger("r-1").await });
        tokio::task::yield_now().await;

        let second = h.engine.trigger("r-1").await.unwrap();
        assert!(second.is_none());
        assert_eq!(h.engine.stats().skipped, 1);

        // The hung firing eventually times out and finishes.
        let outcome = first.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.status, ChangesetStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_rule_fires_on_schedule() {
        let h = setup(true);
        h.engine.load_rule(reboot_rule(RuleTrigger::Interval {
            every: Duration::from_secs(60),
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = h.engine.spawn_tasks(shutdown_rx);

        // The wall clock drives due-ness; the tokio clock drives ticks.
        h.clock.advance(chrono::Duration::seconds(61));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.engine.stats().fired, 1);

        // Not due again until another minute passes.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.engine.stats().fired, 1);

        h.clock.advance(chrono::Duration::seconds(61));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.engine.stats().fired, 2);

        shutdown_tx.send(true).unwrap();
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_rule_does_not_fire() {
        let h = setup(true);
        h.engine.load_rule(reboot_rule(RuleTrigger::Interval {
            every: Duration::from_secs(60),
        }));
        h.engine.set_enabled("r-1", false).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = h.engine.spawn_tasks(shutdown_rx);

        h.clock.advance(chrono::Duration::seconds(120));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.engine.stats().fired, 0);

        shutdown_tx.send(true).unwrap();
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn event_rule_fires_on_matching_event() {
        let h = setup(true);
        h.engine.load_rule(reboot_rule(RuleTrigger::Event {
            event_type: "link-down".to_string(),
            min_severity: Some(Severity::Warning),
        }));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = h.engine.spawn_tasks(shutdown_rx);
        tokio::task::yield_now().await;

        // Below the severity floor: no firing.
        h.engine.evaluate_event("link-down", Severity::Info);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.stats().fired, 0);

        // Wrong type: no firing.
        h.engine.evaluate_event("reboot", Severity::Critical);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.stats().fired, 0);

        // Matching: fires.
        h.engine.evaluate_event("link-down", Severity::Error);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.stats().fired, 1);
        assert_eq!(*h.executed.lock(), vec!["system.reboot"]);

        shutdown_tx.send(true).unwrap();
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[test]
    fn rule_serde_round_trip() {
        let rule = reboot_rule(RuleTrigger::Event {
            event_type: "boot".to_string(),
            min_severity: None,
        });
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
