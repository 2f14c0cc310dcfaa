// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport adapter.
//!
//! The adapter is the only component that touches transport-level
//! handles. It connects with the configured client id, credentials, TLS
//! settings and last-will, delivers inbound publishes to the ingest
//! channel, and drains the outbound channel fed by the dispatcher and
//! rule engine. On connection loss it backs off exponentially with
//! jitter (1 s initial, 60 s cap) and resubscribes to the full topic set
//! before surfacing `connected` again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::codec::{LwtState, LwtStatus};
use crate::error::TransportError;
use crate::msglog::{Direction, MessageLog};
use crate::topic::{Channel, DeviceAddress};

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An inbound publish handed to the ingest loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The full topic.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// QoS the broker delivered with.
    pub qos: u8,
    /// Broker retain flag.
    pub retained: bool,
}

/// An outbound publish queued by the dispatcher or rule engine.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// The full topic.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Requested QoS.
    pub qos: u8,
    /// Retain flag.
    pub retain: bool,
}

/// Reconnect backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// First delay. Default 1 s.
    pub initial: Duration,
    /// Delay ceiling. Default 60 s.
    pub max: Duration,
    /// Growth factor per consecutive failure. Default 2.0.
    pub multiplier: f64,
    /// Jitter fraction applied to each delay (±). Default 0.2.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay before reconnect attempt `attempt` (1-based),
    /// jittered.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(i32::try_from(exp).unwrap_or(16));
        let capped = base.min(self.max.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }
}

/// Transport configuration.
#[derive(Clone)]
pub struct TransportConfig {
    /// Broker host.
    pub host: String,
    /// Broker port. Default 1883.
    pub port: u16,
    /// Client id; generated from pid + counter when unset.
    pub client_id: Option<String>,
    /// Username/password.
    pub credentials: Option<(String, String)>,
    /// Keep-alive interval. Default 30 s.
    pub keep_alive: Duration,
    /// TLS settings, if the broker requires them.
    pub tls: Option<rumqttc::TlsConfiguration>,
    /// The controller's own device address; its `lwt` topic carries the
    /// retained last-will.
    pub lwt_device: Option<DeviceAddress>,
    /// Subscription patterns, resubscribed on every reconnect.
    pub subscriptions: Vec<String>,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Inbound channel capacity. Default 1024.
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: None,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            tls: None,
            lwt_device: None,
            subscriptions: vec![crate::topic::filter_all()],
            reconnect: ReconnectPolicy::default(),
            inbound_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("has_credentials", &self.credentials.is_some())
            .field("has_tls", &self.tls.is_some())
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

/// Transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Publishes sent to the broker.
    pub published: u64,
    /// Publish attempts that failed at the client.
    pub publish_errors: u64,
    /// Inbound messages delivered to the ingest channel.
    pub delivered: u64,
    /// Reconnect attempts made.
    pub reconnects: u64,
}

struct TransportInner {
    client: AsyncClient,
    connected: watch::Sender<bool>,
    published: AtomicU64,
    publish_errors: AtomicU64,
    delivered: AtomicU64,
    reconnects: AtomicU64,
}

/// The MQTT transport adapter. Cheaply cloneable.
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Everything [`MqttTransport::start`] hands back to the controller.
#[derive(Debug)]
pub struct TransportHandles {
    /// The adapter.
    pub transport: MqttTransport,
    /// Inbound messages for the ingest loop.
    pub inbound: mpsc::Receiver<InboundMessage>,
    /// Background tasks (event pump, outbound pump).
    pub tasks: Vec<JoinHandle<()>>,
}

impl MqttTransport {
    /// Connects the adapter and spawns its pumps.
    ///
    /// `outbound` is the queue fed by the dispatcher and rule engine;
    /// outbound traffic is recorded in the message log here, at the
    /// transport boundary.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] for an empty host.
    pub fn start(
        config: TransportConfig,
        clock: SharedClock,
        msglog: MessageLog,
        outbound: mpsc::Receiver<OutboundMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<TransportHandles, TransportError> {
        if config.host.is_empty() {
            return Err(TransportError::InvalidAddress("host is required".to_string()));
        }

        let client_id = config.client_id.clone().unwrap_or_else(|| {
            let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("rtk_core_{}_{}", std::process::id(), counter)
        });

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(tls) = config.tls.clone() {
            options.set_transport(rumqttc::Transport::Tls(tls));
        }
        if let Some(device) = &config.lwt_device {
            let will = LwtStatus {
                status: LwtState::Offline,
                ts: clock.now(),
                reason: Some("connection lost".to_string()),
            };
            if let Ok(payload) = serde_json::to_vec(&will) {
                options.set_last_will(LastWill::new(
                    device.topic(&Channel::Lwt),
                    payload,
                    QoS::AtLeastOnce,
                    true,
                ));
            }
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let inner = Arc::new(TransportInner {
            client,
            connected: connected_tx,
            published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });
        let transport = Self { inner };

        let pump = tokio::spawn(event_pump(
            transport.clone(),
            event_loop,
            config.clone(),
            clock,
            inbound_tx,
            shutdown.clone(),
        ));
        let out_pump = tokio::spawn(outbound_pump(
            transport.clone(),
            msglog,
            outbound,
            shutdown,
        ));

        Ok(TransportHandles {
            transport,
            inbound: inbound_rx,
            tasks: vec![pump, out_pump],
        })
    }

    /// Returns whether the adapter is connected and subscribed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.subscribe().borrow()
    }

    /// Returns a watch over the connected flag.
    #[must_use]
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let inner = &self.inner;
        TransportStats {
            published: inner.published.load(Ordering::Relaxed),
            publish_errors: inner.publish_errors.load(Ordering::Relaxed),
            delivered: inner.delivered.load(Ordering::Relaxed),
            reconnects: inner.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Disconnects from the broker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Mqtt`] if the disconnect request cannot
    /// be queued.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.client.disconnect().await.map_err(TransportError::Mqtt)
    }
}

/// Maps a wire QoS byte to the client enum.
fn qos_from(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Drives the MQTT event loop: resubscription, LWT refresh, inbound
/// delivery, reconnect backoff.
async fn event_pump(
    transport: MqttTransport,
    mut event_loop: EventLoop,
    config: TransportConfig,
    clock: SharedClock,
    inbound_tx: mpsc::Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let inner = &transport.inner;
    let mut failures: u32 = 0;

    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(host = %config.host, "MQTT connected, resubscribing");
                failures = 0;

                // Resubscribe everything before surfacing `connected`.
                let mut all_subscribed = true;
                for pattern in &config.subscriptions {
                    if let Err(e) = inner.client.subscribe(pattern, QoS::AtLeastOnce).await {
                        tracing::error!(pattern = %pattern, error = %e, "Resubscription failed");
                        all_subscribed = false;
                    }
                }

                // Announce ourselves on our retained LWT topic.
                if let Some(device) = &config.lwt_device {
                    let online = LwtStatus {
                        status: LwtState::Online,
                        ts: clock.now(),
                        reason: None,
                    };
                    if let Ok(payload) = serde_json::to_vec(&online) {
                        let _ = inner
                            .client
                            .publish(device.topic(&Channel::Lwt), QoS::AtLeastOnce, true, payload)
                            .await;
                    }
                }

                if all_subscribed {
                    let _ = inner.connected.send(true);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos as u8,
                    retained: publish.retain,
                };
                if inbound_tx.send(message).await.is_err() {
                    tracing::warn!("Ingest channel closed, stopping event pump");
                    break;
                }
                inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                let _ = inner.connected.send(false);
                failures += 1;
                inner.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = config.reconnect.delay_for_attempt(failures);
                tracing::warn!(
                    error = %e,
                    attempt = failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "MQTT connection error, backing off"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = inner.connected.send(false);
}

/// Drains the outbound queue into broker publishes, recording each in
/// the message log.
async fn outbound_pump(
    transport: MqttTransport,
    msglog: MessageLog,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let inner = &transport.inner;
    loop {
        let message = tokio::select! {
            message = outbound.recv() => message,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(message) = message else {
            break;
        };

        msglog.record(
            &message.topic,
            &message.payload,
            message.qos,
            message.retain,
            Direction::Out,
        );

        match inner
            .client
            .publish(
                &message.topic,
                qos_from(message.qos),
                message.retain,
                message.payload,
            )
            .await
        {
            Ok(()) => {
                inner.published.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(topic = %message.topic, "Published");
            }
            Err(e) => {
                inner.publish_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic = %message.topic, error = %e, "Publish failed");
            }
        }
    }
}
