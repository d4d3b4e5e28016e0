//! MQTT link to the physical ventilator.
//!
//! The broker connection is owned by a background task that polls the
//! rumqttc event loop. Reconnection is managed here, not by the library:
//! unintentional drops back off exponentially (base 5 s, cap 60 s) and the
//! link goes to `Error` for good once `max_reconnect_attempts` consecutive
//! failures accumulate. Raw frame payloads from the telemetry and alarm
//! topics are forwarded to the mediator over an mpsc channel.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::MqttConfig;

/// Reconnect delay ceiling.
const MAX_BACKOFF_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Status + errors
// ---------------------------------------------------------------------------

/// Link status as reported to clients. `Reserved` is never set by the link
/// task itself; the mediator composes it when a reservation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reserved,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("mqtt link not connected (status {0:?})")]
    NotConnected(LinkStatus),
    #[error(transparent)]
    Mqtt(#[from] rumqttc::ClientError),
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub fn telemetry_topic(root: &str) -> String {
    format!("{root}/telemetry")
}

pub fn alarm_topic(root: &str) -> String {
    format!("{root}/alarm")
}

pub fn command_topic(root: &str) -> String {
    format!("{root}/command")
}

/// Does this topic carry device frames we should decode?
pub fn is_frame_topic(topic: &str, root: &str) -> bool {
    topic == telemetry_topic(root) || topic == alarm_topic(root)
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1), 60 s)`.
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS))
}

// ---------------------------------------------------------------------------
// Device link
// ---------------------------------------------------------------------------

pub struct DeviceLink {
    client: AsyncClient,
    command_topic: String,
    status_rx: watch::Receiver<LinkStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl DeviceLink {
    /// Spawn the connection task. Returns immediately; `status()` reflects
    /// progress.
    pub fn connect(cfg: &MqttConfig, frames: mpsc::Sender<Vec<u8>>) -> Self {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        options.set_clean_session(false);

        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user, pass);
            info!("mqtt: using password authentication");
        } else {
            warn!("mqtt credentials not set — connecting without authentication");
        }

        let (client, eventloop) = AsyncClient::new(options, 32);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            cfg.topic_root.clone(),
            frames,
            status_tx,
            shutdown_rx,
            cfg.reconnect_interval_ms,
            cfg.max_reconnect_attempts,
        ));

        Self {
            client,
            command_topic: command_topic(&cfg.topic_root),
            status_rx,
            shutdown_tx,
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    /// Publish an encoded command frame. Commands are not queued: a link
    /// that is not currently connected refuses outright and the caller
    /// surfaces the failure.
    pub async fn publish_command(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        let status = self.status();
        if status != LinkStatus::Connected {
            return Err(LinkError::NotConnected(status));
        }
        self.client
            .publish(&self.command_topic, QoS::AtLeastOnce, false, frame)
            .await?;
        Ok(())
    }

    /// Intentional disconnect: no reconnect will be attempted. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.disconnect().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    topic_root: String,
    frames: mpsc::Sender<Vec<u8>>,
    status_tx: watch::Sender<LinkStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
    base_ms: u64,
    max_attempts: u32,
) {
    let telemetry = telemetry_topic(&topic_root);
    let alarm = alarm_topic(&topic_root);
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("mqtt link shut down");
                    status_tx.send_replace(LinkStatus::Disconnected);
                    break;
                }
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(attempt, "mqtt connected");
                    attempt = 0;

                    // Re-subscribe on every (re)connect; the broker may
                    // have lost the session even with clean_session(false).
                    for topic in [&telemetry, &alarm] {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!(topic = %topic, "subscribe failed: {e}");
                        }
                    }
                    status_tx.send_replace(LinkStatus::Connected);
                }

                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if is_frame_topic(&p.topic, &topic_root) {
                        if frames.send(p.payload.to_vec()).await.is_err() {
                            warn!("frame consumer gone — stopping mqtt link");
                            status_tx.send_replace(LinkStatus::Disconnected);
                            break;
                        }
                    } else {
                        warn!(topic = %p.topic, "unhandled topic");
                    }
                }

                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker sent disconnect");
                    status_tx.send_replace(LinkStatus::Disconnected);
                }

                Ok(_) => {}

                Err(e) => {
                    if *shutdown_rx.borrow() {
                        status_tx.send_replace(LinkStatus::Disconnected);
                        break;
                    }

                    attempt += 1;
                    if attempt > max_attempts {
                        error!(
                            attempts = max_attempts,
                            "mqtt reconnect attempts exhausted — link requires operator intervention"
                        );
                        status_tx.send_replace(LinkStatus::Error);
                        break;
                    }

                    let delay = backoff_delay(attempt, base_ms);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "mqtt error: {e} — backing off"
                    );
                    status_tx.send_replace(LinkStatus::Connecting);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            status_tx.send_replace(LinkStatus::Disconnected);
                            break;
                        }
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
