//! Ventilator device simulator: speaks the same binary MQTT protocol as the
//! physical device so the server can be developed against a local broker.
//!
//! Publishes pressure/flow/volume frames on `<root>/telemetry` and alarm
//! frames on `<root>/alarm`, consumes command frames from `<root>/command`,
//! and announces online/offline on the retained `<root>/status` topic.

mod sim;

use std::sync::{Arc, Mutex};
use std::{env, time::Duration};

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};
use ventylab_protocol::frame::{decode_command, encode_telemetry, TelemetryFrame};

use sim::{BreathSim, Sample, Scenario};

/// Encode one tick's sensor readings as the three wire frames.
fn frames_for(sample: &Sample) -> [Vec<u8>; 3] {
    [
        encode_telemetry(&TelemetryFrame::Pressure(sample.pressure_cmh2o)),
        encode_telemetry(&TelemetryFrame::Flow(sample.flow_lpm)),
        encode_telemetry(&TelemetryFrame::Volume(
            sample.volume_ml.round().clamp(0.0, 65_535.0) as u16,
        )),
    ]
}

/// Sample rate from the environment, clamped to something the broker and
/// the server can keep up with.
fn parse_sample_hz(raw: Option<String>) -> u32 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(25).clamp(1, 60)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ───────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let topic_root =
        env::var("TOPIC_ROOT").unwrap_or_else(|_| "ventilab/device/001".to_string());
    let sample_hz = parse_sample_hz(env::var("SAMPLE_HZ").ok());
    let scenario = Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_else(|_| "normal".to_string()),
    );

    let telemetry_topic = format!("{topic_root}/telemetry");
    let alarm_topic = format!("{topic_root}/alarm");
    let command_topic = format!("{topic_root}/command");
    let status_topic = format!("{topic_root}/status");

    info!(%scenario, sample_hz, topic_root = %topic_root, "device simulator starting");

    let simulator = Arc::new(Mutex::new(BreathSim::new(scenario)));

    // ── MQTT setup ───────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("ventylab-device-sim", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    // Retained offline LWT mirrors the "online" announcement below, so the
    // server-side status topic always reflects reality.
    mqttoptions.set_last_will(LastWill::new(
        &status_topic,
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
        mqttoptions.set_credentials(user, pass);
        info!("mqtt: using password authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // ── MQTT event loop task ─────────────────────────────────────────
    let el_client = client.clone();
    let el_status_topic = status_topic.clone();
    let el_command_topic = command_topic.clone();
    let el_simulator = Arc::clone(&simulator);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("device connected to mqtt");

                    if let Err(e) = el_client
                        .publish(&el_status_topic, QoS::AtLeastOnce, true, b"online".to_vec())
                        .await
                    {
                        error!("failed to publish online status: {e}");
                    }
                    if let Err(e) = el_client.subscribe(&el_command_topic, QoS::AtLeastOnce).await
                    {
                        error!("failed to subscribe to commands: {e}");
                    }
                }

                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != el_command_topic {
                        continue;
                    }
                    match decode_command(&publish.payload) {
                        Ok(command) => {
                            info!(
                                mode = ?command.mode,
                                tidal_volume = command.tidal_volume,
                                respiratory_rate = command.respiratory_rate,
                                "command received"
                            );
                            el_simulator.lock().unwrap().apply_command(&command);
                        }
                        Err(e) => warn!("ignoring malformed command frame: {e}"),
                    }
                }

                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e} — retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Sampling loop ────────────────────────────────────────────────
    let dt_ms = 1_000.0 / f64::from(sample_hz);
    let mut ticker = tokio::time::interval(Duration::from_millis((1_000 / sample_hz) as u64));
    info!(topic = %telemetry_topic, "publishing telemetry frames");

    loop {
        ticker.tick().await;

        let (sample, alarm) = {
            let mut sim = simulator.lock().unwrap();
            let sample = sim.step(dt_ms);
            let alarm = sim.alarm_for(&sample);
            (sample, alarm)
        };

        for frame in frames_for(&sample) {
            if let Err(e) = client
                .publish(&telemetry_topic, QoS::AtLeastOnce, false, frame)
                .await
            {
                error!("telemetry publish error: {e}");
            }
        }

        if let Some((alarm_type, severity)) = alarm {
            debug!(?alarm_type, ?severity, "publishing alarm frame");
            let frame = encode_telemetry(&TelemetryFrame::Alarm {
                alarm_type,
                severity,
            });
            if let Err(e) = client
                .publish(&alarm_topic, QoS::AtLeastOnce, false, frame)
                .await
            {
                error!("alarm publish error: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
