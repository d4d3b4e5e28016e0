//! Mediation service: the orchestrator that couples the device link, the
//! frame codec, the gateway, reservations, and simulation sessions.
//!
//! Inbound device frames flow through `handle_frame`; client commands flow
//! through `send_command`. Parse failures are dropped (telemetry arrives at
//! 30-60 Hz, losing one frame is fine); command failures always come back
//! to the caller as a structured outcome.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ventylab_protocol::frame::{self, TelemetryFrame};
use ventylab_protocol::types::{VentilatorAlarm, VentilatorCommand};

use crate::db::{Db, Reservation};
use crate::gateway::{Gateway, EV_ALARM, EV_DATA};
use crate::link::{DeviceLink, LinkStatus};
use crate::reservation::{ReservationManager, ReserveError};
use crate::simulation::SimulationManager;
use crate::state::{now_ms, SharedState};

// ---------------------------------------------------------------------------
// Outcomes + status report
// ---------------------------------------------------------------------------

/// Result of a command attempt, mapped to HTTP codes by the web layer and
/// to `ventilator:command:ack` / `ventilator:error` over WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Accepted { command_id: String },
    Invalid { errors: Vec<String> },
    Conflict { current_user: String },
    Transport { message: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connection: LinkStatus,
    pub reservation: Option<Reservation>,
    pub last_data_at: Option<i64>,
    pub active_alarms: Vec<VentilatorAlarm>,
    pub connected_users: usize,
    pub active_simulations: usize,
    pub uptime_secs: u64,
}

/// An active reservation presents the link as RESERVED to clients; every
/// other state passes through untouched.
pub fn compose_connection(link: LinkStatus, has_reservation: bool) -> LinkStatus {
    if link == LinkStatus::Connected && has_reservation {
        LinkStatus::Reserved
    } else {
        link
    }
}

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

pub struct Mediator {
    pub state: SharedState,
    pub gateway: Arc<Gateway>,
    pub link: DeviceLink,
    pub reservations: ReservationManager,
    pub simulations: SimulationManager,
    pub db: Db,
    pub device_id: String,
}

impl Mediator {
    /// Drain raw frame payloads from the device link for the life of the
    /// process.
    pub fn spawn_frame_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let mediator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                mediator.handle_frame(&buf).await;
            }
            info!("frame pump ended");
        })
    }

    /// Decode one inbound frame and fan out the result.
    ///
    /// Alarms upsert the active-alarm table keyed by type; the other frame
    /// types each update exactly one field of the rolling reading, and the
    /// composite goes out with the device id and a server-side timestamp.
    pub async fn handle_frame(&self, buf: &[u8]) {
        let frame = match frame::decode(buf) {
            Ok(f) => f,
            Err(e) => {
                warn!(bytes = buf.len(), "dropping bad frame: {e}");
                return;
            }
        };
        let timestamp = now_ms();

        match frame {
            TelemetryFrame::Alarm {
                alarm_type,
                severity,
            } => {
                let alarm = VentilatorAlarm {
                    alarm_type,
                    severity,
                    message: alarm_type.human_message().to_string(),
                    timestamp,
                    active: true,
                    acknowledged: false,
                };
                self.state.write().await.upsert_alarm(alarm.clone());
                warn!(?alarm_type, ?severity, "device alarm");
                if let Ok(data) = serde_json::to_value(&alarm) {
                    self.gateway.broadcast(EV_ALARM, &data).await;
                }
            }
            other => {
                let reading = self
                    .state
                    .write()
                    .await
                    .apply_telemetry(&other, timestamp, &self.device_id);
                if let Some(reading) = reading {
                    if let Ok(data) = serde_json::to_value(&reading) {
                        self.gateway.broadcast_data(EV_DATA, &data).await;
                    }
                }
            }
        }
    }

    /// Validate, authorize, and route a command.
    ///
    /// A user with a running simulation session is steering their virtual
    /// patient: the command updates that session and never touches the
    /// physical device. Everyone else goes through the reservation policy
    /// and out over MQTT as a binary frame.
    pub async fn send_command(
        &self,
        user_id: &str,
        mut command: VentilatorCommand,
    ) -> CommandOutcome {
        let now = now_ms();
        if command.timestamp == 0 {
            command.timestamp = now;
        }

        let errors = command.validation_errors();
        if !errors.is_empty() {
            warn!(user = %user_id, ?errors, "command rejected by safety ranges");
            return CommandOutcome::Invalid { errors };
        }

        if self.simulations.update_settings(user_id, command.clone()).await {
            info!(user = %user_id, "command applied to simulation session");
            return CommandOutcome::Accepted {
                command_id: format!("cmd-{now}"),
            };
        }

        match self.reservations.authorize_command(user_id).await {
            Ok(()) => {}
            Err(ReserveError::Conflict { current_user }) => {
                warn!(user = %user_id, holder = %current_user, "command refused — device reserved");
                return CommandOutcome::Conflict { current_user };
            }
            Err(ReserveError::Store(e)) => {
                return CommandOutcome::Transport {
                    message: format!("reservation check failed: {e}"),
                };
            }
        }

        let frame = match frame::encode_command(&command) {
            Ok(frame) => frame,
            // unreachable after the validation gate, but never panic on it
            Err(errors) => return CommandOutcome::Invalid { errors },
        };

        match self.link.publish_command(frame).await {
            Ok(()) => {
                info!(user = %user_id, mode = ?command.mode, "command published to device");
                CommandOutcome::Accepted {
                    command_id: format!("cmd-{now}"),
                }
            }
            Err(e) => {
                warn!(user = %user_id, "command transport failed: {e}");
                CommandOutcome::Transport {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Composed status: link state (RESERVED when held), current lease after
    /// lazy expiry, data watermark, and the alarm snapshot.
    pub async fn status(&self) -> StatusReport {
        let reservation = match self.reservations.current().await {
            Ok(r) => r,
            Err(e) => {
                warn!("reservation lookup failed during status: {e}");
                None
            }
        };

        let (last_data_at, active_alarms, uptime_secs) = {
            let st = self.state.read().await;
            (
                st.last_data_ms,
                st.active_alarms(),
                st.started_at.elapsed().as_secs(),
            )
        };

        StatusReport {
            connection: compose_connection(self.link.status(), reservation.is_some()),
            reservation,
            last_data_at,
            active_alarms,
            connected_users: self.gateway.connected_count().await,
            active_simulations: self.simulations.active_count().await,
            uptime_secs,
        }
    }

    /// Tear down: stop simulations, drop the link, clear volatile state.
    pub async fn shutdown(&self) {
        self.simulations.shutdown().await;
        self.link.shutdown().await;
        self.state.write().await.clear();
        info!("mediation service shut down");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::gateway::client_queue;
    use crate::patient::{Condition, Demographics, Gender, PatientModel};
    use crate::state::MediationState;
    use serde_json::Value;
    use tokio::sync::RwLock;
    use ventylab_protocol::frame::encode_telemetry;
    use ventylab_protocol::types::{AlarmSeverity, AlarmType, VentMode};

    const DEVICE: &str = "ventilab-device-001";

    /// Mediator against an in-memory store and an unreachable broker (the
    /// link stays in Connecting, which is exactly what the transport-failure
    /// paths need).
    async fn mediator() -> Arc<Mediator> {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let gateway = Arc::new(Gateway::new());
        let cfg = MqttConfig {
            port: 1,
            ..MqttConfig::default()
        };
        let (frame_tx, _frame_rx) = mpsc::channel(32);
        let link = DeviceLink::connect(&cfg, frame_tx);

        Arc::new(Mediator {
            state: Arc::new(RwLock::new(MediationState::new())),
            gateway: Arc::clone(&gateway),
            link,
            reservations: ReservationManager::new(db.clone(), DEVICE, Arc::clone(&gateway)),
            simulations: SimulationManager::new(),
            db,
            device_id: DEVICE.to_string(),
        })
    }

    fn command() -> VentilatorCommand {
        VentilatorCommand {
            mode: VentMode::Vcv,
            tidal_volume: 500,
            respiratory_rate: 12,
            peep: 5,
            fio2: 0.4,
            pressure_limit: Some(30),
            inspiratory_time: Some(1.0),
            ie_ratio: None,
            sensitivity: None,
            flow_rate: None,
            timestamp: 0,
        }
    }

    fn patient() -> PatientModel {
        PatientModel::new(
            Demographics {
                weight_kg: 70.0,
                height_cm: 175.0,
                age_years: 45,
                gender: Gender::Male,
            },
            Condition::Healthy,
        )
    }

    // -- frames ---------------------------------------------------------

    #[tokio::test]
    async fn telemetry_frames_merge_and_fan_out() {
        let m = mediator().await;
        let (tx, mut rx) = client_queue();
        m.gateway.register("alice", tx).await;

        m.handle_frame(&encode_telemetry(&TelemetryFrame::Pressure(20.0)))
            .await;
        m.handle_frame(&encode_telemetry(&TelemetryFrame::Volume(500)))
            .await;

        let first: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["event"], "ventilator:data");
        assert_eq!(first["data"]["pressure"], 20.0);
        assert_eq!(first["data"]["deviceId"], DEVICE);

        let second: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(second["data"]["pressure"], 20.0); // carried over
        assert_eq!(second["data"]["volume"], 500.0);
    }

    #[tokio::test]
    async fn corrupt_frame_dropped_without_client_impact() {
        let m = mediator().await;
        let (tx, mut rx) = client_queue();
        m.gateway.register("alice", tx).await;

        let good_1 = encode_telemetry(&TelemetryFrame::Pressure(20.0));
        let mut bad = encode_telemetry(&TelemetryFrame::Flow(30.0));
        let last = bad.len() - 1;
        bad[last] ^= 0xFF; // checksum broken in transit
        let good_3 = encode_telemetry(&TelemetryFrame::Volume(480));

        m.handle_frame(&good_1).await;
        m.handle_frame(&bad).await;
        m.handle_frame(&good_3).await;

        // frames 1 and 3 arrive; nothing at all for frame 2
        let mut events = Vec::new();
        while let Ok(text) = rx.try_recv() {
            events.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["data"]["pressure"], 20.0);
        assert_eq!(events[1]["data"]["volume"], 480.0);
        assert_eq!(events[1]["data"]["flow"], 0.0); // corrupt flow never landed

        let st = m.state.read().await;
        assert_eq!(st.rolling().flow, 0.0);
    }

    #[tokio::test]
    async fn alarm_frame_updates_table_and_broadcasts() {
        let m = mediator().await;
        let (tx, mut rx) = client_queue();
        m.gateway.register("alice", tx).await;

        m.handle_frame(&encode_telemetry(&TelemetryFrame::Alarm {
            alarm_type: AlarmType::HighPressure,
            severity: AlarmSeverity::High,
        }))
        .await;

        let event: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["event"], "ventilator:alarm");
        assert_eq!(event["data"]["type"], "HIGH_PRESSURE");
        assert_eq!(event["data"]["severity"], "HIGH");
        assert_eq!(event["data"]["active"], true);

        let st = m.state.read().await;
        assert_eq!(st.active_alarms().len(), 1);
    }

    // -- commands -------------------------------------------------------

    #[tokio::test]
    async fn invalid_command_returns_error_list() {
        let m = mediator().await;
        let mut cmd = command();
        cmd.tidal_volume = 1_000;

        match m.send_command("alice", cmd).await {
            CommandOutcome::Invalid { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("tidalVolume"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_with_simulation_session_updates_settings() {
        let m = mediator().await;
        m.simulations
            .configure_patient(Arc::clone(&m.gateway), "alice", patient(), None)
            .await;

        let mut cmd = command();
        cmd.fio2 = 0.8;
        match m.send_command("alice", cmd).await {
            CommandOutcome::Accepted { command_id } => {
                assert!(command_id.starts_with("cmd-"));
            }
            other => panic!("expected Accepted, got {other:?}"),
        }

        let info = m.simulations.session_info("alice").await.unwrap();
        assert!((info.settings.fio2 - 0.8).abs() < 1e-9);
        m.simulations.shutdown().await;
    }

    #[tokio::test]
    async fn command_refused_when_device_held_by_other_user() {
        let m = mediator().await;
        m.reservations.reserve("bob", 60, None).await.unwrap();

        match m.send_command("alice", command()).await {
            CommandOutcome::Conflict { current_user } => assert_eq!(current_user, "bob"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_fails_transport_when_link_down() {
        let m = mediator().await;
        // no reservation, valid command: the unreachable broker is the
        // only obstacle left
        match m.send_command("alice", command()).await {
            CommandOutcome::Transport { message } => {
                assert!(message.contains("not connected"), "{message}");
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    // -- status ---------------------------------------------------------

    #[tokio::test]
    async fn status_composes_all_parts() {
        let m = mediator().await;
        m.reservations.reserve("alice", 60, None).await.unwrap();
        m.handle_frame(&encode_telemetry(&TelemetryFrame::Pressure(18.0)))
            .await;

        let status = m.status().await;
        assert_eq!(status.reservation.as_ref().unwrap().user_id, "alice");
        assert!(status.last_data_at.is_some());
        assert!(status.active_alarms.is_empty());
        // the link never connected, so the lease does not mask its state
        assert_ne!(status.connection, LinkStatus::Reserved);
    }

    #[test]
    fn connection_composition() {
        assert_eq!(
            compose_connection(LinkStatus::Connected, true),
            LinkStatus::Reserved
        );
        assert_eq!(
            compose_connection(LinkStatus::Connected, false),
            LinkStatus::Connected
        );
        assert_eq!(
            compose_connection(LinkStatus::Connecting, true),
            LinkStatus::Connecting
        );
        assert_eq!(compose_connection(LinkStatus::Error, true), LinkStatus::Error);
    }

    #[tokio::test]
    async fn shutdown_clears_state() {
        let m = mediator().await;
        m.handle_frame(&encode_telemetry(&TelemetryFrame::Pressure(18.0)))
            .await;
        m.simulations
            .configure_patient(Arc::clone(&m.gateway), "alice", patient(), None)
            .await;

        m.shutdown().await;

        assert_eq!(m.simulations.active_count().await, 0);
        let st = m.state.read().await;
        assert!(st.last_data_ms.is_none());
        assert_eq!(st.rolling().pressure, 0.0);
    }
}
