//! Per-user simulation sessions.
//!
//! Each configured patient gets a 20 Hz ticker task that walks the breath
//! waveform, layers measurement noise on top, recomputes SpO2 once a second,
//! and delivers readings to that user's socket only. Sessions end on
//! `simulator:leave`, on re-configuration (the new session displaces the
//! old), or at server shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};
use ventylab_protocol::types::{VentilatorCommand, VentilatorReading};

use crate::gateway::{Gateway, EV_DATA};
use crate::patient::{
    gaussian, spo2_step, spo2_target, waveform_at, PatientModel, FLOW_NOISE_SIGMA,
    PRESSURE_NOISE_SIGMA, VOLUME_NOISE_SIGMA,
};
use crate::state::now_ms;

/// Simulation tick period (20 Hz).
pub const TICK_MS: u64 = 50;

/// SpO2 is recomputed every this many ticks (once per second).
const SPO2_EVERY_TICKS: u64 = 20;

/// Initial SpO2 before the lag model takes over.
const INITIAL_SPO2: f64 = 95.0;

// ---------------------------------------------------------------------------
// Session bookkeeping
// ---------------------------------------------------------------------------

struct Session {
    patient: PatientModel,
    settings: Arc<RwLock<VentilatorCommand>>,
    started_ms: i64,
    task: JoinHandle<()>,
}

/// Status snapshot of one running session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub patient: PatientModel,
    pub settings: VentilatorCommand,
    pub started_ms: i64,
}

#[derive(Default)]
pub struct SimulationManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SimulationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the simulation loop for a user. An existing
    /// session for the same user is stopped first.
    pub async fn configure_patient(
        &self,
        gateway: Arc<Gateway>,
        user_id: &str,
        patient: PatientModel,
        settings: Option<VentilatorCommand>,
    ) {
        let settings = settings.unwrap_or_else(|| patient.initial_settings());
        let settings = Arc::new(RwLock::new(settings));

        let task = tokio::spawn(run_session(
            gateway,
            user_id.to_string(),
            patient.clone(),
            Arc::clone(&settings),
        ));

        let session = Session {
            patient,
            settings,
            started_ms: now_ms(),
            task,
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.insert(user_id.to_string(), session) {
            previous.task.abort();
            debug!(user = %user_id, "previous simulation session displaced");
        }
        info!(user = %user_id, "simulation session started");
    }

    /// Feed an accepted command into the user's running session. Returns
    /// false when the user has no session.
    pub async fn update_settings(&self, user_id: &str, command: VentilatorCommand) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(user_id) {
            Some(session) => {
                *session.settings.write().await = command;
                true
            }
            None => false,
        }
    }

    pub async fn has_session(&self, user_id: &str) -> bool {
        self.sessions.lock().await.contains_key(user_id)
    }

    pub async fn session_info(&self, user_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(user_id)?;
        let info = SessionInfo {
            patient: session.patient.clone(),
            settings: session.settings.read().await.clone(),
            started_ms: session.started_ms,
        };
        Some(info)
    }

    /// Stop the user's session. Returns false when none was running.
    pub async fn stop(&self, user_id: &str) -> bool {
        match self.sessions.lock().await.remove(user_id) {
            Some(session) => {
                session.task.abort();
                info!(user = %user_id, "simulation session stopped");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (user_id, session) in sessions.drain() {
            session.task.abort();
            debug!(user = %user_id, "simulation session stopped at shutdown");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

async fn run_session(
    gateway: Arc<Gateway>,
    user_id: String,
    patient: PatientModel,
    settings: Arc<RwLock<VentilatorCommand>>,
) {
    let device_id = format!("simulated-{user_id}");
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    let mut tick_count: u64 = 0;
    let mut spo2 = INITIAL_SPO2;

    loop {
        ticker.tick().await;

        let current = settings.read().await.clone();

        // The waveform runs on the session's own tick timeline, so a lagging
        // loop slows the breath rather than jumping ahead.
        let t_ms = (tick_count * TICK_MS) as f64;
        let wf = waveform_at(&current, &patient.mechanics, t_ms);

        if tick_count % SPO2_EVERY_TICKS == 0 {
            let target = spo2_target(current.fio2, patient.condition);
            spo2 = spo2_step(spo2, target, 1.0);
        }

        let reading = VentilatorReading {
            pressure: wf.pressure + gaussian(PRESSURE_NOISE_SIGMA),
            flow: wf.flow + gaussian(FLOW_NOISE_SIGMA),
            volume: (wf.volume + gaussian(VOLUME_NOISE_SIGMA)).max(0.0),
            pco2: None,
            spo2: Some((spo2 * 10.0).round() / 10.0),
            timestamp: now_ms(),
            device_id: device_id.clone(),
        };

        if let Ok(data) = serde_json::to_value(&reading) {
            gateway.send_to_user(&user_id, EV_DATA, &data).await;
        }

        tick_count += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
