//! In-memory mediation state: the rolling reading merged from device frames,
//! the active-alarm table, and the last-data watermark.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use ventylab_protocol::frame::TelemetryFrame;
use ventylab_protocol::types::{AlarmType, VentilatorAlarm, VentilatorReading};

pub type SharedState = Arc<RwLock<MediationState>>;

/// ms since the Unix epoch.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Last seen value of each telemetry quantity. Every inbound frame carries
/// exactly one of pressure/flow/volume, so fields not named by the current
/// frame keep their previous value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingReading {
    pub pressure: f64,
    pub flow: f64,
    pub volume: f64,
    pub timestamp: i64,
}

pub struct MediationState {
    pub started_at: Instant,
    rolling: RollingReading,
    alarms: HashMap<AlarmType, VentilatorAlarm>,
    pub last_data_ms: Option<i64>,
}

impl MediationState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            rolling: RollingReading::default(),
            alarms: HashMap::new(),
            last_data_ms: None,
        }
    }

    /// Merge one pressure/flow/volume frame into the rolling reading and
    /// return the composite to fan out. Alarm frames don't belong here.
    pub fn apply_telemetry(
        &mut self,
        frame: &TelemetryFrame,
        timestamp: i64,
        device_id: &str,
    ) -> Option<VentilatorReading> {
        match frame {
            TelemetryFrame::Pressure(v) => self.rolling.pressure = *v,
            TelemetryFrame::Flow(v) => self.rolling.flow = *v,
            TelemetryFrame::Volume(v) => self.rolling.volume = f64::from(*v),
            TelemetryFrame::Alarm { .. } => return None,
        }
        self.rolling.timestamp = timestamp;
        self.last_data_ms = Some(timestamp);

        Some(VentilatorReading {
            pressure: self.rolling.pressure,
            flow: self.rolling.flow,
            volume: self.rolling.volume,
            pco2: None,
            spo2: None,
            timestamp,
            device_id: device_id.to_string(),
        })
    }

    /// Insert or replace the latest alarm of its type.
    pub fn upsert_alarm(&mut self, alarm: VentilatorAlarm) {
        self.last_data_ms = Some(alarm.timestamp);
        self.alarms.insert(alarm.alarm_type, alarm);
    }

    /// Active alarms, most severe first.
    pub fn active_alarms(&self) -> Vec<VentilatorAlarm> {
        let mut alarms: Vec<_> = self
            .alarms
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect();
        alarms.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.timestamp.cmp(&b.timestamp)));
        alarms
    }

    pub fn rolling(&self) -> &RollingReading {
        &self.rolling
    }

    /// Drop all volatile state (shutdown path).
    pub fn clear(&mut self) {
        self.rolling = RollingReading::default();
        self.alarms.clear();
        self.last_data_ms = None;
    }
}

impl Default for MediationState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
