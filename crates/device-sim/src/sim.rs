//! Stand-in for the ventilator firmware's sensing loop.
//!
//! Produces the pressure/flow/volume stream a real device would put on the
//! wire: square inspiratory flow, passive expiratory decay, electronic
//! noise, and alarm frames when the airway pressure crosses the limit.
//! Deliberately simpler than the server's patient engine: firmware reports
//! what its sensors see, it does not model a patient.

use std::fmt;

use ventylab_protocol::types::{AlarmSeverity, AlarmType, VentilatorCommand};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) with the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(sigma: f64) -> f64 {
    sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured device profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Healthy-ish lung, low noise, alarms only on real limit crossings.
    Normal,
    /// Stiff lung (low compliance): pressures ride high and the high
    /// pressure alarm fires regularly. Exercises the alarm fan-out path.
    Stiff,
    /// High sensor noise plus spurious technical-fault alarms. Exercises
    /// the server's tolerance for a misbehaving device.
    Noisy,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stiff" => Self::Stiff,
            "noisy" => Self::Noisy,
            _ => Self::Normal, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Stiff => write!(f, "stiff"),
            Self::Noisy => write!(f, "noisy"),
        }
    }
}

// ---------------------------------------------------------------------------
// Breath simulator
// ---------------------------------------------------------------------------

/// One tick's sensor readings.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub pressure_cmh2o: f64,
    pub flow_lpm: f64,
    pub volume_ml: f64,
}

pub struct BreathSim {
    // Active ventilator settings (updated by command frames).
    tidal_volume_ml: f64,
    respiratory_rate: f64,
    peep_cmh2o: f64,
    pressure_limit: f64,
    ti_ms: f64,

    // Lung model.
    compliance: f64,
    resistance: f64,

    // Noise + fault injection.
    noise_sigma: f64,
    spurious_alarm_prob: f32,

    // Position on the breath cycle, ms.
    t_ms: f64,
}

const PAUSE_MS: f64 = 100.0;

impl BreathSim {
    pub fn new(scenario: Scenario) -> Self {
        let (compliance, resistance, noise_sigma, spurious_alarm_prob) = match scenario {
            Scenario::Normal => (60.0, 4.0, 0.3, 0.0_f32),
            Scenario::Stiff => (18.0, 9.0, 0.3, 0.0),
            Scenario::Noisy => (60.0, 4.0, 2.0, 0.01),
        };

        Self {
            tidal_volume_ml: 500.0,
            respiratory_rate: 14.0,
            peep_cmh2o: 5.0,
            pressure_limit: 35.0,
            ti_ms: 1_000.0,
            compliance,
            resistance,
            noise_sigma,
            spurious_alarm_prob,
            t_ms: 0.0,
        }
    }

    /// Apply a command frame from the server.
    pub fn apply_command(&mut self, cmd: &VentilatorCommand) {
        self.tidal_volume_ml = f64::from(cmd.tidal_volume);
        self.respiratory_rate = f64::from(cmd.respiratory_rate.max(1));
        self.peep_cmh2o = f64::from(cmd.peep);
        if let Some(limit) = cmd.pressure_limit {
            self.pressure_limit = f64::from(limit);
        }
        if let Some(ti) = cmd.inspiratory_time {
            self.ti_ms = ti * 1_000.0;
        }
    }

    /// Advance the cycle by `dt_ms` and read the sensors.
    pub fn step(&mut self, dt_ms: f64) -> Sample {
        let cycle_ms = 60_000.0 / self.respiratory_rate;
        let ti_ms = self.ti_ms.min(cycle_ms - PAUSE_MS - 100.0).max(100.0);

        self.t_ms = (self.t_ms + dt_ms).rem_euclid(cycle_ms);
        let t = self.t_ms;

        let peak_flow = (self.tidal_volume_ml / 1_000.0) / (ti_ms / 60_000.0);

        let (flow, volume) = if t < ti_ms {
            (peak_flow, self.tidal_volume_ml * (t / ti_ms))
        } else if t < ti_ms + PAUSE_MS {
            (0.0, self.tidal_volume_ml)
        } else {
            let te = t - ti_ms - PAUSE_MS;
            let expiratory_ms = cycle_ms - ti_ms - PAUSE_MS;
            let tau_ms = (self.compliance / 1_000.0) * self.resistance * 1_000.0;
            (
                -1.5 * peak_flow * (-te / tau_ms).exp(),
                self.tidal_volume_ml * (1.0 - te / expiratory_ms),
            )
        };

        let pressure =
            volume / self.compliance + (flow / 60.0) * self.resistance + self.peep_cmh2o;

        Sample {
            pressure_cmh2o: (pressure + gaussian(self.noise_sigma)).max(0.0),
            flow_lpm: flow + gaussian(self.noise_sigma),
            volume_ml: (volume + gaussian(self.noise_sigma * 5.0)).max(0.0),
        }
    }

    /// Alarm to publish for this sample, if any.
    pub fn alarm_for(&self, sample: &Sample) -> Option<(AlarmType, AlarmSeverity)> {
        if sample.pressure_cmh2o > self.pressure_limit {
            return Some((AlarmType::HighPressure, AlarmSeverity::High));
        }
        if fastrand::f32() < self.spurious_alarm_prob {
            return Some((AlarmType::TechnicalFault, AlarmSeverity::Medium));
        }
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
