//! Patient physiology model: demographic derivations, respiratory mechanics
//! by condition, the breath-cycle waveform, and the SpO2 response.
//!
//! Everything here is pure math over a fixed timeline; the per-user tick
//! loop in `simulation` drives it and adds measurement noise.

use serde::{Deserialize, Serialize};
use ventylab_protocol::types::{VentMode, VentilatorCommand};

/// Fixed inspiratory pause between inspiration and expiration.
pub const PAUSE_MS: f64 = 100.0;

/// Default inspiratory time when the settings leave it unset.
pub const DEFAULT_TI_MS: f64 = 1_000.0;

/// SpO2 first-order time constant.
const SPO2_TAU_S: f64 = 30.0;

// ---------------------------------------------------------------------------
// Demographics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    pub weight_kg: f64,
    pub height_cm: f64,
    pub age_years: u32,
    pub gender: Gender,
}

/// Ideal body weight (ARDSNet), floored at 30 kg for very short statures.
pub fn ideal_body_weight(gender: Gender, height_cm: f64) -> f64 {
    let base = match gender {
        Gender::Male => 50.0,
        Gender::Female => 45.5,
    };
    (base + 0.91 * (height_cm - 152.4)).max(30.0)
}

pub fn body_mass_index(weight_kg: f64, height_cm: f64) -> f64 {
    let height_m = height_cm / 100.0;
    weight_kg / (height_m * height_m)
}

/// Body surface area (DuBois).
pub fn body_surface_area(weight_kg: f64, height_cm: f64) -> f64 {
    0.007184 * weight_kg.powf(0.425) * height_cm.powf(0.725)
}

/// Lung-protective tidal volume window, 6-8 ml/kg of ideal body weight.
pub fn predicted_tidal_volume(ibw_kg: f64) -> (u32, u32) {
    ((6.0 * ibw_kg).floor() as u32, (8.0 * ibw_kg).floor() as u32)
}

// ---------------------------------------------------------------------------
// Conditions + mechanics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Healthy,
    ArdsMild,
    ArdsModerate,
    ArdsSevere,
    CopdMild,
    CopdModerate,
    CopdSevere,
    AsthmaMild,
    AsthmaModerate,
    AsthmaSevere,
    Pneumonia,
    PulmonaryEdema,
    Pneumothorax,
    ObesityHypoventilation,
    Neuromuscular,
    PostSurgical,
}

impl Condition {
    pub fn is_severe(self) -> bool {
        matches!(
            self,
            Condition::ArdsSevere | Condition::CopdSevere | Condition::AsthmaSevere
        )
    }

    pub fn is_moderate(self) -> bool {
        matches!(
            self,
            Condition::ArdsModerate | Condition::CopdModerate | Condition::AsthmaModerate
        )
    }

    /// Teaching difficulty, 1 (healthy) to 5 (severe ARDS).
    pub fn difficulty_level(self) -> u8 {
        match self {
            Condition::Healthy => 1,
            Condition::ArdsMild
            | Condition::CopdMild
            | Condition::AsthmaMild
            | Condition::PostSurgical => 2,
            Condition::ArdsModerate
            | Condition::CopdModerate
            | Condition::AsthmaModerate
            | Condition::Pneumonia
            | Condition::ObesityHypoventilation
            | Condition::Neuromuscular => 3,
            Condition::PulmonaryEdema
            | Condition::Pneumothorax
            | Condition::CopdSevere
            | Condition::AsthmaSevere => 4,
            Condition::ArdsSevere => 5,
        }
    }
}

/// Respiratory mechanics: compliance ml/cmH2O, resistance cmH2O.s/L,
/// functional residual capacity ml, intrinsic PEEP cmH2O.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespiratoryMechanics {
    pub compliance: f64,
    pub resistance: f64,
    pub frc: f64,
    pub intrinsic_peep: f64,
}

impl RespiratoryMechanics {
    pub const NORMAL: RespiratoryMechanics = RespiratoryMechanics {
        compliance: 75.0,
        resistance: 3.0,
        frc: 2_400.0,
        intrinsic_peep: 0.0,
    };
}

/// Overlay the condition's mechanics onto the healthy baseline. Fields the
/// condition does not name keep their baseline value.
pub fn mechanics_for(condition: Condition) -> RespiratoryMechanics {
    let mut m = RespiratoryMechanics::NORMAL;
    match condition {
        Condition::Healthy => {}
        Condition::ArdsMild => {
            m.compliance = 40.0;
            m.resistance = 6.0;
        }
        Condition::ArdsModerate => {
            m.compliance = 25.0;
            m.resistance = 8.0;
        }
        Condition::ArdsSevere => {
            m.compliance = 15.0;
            m.resistance = 10.0;
        }
        Condition::CopdMild => {
            m.resistance = 8.0;
            m.intrinsic_peep = 2.0;
        }
        Condition::CopdModerate => {
            m.resistance = 12.0;
            m.intrinsic_peep = 5.0;
        }
        Condition::CopdSevere => {
            m.resistance = 18.0;
            m.intrinsic_peep = 8.0;
        }
        Condition::AsthmaMild => {
            m.resistance = 10.0;
            m.intrinsic_peep = 2.0;
        }
        Condition::AsthmaModerate => {
            m.resistance = 15.0;
            m.intrinsic_peep = 4.0;
        }
        Condition::AsthmaSevere => {
            m.resistance = 25.0;
            m.intrinsic_peep = 8.0;
        }
        Condition::Pneumonia => {
            m.compliance = 35.0;
            m.resistance = 7.0;
        }
        Condition::PulmonaryEdema => {
            m.compliance = 30.0;
            m.resistance = 6.0;
        }
        Condition::Pneumothorax => {
            m.compliance = 20.0;
            m.resistance = 5.0;
        }
        Condition::ObesityHypoventilation => {
            m.compliance = 40.0;
            m.frc = 1_800.0;
        }
        Condition::Neuromuscular => {
            m.compliance = 60.0;
        }
        Condition::PostSurgical => {
            m.compliance = 50.0;
            m.resistance = 5.0;
        }
    }
    m
}

// ---------------------------------------------------------------------------
// Patient model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientModel {
    pub demographics: Demographics,
    pub condition: Condition,
    /// Ideal body weight, kg.
    pub ibw: f64,
    pub bmi: f64,
    /// Body surface area, m2.
    pub bsa: f64,
    /// Lung-protective tidal volume window, ml.
    pub predicted_tidal_volume: (u32, u32),
    pub mechanics: RespiratoryMechanics,
    pub difficulty_level: u8,
}

impl PatientModel {
    /// Build the full model: condition mechanics, then age and obesity
    /// adjustments on top.
    pub fn new(demographics: Demographics, condition: Condition) -> Self {
        let ibw = ideal_body_weight(demographics.gender, demographics.height_cm);
        let bmi = body_mass_index(demographics.weight_kg, demographics.height_cm);
        let bsa = body_surface_area(demographics.weight_kg, demographics.height_cm);

        let mut mechanics = mechanics_for(condition);

        if demographics.age_years > 60 {
            let loss = 0.5 * f64::from(demographics.age_years - 60);
            mechanics.compliance = (mechanics.compliance - loss).max(15.0);
        }
        if bmi > 30.0 {
            let factor = 1.0 - 0.01 * (bmi - 30.0);
            mechanics.compliance = (mechanics.compliance * factor).max(15.0);
            mechanics.frc = (mechanics.frc * factor).max(1_500.0);
        }

        Self {
            demographics,
            condition,
            ibw,
            bmi,
            bsa,
            predicted_tidal_volume: predicted_tidal_volume(ibw),
            mechanics,
            difficulty_level: condition.difficulty_level(),
        }
    }

    /// Starting ventilator settings for a fresh session: mid-range
    /// lung-protective tidal volume, conservative everything else.
    pub fn initial_settings(&self) -> VentilatorCommand {
        let tidal_volume = ((7.0 * self.ibw).round() as u16).clamp(200, 800);
        VentilatorCommand {
            mode: VentMode::Vcv,
            tidal_volume,
            respiratory_rate: 12,
            peep: 5,
            fio2: 0.21,
            pressure_limit: Some(30),
            inspiratory_time: Some(1.0),
            ie_ratio: None,
            sensitivity: None,
            flow_rate: None,
            timestamp: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Breath-cycle waveform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreathPhase {
    Inspiration,
    InspiratoryPause,
    Expiration,
}

/// One noise-free point on the breath cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPoint {
    /// Airway pressure, cmH2O.
    pub pressure: f64,
    /// Flow, L/min (negative during expiration).
    pub flow: f64,
    /// Volume above FRC, ml.
    pub volume: f64,
    pub phase: BreathPhase,
}

/// Sample the deterministic waveform at `t_ms` on the session timeline.
///
/// Cycle: inspiration for the set inspiratory time, a fixed 100 ms pause,
/// then passive expiration for the remainder of `60000/RR` ms. Airway
/// pressure is the single-compartment equation of motion
/// `V/C + (flow/60)*R + PEEP + intrinsic PEEP`.
pub fn waveform_at(
    settings: &VentilatorCommand,
    mechanics: &RespiratoryMechanics,
    t_ms: f64,
) -> WaveformPoint {
    let cycle_ms = 60_000.0 / f64::from(settings.respiratory_rate.max(1));
    // Keep a real expiratory phase even when Ti is set long for the rate.
    let ti_ms = (settings.inspiratory_time.map_or(DEFAULT_TI_MS, |s| s * 1_000.0))
        .min(cycle_ms - PAUSE_MS - 100.0)
        .max(100.0);
    let tidal_volume = f64::from(settings.tidal_volume);

    // Square-wave peak flow that delivers the tidal volume over Ti, L/min.
    let peak_flow = (tidal_volume / 1_000.0) / (ti_ms / 60_000.0);

    let t = t_ms.rem_euclid(cycle_ms);

    let (phase, flow, volume) = if t < ti_ms {
        let progress = t / ti_ms;
        let flow = if settings.mode.is_volume_targeted() {
            peak_flow
        } else {
            peak_flow * 1.5 * (-progress / 0.3).exp()
        };
        (BreathPhase::Inspiration, flow, tidal_volume * progress)
    } else if t < ti_ms + PAUSE_MS {
        (BreathPhase::InspiratoryPause, 0.0, tidal_volume)
    } else {
        let te = t - ti_ms - PAUSE_MS;
        let expiratory_ms = cycle_ms - ti_ms - PAUSE_MS;
        // tau = R*C in seconds; the decay runs on the same ms timeline.
        let tau_ms = (mechanics.compliance / 1_000.0) * mechanics.resistance * 1_000.0;
        let flow = -1.5 * peak_flow * (-te / tau_ms).exp();
        let volume = tidal_volume * (1.0 - te / expiratory_ms);
        (BreathPhase::Expiration, flow, volume)
    };

    let pressure = volume / mechanics.compliance
        + (flow / 60.0) * mechanics.resistance
        + f64::from(settings.peep)
        + mechanics.intrinsic_peep;

    WaveformPoint {
        pressure,
        flow,
        volume,
        phase,
    }
}

// ---------------------------------------------------------------------------
// SpO2 model
// ---------------------------------------------------------------------------

/// Steady-state SpO2 for the given oxygen fraction and condition.
pub fn spo2_target(fio2: f64, condition: Condition) -> f64 {
    let mut target = 88.0 + 15.0 * (fio2 - 0.21);
    if condition.is_severe() {
        target -= 10.0;
    } else if condition.is_moderate() {
        target -= 5.0;
    }
    target.clamp(70.0, 100.0)
}

/// One first-order lag step toward the target (tau = 30 s).
pub fn spo2_step(previous: f64, target: f64, dt_s: f64) -> f64 {
    let alpha = 1.0 - (-dt_s / SPO2_TAU_S).exp();
    (previous + alpha * (target - previous)).clamp(50.0, 100.0)
}

// ---------------------------------------------------------------------------
// Measurement noise
// ---------------------------------------------------------------------------

pub const PRESSURE_NOISE_SIGMA: f64 = 0.5;
pub const FLOW_NOISE_SIGMA: f64 = 1.0;
pub const VOLUME_NOISE_SIGMA: f64 = 5.0;

/// Sample N(0, sigma) via the Box-Muller transform.
pub fn gaussian(sigma: f64) -> f64 {
    let u1 = fastrand::f64().max(f64::MIN_POSITIVE);
    let u2 = fastrand::f64();
    sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// The reference patient from the bedside teaching scenario:
    /// 70 kg, 175 cm, 45 y male, healthy lungs.
    fn reference_demographics() -> Demographics {
        Demographics {
            weight_kg: 70.0,
            height_cm: 175.0,
            age_years: 45,
            gender: Gender::Male,
        }
    }

    fn reference_settings() -> VentilatorCommand {
        VentilatorCommand {
            mode: VentMode::Vcv,
            tidal_volume: 500,
            respiratory_rate: 12,
            peep: 5,
            fio2: 0.40,
            pressure_limit: None,
            inspiratory_time: Some(1.0),
            ie_ratio: None,
            sensitivity: None,
            flow_rate: None,
            timestamp: 0,
        }
    }

    // -- demographics ---------------------------------------------------

    #[test]
    fn ibw_reference_male() {
        let ibw = ideal_body_weight(Gender::Male, 175.0);
        assert!((ibw - 70.6).abs() < 0.2, "ibw = {ibw}");
    }

    #[test]
    fn ibw_female_lower_than_male() {
        let m = ideal_body_weight(Gender::Male, 165.0);
        let f = ideal_body_weight(Gender::Female, 165.0);
        assert!((m - f - 4.5).abs() < 1e-9);
    }

    #[test]
    fn ibw_floored_for_short_stature() {
        assert_eq!(ideal_body_weight(Gender::Female, 120.0), 30.0);
    }

    #[test]
    fn bmi_reference() {
        let bmi = body_mass_index(70.0, 175.0);
        assert!((bmi - 22.9).abs() < 0.05, "bmi = {bmi}");
    }

    #[test]
    fn bsa_dubois_reference() {
        // Published DuBois value for 70 kg / 175 cm is ~1.85 m2.
        let bsa = body_surface_area(70.0, 175.0);
        assert!((bsa - 1.85).abs() < 0.02, "bsa = {bsa}");
    }

    #[test]
    fn predicted_tidal_volume_window() {
        let (lo, hi) = predicted_tidal_volume(70.6);
        assert_eq!(lo, 423);
        assert_eq!(hi, 564);
    }

    // -- mechanics ------------------------------------------------------

    #[test]
    fn healthy_mechanics_are_baseline() {
        assert_eq!(mechanics_for(Condition::Healthy), RespiratoryMechanics::NORMAL);
    }

    #[test]
    fn ards_overlay_reduces_compliance() {
        let m = mechanics_for(Condition::ArdsSevere);
        assert_eq!(m.compliance, 15.0);
        assert_eq!(m.resistance, 10.0);
        // fields the overlay does not name keep the baseline
        assert_eq!(m.frc, 2_400.0);
        assert_eq!(m.intrinsic_peep, 0.0);
    }

    #[test]
    fn copd_overlay_adds_intrinsic_peep() {
        let m = mechanics_for(Condition::CopdModerate);
        assert_eq!(m.resistance, 12.0);
        assert_eq!(m.intrinsic_peep, 5.0);
        assert_eq!(m.compliance, 75.0);
    }

    #[test]
    fn obesity_overlay_shrinks_frc() {
        let m = mechanics_for(Condition::ObesityHypoventilation);
        assert_eq!(m.frc, 1_800.0);
        assert_eq!(m.compliance, 40.0);
    }

    #[test]
    fn age_adjustment_reduces_compliance() {
        let mut demo = reference_demographics();
        demo.age_years = 80;
        let patient = PatientModel::new(demo, Condition::Healthy);
        // 75 - 0.5 * 20 = 65
        assert!((patient.mechanics.compliance - 65.0).abs() < 1e-9);
    }

    #[test]
    fn age_adjustment_floors_at_fifteen() {
        let mut demo = reference_demographics();
        demo.age_years = 100;
        let patient = PatientModel::new(demo, Condition::ArdsSevere);
        assert_eq!(patient.mechanics.compliance, 15.0);
    }

    #[test]
    fn obesity_adjustment_scales_compliance_and_frc() {
        let demo = Demographics {
            weight_kg: 120.0,
            height_cm: 170.0,
            age_years: 40,
            gender: Gender::Male,
        };
        let patient = PatientModel::new(demo, Condition::Healthy);
        let bmi = patient.bmi;
        assert!(bmi > 30.0);
        let factor = 1.0 - 0.01 * (bmi - 30.0);
        assert!((patient.mechanics.compliance - 75.0 * factor).abs() < 1e-6);
        assert!((patient.mechanics.frc - 2_400.0 * factor).abs() < 1e-6);
    }

    #[test]
    fn reference_patient_model() {
        let patient = PatientModel::new(reference_demographics(), Condition::Healthy);
        assert!((patient.ibw - 70.6).abs() < 0.2);
        assert_eq!(patient.mechanics, RespiratoryMechanics::NORMAL);
        assert_eq!(patient.difficulty_level, 1);
    }

    #[test]
    fn initial_settings_are_within_safety_ranges() {
        for condition in [Condition::Healthy, Condition::ArdsSevere, Condition::CopdMild] {
            let patient = PatientModel::new(reference_demographics(), condition);
            assert!(patient.initial_settings().is_valid());
        }
    }

    // -- waveform -------------------------------------------------------

    #[test]
    fn first_inspiration_tick_matches_hand_computation() {
        let wf = waveform_at(&reference_settings(), &RespiratoryMechanics::NORMAL, 50.0);
        assert_eq!(wf.phase, BreathPhase::Inspiration);
        // 500 ml over 1 s -> 30 L/min square flow; 5% through -> 25 ml.
        assert!((wf.flow - 30.0).abs() < 1e-9);
        assert!((wf.volume - 25.0).abs() < 1e-9);
        let expected_pressure = 25.0 / 75.0 + (30.0 / 60.0) * 3.0 + 5.0;
        assert!((wf.pressure - expected_pressure).abs() < 1e-9);
    }

    #[test]
    fn vcv_flow_square_and_positive_during_inspiration() {
        let settings = reference_settings();
        for t in [0.0, 250.0, 500.0, 999.0] {
            let wf = waveform_at(&settings, &RespiratoryMechanics::NORMAL, t);
            assert_eq!(wf.phase, BreathPhase::Inspiration);
            assert!((wf.flow - 30.0).abs() < 1e-9, "t={t} flow={}", wf.flow);
        }
    }

    #[test]
    fn pcv_flow_decelerates() {
        let mut settings = reference_settings();
        settings.mode = VentMode::Pcv;
        let early = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 10.0);
        let late = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 900.0);
        assert!(early.flow > late.flow);
        assert!(late.flow > 0.0);
        // initial pressure-mode flow overshoots the square-wave peak
        assert!(early.flow > 30.0);
    }

    #[test]
    fn flow_zero_during_pause_and_volume_held() {
        let wf = waveform_at(&reference_settings(), &RespiratoryMechanics::NORMAL, 1_050.0);
        assert_eq!(wf.phase, BreathPhase::InspiratoryPause);
        assert_eq!(wf.flow, 0.0);
        assert_eq!(wf.volume, 500.0);
    }

    #[test]
    fn expiration_flow_negative_and_decaying() {
        let settings = reference_settings();
        let early = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 1_200.0);
        let late = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 4_000.0);
        assert_eq!(early.phase, BreathPhase::Expiration);
        assert_eq!(late.phase, BreathPhase::Expiration);
        assert!(early.flow < 0.0);
        assert!(late.flow < 0.0);
        assert!(late.flow > early.flow, "magnitude should decay");
    }

    #[test]
    fn volume_monotonic_during_inspiration() {
        let settings = reference_settings();
        let mut previous = -1.0;
        let mut t = 0.0;
        while t < 1_000.0 {
            let wf = waveform_at(&settings, &RespiratoryMechanics::NORMAL, t);
            assert!(wf.volume >= previous, "volume dipped at t={t}");
            previous = wf.volume;
            t += 50.0;
        }
    }

    #[test]
    fn pressure_never_below_total_peep() {
        let settings = reference_settings();
        let mechanics = mechanics_for(Condition::CopdModerate);
        let floor = f64::from(settings.peep) + mechanics.intrinsic_peep;
        let mut t = 0.0;
        while t < 10_000.0 {
            let wf = waveform_at(&settings, &mechanics, t);
            // expiratory flow subtracts a little resistive pressure, but the
            // noise-free waveform stays within 3 cmH2O of the PEEP floor
            assert!(
                wf.pressure >= floor - 3.0,
                "t={t} pressure={} floor={floor}",
                wf.pressure
            );
            t += 25.0;
        }
    }

    #[test]
    fn cycle_wraps_at_rate_period() {
        let settings = reference_settings(); // 12/min -> 5000 ms cycle
        let a = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 100.0);
        let b = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 5_100.0);
        assert!((a.pressure - b.pressure).abs() < 1e-9);
        assert!((a.volume - b.volume).abs() < 1e-9);
    }

    #[test]
    fn long_ti_still_leaves_expiration() {
        let mut settings = reference_settings();
        settings.respiratory_rate = 40; // 1500 ms cycle
        settings.inspiratory_time = Some(3.0); // longer than the whole cycle
        let wf = waveform_at(&settings, &RespiratoryMechanics::NORMAL, 1_499.0);
        assert_eq!(wf.phase, BreathPhase::Expiration);
    }

    // -- spo2 -----------------------------------------------------------

    #[test]
    fn spo2_target_reference() {
        let target = spo2_target(0.40, Condition::Healthy);
        assert!((target - 90.85).abs() < 1e-9);
    }

    #[test]
    fn spo2_target_modifiers() {
        assert_eq!(
            spo2_target(0.40, Condition::ArdsSevere),
            spo2_target(0.40, Condition::Healthy) - 10.0
        );
        assert_eq!(
            spo2_target(0.40, Condition::ArdsModerate),
            spo2_target(0.40, Condition::Healthy) - 5.0
        );
    }

    #[test]
    fn spo2_target_boundaries() {
        assert!((spo2_target(0.21, Condition::ArdsSevere) - 78.0).abs() < 1e-9);
        assert!((spo2_target(1.0, Condition::Healthy) - 99.85).abs() < 1e-9);
        assert!(spo2_target(1.0, Condition::Healthy) <= 100.0);
        assert!(spo2_target(0.0, Condition::ArdsSevere) >= 70.0);
    }

    #[test]
    fn spo2_converges_within_two_percent_after_thirty_seconds() {
        let target = spo2_target(0.40, Condition::Healthy);
        let mut spo2 = 95.0;
        for _ in 0..30 {
            spo2 = spo2_step(spo2, target, 1.0);
        }
        assert!(
            (spo2 - target).abs() / target < 0.02,
            "spo2 after 30 s = {spo2}, target {target}"
        );
    }

    #[test]
    fn spo2_step_moves_toward_target() {
        let next = spo2_step(95.0, 90.0, 1.0);
        assert!(next < 95.0 && next > 90.0);
        let next = spo2_step(85.0, 90.0, 1.0);
        assert!(next > 85.0 && next < 90.0);
    }

    #[test]
    fn spo2_step_clamped_to_plausible_band() {
        assert_eq!(spo2_step(50.0, 0.0, 1_000.0), 50.0);
        assert_eq!(spo2_step(100.0, 200.0, 1_000.0), 100.0);
    }

    // -- noise ----------------------------------------------------------

    #[test]
    fn gaussian_zero_sigma_is_zero() {
        assert_eq!(gaussian(0.0), 0.0);
    }

    #[test]
    fn gaussian_sample_statistics() {
        let n = 5_000;
        let samples: Vec<f64> = (0..n).map(|_| gaussian(1.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        // std error of the mean is ~0.014 at n=5000; be generous
        assert!(mean.abs() < 0.15, "mean = {mean}");
        assert!((variance - 1.0).abs() < 0.3, "variance = {variance}");
    }

    // -- serde ----------------------------------------------------------

    #[test]
    fn condition_deserializes_from_screaming_snake() {
        let c: Condition = serde_json::from_str("\"ARDS_MODERATE\"").unwrap();
        assert_eq!(c, Condition::ArdsModerate);
        let c: Condition = serde_json::from_str("\"OBESITY_HYPOVENTILATION\"").unwrap();
        assert_eq!(c, Condition::ObesityHypoventilation);
    }

    #[test]
    fn demographics_deserialize_camel_case() {
        let demo: Demographics = serde_json::from_str(
            r#"{"weightKg":70.0,"heightCm":175.0,"ageYears":45,"gender":"MALE"}"#,
        )
        .unwrap();
        assert_eq!(demo, reference_demographics());
    }
}
