//! Ventilator data model: commands, readings, alarms, and the safety ranges
//! every command is checked against before it may reach the device.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Ventilation modes
// ---------------------------------------------------------------------------

/// Supported ventilation modes and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VentMode {
    Vcv,
    Pcv,
    Simv,
    Psv,
}

impl VentMode {
    pub fn code(self) -> u8 {
        match self {
            VentMode::Vcv => 0x01,
            VentMode::Pcv => 0x02,
            VentMode::Simv => 0x03,
            VentMode::Psv => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(VentMode::Vcv),
            0x02 => Some(VentMode::Pcv),
            0x03 => Some(VentMode::Simv),
            0x04 => Some(VentMode::Psv),
            _ => None,
        }
    }

    /// Volume-targeted modes deliver a square inspiratory flow; pressure
    /// modes deliver a decelerating one.
    pub fn is_volume_targeted(self) -> bool {
        matches!(self, VentMode::Vcv | VentMode::Simv)
    }
}

// ---------------------------------------------------------------------------
// Commands + safety ranges
// ---------------------------------------------------------------------------

/// A parameter-change request bound for the ventilator (or a simulation
/// session). Immutable once built; validated against [`SAFETY_RANGES`]
/// before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VentilatorCommand {
    pub mode: VentMode,
    /// Tidal volume in ml.
    pub tidal_volume: u16,
    /// Breaths per minute.
    pub respiratory_rate: u8,
    /// PEEP in cmH2O.
    pub peep: u8,
    /// Inspired oxygen fraction, 0.21..=1.0.
    pub fio2: f64,
    /// Pressure limit in cmH2O.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_limit: Option<u8>,
    /// Inspiratory time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspiratory_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ie_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    /// Peak flow in L/min.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_rate: Option<f64>,
    /// Client timestamp, ms since epoch.
    #[serde(default)]
    pub timestamp: i64,
}

/// Inclusive safety range for one command parameter.
pub struct SafetyRange {
    pub name: &'static str,
    pub lo: f64,
    pub hi: f64,
    pub unit: &'static str,
}

pub const TIDAL_VOLUME_RANGE: SafetyRange = SafetyRange {
    name: "tidalVolume",
    lo: 200.0,
    hi: 800.0,
    unit: "ml",
};
pub const RESPIRATORY_RATE_RANGE: SafetyRange = SafetyRange {
    name: "respiratoryRate",
    lo: 5.0,
    hi: 40.0,
    unit: "breaths/min",
};
pub const PEEP_RANGE: SafetyRange = SafetyRange {
    name: "peep",
    lo: 0.0,
    hi: 20.0,
    unit: "cmH2O",
};
pub const FIO2_RANGE: SafetyRange = SafetyRange {
    name: "fio2",
    lo: 0.21,
    hi: 1.0,
    unit: "fraction",
};
pub const PRESSURE_LIMIT_RANGE: SafetyRange = SafetyRange {
    name: "pressureLimit",
    lo: 10.0,
    hi: 50.0,
    unit: "cmH2O",
};
pub const INSPIRATORY_TIME_RANGE: SafetyRange = SafetyRange {
    name: "inspiratoryTime",
    lo: 0.5,
    hi: 3.0,
    unit: "s",
};
pub const FLOW_RATE_RANGE: SafetyRange = SafetyRange {
    name: "flowRate",
    lo: 20.0,
    hi: 100.0,
    unit: "L/min",
};

impl SafetyRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value <= self.hi
    }

    fn violation(&self, value: f64) -> String {
        format!(
            "{} {} out of range [{},{}] {}",
            self.name, value, self.lo, self.hi, self.unit
        )
    }
}

impl VentilatorCommand {
    /// One entry per parameter outside its safety range; empty means the
    /// command may be sent.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let required: [(&SafetyRange, f64); 4] = [
            (&TIDAL_VOLUME_RANGE, f64::from(self.tidal_volume)),
            (&RESPIRATORY_RATE_RANGE, f64::from(self.respiratory_rate)),
            (&PEEP_RANGE, f64::from(self.peep)),
            (&FIO2_RANGE, self.fio2),
        ];
        for (range, value) in required {
            if !range.contains(value) {
                errors.push(range.violation(value));
            }
        }

        let optional: [(&SafetyRange, Option<f64>); 3] = [
            (&PRESSURE_LIMIT_RANGE, self.pressure_limit.map(f64::from)),
            (&INSPIRATORY_TIME_RANGE, self.inspiratory_time),
            (&FLOW_RATE_RANGE, self.flow_rate),
        ];
        for (range, value) in optional {
            if let Some(v) = value {
                if !range.contains(v) {
                    errors.push(range.violation(v));
                }
            }
        }

        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One telemetry sample, either merged from device frames or produced by a
/// simulation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VentilatorReading {
    /// Airway pressure in cmH2O.
    pub pressure: f64,
    /// Flow in L/min (negative during expiration).
    pub flow: f64,
    /// Volume in ml.
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pco2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2: Option<f64>,
    /// ms since epoch.
    pub timestamp: i64,
    pub device_id: String,
}

// ---------------------------------------------------------------------------
// Alarms
// ---------------------------------------------------------------------------

/// Alarm categories raised by the device. Wire codes 1..=8; anything else
/// is treated as a technical fault rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmType {
    HighPressure,
    LowPressure,
    HighVolume,
    LowVolume,
    Apnea,
    Disconnection,
    PowerFailure,
    TechnicalFault,
}

impl AlarmType {
    pub fn code(self) -> u8 {
        match self {
            AlarmType::HighPressure => 1,
            AlarmType::LowPressure => 2,
            AlarmType::HighVolume => 3,
            AlarmType::LowVolume => 4,
            AlarmType::Apnea => 5,
            AlarmType::Disconnection => 6,
            AlarmType::PowerFailure => 7,
            AlarmType::TechnicalFault => 8,
        }
    }

    /// Unknown codes fall back to `TechnicalFault`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => AlarmType::HighPressure,
            2 => AlarmType::LowPressure,
            3 => AlarmType::HighVolume,
            4 => AlarmType::LowVolume,
            5 => AlarmType::Apnea,
            6 => AlarmType::Disconnection,
            7 => AlarmType::PowerFailure,
            _ => AlarmType::TechnicalFault,
        }
    }

    /// Operator-facing description shown in the client alarm banner.
    pub fn human_message(self) -> &'static str {
        match self {
            AlarmType::HighPressure => "Airway pressure above the configured limit",
            AlarmType::LowPressure => "Airway pressure below the expected minimum",
            AlarmType::HighVolume => "Delivered volume above the configured limit",
            AlarmType::LowVolume => "Delivered volume below the expected minimum",
            AlarmType::Apnea => "No spontaneous breath detected",
            AlarmType::Disconnection => "Patient circuit disconnected",
            AlarmType::PowerFailure => "Device running on backup power",
            AlarmType::TechnicalFault => "Device reported a technical fault",
        }
    }
}

/// Alarm severities. Wire codes 1..=4; anything else falls back to Medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlarmSeverity {
    pub fn code(self) -> u8 {
        match self {
            AlarmSeverity::Low => 1,
            AlarmSeverity::Medium => 2,
            AlarmSeverity::High => 3,
            AlarmSeverity::Critical => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => AlarmSeverity::Low,
            3 => AlarmSeverity::High,
            4 => AlarmSeverity::Critical,
            _ => AlarmSeverity::Medium,
        }
    }
}

/// A device alarm as held in the active-alarm table and fanned out to
/// clients. `acknowledged` is carried for clients but nothing clears it yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VentilatorAlarm {
    #[serde(rename = "type")]
    pub alarm_type: AlarmType,
    pub severity: AlarmSeverity,
    pub message: String,
    /// ms since epoch.
    pub timestamp: i64,
    pub active: bool,
    pub acknowledged: bool,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: a command with every parameter inside its safety range.
    fn valid_command() -> VentilatorCommand {
        VentilatorCommand {
            mode: VentMode::Vcv,
            tidal_volume: 500,
            respiratory_rate: 12,
            peep: 5,
            fio2: 0.40,
            pressure_limit: Some(30),
            inspiratory_time: Some(1.0),
            ie_ratio: None,
            sensitivity: None,
            flow_rate: None,
            timestamp: 1_700_000_000_000,
        }
    }

    // -- validation -----------------------------------------------------

    #[test]
    fn valid_command_has_no_errors() {
        assert!(valid_command().validation_errors().is_empty());
        assert!(valid_command().is_valid());
    }

    #[test]
    fn tidal_volume_boundaries() {
        let mut cmd = valid_command();
        cmd.tidal_volume = 200;
        assert!(cmd.is_valid());
        cmd.tidal_volume = 800;
        assert!(cmd.is_valid());

        cmd.tidal_volume = 199;
        let errors = cmd.validation_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], "tidalVolume 199 out of range [200,800] ml");

        cmd.tidal_volume = 801;
        let errors = cmd.validation_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("tidalVolume 801"));
    }

    #[test]
    fn fio2_boundaries() {
        let mut cmd = valid_command();
        cmd.fio2 = 0.21;
        assert!(cmd.is_valid());
        cmd.fio2 = 1.0;
        assert!(cmd.is_valid());
        cmd.fio2 = 0.20;
        assert!(!cmd.is_valid());
        cmd.fio2 = 1.01;
        assert!(!cmd.is_valid());
    }

    #[test]
    fn respiratory_rate_boundaries() {
        let mut cmd = valid_command();
        cmd.respiratory_rate = 5;
        assert!(cmd.is_valid());
        cmd.respiratory_rate = 40;
        assert!(cmd.is_valid());
        cmd.respiratory_rate = 4;
        assert!(!cmd.is_valid());
        cmd.respiratory_rate = 41;
        assert!(!cmd.is_valid());
    }

    #[test]
    fn optional_fields_skip_validation_when_absent() {
        let mut cmd = valid_command();
        cmd.pressure_limit = None;
        cmd.inspiratory_time = None;
        cmd.flow_rate = None;
        assert!(cmd.is_valid());
    }

    #[test]
    fn optional_fields_validated_when_present() {
        let mut cmd = valid_command();
        cmd.inspiratory_time = Some(3.5);
        cmd.flow_rate = Some(10.0);
        let errors = cmd.validation_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("inspiratoryTime 3.5"));
        assert!(errors[1].starts_with("flowRate 10"));
    }

    #[test]
    fn multiple_violations_all_reported() {
        let mut cmd = valid_command();
        cmd.tidal_volume = 100;
        cmd.peep = 25;
        cmd.fio2 = 0.1;
        assert_eq!(cmd.validation_errors().len(), 3);
    }

    // -- wire codes -----------------------------------------------------

    #[test]
    fn mode_code_roundtrip() {
        for mode in [VentMode::Vcv, VentMode::Pcv, VentMode::Simv, VentMode::Psv] {
            assert_eq!(VentMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(VentMode::from_code(0x05), None);
        assert_eq!(VentMode::from_code(0x00), None);
    }

    #[test]
    fn alarm_type_code_roundtrip() {
        for code in 1..=8u8 {
            assert_eq!(AlarmType::from_code(code).code(), code);
        }
    }

    #[test]
    fn unknown_alarm_code_falls_back_to_technical_fault() {
        assert_eq!(AlarmType::from_code(0x09), AlarmType::TechnicalFault);
        assert_eq!(AlarmType::from_code(0), AlarmType::TechnicalFault);
        assert_eq!(AlarmType::from_code(255), AlarmType::TechnicalFault);
    }

    #[test]
    fn unknown_severity_falls_back_to_medium() {
        assert_eq!(AlarmSeverity::from_code(0), AlarmSeverity::Medium);
        assert_eq!(AlarmSeverity::from_code(5), AlarmSeverity::Medium);
    }

    #[test]
    fn severity_ordering() {
        assert!(AlarmSeverity::Critical > AlarmSeverity::High);
        assert!(AlarmSeverity::High > AlarmSeverity::Medium);
        assert!(AlarmSeverity::Medium > AlarmSeverity::Low);
    }

    // -- JSON shape -----------------------------------------------------

    #[test]
    fn command_serializes_camel_case() {
        let json = serde_json::to_value(valid_command()).unwrap();
        assert_eq!(json["mode"], "VCV");
        assert_eq!(json["tidalVolume"], 500);
        assert_eq!(json["respiratoryRate"], 12);
        assert_eq!(json["pressureLimit"], 30);
        // absent optionals are omitted entirely
        assert!(json.get("ieRatio").is_none());
    }

    #[test]
    fn command_deserializes_without_optionals() {
        let json = r#"{"mode":"PCV","tidalVolume":450,"respiratoryRate":16,"peep":8,"fio2":0.5}"#;
        let cmd: VentilatorCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.mode, VentMode::Pcv);
        assert_eq!(cmd.tidal_volume, 450);
        assert!(cmd.pressure_limit.is_none());
        assert_eq!(cmd.timestamp, 0);
    }

    #[test]
    fn alarm_serializes_with_type_field() {
        let alarm = VentilatorAlarm {
            alarm_type: AlarmType::HighPressure,
            severity: AlarmSeverity::High,
            message: AlarmType::HighPressure.human_message().to_string(),
            timestamp: 1,
            active: true,
            acknowledged: false,
        };
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["type"], "HIGH_PRESSURE");
        assert_eq!(json["severity"], "HIGH");
        assert_eq!(json["active"], true);
    }

    #[test]
    fn reading_serializes_device_id_camel_case() {
        let reading = VentilatorReading {
            pressure: 12.5,
            flow: -20.0,
            volume: 480.0,
            pco2: None,
            spo2: Some(96.0),
            timestamp: 5,
            device_id: "ventilab-device-001".to_string(),
        };
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["deviceId"], "ventilab-device-001");
        assert_eq!(json["spo2"], 96.0);
        assert!(json.get("pco2").is_none());
    }
}
