//! Wire protocol and shared data model for the VentyLab ventilator link.
//!
//! The physical ventilator speaks length-prefixed binary frames over MQTT;
//! this crate owns the frame codec plus the command/reading/alarm types that
//! cross the server's WebSocket and REST surfaces as JSON.

pub mod frame;
pub mod types;

pub use frame::{decode, decode_command, encode_command, encode_telemetry, FrameError, TelemetryFrame};
pub use types::{
    AlarmSeverity, AlarmType, VentMode, VentilatorAlarm, VentilatorCommand, VentilatorReading,
};
