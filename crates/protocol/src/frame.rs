//! Binary frame codec for the device link.
//!
//! Wire schema, MSB-first:
//!
//! ```text
//! +------+------+--------+---------+----------+
//! | 0xFF | TYPE | LENGTH | PAYLOAD | CHECKSUM |
//! +------+------+--------+---------+----------+
//!    1B    1B     1B      LENGTH B     1B
//! ```
//!
//! CHECKSUM is the XOR of every preceding byte, start byte included.
//! Decoding never panics on arbitrary input; a frame that fails any check is
//! rejected with the reason so the caller can log and drop it.

use thiserror::Error;

use crate::types::{AlarmSeverity, AlarmType, VentMode, VentilatorCommand};

pub const FRAME_START: u8 = 0xFF;

pub const TYPE_PRESSURE: u8 = 0xA1;
pub const TYPE_FLOW: u8 = 0xA2;
pub const TYPE_VOLUME: u8 = 0xA3;
pub const TYPE_ALARM: u8 = 0xA4;
pub const TYPE_COMMAND: u8 = 0xB1;
pub const TYPE_ACK: u8 = 0xB2;

/// Total frame length bounds: 3-byte header + >=2-byte payload + checksum.
pub const MIN_FRAME_LEN: usize = 6;
pub const MAX_FRAME_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Decoded frames + errors
// ---------------------------------------------------------------------------

/// A telemetry-direction frame. Each frame carries exactly one quantity;
/// the server merges them into its rolling reading.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    /// Airway pressure in cmH2O (wire: u16, value x10).
    Pressure(f64),
    /// Flow in L/min, negative during expiration (wire: i16, value x10).
    Flow(f64),
    /// Volume in ml (wire: u16).
    Volume(u16),
    Alarm {
        alarm_type: AlarmType,
        severity: AlarmSeverity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame length {0} outside [{MIN_FRAME_LEN},{MAX_FRAME_LEN}]")]
    TotalLength(usize),
    #[error("bad start byte 0x{0:02X}")]
    BadStart(u8),
    #[error("declared payload length {declared} does not match frame of {actual} bytes")]
    LengthMismatch { declared: u8, actual: usize },
    #[error("unknown frame type 0x{0:02X}")]
    UnknownType(u8),
    #[error("checksum mismatch: frame carries 0x{expected:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch { expected: u8, computed: u8 },
    #[error("type 0x{frame_type:02X} payload of {actual} bytes (expected {expected})")]
    PayloadLength {
        frame_type: u8,
        expected: &'static str,
        actual: usize,
    },
    #[error("unknown mode code 0x{0:02X}")]
    UnknownMode(u8),
}

// ---------------------------------------------------------------------------
// Checksum + structural validation
// ---------------------------------------------------------------------------

/// XOR fold over a byte slice.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Structural checks shared by both decode directions: bounds, start byte,
/// declared-length agreement. Returns the declared payload on success.
fn structure(buf: &[u8]) -> Result<&[u8], FrameError> {
    if buf.len() < MIN_FRAME_LEN || buf.len() > MAX_FRAME_LEN {
        return Err(FrameError::TotalLength(buf.len()));
    }
    if buf[0] != FRAME_START {
        return Err(FrameError::BadStart(buf[0]));
    }
    let declared = buf[2];
    if buf.len() != 3 + declared as usize + 1 {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    Ok(&buf[3..buf.len() - 1])
}

fn verify_checksum(buf: &[u8]) -> Result<(), FrameError> {
    let expected = buf[buf.len() - 1];
    let computed = checksum(&buf[..buf.len() - 1]);
    if expected != computed {
        return Err(FrameError::ChecksumMismatch { expected, computed });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Telemetry decode
// ---------------------------------------------------------------------------

/// Decode one inbound telemetry frame (pressure / flow / volume / alarm).
///
/// Check order: total length, start byte, declared length, type, checksum,
/// payload. Command and ack types are not accepted on this path.
pub fn decode(buf: &[u8]) -> Result<TelemetryFrame, FrameError> {
    let payload = structure(buf)?;
    let frame_type = buf[1];
    if !matches!(
        frame_type,
        TYPE_PRESSURE | TYPE_FLOW | TYPE_VOLUME | TYPE_ALARM
    ) {
        return Err(FrameError::UnknownType(frame_type));
    }
    verify_checksum(buf)?;

    match frame_type {
        TYPE_PRESSURE => {
            let raw = be_u16(frame_type, payload)?;
            Ok(TelemetryFrame::Pressure(f64::from(raw) / 10.0))
        }
        TYPE_FLOW => {
            let raw = be_u16(frame_type, payload)? as i16;
            Ok(TelemetryFrame::Flow(f64::from(raw) / 10.0))
        }
        TYPE_VOLUME => Ok(TelemetryFrame::Volume(be_u16(frame_type, payload)?)),
        TYPE_ALARM => {
            if payload.len() != 2 {
                return Err(FrameError::PayloadLength {
                    frame_type,
                    expected: "2",
                    actual: payload.len(),
                });
            }
            // Unknown alarm or severity codes degrade rather than fail: a
            // live device is more useful than a dropped alarm.
            Ok(TelemetryFrame::Alarm {
                alarm_type: AlarmType::from_code(payload[0]),
                severity: AlarmSeverity::from_code(payload[1]),
            })
        }
        _ => unreachable!("type checked above"),
    }
}

fn be_u16(frame_type: u8, payload: &[u8]) -> Result<u16, FrameError> {
    if payload.len() != 2 {
        return Err(FrameError::PayloadLength {
            frame_type,
            expected: "2",
            actual: payload.len(),
        });
    }
    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}

// ---------------------------------------------------------------------------
// Telemetry encode (device side)
// ---------------------------------------------------------------------------

/// Encode a telemetry frame the way the device firmware does. Used by the
/// device simulator and by round-trip tests.
pub fn encode_telemetry(frame: &TelemetryFrame) -> Vec<u8> {
    let (frame_type, payload): (u8, Vec<u8>) = match frame {
        TelemetryFrame::Pressure(cmh2o) => (
            TYPE_PRESSURE,
            (((cmh2o * 10.0).round()) as u16).to_be_bytes().to_vec(),
        ),
        TelemetryFrame::Flow(lpm) => (
            TYPE_FLOW,
            (((lpm * 10.0).round()) as i16).to_be_bytes().to_vec(),
        ),
        TelemetryFrame::Volume(ml) => (TYPE_VOLUME, ml.to_be_bytes().to_vec()),
        TelemetryFrame::Alarm {
            alarm_type,
            severity,
        } => (TYPE_ALARM, vec![alarm_type.code(), severity.code()]),
    };
    seal(frame_type, payload)
}

fn seal(frame_type: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.push(FRAME_START);
    buf.push(frame_type);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(&payload);
    buf.push(checksum(&buf));
    buf
}

// ---------------------------------------------------------------------------
// Command encode / decode
// ---------------------------------------------------------------------------

/// Encode a command frame for the device.
///
/// Fails fast with the full violation list when the command is outside the
/// safety ranges; an invalid command must never reach the wire.
///
/// Payload: mode(1) tidalVolume(2) respiratoryRate(1) peep(1)
/// round(fio2 x 100)(1), then optionally pressureLimit(1) and
/// round(inspiratoryTime x 10)(2).
pub fn encode_command(cmd: &VentilatorCommand) -> Result<Vec<u8>, Vec<String>> {
    let errors = cmd.validation_errors();
    if !errors.is_empty() {
        return Err(errors);
    }

    let mut payload = Vec::with_capacity(9);
    payload.push(cmd.mode.code());
    payload.extend_from_slice(&cmd.tidal_volume.to_be_bytes());
    payload.push(cmd.respiratory_rate);
    payload.push(cmd.peep);
    payload.push((cmd.fio2 * 100.0).round() as u8);
    if let Some(limit) = cmd.pressure_limit {
        payload.push(limit);
    }
    if let Some(ti) = cmd.inspiratory_time {
        payload.extend_from_slice(&(((ti * 10.0).round()) as u16).to_be_bytes());
    }

    Ok(seal(TYPE_COMMAND, payload))
}

/// Decode a command frame (the device side of the command topic).
///
/// Payload length discriminates the optional fields: 6 none, 7 adds the
/// pressure limit, 8 adds the inspiratory time, 9 both.
pub fn decode_command(buf: &[u8]) -> Result<VentilatorCommand, FrameError> {
    let payload = structure(buf)?;
    if buf[1] != TYPE_COMMAND {
        return Err(FrameError::UnknownType(buf[1]));
    }
    verify_checksum(buf)?;

    if !matches!(payload.len(), 6..=9) {
        return Err(FrameError::PayloadLength {
            frame_type: TYPE_COMMAND,
            expected: "6..=9",
            actual: payload.len(),
        });
    }

    let mode = VentMode::from_code(payload[0]).ok_or(FrameError::UnknownMode(payload[0]))?;
    let tidal_volume = u16::from_be_bytes([payload[1], payload[2]]);
    let respiratory_rate = payload[3];
    let peep = payload[4];
    let fio2 = f64::from(payload[5]) / 100.0;

    let (pressure_limit, inspiratory_time) = match payload.len() {
        6 => (None, None),
        7 => (Some(payload[6]), None),
        8 => (
            None,
            Some(f64::from(u16::from_be_bytes([payload[6], payload[7]])) / 10.0),
        ),
        9 => (
            Some(payload[6]),
            Some(f64::from(u16::from_be_bytes([payload[7], payload[8]])) / 10.0),
        ),
        _ => unreachable!("length checked above"),
    };

    Ok(VentilatorCommand {
        mode,
        tidal_volume,
        respiratory_rate,
        peep,
        fio2,
        pressure_limit,
        inspiratory_time,
        ie_ratio: None,
        sensitivity: None,
        flow_rate: None,
        timestamp: 0,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
