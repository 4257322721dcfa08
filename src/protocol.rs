//! Sensor-report codec for 9-axis fused IMU chips.
//!
//! The layout follows the SH-2 input report format. Only the fields the
//! pipeline consumes are decoded; everything else is skipped by length.

use crate::types::OperationMode;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

// -- Report identifiers --
pub const REPORT_ACCELEROMETER: u8 = 0x01;
pub const REPORT_GYROSCOPE: u8 = 0x02;
pub const REPORT_MAGNETIC_FIELD: u8 = 0x03;
pub const REPORT_LINEAR_ACCELERATION: u8 = 0x04;
pub const REPORT_ROTATION_VECTOR: u8 = 0x05;
pub const REPORT_GYROSCOPE_UNCALIBRATED: u8 = 0x07;
pub const REPORT_GAME_ROTATION_VECTOR: u8 = 0x08;
pub const REPORT_ARVR_ROTATION_VECTOR: u8 = 0x28;
pub const REPORT_ARVR_GAME_ROTATION_VECTOR: u8 = 0x29;
pub const REPORT_TIMEBASE: u8 = 0xFB;

// -- Control commands --
pub const CMD_SET_FEATURE: u8 = 0xFD;
pub const CMD_PRODUCT_ID_REQUEST: u8 = 0xF9;
pub const CMD_PRODUCT_ID_RESPONSE: u8 = 0xF8;

// -- Fixed-point Q points --
pub const Q_ACCEL: u8 = 8;
pub const Q_GYRO: u8 = 9;
pub const Q_MAG: u8 = 4;
pub const Q_ROTATION: u8 = 14;
pub const Q_ROTATION_ACCURACY: u8 = 12;

/// Tick of timebase and delay fields, in seconds (100 µs).
pub const TIME_TICK_S: f64 = 100e-6;

/// Largest packet the transport delivers.
pub const MAX_PACKET_SIZE: usize = 128;

pub const SET_FEATURE_LEN: usize = 17;

/// Which physical quantity a rotation report carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationKind {
    /// Magnetometer-referenced heading.
    Absolute,
    /// Gyro-integrated, no magnetic reference.
    Game,
    /// Absolute, with VR stabilization.
    ArvrAbsolute,
    /// Game, with VR stabilization.
    ArvrGame,
}

/// One decoded sensor report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReport {
    Accelerometer {
        value: Vector3<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    LinearAcceleration {
        value: Vector3<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    Gyroscope {
        value: Vector3<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    GyroscopeUncalibrated {
        value: Vector3<f64>,
        bias: Vector3<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    MagneticField {
        value: Vector3<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    Rotation {
        kind: RotationKind,
        orientation: UnitQuaternion<f64>,
        accuracy: u8,
        delay_ticks: u8,
    },
    /// Sensor time of the following reports, in 100 µs ticks.
    Timebase { ticks: u32 },
}

/// Reports the chip must enable for a given operation mode.
pub fn reports_for_mode(mode: OperationMode) -> &'static [u8] {
    match mode {
        OperationMode::Raw => &[
            REPORT_ACCELEROMETER,
            REPORT_GYROSCOPE_UNCALIBRATED,
            REPORT_MAGNETIC_FIELD,
        ],
        OperationMode::FusedOrientation => &[
            REPORT_ACCELEROMETER,
            REPORT_GYROSCOPE,
            REPORT_ROTATION_VECTOR,
        ],
        OperationMode::VrStabilized => &[
            REPORT_ACCELEROMETER,
            REPORT_GYROSCOPE,
            REPORT_ARVR_ROTATION_VECTOR,
        ],
    }
}

/// Build a set-feature command enabling `report_id` every `interval_us`.
/// Format: [0xFD, report_id, flags, sensitivity:u16le, interval:u32le, batch:u32le, config:u32le]
pub fn build_set_feature(report_id: u8, interval_us: u32) -> [u8; SET_FEATURE_LEN] {
    let mut buf = [0u8; SET_FEATURE_LEN];
    buf[0] = CMD_SET_FEATURE;
    buf[1] = report_id;
    buf[5..9].copy_from_slice(&interval_us.to_le_bytes());
    buf
}

/// Build the product id request used as a liveness probe.
pub fn build_product_id_request() -> [u8; 2] {
    [CMD_PRODUCT_ID_REQUEST, 0x00]
}

/// Sample interval in microseconds for a rate in Hz.
pub fn interval_us(rate_hz: u32) -> u32 {
    1_000_000 / rate_hz.max(1)
}

/// Payload length of a report, including its 4-byte header.
pub fn report_len(report_id: u8) -> Option<usize> {
    match report_id {
        REPORT_ACCELEROMETER
        | REPORT_GYROSCOPE
        | REPORT_MAGNETIC_FIELD
        | REPORT_LINEAR_ACCELERATION => Some(10),
        REPORT_GYROSCOPE_UNCALIBRATED => Some(16),
        REPORT_ROTATION_VECTOR | REPORT_ARVR_ROTATION_VECTOR => Some(14),
        REPORT_GAME_ROTATION_VECTOR | REPORT_ARVR_GAME_ROTATION_VECTOR => Some(12),
        REPORT_TIMEBASE => Some(5),
        _ => None,
    }
}

fn q_to_f64(raw: i16, q: u8) -> f64 {
    raw as f64 / (1u32 << q) as f64
}

fn f64_to_q(value: f64, q: u8) -> i16 {
    (value * (1u32 << q) as f64)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn read_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_vec3(data: &[u8], offset: usize, q: u8) -> Vector3<f64> {
    Vector3::new(
        q_to_f64(read_i16(data, offset), q),
        q_to_f64(read_i16(data, offset + 2), q),
        q_to_f64(read_i16(data, offset + 4), q),
    )
}

/// Decode the report at the start of `data`.
///
/// Returns the report (None for ids we skip) and the number of bytes consumed,
/// or None when the bytes do not hold a complete known report.
pub fn parse_report(data: &[u8]) -> Option<(Option<SensorReport>, usize)> {
    let report_id = *data.first()?;
    let len = report_len(report_id)?;
    if data.len() < len {
        return None;
    }

    if report_id == REPORT_TIMEBASE {
        let ticks = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        return Some((Some(SensorReport::Timebase { ticks }), len));
    }

    // [1] sequence, [2] status (accuracy in bits 0..1), [3] delay
    let accuracy = data[2] & 0x03;
    let delay_ticks = data[3];

    let report = match report_id {
        REPORT_ACCELEROMETER => SensorReport::Accelerometer {
            value: read_vec3(data, 4, Q_ACCEL),
            accuracy,
            delay_ticks,
        },
        REPORT_LINEAR_ACCELERATION => SensorReport::LinearAcceleration {
            value: read_vec3(data, 4, Q_ACCEL),
            accuracy,
            delay_ticks,
        },
        REPORT_GYROSCOPE => SensorReport::Gyroscope {
            value: read_vec3(data, 4, Q_GYRO),
            accuracy,
            delay_ticks,
        },
        REPORT_GYROSCOPE_UNCALIBRATED => SensorReport::GyroscopeUncalibrated {
            value: read_vec3(data, 4, Q_GYRO),
            bias: read_vec3(data, 10, Q_GYRO),
            accuracy,
            delay_ticks,
        },
        REPORT_MAGNETIC_FIELD => SensorReport::MagneticField {
            value: read_vec3(data, 4, Q_MAG),
            accuracy,
            delay_ticks,
        },
        REPORT_ROTATION_VECTOR
        | REPORT_GAME_ROTATION_VECTOR
        | REPORT_ARVR_ROTATION_VECTOR
        | REPORT_ARVR_GAME_ROTATION_VECTOR => {
            // Wire order is i, j, k, real.
            let i = q_to_f64(read_i16(data, 4), Q_ROTATION);
            let j = q_to_f64(read_i16(data, 6), Q_ROTATION);
            let k = q_to_f64(read_i16(data, 8), Q_ROTATION);
            let w = q_to_f64(read_i16(data, 10), Q_ROTATION);
            let kind = match report_id {
                REPORT_ROTATION_VECTOR => RotationKind::Absolute,
                REPORT_GAME_ROTATION_VECTOR => RotationKind::Game,
                REPORT_ARVR_ROTATION_VECTOR => RotationKind::ArvrAbsolute,
                _ => RotationKind::ArvrGame,
            };
            SensorReport::Rotation {
                kind,
                orientation: UnitQuaternion::from_quaternion(Quaternion::new(w, i, j, k)),
                accuracy,
                delay_ticks,
            }
        }
        _ => return Some((None, len)),
    };

    Some((Some(report), len))
}

/// Decode every complete report in a packet. Stops at the first unknown id.
pub fn parse_reports(data: &[u8]) -> Vec<SensorReport> {
    let mut reports = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match parse_report(&data[offset..]) {
            Some((report, consumed)) => {
                if let Some(report) = report {
                    reports.push(report);
                }
                offset += consumed;
            }
            None => {
                log::trace!(
                    "Unknown or truncated report 0x{:02x} at offset {}",
                    data[offset],
                    offset
                );
                break;
            }
        }
    }
    reports
}

fn push_header(buf: &mut Vec<u8>, report_id: u8, accuracy: u8, delay_ticks: u8) {
    buf.push(report_id);
    buf.push(0); // sequence
    buf.push(accuracy & 0x03);
    buf.push(delay_ticks);
}

fn push_vec3(buf: &mut Vec<u8>, v: &Vector3<f64>, q: u8) {
    for c in v.iter() {
        buf.extend_from_slice(&f64_to_q(*c, q).to_le_bytes());
    }
}

/// Append the wire encoding of `report` to `buf`.
pub fn encode_report(report: &SensorReport, buf: &mut Vec<u8>) {
    match *report {
        SensorReport::Timebase { ticks } => {
            buf.push(REPORT_TIMEBASE);
            buf.extend_from_slice(&ticks.to_le_bytes());
        }
        SensorReport::Accelerometer { value, accuracy, delay_ticks } => {
            push_header(buf, REPORT_ACCELEROMETER, accuracy, delay_ticks);
            push_vec3(buf, &value, Q_ACCEL);
        }
        SensorReport::LinearAcceleration { value, accuracy, delay_ticks } => {
            push_header(buf, REPORT_LINEAR_ACCELERATION, accuracy, delay_ticks);
            push_vec3(buf, &value, Q_ACCEL);
        }
        SensorReport::Gyroscope { value, accuracy, delay_ticks } => {
            push_header(buf, REPORT_GYROSCOPE, accuracy, delay_ticks);
            push_vec3(buf, &value, Q_GYRO);
        }
        SensorReport::GyroscopeUncalibrated { value, bias, accuracy, delay_ticks } => {
            push_header(buf, REPORT_GYROSCOPE_UNCALIBRATED, accuracy, delay_ticks);
            push_vec3(buf, &value, Q_GYRO);
            push_vec3(buf, &bias, Q_GYRO);
        }
        SensorReport::MagneticField { value, accuracy, delay_ticks } => {
            push_header(buf, REPORT_MAGNETIC_FIELD, accuracy, delay_ticks);
            push_vec3(buf, &value, Q_MAG);
        }
        SensorReport::Rotation { kind, orientation, accuracy, delay_ticks } => {
            let id = match kind {
                RotationKind::Absolute => REPORT_ROTATION_VECTOR,
                RotationKind::Game => REPORT_GAME_ROTATION_VECTOR,
                RotationKind::ArvrAbsolute => REPORT_ARVR_ROTATION_VECTOR,
                RotationKind::ArvrGame => REPORT_ARVR_GAME_ROTATION_VECTOR,
            };
            push_header(buf, id, accuracy, delay_ticks);
            let q = orientation.quaternion();
            for c in [q.i, q.j, q.k, q.w] {
                buf.extend_from_slice(&f64_to_q(c, Q_ROTATION).to_le_bytes());
            }
            if matches!(kind, RotationKind::Absolute | RotationKind::ArvrAbsolute) {
                // Heading accuracy estimate, radians in Q12. Not decoded.
                buf.extend_from_slice(&f64_to_q(0.1, Q_ROTATION_ACCURACY).to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_set_feature() {
        let buf = build_set_feature(REPORT_GYROSCOPE, interval_us(400));
        assert_eq!(buf[0], CMD_SET_FEATURE);
        assert_eq!(buf[1], REPORT_GYROSCOPE);
        assert_eq!(u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]), 2500);
        assert!(buf[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_accelerometer() {
        // 9.81 m/s² on z in Q8 = 2511 = 0x09CF
        let data = [0x01, 0x07, 0x03, 0x02, 0x00, 0x00, 0x00, 0x00, 0xCF, 0x09];
        let (report, len) = parse_report(&data).unwrap();
        assert_eq!(len, 10);
        match report.unwrap() {
            SensorReport::Accelerometer { value, accuracy, delay_ticks } => {
                assert_eq!(accuracy, 3);
                assert_eq!(delay_ticks, 2);
                assert!((value.z - 9.81).abs() < 0.01);
                assert_eq!(value.x, 0.0);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_parse_rotation_identity() {
        // real = 1.0 in Q14 = 0x4000
        let data = [
            0x28, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00,
        ];
        let (report, _) = parse_report(&data).unwrap();
        match report.unwrap() {
            SensorReport::Rotation { kind, orientation, accuracy, .. } => {
                assert_eq!(kind, RotationKind::ArvrAbsolute);
                assert_eq!(accuracy, 2);
                assert!(orientation.angle() < 1e-9);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_parse_multiple_reports_with_unknown_tail() {
        let mut packet = Vec::new();
        encode_report(&SensorReport::Timebase { ticks: 1234 }, &mut packet);
        encode_report(
            &SensorReport::Gyroscope {
                value: Vector3::new(0.5, -0.25, 1.0),
                accuracy: 2,
                delay_ticks: 0,
            },
            &mut packet,
        );
        packet.push(0x77); // unknown id ends parsing
        packet.push(0x00);

        let reports = parse_reports(&packet);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], SensorReport::Timebase { ticks: 1234 });
        match reports[1] {
            SensorReport::Gyroscope { value, .. } => {
                assert!((value - Vector3::new(0.5, -0.25, 1.0)).norm() < 1e-2);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_truncated_report_is_rejected() {
        let data = [REPORT_GYROSCOPE_UNCALIBRATED, 0, 0, 0, 1, 2];
        assert!(parse_report(&data).is_none());
    }

    #[test]
    fn test_mode_reports() {
        assert!(reports_for_mode(OperationMode::VrStabilized).contains(&REPORT_ARVR_ROTATION_VECTOR));
        assert!(reports_for_mode(OperationMode::Raw).contains(&REPORT_GYROSCOPE_UNCALIBRATED));
    }
}
