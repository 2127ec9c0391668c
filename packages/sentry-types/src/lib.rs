//! # sentry-types
//!
//! Shared data model for the Sentry wearable crash-detection pipeline.
//!
//! These types are used by:
//! - `sentry-hub`: reassembling, detecting and escalating wearable telemetry
//! - `device-simulator`: producing motion/GPS messages and gateway bridge frames
//!
//! ## Units
//!
//! - **Acceleration**: m/s² on all three axes; g-force is derived by dividing the
//!   vector magnitude by [`STANDARD_GRAVITY`]
//! - **Attitude**: roll/pitch in degrees, tilt = `max(|roll|, |pitch|)`
//! - **Position**: WGS-84 degrees, altitude in metres, speed in m/s
//!
//! ## Invariants
//! - A [`SensorReading`] is produced once per successfully reassembled motion message
//! - A [`GpsFix`] has its own lifecycle and may be absent for a whole session
//! - [`ThresholdResult`] is ephemeral: only the latest one is retained

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod schema;

// ── Radio Service Contract ────────────────────────────────────────────────────

/// Service advertised by every Sentry wearable.
pub const SERVICE_UUID: &str = "0000ff00-0000-1000-8000-00805f9b34fb";
/// Motion telemetry notification characteristic.
pub const MOTION_CHARACTERISTIC_UUID: &str = "0000ff01-0000-1000-8000-00805f9b34fb";
/// GPS notification characteristic.
pub const GPS_CHARACTERISTIC_UUID: &str = "0000ff02-0000-1000-8000-00805f9b34fb";
/// Advertised names contain this pattern.
pub const DEVICE_NAME_PATTERN: &str = "Sentry";

/// Standard gravity, m/s².
pub const STANDARD_GRAVITY: f64 = 9.81;

/// ATT MTU every link starts with before negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;
/// Bytes of ATT header inside each notification.
pub const ATT_HEADER_LEN: u16 = 3;

/// One of the two notification channels exposed by the wearable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Motion,
    Gps,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Motion, Channel::Gps];

    pub fn characteristic_uuid(self) -> &'static str {
        match self {
            Channel::Motion => MOTION_CHARACTERISTIC_UUID,
            Channel::Gps => GPS_CHARACTERISTIC_UUID,
        }
    }

    /// Value of the `type` discriminator carried by nested envelopes.
    pub fn message_type(self) -> &'static str {
        match self {
            Channel::Motion => "sensor_data",
            Channel::Gps => "gps_data",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Motion => f.write_str("motion"),
            Channel::Gps => f.write_str("gps"),
        }
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// One motion sample from the wearable IMU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub roll: f64,
    pub pitch: f64,
    pub tilt_detected: bool,
    pub timestamp: DateTime<Utc>,
    /// Firmware message counter, when the device sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

impl SensorReading {
    /// Euclidean norm of the acceleration vector, m/s².
    pub fn acceleration_magnitude(&self) -> f64 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }

    pub fn g_force(&self, gravity: f64) -> f64 {
        self.acceleration_magnitude() / gravity
    }

    /// Largest absolute attitude angle, degrees.
    pub fn tilt_deg(&self) -> f64 {
        self.roll.abs().max(self.pitch.abs())
    }
}

/// Location sample. Coordinates stay `None` until the receiver has a satellite fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    /// Derived from the previous fix by the hub, never sent by the device.
    pub speed_change: Option<f64>,
    #[serde(default)]
    pub fix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl GpsFix {
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// A wearable found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub connected: bool,
}

// ── Detection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Impact,
    Tilt,
    Combined,
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => f.write_str("low"),
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
        }
    }
}

/// Outcome of a Tier-1 evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub is_triggered: bool,
    pub trigger_type: Option<TriggerType>,
    pub severity: Severity,
    pub g_force: f64,
    pub tilt: f64,
    pub timestamp: DateTime<Utc>,
}

// ── Escalation ────────────────────────────────────────────────────────────────

/// Unit submitted to the remote confirmation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub device_id: String,
    pub sensor_reading: SensorReading,
    pub threshold_result: ThresholdResult,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "gps_data")]
    pub gps_fix: Option<GpsFix>,
}

/// The confirmation service's judgment on a submitted alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertVerdict {
    pub is_crash: bool,
    pub confidence: f64,
    pub severity: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_type: Option<String>,
    #[serde(default)]
    pub key_indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_positive_risk: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ax: f64, ay: f64, az: f64, roll: f64, pitch: f64) -> SensorReading {
        SensorReading {
            device_id: "dev".into(),
            ax,
            ay,
            az,
            roll,
            pitch,
            tilt_detected: false,
            timestamp: Utc::now(),
            sequence: None,
        }
    }

    #[test]
    fn test_resting_reading_is_one_g() {
        let r = reading(0.0, 0.0, 9.81, 0.0, 0.0);
        assert!((r.g_force(STANDARD_GRAVITY) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tilt_uses_largest_absolute_angle() {
        let r = reading(0.0, 0.0, 9.81, -120.0, 45.0);
        assert_eq!(r.tilt_deg(), 120.0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_envelope_serializes_gps_as_gps_data() {
        let r = reading(0.0, 0.0, 120.0, 0.0, 0.0);
        let env = AlertEnvelope {
            device_id: "dev".into(),
            threshold_result: ThresholdResult {
                is_triggered: true,
                trigger_type: Some(TriggerType::Impact),
                severity: Severity::High,
                g_force: 12.2,
                tilt: 0.0,
                timestamp: r.timestamp,
            },
            timestamp: r.timestamp,
            sensor_reading: r,
            gps_fix: None,
        };
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("gps_data").unwrap().is_null());
        assert_eq!(v["threshold_result"]["trigger_type"], "impact");
        assert_eq!(v["threshold_result"]["severity"], "high");
    }

    #[test]
    fn test_verdict_accepts_minimal_response() {
        let v: AlertVerdict = serde_json::from_str(
            r#"{"is_crash":true,"confidence":0.9,"severity":"high","reasoning":"spike"}"#,
        )
        .unwrap();
        assert!(v.is_crash);
        assert!(v.key_indicators.is_empty());
        assert!(v.crash_type.is_none());
    }
}
