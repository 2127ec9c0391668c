//! Normalisation of reassembled wearable documents into typed telemetry.
//!
//! Firmware revisions disagree on shape. Newer builds wrap the body in an
//! envelope (`{"type":"sensor_data","sensor":{..}}`), older ones send the body
//! flat (`{"ax":..,"ay":..}`). Both normalise to the same entity; the nested
//! form is tried first, then the flat one, anything else is rejected.
//!
//! Missing numbers become `0.0` (motion) or `None` (GPS), missing booleans
//! become `false`. A missing field is never an error.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{Channel, GpsFix, SensorReading};

const MOTION_FIELDS: [&str; 6] = ["ax", "ay", "az", "roll", "pitch", "tilt_detected"];
const GPS_FIELDS: [&str; 7] = [
    "latitude",
    "longitude",
    "altitude",
    "accuracy",
    "speed",
    "fix",
    "satellites",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("message type {0:?} does not belong on the {1} channel")]
    WrongType(String, Channel),
    #[error("no {0} fields in document")]
    MissingBody(Channel),
}

/// A document normalised to the entity of its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Motion(SensorReading),
    Gps(GpsFix),
}

/// Normalise `doc` received on `channel`. `received_at` stands in for the
/// reading time whenever the device did not send a wall-clock timestamp.
pub fn decode(
    channel: Channel,
    doc: &Value,
    device_id: &str,
    received_at: DateTime<Utc>,
) -> Result<Telemetry, SchemaError> {
    match channel {
        Channel::Motion => motion_from_document(doc, device_id, received_at).map(Telemetry::Motion),
        Channel::Gps => gps_from_document(doc, received_at).map(Telemetry::Gps),
    }
}

pub fn motion_from_document(
    doc: &Value,
    device_id: &str,
    received_at: DateTime<Utc>,
) -> Result<SensorReading, SchemaError> {
    let (envelope, body) = resolve_body(Channel::Motion, doc, "sensor", &MOTION_FIELDS)?;
    Ok(SensorReading {
        device_id: device_id.to_string(),
        ax: number(body, "ax"),
        ay: number(body, "ay"),
        az: number(body, "az"),
        roll: number(body, "roll"),
        pitch: number(body, "pitch"),
        tilt_detected: body.get("tilt_detected").and_then(Value::as_bool).unwrap_or(false),
        timestamp: timestamp(envelope, body).unwrap_or(received_at),
        sequence: sequence(envelope),
    })
}

pub fn gps_from_document(doc: &Value, received_at: DateTime<Utc>) -> Result<GpsFix, SchemaError> {
    let (envelope, body) = resolve_body(Channel::Gps, doc, "gps", &GPS_FIELDS)?;
    let latitude = optional_number(body, "latitude");
    let longitude = optional_number(body, "longitude");
    let fix = body
        .get("fix")
        .and_then(Value::as_bool)
        .unwrap_or(latitude.is_some() && longitude.is_some());
    Ok(GpsFix {
        latitude,
        longitude,
        altitude: optional_number(body, "altitude"),
        accuracy: optional_number(body, "accuracy"),
        speed: optional_number(body, "speed"),
        speed_change: None,
        fix,
        satellites: body
            .get("satellites")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        timestamp: timestamp(envelope, body).unwrap_or(received_at),
    })
}

// ── Shape discrimination ─────────────────────────────────────────────────────

/// Returns `(envelope, body)`. For flat documents both are the same object.
fn resolve_body<'a>(
    channel: Channel,
    doc: &'a Value,
    wrapper: &str,
    fields: &[&str],
) -> Result<(&'a Map<String, Value>, &'a Map<String, Value>), SchemaError> {
    let envelope = doc.as_object().ok_or(SchemaError::NotAnObject)?;

    if let Some(kind) = envelope.get("type").and_then(Value::as_str) {
        if kind != channel.message_type() {
            return Err(SchemaError::WrongType(kind.to_string(), channel));
        }
    }

    if let Some(nested) = envelope.get(wrapper).and_then(Value::as_object) {
        return Ok((envelope, nested));
    }
    if fields.iter().any(|f| envelope.contains_key(*f)) {
        return Ok((envelope, envelope));
    }
    Err(SchemaError::MissingBody(channel))
}

fn number(body: &Map<String, Value>, key: &str) -> f64 {
    optional_number(body, key).unwrap_or(0.0)
}

fn optional_number(body: &Map<String, Value>, key: &str) -> Option<f64> {
    body.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn sequence(envelope: &Map<String, Value>) -> Option<u32> {
    envelope
        .get("sequence")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

/// Firmware sends milliseconds since boot as a number; only RFC 3339 strings
/// carry wall-clock time.
fn timestamp(envelope: &Map<String, Value>, body: &Map<String, Value>) -> Option<DateTime<Utc>> {
    envelope
        .get("timestamp")
        .or_else(|| body.get("timestamp"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_nested_and_flat_motion_normalise_identically() {
        let nested = json!({
            "type": "sensor_data",
            "sensor": {"ax": 0.1, "ay": -0.2, "az": 9.8, "roll": 3.0, "pitch": -4.0, "tilt_detected": false}
        });
        let flat = json!({"ax": 0.1, "ay": -0.2, "az": 9.8, "roll": 3.0, "pitch": -4.0, "tilt_detected": false});
        let a = motion_from_document(&nested, "dev", now()).unwrap();
        let b = motion_from_document(&flat, "dev", now()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.az, 9.8);
    }

    #[test]
    fn test_missing_motion_fields_default() {
        let doc = json!({"type": "sensor_data", "sensor": {"az": 9.81}});
        let r = motion_from_document(&doc, "dev", now()).unwrap();
        assert_eq!(r.ax, 0.0);
        assert_eq!(r.roll, 0.0);
        assert!(!r.tilt_detected);
        assert_eq!(r.timestamp, now());
    }

    #[test]
    fn test_firmware_envelope_keeps_sequence_and_ignores_uptime() {
        let doc = json!({
            "type": "sensor_data",
            "sequence": 42,
            "timestamp": 183_000,
            "sensor": {"ax": 0.0, "ay": 0.0, "az": 9.81, "roll": 0.0, "pitch": 0.0, "tilt_detected": false},
            "crc": 1234
        });
        let r = motion_from_document(&doc, "dev", now()).unwrap();
        assert_eq!(r.sequence, Some(42));
        assert_eq!(r.timestamp, now());
    }

    #[test]
    fn test_rfc3339_timestamp_is_used() {
        let doc = json!({"ax": 1.0, "timestamp": "2026-02-01T08:30:00Z"});
        let r = motion_from_document(&doc, "dev", now()).unwrap();
        assert_eq!(r.timestamp.to_rfc3339(), "2026-02-01T08:30:00+00:00");
    }

    #[test]
    fn test_gps_on_motion_channel_is_rejected() {
        let doc = json!({"type": "gps_data", "gps": {"latitude": 1.0}});
        assert!(matches!(
            decode(Channel::Motion, &doc, "dev", now()),
            Err(SchemaError::WrongType(_, Channel::Motion))
        ));
    }

    #[test]
    fn test_unrelated_document_is_rejected() {
        assert_eq!(
            motion_from_document(&json!({"hello": "world"}), "dev", now()),
            Err(SchemaError::MissingBody(Channel::Motion))
        );
        assert_eq!(
            motion_from_document(&json!([1, 2, 3]), "dev", now()),
            Err(SchemaError::NotAnObject)
        );
    }

    #[test]
    fn test_gps_without_fix_keeps_nulls() {
        let doc = json!({
            "type": "gps_data",
            "gps": {"fix": false, "satellites": 2, "latitude": null, "longitude": null, "altitude": null}
        });
        let fix = gps_from_document(&doc, now()).unwrap();
        assert!(!fix.fix);
        assert!(!fix.has_position());
        assert_eq!(fix.satellites, Some(2));
        assert!(fix.speed_change.is_none());
    }

    #[test]
    fn test_flat_gps_infers_fix_from_coordinates() {
        let doc = json!({"latitude": 52.52, "longitude": 13.40, "speed": 8.3});
        let fix = gps_from_document(&doc, now()).unwrap();
        assert!(fix.fix);
        assert_eq!(fix.speed, Some(8.3));
        assert!(fix.accuracy.is_none());
    }
}
