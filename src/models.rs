//! Core data models for the telemetry pipeline
//!
//! Defines the schema-flexible telemetry record, the raw serial line
//! container, IMU samples in SI units, and orientation types shared by
//! the parsers, fusion engine, and broadcast hub.

use chrono::Utc;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current wall-clock time as unix seconds, matching the `timestamp`
/// field of outbound hub events.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 * 1e-6
}

/// One newline-terminated line read from a serial port.
///
/// Lives for a single pipeline traversal: console event, decode, fusion,
/// telemetry event.
#[derive(Debug, Clone)]
pub struct RawLine {
    /// Port the line arrived on (e.g. `/dev/ttyUSB0`, `COM3`).
    pub port: String,

    /// Line content, decoded lossily from UTF-8 with the terminator stripped.
    pub line: String,

    /// Monotonic receive time in seconds since process start.
    pub timestamp: f64,
}

/// Quaternion representation for 3D orientation
///
/// Used for representing rotation without gimbal lock issues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// Create a new quaternion
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Identity quaternion (no rotation)
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Hamilton product `self ⊗ other`.
    pub fn multiply(&self, other: &Quaternion) -> Quaternion {
        Quaternion::new(
            self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        )
    }

    /// Quaternion conjugate (inverse rotation for unit quaternions).
    pub fn conjugate(&self) -> Quaternion {
        Quaternion::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize to unit length; falls back to identity near zero norm.
    pub fn normalized(&self) -> Quaternion {
        let norm = self.norm();
        if norm > 1e-12 {
            Quaternion::new(self.w / norm, self.x / norm, self.y / norm, self.z / norm)
        } else {
            Quaternion::identity()
        }
    }

    /// Convert to Euler angles (roll, pitch, yaw) in radians
    pub fn to_euler(&self) -> (f64, f64, f64) {
        // Roll (x-axis rotation)
        let sinr_cosp = 2.0 * (self.w * self.x + self.y * self.z);
        let cosr_cosp = 1.0 - 2.0 * (self.x * self.x + self.y * self.y);
        let roll = sinr_cosp.atan2(cosr_cosp);

        // Pitch (y-axis rotation), saturated at ±90° outside the asin domain
        let sinp = 2.0 * (self.w * self.y - self.z * self.x);
        let pitch = if sinp.abs() >= 1.0 {
            std::f64::consts::FRAC_PI_2.copysign(sinp)
        } else {
            sinp.asin()
        };

        // Yaw (z-axis rotation)
        let siny_cosp = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        let yaw = siny_cosp.atan2(cosy_cosp);

        (roll, pitch, yaw)
    }
}

/// One IMU reading handed to the fusion engine.
///
/// Units: accelerometer m/s², gyroscope degrees/sec, magnetometer µT,
/// timestamp unix seconds. A magnetometer of all zeros means "no data".
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub mag: Vector3<f64>,
    pub timestamp: f64,
}

/// Orientation estimate produced by the fusion engine.
///
/// Roll ∈ (−180, 180], pitch ∈ [−90, 90], yaw ∈ [0, 360), all degrees.
/// The quaternion is always the latest filter state, even when the angle
/// triple has been smoothed.
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub quaternion: Quaternion,
}

/// Schema-flexible telemetry record: a keyed map of heterogeneous values.
///
/// Decoders fill it with unit-normalized fields, the dispatcher annotates
/// the source port and orientation, and the hub serializes it verbatim.
/// The wire JSON shape is authoritative; a record is immutable once
/// published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryRecord(Map<String, Value>);

impl TelemetryRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an existing JSON object (used by the JSON passthrough decoder).
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Insert a field, converting any JSON-representable value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric field as f64, coercing integers.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quaternion_identity_has_zero_euler() {
        let (roll, pitch, yaw) = Quaternion::identity().to_euler();
        assert_eq!(roll, 0.0);
        assert_eq!(pitch, 0.0);
        assert_eq!(yaw, 0.0);
    }

    #[test]
    fn quaternion_normalized_is_unit() {
        let q = Quaternion::new(2.0, 1.0, -3.0, 0.5).normalized();
        assert!((q.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn quaternion_times_conjugate_is_identity() {
        let q = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        let p = q.multiply(&q.conjugate());
        assert!((p.w - 1.0).abs() < 1e-12);
        assert!(p.x.abs() < 1e-12 && p.y.abs() < 1e-12 && p.z.abs() < 1e-12);
    }

    #[test]
    fn record_coerces_integers_to_f64() {
        let mut record = TelemetryRecord::new();
        record.insert("satellites", 8i64);
        record.insert("altitude", 545.4);
        assert_eq!(record.get_f64("satellites"), Some(8.0));
        assert_eq!(record.get_i64("satellites"), Some(8));
        assert_eq!(record.get_f64("altitude"), Some(545.4));
        assert_eq!(record.get_i64("altitude"), None);
        assert_eq!(record.len(), 2);
        assert!(!record.is_empty());
        assert_eq!(record.iter().count(), 2);
    }

    #[test]
    fn record_serializes_as_plain_object() {
        let mut record = TelemetryRecord::new();
        record.insert("temp", 25.6);
        record.insert("_parser", "JSON");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["temp"], 25.6);
        assert_eq!(json["_parser"], "JSON");
    }
}
