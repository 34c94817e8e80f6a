//! ARMED state telemetry decoder
//!
//! Frames from the flight computer in the ARMED state:
//! `<MM/DD/YYYY,HH:MM:SS,altitude,accelXYZ,gyroXYZ,magXYZ,lat,lon,sats,temp>`
//!
//! Example: `<05/27/2025,11:43:46,0.95,-37,-967,-3,128,-27,204,6,-53,20,1,1,0,24>`
//!
//! Raw integer fields arrive in scaled units (milli-g, centi-dps,
//! deci-µT, degrees·1e7); the decoder emits both the raw field and the
//! unit-normalized companion.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::models::TelemetryRecord;

const DATETIME_FORMAT: &str = "%m/%d/%Y,%H:%M:%S";

/// Field names by frame index.
const FIELD_NAMES: [&str; 16] = [
    "date",
    "time",
    "altitude_m",
    "accel_x_mg",
    "accel_y_mg",
    "accel_z_mg",
    "gyro_x_centidps",
    "gyro_y_centidps",
    "gyro_z_centidps",
    "mag_x_decisla",
    "mag_y_decisla",
    "mag_z_decisla",
    "gps_lat_1e7",
    "gps_lon_1e7",
    "gps_satellites",
    "temperature_c",
];

/// Decoder for bracketed 16-field ARMED telemetry frames.
#[derive(Debug, Clone, Default)]
pub struct ArmedTelemetryDecoder;

impl ArmedTelemetryDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "ARMED_TELEMETRY"
    }

    /// A line matches when it is bracketed, carries exactly 16 fields,
    /// and its first two fields parse as `MM/DD/YYYY,HH:MM:SS`.
    pub fn matches(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('<') || !line.ends_with('>') {
            return false;
        }

        let content = &line[1..line.len() - 1];
        let parts: Vec<&str> = content.split(',').collect();
        if parts.len() != 16 {
            return false;
        }

        let stamp = format!("{},{}", parts[0], parts[1]);
        NaiveDateTime::parse_from_str(&stamp, DATETIME_FORMAT).is_ok()
    }

    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        let line = line.trim();
        if !self.matches(line) {
            return None;
        }

        let content = &line[1..line.len() - 1];
        let mut record = TelemetryRecord::new();

        for (index, value) in content.split(',').enumerate() {
            let name = FIELD_NAMES[index];
            convert_field(&mut record, name, value.trim());
        }

        // Combined ISO-8601 datetime and unix timestamp
        let date = record.get_str("date").map(str::to_owned);
        let time = record.get_str("time").map(str::to_owned);
        if let (Some(date), Some(time)) = (date, time) {
            let stamp = format!("{},{}", date, time);
            if let Ok(dt) = NaiveDateTime::parse_from_str(&stamp, DATETIME_FORMAT) {
                record.insert("datetime", dt.format("%Y-%m-%dT%H:%M:%S").to_string());
                record.insert("timestamp", dt.and_utc().timestamp() as f64);
            }
        }

        // GPS coordinates to decimal degrees
        if let (Some(lat), Some(lon)) = (record.get_i64("gps_lat_1e7"), record.get_i64("gps_lon_1e7")) {
            record.insert("gps_lat_deg", lat as f64 / 10_000_000.0);
            record.insert("gps_lon_deg", lon as f64 / 10_000_000.0);
        }

        // Accelerometer to g-force
        if let (Some(x), Some(y), Some(z)) = (
            record.get_i64("accel_x_mg"),
            record.get_i64("accel_y_mg"),
            record.get_i64("accel_z_mg"),
        ) {
            record.insert("accel_x_g", x as f64 / 1000.0);
            record.insert("accel_y_g", y as f64 / 1000.0);
            record.insert("accel_z_g", z as f64 / 1000.0);
        }

        // Gyroscope to degrees/sec
        if let (Some(x), Some(y), Some(z)) = (
            record.get_i64("gyro_x_centidps"),
            record.get_i64("gyro_y_centidps"),
            record.get_i64("gyro_z_centidps"),
        ) {
            record.insert("gyro_x_dps", x as f64 / 100.0);
            record.insert("gyro_y_dps", y as f64 / 100.0);
            record.insert("gyro_z_dps", z as f64 / 100.0);
        }

        // Magnetometer to microTesla
        if let (Some(x), Some(y), Some(z)) = (
            record.get_i64("mag_x_decisla"),
            record.get_i64("mag_y_decisla"),
            record.get_i64("mag_z_decisla"),
        ) {
            record.insert("mag_x_ut", x as f64 / 10.0);
            record.insert("mag_y_ut", y as f64 / 10.0);
            record.insert("mag_z_ut", z as f64 / 10.0);
        }

        // GPS validity: enough satellites and a coordinate away from the origin
        if let (Some(lat), Some(lon), Some(sats)) = (
            record.get_i64("gps_lat_1e7"),
            record.get_i64("gps_lon_1e7"),
            record.get_i64("gps_satellites"),
        ) {
            record.insert("gps_valid", is_gps_valid(lat, lon, sats));
        }

        super::stamp_metadata(&mut record, self.name(), line);
        record.insert("_state", "ARMED");

        Some(record)
    }
}

/// Convert one raw field by name; a value that fails to convert is
/// dropped from the record but does not fail the line.
fn convert_field(record: &mut TelemetryRecord, name: &str, value: &str) {
    match name {
        "date" | "time" => record.insert(name, value),
        "altitude_m" => match value.parse::<f64>() {
            Ok(v) => record.insert(name, v),
            Err(_) => warn!(field = name, value, "could not convert ARMED telemetry field"),
        },
        _ => match value.parse::<i64>() {
            Ok(v) => record.insert(name, v),
            Err(_) => warn!(field = name, value, "could not convert ARMED telemetry field"),
        },
    }
}

/// `satellites ≥ 4` and both coordinates more than 0.01° from zero.
fn is_gps_valid(lat_1e7: i64, lon_1e7: i64, satellites: i64) -> bool {
    satellites >= 4 && lat_1e7.abs() > 100_000 && lon_1e7.abs() > 100_000
}
