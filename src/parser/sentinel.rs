//! SENTINEL rocket telemetry decoder
//!
//! Unbracketed CSV frames with a fixed field order, e.g.
//! `2025-06-03 14:30:15,12,1013.25,25.6,9.81,0.15,-0.32,45.123456,-75.987654,850.5,...`
//!
//! The index→name mapping is reconfigurable at runtime through the
//! `configure_sentinel_parser` command.

use std::collections::BTreeMap;

use tracing::warn;

use crate::models::TelemetryRecord;

/// Sensor fields carried as floats in the default mapping.
const FLOAT_FIELDS: [&str; 12] = [
    "pressure",
    "temp",
    "accel_x",
    "accel_y",
    "accel_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "latitude",
    "longitude",
    "alt_gps",
    "alt_bmp",
];

/// Decoder for comma-separated SENTINEL telemetry frames.
#[derive(Debug, Clone)]
pub struct SentinelTelemetryDecoder {
    field_mapping: BTreeMap<usize, String>,
}

impl Default for SentinelTelemetryDecoder {
    fn default() -> Self {
        let names = [
            "timestamp",
            "satellites",
            "pressure",
            "temp",
            "accel_x",
            "accel_y",
            "accel_z",
            "gyro_x",
            "gyro_y",
            "gyro_z",
            "latitude",
            "longitude",
            "alt_gps",
            "alt_bmp",
        ];
        let field_mapping = names
            .iter()
            .enumerate()
            .map(|(i, name)| (i, name.to_string()))
            .collect();
        Self { field_mapping }
    }
}

impl SentinelTelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        "SENTINEL_TELEMETRY"
    }

    /// Merge a custom index→name mapping over the default one.
    pub fn configure(&mut self, mapping: impl IntoIterator<Item = (usize, String)>) {
        for (index, name) in mapping {
            self.field_mapping.insert(index, name);
        }
    }

    /// Any line with at least ten comma-separated fields. ARMED frames
    /// also satisfy this, so this decoder must be registered after the
    /// ARMED one.
    pub fn matches(&self, line: &str) -> bool {
        let line = line.trim();
        !line.is_empty() && line.split(',').count() >= 10
    }

    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        let line = line.trim();
        if !self.matches(line) {
            return None;
        }

        let mut record = TelemetryRecord::new();
        for (index, value) in line.split(',').enumerate() {
            if let Some(name) = self.field_mapping.get(&index) {
                convert_field(&mut record, name, value.trim());
            }
        }

        super::stamp_metadata(&mut record, self.name(), line);
        Some(record)
    }
}

/// `timestamp` stays a string, `satellites` is an integer, the known
/// sensor fields are floats, anything else passes through as a string.
fn convert_field(record: &mut TelemetryRecord, name: &str, value: &str) {
    if name == "timestamp" {
        record.insert(name, value);
    } else if name == "satellites" {
        match value.parse::<i64>() {
            Ok(v) => record.insert(name, v),
            Err(_) => warn!(field = name, value, "could not convert SENTINEL telemetry field"),
        }
    } else if FLOAT_FIELDS.contains(&name) {
        match value.parse::<f64>() {
            Ok(v) => record.insert(name, v),
            Err(_) => warn!(field = name, value, "could not convert SENTINEL telemetry field"),
        }
    } else {
        record.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str =
        "2025-06-03 14:30:15,12,1013.25,25.6,9.81,0.15,-0.32,0.01,0.02,0.03,45.123456,-75.987654,850.5,848.2";

    #[test]
    fn matches_needs_ten_fields() {
        let decoder = SentinelTelemetryDecoder::new();
        assert!(decoder.matches(SAMPLE));
        assert!(decoder.matches("1,2,3,4,5,6,7,8,9,10"));
        assert!(!decoder.matches("1,2,3,4,5"));
        assert!(!decoder.matches(""));
    }

    #[test]
    fn decodes_default_mapping() {
        let record = SentinelTelemetryDecoder::new().decode(SAMPLE).unwrap();

        assert_eq!(record.get_str("_parser"), Some("SENTINEL_TELEMETRY"));
        assert_eq!(record.get_str("timestamp"), Some("2025-06-03 14:30:15"));
        assert_eq!(record.get_i64("satellites"), Some(12));
        assert_eq!(record.get_f64("pressure"), Some(1013.25));
        assert_eq!(record.get_f64("accel_z"), Some(-0.32));
        assert_eq!(record.get_f64("latitude"), Some(45.123456));
        assert_eq!(record.get_f64("alt_bmp"), Some(848.2));
    }

    #[test]
    fn configure_overrides_field_names() {
        let mut decoder = SentinelTelemetryDecoder::new();
        decoder.configure([(2, "baro_hpa".to_string())]);

        let record = decoder.decode(SAMPLE).unwrap();
        assert!(record.contains_key("baro_hpa"));
        assert!(!record.contains_key("pressure"));
    }

    #[test]
    fn bad_numeric_field_is_dropped() {
        let line = "2025-06-03 14:30:15,twelve,1013.25,25.6,9.81,0.15,-0.32,0.01,0.02,0.03";
        let record = SentinelTelemetryDecoder::new().decode(line).unwrap();
        assert!(!record.contains_key("satellites"));
        assert_eq!(record.get_f64("pressure"), Some(1013.25));
    }
}
