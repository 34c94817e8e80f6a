//! NMEA 0183 GPS sentence decoder
//!
//! Example: `$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47`
//!
//! Every sentence yields its type and raw field list; `$GPGGA` sentences
//! are additionally decoded into position, fix quality, satellite count,
//! HDOP, and altitude. The trailing checksum is verified when present
//! and reported as `checksum_valid`.

use serde_json::Value;

use crate::models::TelemetryRecord;

/// Decoder for `$...*hh` NMEA sentences.
#[derive(Debug, Clone, Default)]
pub struct NmeaDecoder;

impl NmeaDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "NMEA_GPS"
    }

    pub fn matches(&self, line: &str) -> bool {
        let line = line.trim();
        line.starts_with('$') && line.contains('*')
    }

    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        let line = line.trim();
        if !self.matches(line) {
            return None;
        }

        let parts: Vec<&str> = line.split(',').collect();
        let sentence_type = parts[0];

        let mut record = TelemetryRecord::new();
        record.insert("sentence_type", sentence_type);
        record.insert(
            "raw_fields",
            Value::Array(parts.iter().map(|p| Value::from(*p)).collect()),
        );

        if let Some(valid) = verify_checksum(line) {
            record.insert("checksum_valid", valid);
        }

        if sentence_type == "$GPGGA" {
            decode_gpgga(&mut record, &parts);
        }

        super::stamp_metadata(&mut record, self.name(), line);
        Some(record)
    }
}

/// XOR of the payload between `$` and `*`, compared against the two hex
/// digits after `*`. `None` when the sentence carries no parseable
/// checksum suffix.
fn verify_checksum(line: &str) -> Option<bool> {
    let star = line.rfind('*')?;
    let expected = u8::from_str_radix(line.get(star + 1..star + 3)?, 16).ok()?;
    let computed = line[1..star].bytes().fold(0u8, |acc, b| acc ^ b);
    Some(computed == expected)
}

fn decode_gpgga(record: &mut TelemetryRecord, parts: &[&str]) {
    if let Some(time) = parts.get(1).filter(|t| !t.is_empty()) {
        record.insert("time", *time);
    }

    if parts.len() > 3 {
        if let Some(lat) = convert_coordinate(parts[2], parts[3]) {
            record.insert("latitude", lat);
        }
    }
    if parts.len() > 5 {
        if let Some(lon) = convert_coordinate(parts[4], parts[5]) {
            record.insert("longitude", lon);
        }
    }

    let fix_quality = parts.get(6).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    record.insert("fix_quality", fix_quality);

    let satellites = parts.get(7).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    record.insert("satellites", satellites);

    if let Some(hdop) = parts.get(8).and_then(|v| v.parse::<f64>().ok()) {
        record.insert("hdop", hdop);
    }
    if let Some(altitude) = parts.get(9).and_then(|v| v.parse::<f64>().ok()) {
        record.insert("altitude", altitude);
    }
}

/// Convert an NMEA `DDMM.MMMM` / `DDDMM.MMMM` coordinate to decimal
/// degrees, negated for the southern and western hemispheres.
pub fn convert_coordinate(coord: &str, direction: &str) -> Option<f64> {
    if coord.len() < 4 || direction.is_empty() {
        return None;
    }

    let (degrees, minutes) = match coord.find('.') {
        Some(dot) if dot >= 2 => {
            let degrees: i64 = coord[..dot - 2].parse().ok()?;
            let minutes: f64 = coord[dot - 2..].parse().ok()?;
            (degrees, minutes)
        }
        Some(_) => return None,
        None => {
            let degrees: i64 = coord[..coord.len() - 2].parse().ok()?;
            let minutes: f64 = coord[coord.len() - 2..].parse().ok()?;
            (degrees, minutes)
        }
    };

    let mut decimal = degrees as f64 + minutes / 60.0;
    if direction == "S" || direction == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GPGGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn matches_dollar_star_lines() {
        let decoder = NmeaDecoder::new();
        assert!(decoder.matches(GPGGA));
        assert!(!decoder.matches("$GPGGA,123519,4807.038"));
        assert!(!decoder.matches("GPGGA,123519*47"));
    }

    #[test]
    fn decodes_gpgga_sentence() {
        let record = NmeaDecoder::new().decode(GPGGA).unwrap();

        assert_eq!(record.get_str("_parser"), Some("NMEA_GPS"));
        assert_eq!(record.get_str("sentence_type"), Some("$GPGGA"));
        assert_eq!(record.get_str("time"), Some("123519"));
        assert!((record.get_f64("latitude").unwrap() - 48.1173).abs() < 1e-4);
        assert!((record.get_f64("longitude").unwrap() - 11.5167).abs() < 1e-4);
        assert_eq!(record.get_i64("fix_quality"), Some(1));
        assert_eq!(record.get_i64("satellites"), Some(8));
        assert_eq!(record.get_f64("hdop"), Some(0.9));
        assert_eq!(record.get_f64("altitude"), Some(545.4));
    }

    #[test]
    fn reports_checksum_validity() {
        let record = NmeaDecoder::new().decode(GPGGA).unwrap();
        assert_eq!(record.get_bool("checksum_valid"), Some(true));

        let corrupted = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48";
        let record = NmeaDecoder::new().decode(corrupted).unwrap();
        assert_eq!(record.get_bool("checksum_valid"), Some(false));
    }

    #[test]
    fn coordinate_conversion_round_trips() {
        let lat = convert_coordinate("4807.038", "N").unwrap();
        assert!((lat - 48.1173).abs() < 1e-4);

        let south = convert_coordinate("4807.038", "S").unwrap();
        assert_eq!(south, -lat);

        let lon = convert_coordinate("01131.000", "E").unwrap();
        assert!((lon - 11.516_666_666).abs() < 1e-4);

        assert_eq!(convert_coordinate("", "N"), None);
        assert_eq!(convert_coordinate("12", "N"), None);
    }

    #[test]
    fn non_gpgga_sentence_keeps_raw_fields_only() {
        let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        let record = NmeaDecoder::new().decode(line).unwrap();

        assert_eq!(record.get_str("sentence_type"), Some("$GPRMC"));
        assert!(record.get("raw_fields").unwrap().is_array());
        assert!(!record.contains_key("latitude"));
    }
}
