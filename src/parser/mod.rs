//! Frame recognition and format decoding
//!
//! Each decoder exposes `name()`, `matches()`, and `decode()`; the
//! registry routes lines to the first matching decoder in registration
//! order (or to a pinned one). Decoders are stateless with respect to
//! prior lines.

pub mod armed;
pub mod custom;
pub mod json;
pub mod nmea;
pub mod registry;
pub mod sentinel;

pub use armed::ArmedTelemetryDecoder;
pub use custom::CustomDelimitedDecoder;
pub use json::JsonDecoder;
pub use nmea::NmeaDecoder;
pub use registry::{ParserInfo, ParserRegistry};
pub use sentinel::SentinelTelemetryDecoder;

use crate::models::TelemetryRecord;

/// Tagged set of frame decoders.
///
/// Auto-detection is a bounded linear search over this variant list;
/// registration order is the tiebreak. ARMED must precede SENTINEL
/// because SENTINEL accepts any line with ten comma-separated fields.
#[derive(Debug, Clone)]
pub enum Decoder {
    Armed(ArmedTelemetryDecoder),
    Sentinel(SentinelTelemetryDecoder),
    Nmea(NmeaDecoder),
    Json(JsonDecoder),
    Custom(CustomDelimitedDecoder),
}

impl Decoder {
    /// Format name reported in `_parser` and the parser info command.
    pub fn name(&self) -> &str {
        match self {
            Decoder::Armed(d) => d.name(),
            Decoder::Sentinel(d) => d.name(),
            Decoder::Nmea(d) => d.name(),
            Decoder::Json(d) => d.name(),
            Decoder::Custom(d) => d.name(),
        }
    }

    /// Structural recognition: does this line look like our format?
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Decoder::Armed(d) => d.matches(line),
            Decoder::Sentinel(d) => d.matches(line),
            Decoder::Nmea(d) => d.matches(line),
            Decoder::Json(d) => d.matches(line),
            Decoder::Custom(d) => d.matches(line),
        }
    }

    /// Decode the line into a record, or `None` when recognition or a
    /// mandatory semantic check fails. Per-field conversion failures
    /// degrade the record without suppressing it.
    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        match self {
            Decoder::Armed(d) => d.decode(line),
            Decoder::Sentinel(d) => d.decode(line),
            Decoder::Nmea(d) => d.decode(line),
            Decoder::Json(d) => d.decode(line),
            Decoder::Custom(d) => d.decode(line),
        }
    }
}

/// Stamp the metadata every decoder must carry.
pub(crate) fn stamp_metadata(record: &mut TelemetryRecord, parser: &str, raw: &str) {
    record.insert("_parser", parser);
    record.insert("_parsed_at", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
    record.insert("_raw", raw);
}
