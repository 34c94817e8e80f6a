//! JSON passthrough decoder
//!
//! Example: `{"temp": 25.6, "pressure": 1013.25}`
//!
//! Fields are copied as-is; arrays and nested objects are preserved.

use serde_json::Value;

use crate::models::TelemetryRecord;

/// Decoder for lines that parse as a JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonDecoder;

impl JsonDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "JSON"
    }

    pub fn matches(&self, line: &str) -> bool {
        matches!(serde_json::from_str::<Value>(line.trim()), Ok(Value::Object(_)))
    }

    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        let line = line.trim();
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
            return None;
        };

        let mut record = TelemetryRecord::from_map(map);
        super::stamp_metadata(&mut record, self.name(), line);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn matches_objects_only() {
        let decoder = JsonDecoder::new();
        assert!(decoder.matches(r#"{"temp": 25.6}"#));
        assert!(!decoder.matches("[1, 2, 3]"));
        assert!(!decoder.matches("42"));
        assert!(!decoder.matches("{not json}"));
    }

    #[test]
    fn copies_fields_as_is() {
        let record = JsonDecoder::new()
            .decode(r#"{"temp":25.6,"pressure":1013.25}"#)
            .unwrap();

        assert_eq!(record.get_f64("temp"), Some(25.6));
        assert_eq!(record.get_f64("pressure"), Some(1013.25));
        assert_eq!(record.get_str("_parser"), Some("JSON"));
    }

    #[test]
    fn preserves_nested_structures() {
        let record = JsonDecoder::new()
            .decode(r#"{"readings":[1,2,3],"meta":{"source":"bench"}}"#)
            .unwrap();

        assert!(record.get("readings").unwrap().is_array());
        assert_eq!(record.get("meta").unwrap()["source"], "bench");
    }
}
