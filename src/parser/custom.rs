//! Configurable delimited decoder
//!
//! Registered on demand through the `add_custom_parser` command for
//! payloads the built-in formats do not cover. Values stay strings;
//! unnamed positions fall back to `field_<i>`.

use crate::models::TelemetryRecord;

/// Decoder splitting on a caller-supplied delimiter.
#[derive(Debug, Clone)]
pub struct CustomDelimitedDecoder {
    name: String,
    delimiter: String,
    field_names: Vec<String>,
}

impl CustomDelimitedDecoder {
    /// Build a decoder for `delimiter`; the name defaults to
    /// `CUSTOM_DELIMITED_<delimiter>` unless overridden.
    pub fn new(delimiter: impl Into<String>, field_names: Vec<String>, name: Option<String>) -> Self {
        let delimiter = delimiter.into();
        let name = name.unwrap_or_else(|| format!("CUSTOM_DELIMITED_{delimiter}"));
        Self { name, delimiter, field_names }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, line: &str) -> bool {
        line.contains(&self.delimiter)
    }

    pub fn decode(&self, line: &str) -> Option<TelemetryRecord> {
        if !self.matches(line) {
            return None;
        }

        let line = line.trim();
        let mut record = TelemetryRecord::new();
        for (i, value) in line.split(self.delimiter.as_str()).enumerate() {
            match self.field_names.get(i) {
                Some(name) => record.insert(name.clone(), value.trim()),
                None => record.insert(format!("field_{i}"), value.trim()),
            }
        }

        super::stamp_metadata(&mut record, self.name(), line);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_name_embeds_delimiter() {
        let decoder = CustomDelimitedDecoder::new("|", vec![], None);
        assert_eq!(decoder.name(), "CUSTOM_DELIMITED_|");

        let named = CustomDelimitedDecoder::new("|", vec![], Some("PIPE_TELEMETRY".into()));
        assert_eq!(named.name(), "PIPE_TELEMETRY");
    }

    #[test]
    fn named_and_positional_fields() {
        let decoder = CustomDelimitedDecoder::new(
            "|",
            vec!["stage".to_string(), "thrust".to_string()],
            None,
        );
        let record = decoder.decode("boost | 1250 | nominal").unwrap();

        assert_eq!(record.get_str("stage"), Some("boost"));
        assert_eq!(record.get_str("thrust"), Some("1250"));
        assert_eq!(record.get_str("field_2"), Some("nominal"));
    }

    #[test]
    fn rejects_lines_without_delimiter() {
        let decoder = CustomDelimitedDecoder::new(";", vec![], None);
        assert!(decoder.decode("plain text line").is_none());
    }
}
