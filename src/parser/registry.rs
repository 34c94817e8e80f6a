//! Parser registry with auto-detection
//!
//! Holds the ordered decoder list and the detection mode. In auto mode
//! a line goes to the first decoder whose `matches` accepts it; in
//! pinned mode only the pinned decoder is consulted. Post-parse
//! callbacks run in registration order, isolated from one another.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::models::TelemetryRecord;
use crate::parser::{
    ArmedTelemetryDecoder, Decoder, JsonDecoder, NmeaDecoder, SentinelTelemetryDecoder,
};

type RecordCallback = Box<dyn Fn(&TelemetryRecord) + Send + Sync>;

/// Detection mode: linear search or a single pinned decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectionMode {
    Auto,
    Pinned(usize),
}

/// Registry configuration snapshot for the `get_parser_info` command.
#[derive(Debug, Clone, Serialize)]
pub struct ParserInfo {
    pub available_parsers: Vec<String>,
    pub active_parser: Option<String>,
    pub auto_detect: bool,
    pub callback_count: usize,
}

/// Ordered decoder list plus detection mode and post-parse callbacks.
///
/// Shared-read, rarely-mutated: `parse` needs only `&self`, so the
/// registry sits behind an `RwLock` and reconfiguration commands appear
/// atomic to in-flight parses.
pub struct ParserRegistry {
    decoders: Vec<Decoder>,
    mode: DetectionMode,
    callbacks: Vec<RecordCallback>,
}

impl Default for ParserRegistry {
    /// Registry with the default decoders. ARMED precedes SENTINEL
    /// because SENTINEL's match (≥10 comma fields) subsumes ARMED-shaped
    /// lines; JSON comes last so no JSON-shaped line is claimed earlier.
    fn default() -> Self {
        let mut registry = Self {
            decoders: Vec::new(),
            mode: DetectionMode::Auto,
            callbacks: Vec::new(),
        };
        registry.register(Decoder::Armed(ArmedTelemetryDecoder::new()));
        registry.register(Decoder::Sentinel(SentinelTelemetryDecoder::new()));
        registry.register(Decoder::Nmea(NmeaDecoder::new()));
        registry.register(Decoder::Json(JsonDecoder::new()));
        registry
    }
}

impl ParserRegistry {
    /// Append a decoder; first-match order is registration order.
    pub fn register(&mut self, decoder: Decoder) {
        info!(parser = decoder.name(), "registered parser");
        self.decoders.push(decoder);
    }

    /// Pin a single decoder by name, disabling auto-detection.
    pub fn set_pinned(&mut self, name: &str) -> Result<(), ConfigError> {
        match self.decoders.iter().position(|d| d.name() == name) {
            Some(index) => {
                self.mode = DetectionMode::Pinned(index);
                info!(parser = name, "set active parser");
                Ok(())
            }
            None => {
                warn!(parser = name, "parser not found");
                Err(ConfigError::UnknownParser(name.to_string()))
            }
        }
    }

    /// Revert to auto-detection.
    pub fn enable_auto(&mut self) {
        self.mode = DetectionMode::Auto;
        info!("enabled automatic parser detection");
    }

    /// Register a callback invoked for every successfully parsed record.
    pub fn add_callback(&mut self, callback: impl Fn(&TelemetryRecord) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Route a line through the current mode.
    ///
    /// A decoder that matches but fails to decode suppresses the line;
    /// later decoders are not consulted. Returns `None` on recognition
    /// miss, which is not an error.
    pub fn parse(&self, raw: &str) -> Option<TelemetryRecord> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        let record = match self.mode {
            DetectionMode::Auto => {
                let decoder = self.decoders.iter().find(|d| d.matches(line))?;
                let record = decoder.decode(line);
                if record.is_some() {
                    debug!(parser = decoder.name(), "line parsed");
                } else {
                    warn!(parser = decoder.name(), "decoder matched but could not decode line");
                }
                record?
            }
            DetectionMode::Pinned(index) => self.decoders[index].decode(line)?,
        };

        for callback in &self.callbacks {
            // A panicking callback must not poison its siblings or the pipeline.
            if catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                warn!("post-parse callback panicked");
            }
        }

        Some(record)
    }

    /// Merge a custom index→name mapping into the SENTINEL decoder.
    pub fn configure_sentinel(&mut self, mapping: HashMap<usize, String>) -> bool {
        let sentinel = self.decoders.iter_mut().find_map(|d| match d {
            Decoder::Sentinel(s) => Some(s),
            _ => None,
        });
        match sentinel {
            Some(sentinel) => {
                sentinel.configure(mapping);
                info!("updated SENTINEL parser field mapping");
                true
            }
            None => false,
        }
    }

    /// Registered decoder names in registration order.
    pub fn parser_names(&self) -> Vec<String> {
        self.decoders.iter().map(|d| d.name().to_string()).collect()
    }

    /// Snapshot for the `get_parser_info` command.
    pub fn info(&self) -> ParserInfo {
        let active_parser = match self.mode {
            DetectionMode::Auto => None,
            DetectionMode::Pinned(index) => Some(self.decoders[index].name().to_string()),
        };
        ParserInfo {
            available_parsers: self.parser_names(),
            active_parser,
            auto_detect: self.mode == DetectionMode::Auto,
            callback_count: self.callbacks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::CustomDelimitedDecoder;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ARMED_LINE: &str = "<05/27/2025,11:43:46,0.95,-37,-967,-3,128,-27,204,6,-53,20,1,1,0,24>";

    #[test]
    fn default_registration_order() {
        let registry = ParserRegistry::default();
        assert_eq!(
            registry.parser_names(),
            vec!["ARMED_TELEMETRY", "SENTINEL_TELEMETRY", "NMEA_GPS", "JSON"]
        );
    }

    #[test]
    fn armed_wins_over_sentinel_for_bracketed_frames() {
        // The ARMED frame also has ≥10 comma fields, which SENTINEL accepts.
        let registry = ParserRegistry::default();
        let record = registry.parse(ARMED_LINE).unwrap();
        assert_eq!(record.get_str("_parser"), Some("ARMED_TELEMETRY"));
    }

    #[test]
    fn at_most_one_decoder_claims_each_line() {
        let registry = ParserRegistry::default();
        let corpus = [
            ARMED_LINE,
            "2025-06-03 14:30:15,12,1013.25,25.6,9.81,0.15,-0.32,0.01,0.02,0.03",
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47",
            r#"{"temp":25.6,"pressure":1013.25}"#,
            "no telemetry here",
        ];

        for line in corpus {
            let matching: Vec<&str> = registry
                .decoders
                .iter()
                .filter(|d| d.matches(line))
                .map(Decoder::name)
                .collect();
            match registry.parse(line) {
                Some(record) => {
                    // The chosen decoder is the first matching one.
                    assert_eq!(record.get_str("_parser"), Some(matching[0]));
                }
                None => assert!(matching.is_empty(), "unparsed line matched {matching:?}"),
            }
        }
    }

    #[test]
    fn pinned_mode_uses_only_the_named_decoder() {
        let mut registry = ParserRegistry::default();
        registry.set_pinned("NMEA_GPS").unwrap();

        // An ARMED frame no longer decodes; an NMEA sentence still does.
        assert!(registry.parse(ARMED_LINE).is_none());
        let record = registry
            .parse("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47")
            .unwrap();
        assert_eq!(record.get_str("_parser"), Some("NMEA_GPS"));

        registry.enable_auto();
        assert!(registry.parse(ARMED_LINE).is_some());
    }

    #[test]
    fn pinning_unknown_parser_fails() {
        let mut registry = ParserRegistry::default();
        assert!(registry.set_pinned("NO_SUCH_FORMAT").is_err());
        assert!(registry.info().auto_detect);
    }

    #[test]
    fn callbacks_run_and_panics_are_isolated() {
        let mut registry = ParserRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.add_callback(|_| panic!("bad callback"));
        let counter = calls.clone();
        registry.add_callback(move |record| {
            assert!(record.contains_key("_parser"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let record = registry.parse(r#"{"temp":1.0}"#);
        assert!(record.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_decoder_registers_behind_defaults() {
        let mut registry = ParserRegistry::default();
        registry.register(Decoder::Custom(CustomDelimitedDecoder::new(
            "|",
            vec!["a".to_string()],
            None,
        )));

        let record = registry.parse("one|two").unwrap();
        assert_eq!(record.get_str("_parser"), Some("CUSTOM_DELIMITED_|"));

        let info = registry.info();
        assert_eq!(info.available_parsers.len(), 5);
    }

    #[test]
    fn info_reflects_mode_and_callbacks() {
        let mut registry = ParserRegistry::default();
        registry.add_callback(|_| {});
        registry.set_pinned("JSON").unwrap();

        let info = registry.info();
        assert_eq!(info.active_parser.as_deref(), Some("JSON"));
        assert!(!info.auto_detect);
        assert_eq!(info.callback_count, 1);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let registry = ParserRegistry::default();
        assert!(registry.parse("").is_none());
        assert!(registry.parse("   \r\n").is_none());
    }
}
