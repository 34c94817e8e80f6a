//! Pipeline dispatcher
//!
//! Drives one raw line through the whole pipeline: console event, frame
//! decode, source-port annotation, orientation enrichment, telemetry
//! event. Runs synchronously on the serial reader thread that produced
//! the line, so per-port ordering falls out of the call order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use nalgebra::Vector3;
use tracing::{info, warn};

use crate::error::FusionError;
use crate::fusion::{FusionConfig, SensorFusion};
use crate::hub::{BroadcastHub, HubEvent};
use crate::models::{unix_timestamp, ImuSample, Orientation, RawLine, TelemetryRecord};
use crate::parser::ParserRegistry;

/// Standard gravity, for converting accelerometer g readings to m/s².
const GRAVITY: f64 = 9.81;

/// Stateless glue between the serial layer, the parser registry, the
/// fusion engines, and the broadcast hub.
///
/// The only state it owns is the per-port fusion pool; one
/// `SensorFusion` per port, guarded so concurrent updates to a single
/// state can never interleave.
pub struct Dispatcher {
    hub: Arc<BroadcastHub>,
    registry: Arc<RwLock<ParserRegistry>>,
    fusion_config: Mutex<FusionConfig>,
    fusion_states: Mutex<HashMap<String, SensorFusion>>,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<BroadcastHub>,
        registry: Arc<RwLock<ParserRegistry>>,
        fusion_config: FusionConfig,
    ) -> Self {
        Self {
            hub,
            registry,
            fusion_config: Mutex::new(fusion_config),
            fusion_states: Mutex::new(HashMap::new()),
        }
    }

    /// Process one raw line from a serial port.
    ///
    /// The console event always goes out first; the telemetry event
    /// follows only when a decoder produced a record. A fusion failure
    /// degrades the record to its unaugmented form instead of dropping
    /// it.
    pub fn handle_line(&self, raw: RawLine) {
        self.hub.publish(&HubEvent::Console {
            port: raw.port.clone(),
            data: raw.line.clone(),
            timestamp: unix_timestamp(),
        });

        let parsed = self.registry.read().unwrap().parse(&raw.line);
        let Some(mut record) = parsed else {
            return;
        };
        record.insert("_source_port", raw.port.as_str());

        if let Some(sample) = imu_sample_from(&record) {
            match self.run_fusion(&raw.port, &sample) {
                Ok(orientation) => merge_orientation(&mut record, &orientation),
                Err(e) => {
                    warn!(port = %raw.port, error = %e, "sensor fusion failed, emitting record without orientation");
                }
            }
        }

        self.hub.publish(&HubEvent::Telemetry {
            port: raw.port,
            data: record,
            timestamp: unix_timestamp(),
        });
    }

    fn run_fusion(&self, port: &str, sample: &ImuSample) -> Result<Orientation, FusionError> {
        // Snapshot the config before touching the state map so the two
        // locks are never held together.
        let config = *self.fusion_config.lock().unwrap();
        let mut states = self.fusion_states.lock().unwrap();
        let engine = states
            .entry(port.to_string())
            .or_insert_with(|| SensorFusion::new(config));
        engine.process(sample)
    }

    /// Apply `configure_sensor_fusion` to every port's engine and to the
    /// config used for ports opened later.
    pub fn configure_fusion(&self, use_magnetometer: bool, beta: f64, smoothing_window: usize) {
        {
            let mut config = self.fusion_config.lock().unwrap();
            config.use_magnetometer = use_magnetometer;
            config.madgwick_beta = beta;
            config.smoothing_window = smoothing_window;
        }
        let mut states = self.fusion_states.lock().unwrap();
        for engine in states.values_mut() {
            engine.configure(use_magnetometer, beta, smoothing_window);
        }
        info!(
            use_magnetometer,
            beta, smoothing_window, "sensor fusion configured"
        );
    }

    /// Reset every port's fusion engine to its initial orientation.
    pub fn reset_fusion(&self) {
        let mut states = self.fusion_states.lock().unwrap();
        for engine in states.values_mut() {
            engine.reset();
        }
    }
}

/// Build an `ImuSample` when the record carries the full IMU cluster
/// (accelerometer in g, gyroscope in dps). The magnetometer defaults to
/// zero and the timestamp falls back to wall-clock.
fn imu_sample_from(record: &TelemetryRecord) -> Option<ImuSample> {
    let accel = Vector3::new(
        record.get_f64("accel_x_g")?,
        record.get_f64("accel_y_g")?,
        record.get_f64("accel_z_g")?,
    ) * GRAVITY;

    let gyro = Vector3::new(
        record.get_f64("gyro_x_dps")?,
        record.get_f64("gyro_y_dps")?,
        record.get_f64("gyro_z_dps")?,
    );

    let mag = Vector3::new(
        record.get_f64("mag_x_ut").unwrap_or(0.0),
        record.get_f64("mag_y_ut").unwrap_or(0.0),
        record.get_f64("mag_z_ut").unwrap_or(0.0),
    );

    let timestamp = record.get_f64("timestamp").unwrap_or_else(unix_timestamp);

    Some(ImuSample {
        accel,
        gyro,
        mag,
        timestamp,
    })
}

fn merge_orientation(record: &mut TelemetryRecord, orientation: &Orientation) {
    record.insert("orientation_roll", orientation.roll);
    record.insert("orientation_pitch", orientation.pitch);
    record.insert("orientation_yaw", orientation.yaw);
    record.insert("quaternion_w", orientation.quaternion.w);
    record.insert("quaternion_x", orientation.quaternion.x);
    record.insert("quaternion_y", orientation.quaternion.y);
    record.insert("quaternion_z", orientation.quaternion.z);
    record.insert("_sensor_fusion", true);
    record.insert("_fusion_algorithm", "Madgwick");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    const ARMED_LINE: &str = "<05/27/2025,11:43:46,0.95,-37,-967,-3,128,-27,204,6,-53,20,1,1,0,24>";

    fn dispatcher_with_hub(capacity: usize) -> (Arc<BroadcastHub>, Dispatcher) {
        let hub = Arc::new(BroadcastHub::new(capacity));
        let registry = Arc::new(RwLock::new(ParserRegistry::default()));
        let dispatcher = Dispatcher::new(hub.clone(), registry, FusionConfig::default());
        (hub, dispatcher)
    }

    fn raw(port: &str, line: &str, n: usize) -> RawLine {
        RawLine {
            port: port.to_string(),
            line: line.to_string(),
            timestamp: n as f64 * 0.1,
        }
    }

    #[tokio::test]
    async fn console_event_precedes_telemetry_event() {
        let (hub, dispatcher) = dispatcher_with_hub(64);
        let (_id, mut rx) = hub.attach();

        let lines = 5;
        for n in 0..lines {
            dispatcher.handle_line(raw("/dev/ttyUSB0", ARMED_LINE, n));
        }

        // Each line produces a console event immediately followed by its
        // telemetry event; console events arrive in feed order.
        for _ in 0..lines {
            let console: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(console["type"], "console_data");
            assert_eq!(console["data"], ARMED_LINE);

            let telemetry: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(telemetry["type"], "telemetry_data");
        }
    }

    #[tokio::test]
    async fn armed_record_is_enriched_with_orientation() {
        let (hub, dispatcher) = dispatcher_with_hub(16);
        let (_id, mut rx) = hub.attach();

        dispatcher.handle_line(raw("/dev/ttyUSB0", ARMED_LINE, 0));

        let _console = rx.recv().await.unwrap();
        let telemetry: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let data = &telemetry["data"];

        assert_eq!(data["_parser"], "ARMED_TELEMETRY");
        assert_eq!(data["_source_port"], "/dev/ttyUSB0");
        assert_eq!(data["_sensor_fusion"], true);
        assert!(data["orientation_roll"].is_f64());
        assert!(data["orientation_pitch"].is_f64());

        let norm = (data["quaternion_w"].as_f64().unwrap().powi(2)
            + data["quaternion_x"].as_f64().unwrap().powi(2)
            + data["quaternion_y"].as_f64().unwrap().powi(2)
            + data["quaternion_z"].as_f64().unwrap().powi(2))
        .sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn json_record_passes_through_without_fusion() {
        let (hub, dispatcher) = dispatcher_with_hub(16);
        let (_id, mut rx) = hub.attach();

        dispatcher.handle_line(raw("COM3", r#"{"temp":25.6,"pressure":1013.25}"#, 0));

        let _console = rx.recv().await.unwrap();
        let telemetry: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let data = &telemetry["data"];

        assert_eq!(data["temp"], 25.6);
        assert_eq!(data["_parser"], "JSON");
        assert!(data.get("_sensor_fusion").is_none());
    }

    #[tokio::test]
    async fn unrecognized_line_yields_console_only() {
        let (hub, dispatcher) = dispatcher_with_hub(16);
        let (_id, mut rx) = hub.attach();

        dispatcher.handle_line(raw("COM3", "no telemetry here", 0));
        dispatcher.handle_line(raw("COM3", r#"{"ok":1}"#, 1));

        let console: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(console["data"], "no telemetry here");

        // The very next frame is the console event of the second line,
        // not a telemetry event for the first.
        let next: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(next["type"], "console_data");
        assert_eq!(next["data"], r#"{"ok":1}"#);
    }

    #[tokio::test]
    async fn each_port_gets_its_own_fusion_state() {
        let (_hub, dispatcher) = dispatcher_with_hub(1024);

        for n in 0..3 {
            dispatcher.handle_line(raw("/dev/ttyUSB0", ARMED_LINE, n));
            dispatcher.handle_line(raw("/dev/ttyUSB1", ARMED_LINE, n));
        }

        let states = dispatcher.fusion_states.lock().unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.contains_key("/dev/ttyUSB0"));
        assert!(states.contains_key("/dev/ttyUSB1"));
    }

    #[tokio::test]
    async fn reset_and_configure_apply_to_existing_states() {
        let (_hub, dispatcher) = dispatcher_with_hub(1024);
        dispatcher.handle_line(raw("COM3", ARMED_LINE, 0));

        dispatcher.configure_fusion(false, 0.2, 3);
        dispatcher.reset_fusion();

        let states = dispatcher.fusion_states.lock().unwrap();
        assert!(!states.is_empty());
    }
}
