//! Sensor fusion engine
//!
//! Owns the per-port fusion state: filters, calibration biases, and the
//! orientation smoothing history. Raw IMU samples go in, smoothed
//! orientation estimates come out.

use std::collections::VecDeque;

use nalgebra::Vector3;
use tracing::{info, warn};

use crate::error::FusionError;
use crate::fusion::{ComplementaryFilter, MadgwickFilter};
use crate::models::{ImuSample, Orientation};

/// Tunable fusion parameters, shared by every per-port engine.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Whether magnetometer data contributes to heading.
    pub use_magnetometer: bool,

    /// Expected sample rate in Hz; sets the nominal period used for the
    /// first sample, before a timestamp delta is available.
    pub sample_rate_hz: f64,

    /// Madgwick filter gain β.
    pub madgwick_beta: f64,

    /// Complementary filter coefficient α.
    pub complementary_alpha: f64,

    /// Length of the orientation smoothing history.
    pub smoothing_window: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            use_magnetometer: true,
            sample_rate_hz: 10.0,
            madgwick_beta: 0.1,
            complementary_alpha: 0.98,
            smoothing_window: 5,
        }
    }
}

/// Orientation estimator for a single telemetry stream.
///
/// Calibration is orthogonal to operation: an uncalibrated engine
/// processes samples with zero biases. State is mutated only by the
/// pipeline thread driving its port.
pub struct SensorFusion {
    use_magnetometer: bool,
    sample_period: f64,

    madgwick: MadgwickFilter,
    complementary: ComplementaryFilter,

    // Calibration offsets
    accel_bias: Vector3<f64>,
    gyro_bias: Vector3<f64>,
    mag_bias: Vector3<f64>,
    mag_scale: Vector3<f64>,

    // Moving average for smoothing
    history: VecDeque<Orientation>,
    history_size: usize,

    last_update: Option<f64>,
    calibrated: bool,
}

impl SensorFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            use_magnetometer: config.use_magnetometer,
            sample_period: 1.0 / config.sample_rate_hz,
            madgwick: MadgwickFilter::new(config.madgwick_beta),
            complementary: ComplementaryFilter::new(config.complementary_alpha),
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            mag_bias: Vector3::zeros(),
            mag_scale: Vector3::new(1.0, 1.0, 1.0),
            history: VecDeque::new(),
            history_size: config.smoothing_window,
            last_update: None,
            calibrated: false,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Independent complementary-filter estimate, for cross-checks.
    pub fn complementary(&self) -> &ComplementaryFilter {
        &self.complementary
    }

    /// Derive calibration biases from stationary samples.
    ///
    /// Gyroscope should read zero at rest; the accelerometer mean minus
    /// one gravity on z becomes the accel bias; the magnetometer gets a
    /// hard-iron min/max correction. Fewer than 10 samples is a no-op.
    pub fn calibrate(&mut self, samples: &[ImuSample]) {
        if samples.len() < 10 {
            warn!(count = samples.len(), "not enough samples for calibration");
            return;
        }

        let n = samples.len() as f64;

        self.gyro_bias = samples.iter().map(|s| s.gyro).sum::<Vector3<f64>>() / n;

        let accel_mean = samples.iter().map(|s| s.accel).sum::<Vector3<f64>>() / n;
        let accel_magnitude = samples.iter().map(|s| s.accel.norm()).sum::<f64>() / n;
        self.accel_bias = accel_mean;
        // Resting z should read +g after bias removal
        self.accel_bias.z -= accel_magnitude;

        let have_mag = samples.iter().any(|s| s.mag != Vector3::zeros());
        if self.use_magnetometer && have_mag {
            let mut max = samples[0].mag;
            let mut min = samples[0].mag;
            for s in &samples[1..] {
                max = max.sup(&s.mag);
                min = min.inf(&s.mag);
            }
            self.mag_bias = (max + min) / 2.0;
            // Hard-iron correction only; a degenerate axis keeps unit scale
            self.mag_scale = ((max - min) / 2.0).map(|v| if v == 0.0 { 1.0 } else { v });
        }

        self.calibrated = true;
        info!("sensor calibration completed");
    }

    /// Process one IMU sample into an orientation estimate.
    ///
    /// On error the quaternion is renormalized and `last_update` is left
    /// untouched, so the next good sample resumes cleanly.
    pub fn process(&mut self, sample: &ImuSample) -> Result<Orientation, FusionError> {
        if !sample_is_finite(sample) {
            return Err(FusionError::NonFiniteInput);
        }

        // Apply calibration offsets
        let accel = sample.accel - self.accel_bias;
        let gyro = (sample.gyro - self.gyro_bias).map(f64::to_radians);

        let mag = if self.use_magnetometer && sample.mag != Vector3::zeros() {
            Some((sample.mag - self.mag_bias).component_div(&self.mag_scale))
        } else {
            None
        };

        // First sample falls back to the nominal period; afterwards the
        // delta is clamped to at least 1 ms
        let dt = match self.last_update {
            None => self.sample_period,
            Some(last) => (sample.timestamp - last).max(0.001),
        };

        self.madgwick.update(gyro, accel, mag, dt);

        let q = self.madgwick.quaternion();
        if ![q.w, q.x, q.y, q.z].iter().all(|v| v.is_finite()) {
            self.madgwick.reset();
            return Err(FusionError::Diverged);
        }
        self.last_update = Some(sample.timestamp);

        // Sanity channel; does not feed back into the Madgwick estimate
        self.complementary.update(&accel, &gyro, dt);

        let (roll, pitch, yaw) = self.madgwick.euler_angles();
        let mut yaw_deg = yaw.to_degrees();
        if yaw_deg < 0.0 {
            yaw_deg += 360.0;
        }

        let orientation = Orientation {
            roll: roll.to_degrees(),
            pitch: pitch.to_degrees(),
            yaw: yaw_deg,
            quaternion: q,
        };

        Ok(self.smooth(orientation))
    }

    /// Weighted moving average over the bounded history.
    ///
    /// Recent samples weigh more (0.5→1.0). Yaw is averaged on the unit
    /// circle to respect the 0/360 wrap. The quaternion stays the latest
    /// filter state; smoothing is a display-only angle triple.
    fn smooth(&mut self, orientation: Orientation) -> Orientation {
        self.history.push_back(orientation);
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }

        if self.history.len() < 3 {
            return orientation;
        }

        let n = self.history.len();
        let raw_weights: Vec<f64> = (0..n)
            .map(|i| 0.5 + 0.5 * i as f64 / (n - 1) as f64)
            .collect();
        let total: f64 = raw_weights.iter().sum();

        let mut roll = 0.0;
        let mut pitch = 0.0;
        let mut yaw_sin = 0.0;
        let mut yaw_cos = 0.0;
        for (o, w) in self.history.iter().zip(&raw_weights) {
            let w = w / total;
            roll += o.roll * w;
            pitch += o.pitch * w;
            yaw_sin += o.yaw.to_radians().sin() * w;
            yaw_cos += o.yaw.to_radians().cos() * w;
        }

        let mut yaw = yaw_sin.atan2(yaw_cos).to_degrees();
        if yaw < 0.0 {
            yaw += 360.0;
        }

        Orientation {
            roll,
            pitch,
            yaw,
            quaternion: orientation.quaternion,
        }
    }

    /// Apply runtime configuration from the `configure_sensor_fusion`
    /// command.
    pub fn configure(&mut self, use_magnetometer: bool, beta: f64, smoothing_window: usize) {
        self.use_magnetometer = use_magnetometer;
        self.madgwick.set_beta(beta);
        self.history_size = smoothing_window;
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }

    /// Reset the filters to their initial state, keeping calibration.
    pub fn reset(&mut self) {
        self.madgwick.reset();
        self.complementary.reset();
        self.history.clear();
        self.last_update = None;
        info!("sensor fusion reset");
    }
}

fn sample_is_finite(sample: &ImuSample) -> bool {
    sample
        .accel
        .iter()
        .chain(sample.gyro.iter())
        .chain(sample.mag.iter())
        .all(|v| v.is_finite())
        && sample.timestamp.is_finite()
}
