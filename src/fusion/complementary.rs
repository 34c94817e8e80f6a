//! Complementary Filter for Sensor Fusion
//!
//! Linear blend of gyroscope integration (high frequency) and
//! accelerometer tilt angles (low frequency). Runs in parallel with the
//! Madgwick filter as an independent sanity channel; its output does not
//! feed back into the primary estimate.
//!
//! Alpha parameter (typically 0.95-0.98) controls trust ratio:
//! - Higher alpha = more trust in gyroscope (responsive but drifts)
//! - Lower alpha = more trust in accelerometer (stable but noisy)

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::Vector3;

/// Roll/pitch complementary filter over accelerometer and gyroscope.
pub struct ComplementaryFilter {
    /// Filter coefficient (0.0 to 1.0)
    alpha: f64,

    /// Current roll estimate in radians
    roll: f64,

    /// Current pitch estimate in radians
    pitch: f64,
}

impl ComplementaryFilter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            roll: 0.0,
            pitch: 0.0,
        }
    }

    /// Update with one sample: accelerometer in m/s², gyro in rad/s.
    pub fn update(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        // Tilt angles from the gravity direction
        let accel_roll = accel.y.atan2(accel.z);
        let accel_pitch = (-accel.x).atan2((accel.y * accel.y + accel.z * accel.z).sqrt());

        // Integrate gyroscope rates
        self.roll += gyro.x * dt;
        self.pitch += gyro.y * dt;

        // Blend: gyro short-term, accelerometer long-term
        self.roll = self.alpha * self.roll + (1.0 - self.alpha) * accel_roll;
        self.pitch = self.alpha * self.pitch + (1.0 - self.alpha) * accel_pitch;

        // Keep angles in range
        self.roll = (self.roll + PI).rem_euclid(2.0 * PI) - PI;
        self.pitch = self.pitch.clamp(-FRAC_PI_2, FRAC_PI_2);
    }

    /// Roll estimate in radians, within [−π, π).
    pub fn roll(&self) -> f64 {
        self.roll
    }

    /// Pitch estimate in radians, within [−π/2, π/2].
    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    pub fn reset(&mut self) {
        self.roll = 0.0;
        self.pitch = 0.0;
    }
}
