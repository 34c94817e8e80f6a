//! Madgwick AHRS filter
//!
//! Gradient-descent orientation filter over unit quaternions, after
//! Madgwick, S. (2010), "An efficient orientation filter for inertial
//! and inertial/magnetic sensor arrays". Runs the 9-DOF AHRS form when
//! magnetometer data is available and falls back to the 6-DOF IMU form
//! otherwise.

use nalgebra::{SMatrix, SVector, Vector3, Vector4};

use crate::models::Quaternion;

/// Madgwick gradient-descent orientation filter.
pub struct MadgwickFilter {
    /// Algorithm gain β (typically 0.1 to 0.5)
    beta: f64,

    /// Current orientation estimate, always unit-norm after an update.
    quaternion: Quaternion,
}

impl MadgwickFilter {
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            quaternion: Quaternion::identity(),
        }
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn set_beta(&mut self, beta: f64) {
        self.beta = beta;
    }

    pub fn quaternion(&self) -> Quaternion {
        self.quaternion
    }

    /// Euler angles (roll, pitch, yaw) of the current estimate, radians.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.quaternion.to_euler()
    }

    /// Restore the identity orientation.
    pub fn reset(&mut self) {
        self.quaternion = Quaternion::identity();
    }

    /// Advance the filter by one sample over `dt` seconds.
    ///
    /// Gyro in rad/s; accelerometer and magnetometer in any consistent
    /// unit (both are normalized internally). A zero-norm accelerometer
    /// reading leaves the state untouched.
    pub fn update(&mut self, gyro: Vector3<f64>, accel: Vector3<f64>, mag: Option<Vector3<f64>>, dt: f64) {
        let q = self.quaternion;

        let accel_norm = accel.norm();
        if accel_norm == 0.0 {
            return;
        }
        let a = accel / accel_norm;

        let step = match mag.filter(|m| m.norm() > 0.0) {
            Some(m) => Self::gradient_step_ahrs(&q, &a, &(m / m.norm())),
            None => Self::gradient_step_imu(&q, &a),
        };

        // Normalize the corrective step; a zero gradient applies no correction.
        let step_norm = step.norm();
        let step = if step_norm > 0.0 { step / step_norm } else { step };

        // q̇ = ½·q⊗[0,ω] − β·∇, integrated over dt
        let q_omega = q.multiply(&Quaternion::new(0.0, gyro.x, gyro.y, gyro.z));
        let integrated = Quaternion::new(
            q.w + (0.5 * q_omega.w - self.beta * step[0]) * dt,
            q.x + (0.5 * q_omega.x - self.beta * step[1]) * dt,
            q.y + (0.5 * q_omega.y - self.beta * step[2]) * dt,
            q.z + (0.5 * q_omega.z - self.beta * step[3]) * dt,
        );

        self.quaternion = integrated.normalized();
    }

    /// 6-DOF corrective step: gravity objective only.
    fn gradient_step_imu(q: &Quaternion, a: &Vector3<f64>) -> Vector4<f64> {
        let (qw, qx, qy, qz) = (q.w, q.x, q.y, q.z);

        let f = Vector3::new(
            2.0 * (qx * qz - qw * qy) - a.x,
            2.0 * (qw * qx + qy * qz) - a.y,
            2.0 * (0.5 - qx * qx - qy * qy) - a.z,
        );

        #[rustfmt::skip]
        let j = SMatrix::<f64, 3, 4>::new(
            -2.0 * qy, 2.0 * qz, -2.0 * qw, 2.0 * qx,
             2.0 * qx, 2.0 * qw,  2.0 * qz, 2.0 * qy,
             0.0,     -4.0 * qx, -4.0 * qy, 0.0,
        );

        j.transpose() * f
    }

    /// 9-DOF corrective step: gravity plus the Earth's magnetic field,
    /// with the reference field `b` recovered by rotating the measured
    /// field into the world frame.
    fn gradient_step_ahrs(q: &Quaternion, a: &Vector3<f64>, m: &Vector3<f64>) -> Vector4<f64> {
        let (qw, qx, qy, qz) = (q.w, q.x, q.y, q.z);

        // Reference direction of Earth's magnetic field
        let h = q.multiply(&Quaternion::new(0.0, m.x, m.y, m.z).multiply(&q.conjugate()));
        let bx = (h.x * h.x + h.y * h.y).sqrt();
        let bz = h.z;

        let f = SVector::<f64, 6>::from([
            2.0 * (qx * qz - qw * qy) - a.x,
            2.0 * (qw * qx + qy * qz) - a.y,
            2.0 * (0.5 - qx * qx - qy * qy) - a.z,
            2.0 * bx * (0.5 - qy * qy - qz * qz) + 2.0 * bz * (qx * qz - qw * qy) - m.x,
            2.0 * bx * (qx * qy - qw * qz) + 2.0 * bz * (qw * qx + qy * qz) - m.y,
            2.0 * bx * (qw * qy + qx * qz) + 2.0 * bz * (0.5 - qx * qx - qy * qy) - m.z,
        ]);

        #[rustfmt::skip]
        let j = SMatrix::<f64, 6, 4>::new(
            -2.0 * qy,                2.0 * qz,                -2.0 * qw,                     2.0 * qx,
             2.0 * qx,                2.0 * qw,                 2.0 * qz,                     2.0 * qy,
             0.0,                    -4.0 * qx,                -4.0 * qy,                     0.0,
            -2.0 * bz * qy,           2.0 * bz * qz,           -4.0 * bx * qy - 2.0 * bz * qw, -4.0 * bx * qz + 2.0 * bz * qx,
            -2.0 * bx * qz + 2.0 * bz * qx, 2.0 * bx * qy + 2.0 * bz * qw, 2.0 * bx * qx + 2.0 * bz * qz, -2.0 * bx * qw + 2.0 * bz * qy,
             2.0 * bx * qy,           2.0 * bx * qz - 4.0 * bz * qx, 2.0 * bx * qw - 4.0 * bz * qy,  2.0 * bx * qx,
        );

        j.transpose() * f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.1;
    const GRAVITY: f64 = 9.81;

    #[test]
    fn quaternion_stays_unit_norm() {
        let mut filter = MadgwickFilter::new(0.1);
        assert_eq!(filter.beta(), 0.1);
        for i in 0..200 {
            let gyro = Vector3::new(0.01 * (i as f64).sin(), 0.02, -0.01);
            let accel = Vector3::new(0.3, -0.1, GRAVITY);
            let mag = Some(Vector3::new(22.0, -5.0, 43.0));
            filter.update(gyro, accel, mag, DT);
            assert!((filter.quaternion().norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn converges_level_when_stationary() {
        let mut filter = MadgwickFilter::new(0.1);
        // Start from a deliberately wrong attitude. The normalized
        // gradient corrects at roughly β rad/s, so give the filter
        // ample samples before judging.
        filter.quaternion = Quaternion::new(0.9, 0.3, -0.2, 0.1).normalized();

        for _ in 0..100 {
            filter.update(Vector3::zeros(), Vector3::new(0.0, 0.0, GRAVITY), None, DT);
        }

        let (roll, pitch, _yaw) = filter.euler_angles();
        assert!(roll.to_degrees().abs() < 2.0, "roll {} deg", roll.to_degrees());
        assert!(pitch.to_degrees().abs() < 2.0, "pitch {} deg", pitch.to_degrees());
    }

    #[test]
    fn zero_accel_leaves_state_untouched() {
        let mut filter = MadgwickFilter::new(0.1);
        let before = filter.quaternion();
        filter.update(Vector3::new(0.5, 0.0, 0.0), Vector3::zeros(), None, DT);
        let after = filter.quaternion();
        assert_eq!(before.w, after.w);
        assert_eq!(before.x, after.x);
    }

    #[test]
    fn magnetometer_branch_stays_stable() {
        let mut filter = MadgwickFilter::new(0.1);
        for _ in 0..100 {
            filter.update(
                Vector3::zeros(),
                Vector3::new(0.0, 0.0, GRAVITY),
                Some(Vector3::new(22.0, -5.0, 43.0)),
                DT,
            );
        }
        let q = filter.quaternion();
        assert!((q.norm() - 1.0).abs() < 1e-6);
        let (roll, pitch, _) = filter.euler_angles();
        assert!(roll.to_degrees().abs() < 2.0);
        assert!(pitch.to_degrees().abs() < 2.0);
    }
}
