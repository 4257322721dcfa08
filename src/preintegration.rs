//! Inertial preintegration between two visual observations.
//!
//! Accumulates gravity-free relative rotation, velocity and position
//! increments, their first-order bias Jacobians and the 9x9 covariance of
//! `[δθ, δv, δp]`, following Forster et al., "On-Manifold Preintegration".

use crate::geometry::{right_jacobian, skew};
use crate::types::{ImuBias, InertialSample};
use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

/// Covariance of `[δθ, δv, δp]`.
pub type Matrix9 = SMatrix<f64, 9, 9>;
type Matrix9x6 = SMatrix<f64, 9, 6>;

/// Continuous-time noise densities of the IMU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuNoise {
    /// rad/s/√Hz
    pub gyro: f64,
    /// m/s²/√Hz
    pub accel: f64,
    pub gyro_walk: f64,
    pub accel_walk: f64,
}

/// Rotation, position and velocity of the body in the world at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    pub rotation: UnitQuaternion<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub timestamp_s: f64,
}

#[derive(Debug, Clone)]
pub struct Preintegrated {
    /// Bias the increments were integrated with.
    pub bias: ImuBias,
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    /// Integrated time span in seconds.
    pub dt: f64,
    pub covariance: Matrix9,
    pub d_rot_d_bg: Matrix3<f64>,
    pub d_vel_d_bg: Matrix3<f64>,
    pub d_vel_d_ba: Matrix3<f64>,
    pub d_pos_d_bg: Matrix3<f64>,
    pub d_pos_d_ba: Matrix3<f64>,
    noise: ImuNoise,
    start_s: f64,
    end_s: f64,
    last: Option<InertialSample>,
    samples: usize,
}

impl Preintegrated {
    pub fn new(bias: ImuBias, noise: ImuNoise, start_s: f64) -> Self {
        Self {
            bias,
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            covariance: Matrix9::zeros(),
            d_rot_d_bg: Matrix3::zeros(),
            d_vel_d_bg: Matrix3::zeros(),
            d_vel_d_ba: Matrix3::zeros(),
            d_pos_d_bg: Matrix3::zeros(),
            d_pos_d_ba: Matrix3::zeros(),
            noise,
            start_s,
            end_s: start_s,
            last: None,
            samples: 0,
        }
    }

    pub fn start_time(&self) -> f64 {
        self.start_s
    }

    pub fn end_time(&self) -> f64 {
        self.end_s
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Integrate from the current end time up to `sample.timestamp_s` using
    /// the sample's measurement. Samples at or before the end time are ignored.
    pub fn push(&mut self, sample: &InertialSample) {
        let dt = sample.timestamp_s - self.end_s;
        if dt <= 0.0 {
            return;
        }
        self.integrate(&sample.gyro, &sample.accel, dt);
        self.end_s = sample.timestamp_s;
        self.last = Some(*sample);
        self.samples += 1;
    }

    /// Hold the last measurement until `t`.
    pub fn extend_to(&mut self, t: f64) {
        let dt = t - self.end_s;
        if dt <= 0.0 {
            return;
        }
        if let Some(last) = self.last {
            self.integrate(&last.gyro, &last.accel, dt);
        }
        self.end_s = t;
    }

    /// One integration step with raw (not yet bias-corrected) measurements.
    pub fn integrate(&mut self, gyro: &Vector3<f64>, accel: &Vector3<f64>, dt: f64) {
        let w = gyro - self.bias.gyro;
        let a = accel - self.bias.accel;
        let r = self.delta_rot.to_rotation_matrix().into_inner();
        let a_skew = skew(&a);

        let step = w * dt;
        let d_r = UnitQuaternion::from_scaled_axis(step);
        let d_r_mat = d_r.to_rotation_matrix().into_inner();
        let jr = right_jacobian(&step);
        let dt2 = dt * dt;

        // Covariance, using the increments before this step.
        let mut a_mat = Matrix9::identity();
        a_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_r_mat.transpose());
        a_mat.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-r * a_skew * dt));
        a_mat.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * r * a_skew * dt2));
        a_mat.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));

        let mut b_mat = Matrix9x6::zeros();
        b_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b_mat.fixed_view_mut::<3, 3>(3, 3).copy_from(&(r * dt));
        b_mat.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * r * dt2));

        let mut q = SMatrix::<f64, 6, 6>::zeros();
        let qg = self.noise.gyro * self.noise.gyro / dt;
        let qa = self.noise.accel * self.noise.accel / dt;
        for i in 0..3 {
            q[(i, i)] = qg;
            q[(i + 3, i + 3)] = qa;
        }
        self.covariance = a_mat * self.covariance * a_mat.transpose() + b_mat * q * b_mat.transpose();

        // Bias Jacobians.
        self.d_pos_d_ba += self.d_vel_d_ba * dt - 0.5 * r * dt2;
        self.d_pos_d_bg += self.d_vel_d_bg * dt - 0.5 * r * a_skew * self.d_rot_d_bg * dt2;
        self.d_vel_d_ba -= r * dt;
        self.d_vel_d_bg -= r * a_skew * self.d_rot_d_bg * dt;
        self.d_rot_d_bg = d_r_mat.transpose() * self.d_rot_d_bg - jr * dt;

        // Increments.
        self.delta_pos += self.delta_vel * dt + 0.5 * (r * a) * dt2;
        self.delta_vel += r * a * dt;
        self.delta_rot *= d_r;
        self.dt += dt;
    }

    /// Rotation increment corrected to first order for `bias`.
    pub fn delta_rot_for(&self, bias: &ImuBias) -> UnitQuaternion<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        self.delta_rot * UnitQuaternion::from_scaled_axis(self.d_rot_d_bg * dbg)
    }

    pub fn delta_vel_for(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_vel + self.d_vel_d_bg * dbg + self.d_vel_d_ba * dba
    }

    pub fn delta_pos_for(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_pos + self.d_pos_d_bg * dbg + self.d_pos_d_ba * dba
    }

    /// State at the end of the interval given the state at its start.
    /// `gravity` is the gravity acceleration in the world frame.
    pub fn predict(&self, start: &NavState, gravity: &Vector3<f64>, bias: &ImuBias) -> NavState {
        let dt = self.dt;
        let r_i = start.rotation;
        NavState {
            rotation: r_i * self.delta_rot_for(bias),
            position: start.position
                + start.velocity * dt
                + gravity * (0.5 * dt * dt)
                + r_i * self.delta_pos_for(bias),
            velocity: start.velocity + gravity * dt + r_i * self.delta_vel_for(bias),
            timestamp_s: self.end_s,
        }
    }

    pub fn noise(&self) -> &ImuNoise {
        &self.noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn noise() -> ImuNoise {
        ImuNoise {
            gyro: 1.7e-4,
            accel: 2.0e-3,
            gyro_walk: 2.0e-5,
            accel_walk: 3.0e-3,
        }
    }

    fn start() -> NavState {
        NavState {
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            timestamp_s: 0.0,
        }
    }

    #[test]
    fn test_still_body_stays_put() {
        let gravity = Vector3::new(0.0, 0.0, -9.81);
        let mut pre = Preintegrated::new(ImuBias::zero(), noise(), 0.0);
        for i in 1..=200 {
            pre.push(&InertialSample {
                timestamp_s: i as f64 * 0.005,
                accel: Vector3::new(0.0, 0.0, 9.81),
                gyro: Vector3::zeros(),
            });
        }
        let end = pre.predict(&start(), &gravity, &ImuBias::zero());
        assert_relative_eq!(pre.dt, 1.0, epsilon = 1e-9);
        assert_relative_eq!(end.position, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(end.velocity, Vector3::zeros(), epsilon = 1e-9);
        assert!(pre.covariance.trace() > 0.0);
    }

    #[test]
    fn test_constant_rotation_rate() {
        let mut pre = Preintegrated::new(ImuBias::zero(), noise(), 0.0);
        for i in 1..=100 {
            pre.push(&InertialSample {
                timestamp_s: i as f64 * 0.01,
                accel: Vector3::zeros(),
                gyro: Vector3::new(0.0, 0.0, 0.5),
            });
        }
        assert_relative_eq!(pre.delta_rot.angle(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let samples: Vec<InertialSample> = (1..=50)
            .map(|i| {
                let t = i as f64 * 0.004;
                InertialSample {
                    timestamp_s: t,
                    accel: Vector3::new(0.3 * t.sin(), 9.81, 0.2),
                    gyro: Vector3::new(0.1, -0.4 * t, 0.2),
                }
            })
            .collect();
        let mut pre = Preintegrated::new(ImuBias::zero(), noise(), 0.0);
        samples.iter().for_each(|s| pre.push(s));

        let bias = ImuBias {
            gyro: Vector3::new(0.002, -0.001, 0.003),
            accel: Vector3::new(0.02, 0.01, -0.015),
        };
        let mut exact = Preintegrated::new(bias, noise(), 0.0);
        samples.iter().for_each(|s| exact.push(s));

        assert!(pre.delta_rot_for(&bias).angle_to(&exact.delta_rot) < 1e-6);
        assert_relative_eq!(pre.delta_vel_for(&bias), exact.delta_vel, epsilon = 1e-5);
        assert_relative_eq!(pre.delta_pos_for(&bias), exact.delta_pos, epsilon = 1e-6);
    }

    #[test]
    fn test_extend_holds_last_measurement() {
        let mut pre = Preintegrated::new(ImuBias::zero(), noise(), 0.0);
        pre.push(&InertialSample {
            timestamp_s: 0.01,
            accel: Vector3::new(1.0, 0.0, 0.0),
            gyro: Vector3::zeros(),
        });
        pre.extend_to(0.02);
        assert_relative_eq!(pre.dt, 0.02, epsilon = 1e-12);
        assert_relative_eq!(pre.delta_vel.x, 0.02, epsilon = 1e-12);
        assert_relative_eq!(pre.end_time(), 0.02);
    }
}
