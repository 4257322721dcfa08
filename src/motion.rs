//! Render-time pose prediction.
//!
//! [`MotionModel`] keeps a short history of fused poses, estimates smoothed
//! linear velocity/acceleration/jerk and angular velocity/acceleration from it
//! and extrapolates to a requested horizon. All state sits behind one lock so
//! the render thread can predict while the tracking thread feeds poses.

use std::collections::VecDeque;

use log::{debug, trace};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;

use crate::config::MotionConfig;
use crate::types::{HeadsetState, InteractionMode, Pose, PredictionConfig};

/// A gap longer than this between poses restarts derivative estimation.
const MAX_POSE_GAP_S: f64 = 0.25;

/// Inertial hints older than this (relative to the latest pose) are ignored.
const INERTIAL_MAX_AGE_S: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
struct InertialHint {
    timestamp_s: f64,
    /// Body frame, rad/s.
    angular_velocity: Vector3<f64>,
    /// World frame, gravity removed, m/s².
    linear_acceleration: Vector3<f64>,
}

#[derive(Debug, Clone)]
struct MotionState {
    prediction: PredictionConfig,
    history: VecDeque<Pose>,
    /// Number of derivative levels that hold a valid estimate (0..=3).
    order: u8,
    velocity: Vector3<f64>,
    acceleration: Vector3<f64>,
    jerk: Vector3<f64>,
    /// World frame.
    angular_velocity: Vector3<f64>,
    angular_acceleration: Vector3<f64>,
    inertial: Option<InertialHint>,
    headset_state: HeadsetState,
}

impl MotionState {
    fn new(prediction: PredictionConfig) -> Self {
        Self {
            prediction,
            history: VecDeque::new(),
            order: 0,
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            jerk: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            angular_acceleration: Vector3::zeros(),
            inertial: None,
            headset_state: HeadsetState::Stationary,
        }
    }

    fn clear_derivatives(&mut self) {
        self.order = 0;
        self.velocity = Vector3::zeros();
        self.acceleration = Vector3::zeros();
        self.jerk = Vector3::zeros();
        self.angular_velocity = Vector3::zeros();
        self.angular_acceleration = Vector3::zeros();
    }

    /// Inertial hint close enough to the latest pose to trust.
    fn fresh_inertial(&self) -> Option<InertialHint> {
        if !self.prediction.use_inertial {
            return None;
        }
        let last = self.history.back()?;
        self.inertial
            .filter(|hint| (hint.timestamp_s - last.timestamp_s).abs() <= INERTIAL_MAX_AGE_S)
    }

    fn world_angular_velocity(&self) -> Vector3<f64> {
        match (self.fresh_inertial(), self.history.back()) {
            (Some(hint), Some(last)) => last.rotation * hint.angular_velocity,
            _ => self.angular_velocity,
        }
    }
}

/// Jerk-aware kinematic predictor with headset-state classification.
#[derive(Debug)]
pub struct MotionModel {
    config: MotionConfig,
    state: Mutex<MotionState>,
}

impl MotionModel {
    pub fn new(config: MotionConfig, prediction: PredictionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MotionState::new(prediction)),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Feed one fused pose. Poses that do not advance in time are ignored.
    pub fn add_pose(&self, pose: Pose) {
        let mut state = self.state.lock();
        let s = self.config.derivative_smoothing.clamp(0.01, 1.0);

        if let Some(prev) = state.history.back().copied() {
            let dt = pose.timestamp_s - prev.timestamp_s;
            if dt <= 0.0 {
                trace!("motion: ignoring pose at {:.4}s, not after {:.4}s", pose.timestamp_s, prev.timestamp_s);
                return;
            }
            if dt > MAX_POSE_GAP_S {
                debug!("motion: {:.0} ms pose gap, restarting derivative estimation", dt * 1e3);
                state.clear_derivatives();
                state.history.clear();
            } else {
                // The backward difference is centred half a step back; the
                // acceleration term moves it to the new pose.
                let v_raw = (pose.translation - prev.translation) / dt + state.acceleration * (0.5 * dt);
                let w_raw = (pose.rotation * prev.rotation.inverse()).scaled_axis() / dt;

                if state.order == 0 {
                    state.velocity = v_raw;
                    state.angular_velocity = w_raw;
                    state.order = 1;
                } else {
                    let v_prev = state.velocity;
                    let w_prev = state.angular_velocity;
                    state.velocity = v_prev.lerp(&v_raw, s);
                    state.angular_velocity = w_prev.lerp(&w_raw, s);

                    let a_raw = (state.velocity - v_prev) / dt;
                    let alpha_raw = (state.angular_velocity - w_prev) / dt;
                    if state.order == 1 {
                        state.acceleration = a_raw;
                        state.angular_acceleration = alpha_raw;
                        state.order = 2;
                    } else {
                        let a_prev = state.acceleration;
                        state.acceleration = a_prev.lerp(&a_raw, s);
                        state.angular_acceleration = state.angular_acceleration.lerp(&alpha_raw, s);

                        let j_raw = (state.acceleration - a_prev) / dt;
                        let j = if state.order == 2 { j_raw } else { state.jerk.lerp(&j_raw, s) };
                        state.jerk = clamp_norm(j, self.config.max_jerk);
                        state.order = 3;
                    }
                }
            }
        }

        state.history.push_back(pose);
        while state.history.len() > self.config.history_len.max(2) {
            state.history.pop_front();
        }
        self.update_headset_state(&mut state);
    }

    /// Feed an inertial hint: body-frame angular velocity and world-frame
    /// gravity-free linear acceleration. Ignored unless
    /// [`PredictionConfig::use_inertial`] is set.
    pub fn add_inertial(&self, angular_velocity: Vector3<f64>, linear_acceleration: Vector3<f64>, timestamp_s: f64) {
        let mut state = self.state.lock();
        if !state.prediction.use_inertial {
            return;
        }
        if state.inertial.is_some_and(|h| h.timestamp_s > timestamp_s) {
            return;
        }
        state.inertial = Some(InertialHint {
            timestamp_s,
            angular_velocity,
            linear_acceleration,
        });
    }

    /// Pose `horizon_ms` after the latest fused pose, or `None` before the
    /// first pose. The horizon is shifted by the latency compensation and
    /// clamped to `[0, max_prediction_ms]`.
    pub fn predict_pose(&self, horizon_ms: f64) -> Option<Pose> {
        let state = self.state.lock();
        let last = *state.history.back()?;
        let cfg = state.prediction;
        let h = (horizon_ms + cfg.latency_compensation_ms).clamp(0.0, cfg.max_prediction_ms.max(0.0)) / 1e3;

        if state.order == 0 || state.headset_state == HeadsetState::Stationary {
            return Some(Pose {
                timestamp_s: last.timestamp_s + h,
                ..last
            });
        }

        let inertial = state.fresh_inertial();
        let mode = cfg.interaction_mode;

        let translation = if state.headset_state == HeadsetState::RotationOnly {
            last.translation
        } else {
            let accel = inertial.map_or(state.acceleration, |hint| hint.linear_acceleration);
            let higher = accel * (0.5 * h * h) + state.jerk * (h * h * h / 6.0);
            let displacement = state.velocity * h + higher * mode.translation_gain();
            last.translation + clamp_norm(displacement, mode.max_translation_jump())
        };

        let omega = state.world_angular_velocity();
        let alpha = if inertial.is_some() {
            Vector3::zeros()
        } else {
            state.angular_acceleration
        };
        let step = omega * h + alpha * (0.5 * h * h);
        let rotation = UnitQuaternion::from_scaled_axis(step) * last.rotation;

        Some(Pose {
            rotation,
            translation,
            timestamp_s: last.timestamp_s + h,
        })
    }

    /// [`predict_pose`](Self::predict_pose) with the configured horizon.
    pub fn predicted_pose(&self) -> Option<Pose> {
        let horizon = self.state.lock().prediction.horizon_ms;
        self.predict_pose(horizon)
    }

    /// Pose at an absolute time: interpolated inside the history, predicted
    /// past its end.
    pub fn pose_at(&self, timestamp_s: f64) -> Option<Pose> {
        let (first, last) = {
            let state = self.state.lock();
            let first = *state.history.front()?;
            let last = *state.history.back()?;
            if timestamp_s > first.timestamp_s && timestamp_s < last.timestamp_s {
                let idx = state.history.partition_point(|p| p.timestamp_s <= timestamp_s);
                let a = state.history[idx - 1];
                let b = state.history[idx];
                return Some(interpolate(&a, &b, timestamp_s));
            }
            (first, last)
        };
        if timestamp_s <= first.timestamp_s {
            return Some(Pose { timestamp_s, ..first });
        }
        if timestamp_s == last.timestamp_s {
            return Some(last);
        }
        let state = self.state.lock();
        let max = state.prediction.max_prediction_ms - state.prediction.latency_compensation_ms;
        drop(state);
        self.predict_pose(((timestamp_s - last.timestamp_s) * 1e3).min(max))
    }

    /// Classify motion from the current derivative estimates.
    pub fn estimate_headset_state(&self) -> HeadsetState {
        let mut state = self.state.lock();
        self.update_headset_state(&mut state);
        state.headset_state
    }

    /// Last classification, without recomputing.
    pub fn headset_state(&self) -> HeadsetState {
        self.state.lock().headset_state
    }

    pub fn set_interaction_mode(&self, mode: InteractionMode) {
        let mut state = self.state.lock();
        if state.prediction.interaction_mode != mode {
            debug!("motion: interaction mode {:?} -> {:?}", state.prediction.interaction_mode, mode);
            state.prediction.interaction_mode = mode;
        }
    }

    pub fn interaction_mode(&self) -> InteractionMode {
        self.state.lock().prediction.interaction_mode
    }

    /// Default horizon for [`predicted_pose`](Self::predicted_pose).
    pub fn set_prediction_horizon(&self, horizon_ms: f64) {
        self.state.lock().prediction.horizon_ms = horizon_ms.max(0.0);
    }

    pub fn set_latency_compensation(&self, latency_ms: f64) {
        self.state.lock().prediction.latency_compensation_ms = latency_ms;
    }

    pub fn prediction_config(&self) -> PredictionConfig {
        self.state.lock().prediction
    }

    pub fn set_prediction_config(&self, prediction: PredictionConfig) {
        let mut state = self.state.lock();
        state.prediction = prediction;
        if !prediction.use_inertial {
            state.inertial = None;
        }
    }

    pub fn latest_pose(&self) -> Option<Pose> {
        self.state.lock().history.back().copied()
    }

    /// World-frame linear velocity, m/s.
    pub fn velocity(&self) -> Vector3<f64> {
        self.state.lock().velocity
    }

    /// World-frame angular velocity, rad/s.
    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.state.lock().world_angular_velocity()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Drop history, derivatives and inertial hints in one step. Prediction
    /// settings are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let prediction = state.prediction;
        *state = MotionState::new(prediction);
        debug!("motion: reset");
    }

    fn update_headset_state(&self, state: &mut MotionState) {
        let speed = state.velocity.norm();
        let angular = state.world_angular_velocity().norm();
        let next = classify(&self.config, speed, angular, state.headset_state);
        if next != state.headset_state {
            trace!(
                "motion: {:?} -> {:?} (|v| {:.3} m/s, |w| {:.3} rad/s)",
                state.headset_state,
                next,
                speed,
                angular
            );
            state.headset_state = next;
        }
    }
}

/// One classification step. Leaving `FastMovement` always passes through
/// `SlowMovement` before `Stationary`.
pub fn classify(config: &MotionConfig, speed: f64, angular: f64, previous: HeadsetState) -> HeadsetState {
    let raw = if speed > config.fast_linear_mps || angular > config.fast_angular_rps {
        HeadsetState::FastMovement
    } else if speed < config.stationary_linear_mps && angular < config.stationary_angular_rps {
        HeadsetState::Stationary
    } else if speed < config.stationary_linear_mps && angular > config.rotation_angular_rps {
        HeadsetState::RotationOnly
    } else {
        HeadsetState::SlowMovement
    };
    match (previous, raw) {
        (HeadsetState::FastMovement, HeadsetState::Stationary) => HeadsetState::SlowMovement,
        _ => raw,
    }
}

fn clamp_norm(v: Vector3<f64>, max: f64) -> Vector3<f64> {
    let n = v.norm();
    if n > max && n > 0.0 {
        v * (max / n)
    } else {
        v
    }
}

fn interpolate(a: &Pose, b: &Pose, timestamp_s: f64) -> Pose {
    let span = b.timestamp_s - a.timestamp_s;
    let t = if span > 0.0 { (timestamp_s - a.timestamp_s) / span } else { 0.0 };
    Pose {
        rotation: a.rotation.slerp(&b.rotation, t),
        translation: a.translation.lerp(&b.translation, t),
        timestamp_s,
    }
}
