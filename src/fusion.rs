//! Visual-inertial fusion.
//!
//! An error-state Kalman filter over `[δθ, δp, δv, δbg, δba]`. The nominal
//! state is anchored at the last visual observation; inertial samples after
//! the anchor are preintegrated and the anchor covariance is carried forward
//! with the preintegration Jacobians. Each visual pose corrects the state at
//! its own timestamp, after which the buffered samples are re-integrated on
//! top of the corrected anchor.
//!
//! The filter state is the IMU body. Visual poses of the reference camera
//! are moved onto the IMU through `T_imu_ref` before they correct it, and
//! fused poses are reported for the reference camera again.
//!
//! Cold start: gravity comes from a short window of accelerometer samples;
//! until the first visual observation the world frame is the body frame at
//! that instant. The first observation (and every map re-bootstrap) re-aligns
//! the filter to the map frame. Metric scale comes from the rig baseline; with
//! a single camera (no baseline) visual positions are not trusted and updates
//! correct rotation only.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use nalgebra::{Isometry3, Matrix3, SMatrix, Translation3, UnitQuaternion, Vector3};

use crate::config::FusionConfig;
use crate::geometry::skew;
use crate::motion::MotionModel;
use crate::preintegration::{ImuNoise, NavState, Preintegrated};
use crate::types::{ImuBias, InertialSample, Pose};

type Matrix15 = SMatrix<f64, 15, 15>;
type Matrix6x15 = SMatrix<f64, 6, 15>;
type Matrix15x6 = SMatrix<f64, 15, 6>;
type Matrix15x9 = SMatrix<f64, 15, 9>;
type Vector6 = SMatrix<f64, 6, 1>;

const TH: usize = 0;
const P: usize = 3;
const V: usize = 6;
const BG: usize = 9;
const BA: usize = 12;

/// Baselines shorter than this cannot fix metric scale.
const MIN_METRIC_BASELINE_M: f64 = 1e-3;
/// Position sigma used when visual translation carries no metric scale.
const UNTRUSTED_POSITION_SIGMA_M: f64 = 1e3;
/// Variance added per second of interval that no inertial sample covered.
const UNCOVERED_VARIANCE_PER_S: f64 = 1.0;
/// Samples spinning faster than this are skipped during gravity estimation.
const GRAVITY_INIT_MAX_RATE: f64 = 0.5;
/// 99.9% quantile of χ² with 6 degrees of freedom.
const CHI2_GATE: f64 = 22.46;
/// Consecutive gated observations after which the filter re-aligns.
const MAX_REJECTED_IN_ROW: u32 = 3;
/// Inertial-only propagation longer than this moves the anchor forward.
const REBASE_AFTER_S: f64 = 0.5;
/// Minimum spacing of poses handed to the motion model between visual updates.
const MOTION_FEED_INTERVAL_S: f64 = 1.0 / 120.0;

/// Health of the fused estimate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionQuality {
    /// No gravity and no visual pose yet.
    Initializing = 0,
    /// Recent visual correction.
    Nominal = 1,
    /// Visual corrections paused; propagation continues.
    Degraded = 2,
    /// Only inertial data drives the estimate.
    InertialOnly = 3,
}

/// Signal for the consuming application.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingQuality {
    Good = 0,
    Limited = 1,
    /// Visual tracking has been lost for longer than `lost_signal_after_s`.
    Lost = 2,
}

/// One pose from multi-camera tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualObservation {
    /// Reference camera (head) pose in the map frame.
    pub pose: Pose,
    pub inliers: usize,
    /// Bumped by tracking whenever the map frame changes.
    pub map_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedPose {
    pub pose: Pose,
    /// World frame, m/s.
    pub velocity: Vector3<f64>,
    pub quality: FusionQuality,
    pub tracking_quality: TrackingQuality,
    /// 1σ position uncertainty, m.
    pub position_sigma_m: f64,
    /// 1σ rotation uncertainty, rad.
    pub rotation_sigma_rad: f64,
    pub bias: ImuBias,
}

#[derive(Debug, Clone)]
struct Estimator {
    anchor: NavState,
    bias: ImuBias,
    /// Error covariance at the anchor.
    covariance: Matrix15,
    /// Samples after the anchor, integrated into `preint`.
    pending: Vec<InertialSample>,
    preint: Preintegrated,
}

impl Estimator {
    fn new(anchor: NavState, bias: ImuBias, covariance: Matrix15, noise: ImuNoise) -> Self {
        Self {
            preint: Preintegrated::new(bias, noise, anchor.timestamp_s),
            anchor,
            bias,
            covariance,
            pending: Vec::new(),
        }
    }

    /// Restart preintegration at the anchor, keeping later samples.
    fn rebuild(&mut self) {
        let t = self.anchor.timestamp_s;
        self.pending.retain(|s| s.timestamp_s > t);
        self.preint = Preintegrated::new(self.bias, *self.preint.noise(), t);
        for s in &self.pending {
            self.preint.push(s);
        }
    }

    /// Preintegration from the anchor up to `t`.
    fn integrate_until(&self, t: f64) -> Preintegrated {
        let mut pre = Preintegrated::new(self.bias, *self.preint.noise(), self.anchor.timestamp_s);
        for s in self.pending.iter().take_while(|s| s.timestamp_s <= t) {
            pre.push(s);
        }
        pre.extend_to(t);
        pre
    }

    fn current(&self, gravity: Option<&Vector3<f64>>) -> NavState {
        match gravity {
            Some(g) => self.preint.predict(&self.anchor, g, &self.bias),
            None => self.anchor,
        }
    }
}

pub struct VisualInertialFusion {
    config: FusionConfig,
    noise: ImuNoise,
    motion: Arc<MotionModel>,
    min_inliers: usize,
    metric_position: bool,
    /// `T_ref_imu`, inverse of the configured extrinsic.
    ref_from_imu: Isometry3<f64>,
    /// Bias-corrected angular rate of the latest sample, IMU frame.
    body_rate: Vector3<f64>,

    gravity_sum: Vector3<f64>,
    gravity_count: usize,
    /// Gravity in the world frame.
    gravity: Option<Vector3<f64>>,

    est: Option<Estimator>,
    aligned: bool,
    map_epoch: Option<u64>,
    rejected_in_row: u32,

    first_s: Option<f64>,
    latest_s: f64,
    last_imu_s: Option<f64>,
    last_visual_s: Option<f64>,
    last_motion_feed_s: f64,
    lost_signalled: bool,
}

impl VisualInertialFusion {
    /// `rig_baseline_m` is the largest camera baseline of the rig; below a
    /// millimetre visual translation is treated as scale-free.
    pub fn new(config: FusionConfig, rig_baseline_m: f64, min_inliers: usize, motion: Arc<MotionModel>) -> Self {
        let noise = ImuNoise {
            gyro: config.gyro_noise_density,
            accel: config.accel_noise_density,
            gyro_walk: config.gyro_bias_walk,
            accel_walk: config.accel_bias_walk,
        };
        let metric_position = rig_baseline_m >= MIN_METRIC_BASELINE_M;
        if !metric_position {
            info!("fusion: rig baseline {:.4} m, visual updates correct rotation only", rig_baseline_m);
        }
        Self {
            ref_from_imu: config.imu_from_ref.inverse(),
            body_rate: Vector3::zeros(),
            config,
            noise,
            motion,
            min_inliers: min_inliers.max(1),
            metric_position,
            gravity_sum: Vector3::zeros(),
            gravity_count: 0,
            gravity: None,
            est: None,
            aligned: false,
            map_epoch: None,
            rejected_in_row: 0,
            first_s: None,
            latest_s: 0.0,
            last_imu_s: None,
            last_visual_s: None,
            last_motion_feed_s: f64::NEG_INFINITY,
            lost_signalled: false,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn motion_model(&self) -> &Arc<MotionModel> {
        &self.motion
    }

    /// Move the IMU to `imu_from_ref` (`T_imu_ref`). The next visual pose
    /// re-aligns the filter.
    pub fn set_imu_extrinsic(&mut self, imu_from_ref: Isometry3<f64>) {
        if imu_from_ref == self.config.imu_from_ref {
            return;
        }
        self.config.imu_from_ref = imu_from_ref;
        self.ref_from_imu = imu_from_ref.inverse();
        self.aligned = false;
        info!("fusion: IMU extrinsic changed, re-aligning on the next visual pose");
    }

    /// Feed inertial samples in time order. Samples not after the previous one
    /// are dropped.
    pub fn process_imu_measurements(&mut self, samples: &[InertialSample]) {
        for sample in samples {
            if self.last_imu_s.is_some_and(|t| sample.timestamp_s <= t) {
                trace!("fusion: dropping out-of-order IMU sample at {:.4}s", sample.timestamp_s);
                continue;
            }
            self.last_imu_s = Some(sample.timestamp_s);
            self.touch(sample.timestamp_s);

            if self.gravity.is_none() {
                self.accumulate_gravity(sample);
                continue;
            }
            let Some(est) = self.est.as_mut() else {
                continue;
            };
            if sample.timestamp_s <= est.preint.end_time() {
                continue;
            }
            est.preint.push(sample);
            est.pending.push(*sample);

            let gravity = self.gravity.unwrap_or_default();
            let state = est.current(Some(&gravity));
            let linear = state.rotation * (sample.accel - est.bias.accel) + gravity;
            self.body_rate = sample.gyro - est.bias.gyro;
            self.motion
                .add_inertial(self.ref_from_imu.rotation * self.body_rate, linear, sample.timestamp_s);
        }

        self.rebase_if_coasting();
        self.feed_motion(false);
    }

    /// Correct the estimate with one visual pose and return the fused result.
    pub fn process_visual_tracking(&mut self, observation: &VisualObservation) -> FusedPose {
        let t = observation.pose.timestamp_s;
        self.touch(t);

        if let Some(est) = &self.est {
            if t < est.anchor.timestamp_s {
                trace!("fusion: visual pose at {:.4}s older than anchor, ignored", t);
                return self.fused_or_observation(observation);
            }
        }

        let obs = &VisualObservation {
            pose: self.body_pose(&observation.pose),
            ..*observation
        };
        let epoch_changed = self.map_epoch.is_some_and(|e| e != obs.map_epoch);
        if self.est.is_none() || !self.aligned || epoch_changed {
            if epoch_changed {
                info!("fusion: map epoch {} -> {}, re-aligning", self.map_epoch.unwrap_or(0), obs.map_epoch);
            }
            self.align(obs);
        } else if self.gravity.is_none() {
            self.update_vision_only(obs);
        } else if !self.update(obs) {
            self.rejected_in_row += 1;
            if self.rejected_in_row >= MAX_REJECTED_IN_ROW {
                warn!("fusion: {} visual poses rejected in a row, re-aligning", self.rejected_in_row);
                self.align(obs);
            }
        }

        self.map_epoch = Some(obs.map_epoch);
        self.last_visual_s = Some(self.last_visual_s.map_or(t, |last| last.max(t)));
        if self.lost_signalled {
            info!("fusion: visual tracking recovered");
            self.lost_signalled = false;
        }
        self.feed_motion(true);
        self.fused_or_observation(observation)
    }

    /// Tracking produced no pose at `timestamp_s`.
    pub fn report_tracking_lost(&mut self, timestamp_s: f64) {
        self.touch(timestamp_s);
        if !self.lost_signalled && self.tracking_quality() == TrackingQuality::Lost {
            warn!(
                "fusion: no visual pose for more than {:.1}s, tracking lost",
                self.config.lost_signal_after_s
            );
            self.lost_signalled = true;
        }
    }

    /// Latest fused estimate, `None` until gravity or a visual pose is known.
    pub fn current_pose(&self) -> Option<FusedPose> {
        let est = self.est.as_ref()?;
        let state = est.current(self.gravity.as_ref());
        let covariance = if self.gravity.is_some() {
            propagate(&est.covariance, &est.anchor.rotation, &est.preint)
        } else {
            est.covariance
        };
        let lever = self.config.imu_from_ref.translation.vector;
        Some(FusedPose {
            pose: self.head_pose(&state),
            velocity: state.velocity + state.rotation * self.body_rate.cross(&lever),
            quality: self.quality(),
            tracking_quality: self.tracking_quality(),
            position_sigma_m: block_sigma(&covariance, P),
            rotation_sigma_rad: block_sigma(&covariance, TH),
            bias: est.bias,
        })
    }

    /// Convenience over the motion model.
    pub fn get_predicted_pose(&self, horizon_ms: f64) -> Option<Pose> {
        self.motion.predict_pose(horizon_ms)
    }

    pub fn quality(&self) -> FusionQuality {
        if self.est.is_none() {
            return FusionQuality::Initializing;
        }
        match self.visual_gap() {
            Some(gap) if gap <= self.config.degraded_after_s => FusionQuality::Nominal,
            Some(gap) if gap <= self.config.lost_signal_after_s => FusionQuality::Degraded,
            _ if self.gravity.is_some() => FusionQuality::InertialOnly,
            _ => FusionQuality::Degraded,
        }
    }

    pub fn tracking_quality(&self) -> TrackingQuality {
        let gap = self
            .visual_gap()
            .or_else(|| self.first_s.map(|first| self.latest_s - first))
            .unwrap_or(0.0);
        if self.last_visual_s.is_some() && gap <= self.config.degraded_after_s {
            TrackingQuality::Good
        } else if gap > self.config.lost_signal_after_s {
            TrackingQuality::Lost
        } else {
            TrackingQuality::Limited
        }
    }

    pub fn bias(&self) -> ImuBias {
        self.est.as_ref().map(|e| e.bias).unwrap_or_default()
    }

    /// Seed or override the bias estimate. Buffered samples are re-integrated.
    pub fn set_bias(&mut self, bias: ImuBias) {
        if let Some(est) = self.est.as_mut() {
            est.bias = bias;
            est.rebuild();
        }
    }

    /// Gravity in the world frame once known.
    pub fn gravity(&self) -> Option<Vector3<f64>> {
        self.gravity
    }

    /// Forget everything, including gravity. The motion model is reset too.
    pub fn reset(&mut self) {
        let config = self.config.clone();
        let baseline = if self.metric_position { 1.0 } else { 0.0 };
        *self = Self::new(config, baseline, self.min_inliers, Arc::clone(&self.motion));
        self.motion.reset();
        debug!("fusion: reset");
    }

    /// `T_world_ref` to the filter's `T_world_imu`.
    fn body_pose(&self, head: &Pose) -> Pose {
        Pose::from_isometry(&(head.to_isometry() * self.ref_from_imu), head.timestamp_s)
    }

    /// Filter state back to `T_world_ref`.
    fn head_pose(&self, state: &NavState) -> Pose {
        let world_from_imu = Isometry3::from_parts(Translation3::from(state.position), state.rotation);
        Pose::from_isometry(&(world_from_imu * self.config.imu_from_ref), state.timestamp_s)
    }

    fn touch(&mut self, t: f64) {
        if self.first_s.is_none() {
            self.first_s = Some(t);
        }
        self.latest_s = self.latest_s.max(t);
    }

    fn visual_gap(&self) -> Option<f64> {
        self.last_visual_s.map(|t| (self.latest_s - t).max(0.0))
    }

    fn accumulate_gravity(&mut self, sample: &InertialSample) {
        if sample.gyro.norm() > GRAVITY_INIT_MAX_RATE {
            self.gravity_sum = Vector3::zeros();
            self.gravity_count = 0;
            return;
        }
        self.gravity_sum += sample.accel;
        self.gravity_count += 1;
        if self.gravity_count < self.config.gravity_init_samples.max(1) {
            return;
        }

        let mean = self.gravity_sum / self.gravity_count as f64;
        let Some(dir) = (-mean).try_normalize(1e-6) else {
            warn!("fusion: zero mean acceleration during gravity init, retrying");
            self.gravity_sum = Vector3::zeros();
            self.gravity_count = 0;
            return;
        };
        let g_body = dir * self.config.gravity_magnitude;
        let t = sample.timestamp_s;

        match self.est.as_mut() {
            Some(est) => {
                // Vision came first: express gravity in the map frame.
                self.gravity = Some(est.anchor.rotation * g_body);
                est.pending.clear();
                est.rebuild();
            }
            None => {
                self.gravity = Some(g_body);
                let anchor = NavState {
                    rotation: UnitQuaternion::identity(),
                    position: Vector3::zeros(),
                    velocity: Vector3::zeros(),
                    timestamp_s: t,
                };
                self.est = Some(Estimator::new(anchor, ImuBias::zero(), self.initial_covariance(), self.noise));
            }
        }
        info!(
            "fusion: gravity initialised from {} samples, |f| = {:.3} m/s²",
            self.gravity_count,
            mean.norm()
        );
    }

    fn initial_covariance(&self) -> Matrix15 {
        let mut cov = Matrix15::zeros();
        let th = self.config.visual_rotation_sigma_rad.powi(2);
        let p = self.config.visual_position_sigma_m.powi(2);
        for i in 0..3 {
            cov[(TH + i, TH + i)] = th;
            cov[(P + i, P + i)] = p;
            cov[(V + i, V + i)] = 1.0;
            cov[(BG + i, BG + i)] = 1e-4;
            cov[(BA + i, BA + i)] = 1e-2;
        }
        cov
    }

    /// Jump the nominal state onto the observation, carrying gravity and
    /// velocity through the body frame.
    fn align(&mut self, obs: &VisualObservation) {
        let t = obs.pose.timestamp_s;
        let covariance = self.initial_covariance();
        self.rejected_in_row = 0;

        if self.est.is_none() {
            let anchor = NavState {
                rotation: obs.pose.rotation,
                position: obs.pose.translation,
                velocity: Vector3::zeros(),
                timestamp_s: t,
            };
            self.est = Some(Estimator::new(anchor, ImuBias::zero(), covariance, self.noise));
            self.aligned = true;
            self.motion.reset();
            debug!("fusion: first visual pose at {:.4}s, vision only until gravity is known", t);
            return;
        }
        let Some(est) = self.est.as_mut() else {
            return;
        };

        let at_t = match &self.gravity {
            Some(g) => est.integrate_until(t).predict(&est.anchor, g, &est.bias),
            None => est.anchor,
        };
        let to_body = at_t.rotation.inverse();
        if let Some(g) = self.gravity {
            self.gravity = Some(obs.pose.rotation * (to_body * g));
        }
        est.anchor = NavState {
            rotation: obs.pose.rotation,
            position: obs.pose.translation,
            velocity: obs.pose.rotation * (to_body * at_t.velocity),
            timestamp_s: t,
        };
        est.covariance = covariance;
        est.rebuild();
        self.aligned = true;
        self.motion.reset();
        debug!("fusion: aligned to map frame at {:.4}s", t);
    }

    fn update_vision_only(&mut self, obs: &VisualObservation) {
        let Some(est) = self.est.as_mut() else {
            return;
        };
        let dt = obs.pose.timestamp_s - est.anchor.timestamp_s;
        if dt > 0.0 {
            est.anchor.velocity = (obs.pose.translation - est.anchor.position) / dt;
        }
        est.anchor.rotation = obs.pose.rotation;
        est.anchor.position = obs.pose.translation;
        est.anchor.timestamp_s = obs.pose.timestamp_s;
        est.rebuild();
    }

    /// EKF correction. Returns false when the observation fails the gate.
    fn update(&mut self, obs: &VisualObservation) -> bool {
        let Some(gravity) = self.gravity else {
            return false;
        };
        let (sigma_th, sigma_p) = self.measurement_sigmas(obs.inliers);
        let Some(est) = self.est.as_mut() else {
            return false;
        };
        let t = obs.pose.timestamp_s;

        let pre = est.integrate_until(t);
        let predicted = pre.predict(&est.anchor, &gravity, &est.bias);
        let mut cov = propagate(&est.covariance, &est.anchor.rotation, &pre);
        let uncovered = (t - est.anchor.timestamp_s) - pre.dt;
        if uncovered > 1e-6 {
            let extra = UNCOVERED_VARIANCE_PER_S * uncovered;
            for i in 0..9 {
                cov[(i, i)] += extra;
            }
        }

        let mut residual = Vector6::zeros();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(predicted.rotation.inverse() * obs.pose.rotation).scaled_axis());
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(obs.pose.translation - predicted.position));

        let mut h = Matrix6x15::zeros();
        h.fixed_view_mut::<3, 3>(0, TH).copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(3, P).copy_from(&Matrix3::identity());

        let mut r = SMatrix::<f64, 6, 6>::zeros();
        for i in 0..3 {
            r[(i, i)] = sigma_th * sigma_th;
            r[(i + 3, i + 3)] = sigma_p * sigma_p;
        }

        let s = h * cov * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            warn!("fusion: singular innovation covariance, skipping update");
            return false;
        };
        let mahalanobis = (residual.transpose() * s_inv * residual)[(0, 0)];
        if mahalanobis > CHI2_GATE {
            debug!("fusion: visual pose gated (χ² = {:.1})", mahalanobis);
            return false;
        }

        let k: Matrix15x6 = cov * h.transpose() * s_inv;
        let dx = k * residual;
        let i_kh = Matrix15::identity() - k * h;
        let cov = i_kh * cov * i_kh.transpose() + k * r * k.transpose();

        est.anchor = NavState {
            rotation: predicted.rotation * UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(TH).into_owned()),
            position: predicted.position + dx.fixed_rows::<3>(P),
            velocity: predicted.velocity + dx.fixed_rows::<3>(V),
            timestamp_s: t,
        };
        est.bias.gyro += dx.fixed_rows::<3>(BG);
        est.bias.accel += dx.fixed_rows::<3>(BA);
        est.covariance = (cov + cov.transpose()) * 0.5;
        est.rebuild();
        self.rejected_in_row = 0;
        true
    }

    /// Visual noise, widened when fewer inliers support the pose.
    fn measurement_sigmas(&self, inliers: usize) -> (f64, f64) {
        let scale = (self.min_inliers as f64 / inliers.max(1) as f64).sqrt();
        let sigma_p = if self.metric_position {
            self.config.visual_position_sigma_m * scale
        } else {
            UNTRUSTED_POSITION_SIGMA_M
        };
        (self.config.visual_rotation_sigma_rad * scale, sigma_p)
    }

    /// Bound the preintegration window while no visual pose arrives.
    fn rebase_if_coasting(&mut self) {
        let Some(gravity) = self.gravity else {
            return;
        };
        let Some(est) = self.est.as_mut() else {
            return;
        };
        if est.preint.dt < REBASE_AFTER_S {
            return;
        }
        let covariance = propagate(&est.covariance, &est.anchor.rotation, &est.preint);
        est.anchor = est.preint.predict(&est.anchor, &gravity, &est.bias);
        est.covariance = covariance;
        est.pending.clear();
        est.rebuild();
        trace!("fusion: inertial coast, anchor moved to {:.4}s", est.anchor.timestamp_s);
    }

    fn feed_motion(&mut self, force: bool) {
        let Some(est) = &self.est else {
            return;
        };
        let state = est.current(self.gravity.as_ref());
        if !force && state.timestamp_s - self.last_motion_feed_s < MOTION_FEED_INTERVAL_S {
            return;
        }
        if state.timestamp_s <= self.last_motion_feed_s && !force {
            return;
        }
        self.motion.add_pose(self.head_pose(&state));
        self.last_motion_feed_s = self.last_motion_feed_s.max(state.timestamp_s);
    }

    fn fused_or_observation(&self, obs: &VisualObservation) -> FusedPose {
        self.current_pose().unwrap_or_else(|| FusedPose {
            pose: obs.pose,
            velocity: Vector3::zeros(),
            quality: self.quality(),
            tracking_quality: self.tracking_quality(),
            position_sigma_m: self.config.visual_position_sigma_m,
            rotation_sigma_rad: self.config.visual_rotation_sigma_rad,
            bias: ImuBias::zero(),
        })
    }
}

/// Carry the anchor error covariance across `pre`.
fn propagate(cov: &Matrix15, rotation: &UnitQuaternion<f64>, pre: &Preintegrated) -> Matrix15 {
    let r = rotation.to_rotation_matrix().into_inner();
    let d_r = pre.delta_rot.to_rotation_matrix().into_inner();
    let dt = pre.dt;

    let mut phi = Matrix15::identity();
    phi.fixed_view_mut::<3, 3>(TH, TH).copy_from(&d_r.transpose());
    phi.fixed_view_mut::<3, 3>(TH, BG).copy_from(&pre.d_rot_d_bg);
    phi.fixed_view_mut::<3, 3>(P, TH).copy_from(&(-r * skew(&pre.delta_pos)));
    phi.fixed_view_mut::<3, 3>(P, V).copy_from(&(Matrix3::identity() * dt));
    phi.fixed_view_mut::<3, 3>(P, BG).copy_from(&(r * pre.d_pos_d_bg));
    phi.fixed_view_mut::<3, 3>(P, BA).copy_from(&(r * pre.d_pos_d_ba));
    phi.fixed_view_mut::<3, 3>(V, TH).copy_from(&(-r * skew(&pre.delta_vel)));
    phi.fixed_view_mut::<3, 3>(V, BG).copy_from(&(r * pre.d_vel_d_bg));
    phi.fixed_view_mut::<3, 3>(V, BA).copy_from(&(r * pre.d_vel_d_ba));

    // Preintegration noise is ordered [δθ, δv, δp].
    let mut g = Matrix15x9::zeros();
    g.fixed_view_mut::<3, 3>(TH, 0).copy_from(&Matrix3::identity());
    g.fixed_view_mut::<3, 3>(V, 3).copy_from(&r);
    g.fixed_view_mut::<3, 3>(P, 6).copy_from(&r);

    let mut out = phi * cov * phi.transpose() + g * pre.covariance * g.transpose();
    let noise = pre.noise();
    for i in 0..3 {
        out[(BG + i, BG + i)] += noise.gyro_walk * noise.gyro_walk * dt;
        out[(BA + i, BA + i)] += noise.accel_walk * noise.accel_walk * dt;
    }
    out
}

fn block_sigma(cov: &Matrix15, start: usize) -> f64 {
    (cov[(start, start)] + cov[(start + 1, start + 1)] + cov[(start + 2, start + 2)])
        .max(0.0)
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;
    use crate::types::PredictionConfig;
    use approx::assert_relative_eq;

    const G: f64 = 9.81;
    const IMU_DT: f64 = 1.0 / 400.0;

    fn fusion(baseline: f64) -> VisualInertialFusion {
        fusion_with(FusionConfig::default(), baseline)
    }

    fn fusion_with(config: FusionConfig, baseline: f64) -> VisualInertialFusion {
        let motion = Arc::new(MotionModel::new(MotionConfig::default(), PredictionConfig::default()));
        VisualInertialFusion::new(config, baseline, 12, motion)
    }

    fn still_sample(t: f64) -> InertialSample {
        InertialSample {
            timestamp_s: t,
            accel: Vector3::new(0.0, 0.0, G),
            gyro: Vector3::zeros(),
        }
    }

    /// Walks along x at 0.5 m/s with a vertical bob while yawing at 0.3 rad/s.
    fn truth(t: f64) -> NavState {
        NavState {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3 * t),
            position: Vector3::new(0.5 * t, 0.0, 0.1 * t.sin()),
            velocity: Vector3::new(0.5, 0.0, 0.1 * t.cos()),
            timestamp_s: t,
        }
    }

    fn truth_sample(t: f64) -> InertialSample {
        let s = truth(t);
        let accel_world = Vector3::new(0.0, 0.0, -0.1 * t.sin());
        let gravity = Vector3::new(0.0, 0.0, -G);
        InertialSample {
            timestamp_s: t,
            accel: s.rotation.inverse() * (accel_world - gravity),
            gyro: Vector3::new(0.0, 0.0, 0.3),
        }
    }

    fn observe(t: f64, epoch: u64) -> VisualObservation {
        let s = truth(t);
        VisualObservation {
            pose: Pose {
                rotation: s.rotation,
                translation: s.position,
                timestamp_s: t,
            },
            inliers: 40,
            map_epoch: epoch,
        }
    }

    /// Interleave 400 Hz inertial samples with 30 Hz visual poses over `[start, end)`.
    fn run(f: &mut VisualInertialFusion, start: f64, end: f64, visual: bool) {
        let mut next_visual = start;
        let mut i = (start / IMU_DT).ceil() as usize;
        loop {
            let t = i as f64 * IMU_DT;
            if t >= end {
                break;
            }
            f.process_imu_measurements(&[truth_sample(t)]);
            if t >= next_visual {
                if visual {
                    f.process_visual_tracking(&observe(t, 1));
                } else {
                    f.report_tracking_lost(t);
                }
                next_visual += 1.0 / 30.0;
            }
            i += 1;
        }
    }

    #[test]
    fn test_gravity_from_still_window() {
        let mut f = fusion(0.1);
        assert_eq!(f.quality(), FusionQuality::Initializing);
        assert!(f.current_pose().is_none());

        let samples: Vec<_> = (1..=60).map(|i| still_sample(i as f64 * IMU_DT)).collect();
        f.process_imu_measurements(&samples);
        assert_relative_eq!(f.gravity().unwrap(), Vector3::new(0.0, 0.0, -G), epsilon = 1e-9);
        assert_eq!(f.quality(), FusionQuality::InertialOnly);

        let later: Vec<_> = (61..=460).map(|i| still_sample(i as f64 * IMU_DT)).collect();
        f.process_imu_measurements(&later);
        let fused = f.current_pose().unwrap();
        assert!(fused.pose.translation.norm() < 1e-9);
        assert_relative_eq!(fused.pose.timestamp_s, 460.0 * IMU_DT, epsilon = 1e-9);
    }

    #[test]
    fn test_vision_only_passes_poses_through() {
        let mut f = fusion(0.1);
        for i in 0..10 {
            let obs = observe(i as f64 / 30.0, 1);
            let fused = f.process_visual_tracking(&obs);
            assert_eq!(fused.pose, obs.pose);
        }
        assert_eq!(f.quality(), FusionQuality::Nominal);
        assert_eq!(f.tracking_quality(), TrackingQuality::Good);
        assert_relative_eq!(f.current_pose().unwrap().velocity.x, 0.5, epsilon = 1e-2);
        assert!(f.get_predicted_pose(16.0).is_some());
    }

    #[test]
    fn test_visual_inertial_tracks_trajectory() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 3.0, true);

        let fused = f.current_pose().unwrap();
        let t = fused.pose.timestamp_s;
        let expected = truth(t);
        assert!((fused.pose.translation - expected.position).norm() < 0.02);
        assert!(fused.pose.rotation.angle_to(&expected.rotation) < 0.01);
        assert!((fused.velocity - expected.velocity).norm() < 0.1);
        assert_eq!(f.quality(), FusionQuality::Nominal);
        assert!(fused.position_sigma_m < 0.05);
    }

    #[test]
    fn test_visual_loss_coasts_on_inertial() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 2.0, true);
        let sigma_before = f.current_pose().unwrap().position_sigma_m;

        run(&mut f, 2.0, 2.3, false);
        let fused = f.current_pose().unwrap();
        assert_eq!(fused.quality, FusionQuality::Degraded);
        assert_eq!(fused.tracking_quality, TrackingQuality::Limited);
        assert!(fused.position_sigma_m > sigma_before);
        assert!((fused.pose.translation - truth(fused.pose.timestamp_s).position).norm() < 0.05);

        run(&mut f, 2.3, 3.5, false);
        assert_eq!(f.quality(), FusionQuality::InertialOnly);
        assert_eq!(f.tracking_quality(), TrackingQuality::Lost);

        run(&mut f, 3.5, 4.0, true);
        assert_eq!(f.quality(), FusionQuality::Nominal);
        assert_eq!(f.tracking_quality(), TrackingQuality::Good);
    }

    #[test]
    fn test_map_epoch_change_realigns() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 1.0, true);
        let t = 1.0;
        f.process_imu_measurements(&[truth_sample(t)]);
        let mut obs = observe(t, 2);
        obs.pose.translation += Vector3::new(5.0, 0.0, 0.0);
        obs.pose.rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4) * obs.pose.rotation;

        let fused = f.process_visual_tracking(&obs);
        assert_relative_eq!(fused.pose.translation, obs.pose.translation, epsilon = 1e-9);
        // Gravity follows the new map frame.
        let g = f.gravity().unwrap();
        assert_relative_eq!(g, obs.pose.rotation * (truth(t).rotation.inverse() * Vector3::new(0.0, 0.0, -G)), epsilon = 0.05);
    }

    #[test]
    fn test_outlier_gated_then_realigned() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 1.0, true);
        let base = f.current_pose().unwrap().pose;

        let mut t = 1.0;
        let jumped = |t: f64| {
            let mut obs = observe(t, 1);
            obs.pose.translation += Vector3::new(1.0, 0.0, 0.0);
            obs
        };
        f.process_imu_measurements(&[truth_sample(t)]);
        let fused = f.process_visual_tracking(&jumped(t));
        assert!((fused.pose.translation - base.translation).norm() < 0.1);

        for _ in 0..2 {
            t += 1.0 / 30.0;
            f.process_imu_measurements(&[truth_sample(t)]);
            f.process_visual_tracking(&jumped(t));
        }
        let fused = f.current_pose().unwrap();
        assert!((fused.pose.translation - jumped(t).pose.translation).norm() < 0.01);
    }

    #[test]
    fn test_single_camera_ignores_visual_translation() {
        let mut f = fusion(0.0);
        let samples: Vec<_> = (1..=60).map(|i| still_sample(i as f64 * IMU_DT)).collect();
        f.process_imu_measurements(&samples);
        let t0 = 60.0 * IMU_DT;
        let first = VisualObservation {
            pose: Pose::identity(t0),
            inliers: 20,
            map_epoch: 0,
        };
        f.process_visual_tracking(&first);

        let t1 = t0 + 0.1;
        let later: Vec<_> = (61..=100).map(|i| still_sample(i as f64 * IMU_DT)).collect();
        f.process_imu_measurements(&later);
        let mut shifted = Pose::identity(t1);
        shifted.translation = Vector3::new(0.3, 0.0, 0.0);
        shifted.rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.005);
        f.process_visual_tracking(&VisualObservation {
            pose: shifted,
            inliers: 20,
            map_epoch: 0,
        });

        let fused = f.current_pose().unwrap();
        assert!(fused.pose.translation.norm() < 1e-3);
        assert!(fused.pose.rotation.angle() > 0.002);
    }

    #[test]
    fn test_rotated_imu_mount() {
        let imu_from_ref = Isometry3::from_parts(
            Translation3::new(0.02, -0.03, 0.01),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2),
        );
        let head: crate::sim::Trajectory = Arc::new(|t| {
            let s = truth(t);
            Pose {
                rotation: s.rotation,
                translation: s.position,
                timestamp_s: t,
            }
        });
        let imu = crate::sim::trajectory_motion(head, Vector3::new(0.0, 0.0, -G), imu_from_ref);
        let mut f = fusion_with(
            FusionConfig {
                imu_from_ref,
                ..FusionConfig::default()
            },
            0.1,
        );

        let mut next_visual = 0.0;
        for i in 0..1200 {
            let t = i as f64 * IMU_DT;
            let m = imu(t);
            f.process_imu_measurements(&[InertialSample {
                timestamp_s: t,
                accel: m.accel,
                gyro: m.gyro,
            }]);
            if t >= next_visual {
                f.process_visual_tracking(&observe(t, 1));
                next_visual += 1.0 / 30.0;
            }
        }

        // Gravity is expressed in the map frame, not in the IMU's axes.
        assert_relative_eq!(f.gravity().unwrap(), Vector3::new(0.0, 0.0, -G), epsilon = 0.05);
        let fused = f.current_pose().unwrap();
        let expected = truth(fused.pose.timestamp_s);
        assert!((fused.pose.translation - expected.position).norm() < 0.02);
        assert!(fused.pose.rotation.angle_to(&expected.rotation) < 0.01);
        assert!((fused.velocity - expected.velocity).norm() < 0.1);
        assert_eq!(f.quality(), FusionQuality::Nominal);
        assert!(f.bias().gyro.norm() < 0.05);
    }

    #[test]
    fn test_extrinsic_change_realigns() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 0.5, true);
        let mount = Isometry3::from_parts(
            Translation3::new(0.0, 0.05, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5),
        );
        f.set_imu_extrinsic(mount);
        assert_eq!(f.config().imu_from_ref, mount);

        let t = 0.5;
        f.process_imu_measurements(&[truth_sample(t)]);
        let obs = observe(t, 1);
        let fused = f.process_visual_tracking(&obs);
        // Re-aligned: the reported head pose is the observation itself.
        assert_relative_eq!(fused.pose.translation, obs.pose.translation, epsilon = 1e-9);
        assert!(fused.pose.rotation.angle_to(&obs.pose.rotation) < 1e-9);
    }

    #[test]
    fn test_reset_forgets_gravity() {
        let mut f = fusion(0.1);
        run(&mut f, 0.0, 0.5, true);
        f.reset();
        assert!(f.gravity().is_none());
        assert!(f.current_pose().is_none());
        assert!(f.motion_model().latest_pose().is_none());
    }
}
