//! The head tracker context object.
//!
//! [`HeadTracker`] owns every component of the pipeline and runs one tracking
//! thread that pulls synchronized frame sets and inertial samples, feeds
//! multi-camera tracking and fusion, and publishes fused poses on a bounded
//! channel. Render-time prediction is a synchronous call on the caller's
//! thread that only touches the motion model.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};
use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::driver::{CameraDriver, ImuDriver, InferenceBackend};
use crate::error::LastError;
use crate::extractor::FeatureExtractor;
use crate::frame::FrameProvider;
use crate::fusion::{FusedPose, FusionQuality, TrackingQuality, VisualInertialFusion};
use crate::inertial::{InertialInterface, InertialStatus};
use crate::motion::MotionModel;
use crate::rig::{CameraRig, RigCalibration};
use crate::tracking::{MultiCameraTracker, TrackingShared, TrackingStats, TrackingStatus};
use crate::types::{
    CalibrationState, CameraId, HeadsetState, ImuBias, InteractionMode, Pose, PredictionConfig,
};
use crate::{Result, TrackingError};

/// Hardware handed to [`HeadTracker::initialize`].
pub struct Devices {
    /// One driver per entry of [`PipelineConfig::cameras`], in the same order.
    pub cameras: Vec<Box<dyn CameraDriver>>,
    pub imu: Option<Box<dyn ImuDriver>>,
    /// Accelerator per camera, in camera order. Cameras without one use the
    /// software backend.
    pub accelerators: Vec<Box<dyn InferenceBackend>>,
}

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerStatus {
    pub running: bool,
    pub tracking: TrackingStatus,
    pub fusion: FusionQuality,
    pub tracking_quality: TrackingQuality,
    pub headset_state: HeadsetState,
    pub active_camera: CameraId,
    pub map_epoch: u64,
    /// `None` when the pipeline runs without an IMU.
    pub inertial: Option<InertialStatus>,
}

/// Everything the tracking thread shares with the owner.
struct Context {
    frames: Arc<FrameProvider>,
    inertial: Option<Arc<InertialInterface>>,
    fusion: Arc<Mutex<VisualInertialFusion>>,
    sender: Sender<FusedPose>,
    last_error: Arc<LastError>,
    reset_requested: Arc<AtomicBool>,
    sync_tolerance_ms: f64,
    sync_timeout_ms: i64,
}

pub struct HeadTracker {
    config: PipelineConfig,
    rig: Arc<CameraRig>,
    frames: Arc<FrameProvider>,
    inertial: Option<Arc<InertialInterface>>,
    motion: Arc<MotionModel>,
    fusion: Arc<Mutex<VisualInertialFusion>>,
    tracking: Arc<TrackingShared>,
    /// Parked here while the tracking thread is not running.
    tracker: Mutex<Option<MultiCameraTracker>>,
    sender: Sender<FusedPose>,
    receiver: Receiver<FusedPose>,
    stop_flag: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<MultiCameraTracker>>>,
    last_error: Arc<LastError>,
}

impl HeadTracker {
    /// Load the rig, open every device and build the components.
    ///
    /// Camera and extractor failures abort. An IMU that fails to open is
    /// reported through [`last_error`](Self::last_error) and the pipeline
    /// runs vision-only.
    pub fn initialize(config: PipelineConfig, devices: Devices) -> Result<HeadTracker> {
        if devices.cameras.len() != config.cameras.len() {
            return Err(TrackingError::DeviceUnavailable(format!(
                "{} camera configs but {} drivers",
                config.cameras.len(),
                devices.cameras.len()
            )));
        }
        let last_error = Arc::new(LastError::new());

        let nominal = RigCalibration::nominal(&config.cameras);
        let rig = Arc::new(match &config.calibration_path {
            Some(path) => CameraRig::load_or_default(path, &nominal)?,
            None => CameraRig::from_calibration(&nominal)?,
        });
        for camera in &config.cameras {
            rig.camera(camera.id)?;
        }

        let frames = Arc::new(FrameProvider::initialize(
            config.cameras.iter().cloned().zip(devices.cameras).collect(),
            config.frames.clone(),
        )?);

        let inertial = match devices.imu {
            Some(driver) => match InertialInterface::initialize(driver, config.inertial.clone()) {
                Ok(imu) => Some(Arc::new(imu)),
                Err(e) => {
                    warn!("pipeline: IMU unavailable ({}), running vision-only", e);
                    last_error.set(&e);
                    None
                }
            },
            None => None,
        };

        let mut accelerators = devices.accelerators.into_iter();
        let extractors = config
            .cameras
            .iter()
            .map(|camera| {
                FeatureExtractor::initialize(config.extractor.clone(), accelerators.next())
                    .map(|extractor| (camera.id, extractor))
            })
            .collect::<Result<Vec<_>>>()?;

        let motion = Arc::new(MotionModel::new(config.motion.clone(), config.prediction));
        let mut fusion_config = config.fusion.clone();
        fusion_config.imu_from_ref = rig.imu_from_ref();
        let fusion = VisualInertialFusion::new(
            fusion_config,
            rig.snapshot().max_baseline(),
            config.tracking.min_inliers,
            Arc::clone(&motion),
        );
        let tracker = MultiCameraTracker::new(config.tracking.clone(), Arc::clone(&rig), extractors)?;
        let tracking = tracker.shared();
        let (sender, receiver) = crossbeam_channel::bounded(config.pose_channel_capacity.max(1));

        info!(
            "pipeline: {} cameras, IMU {}",
            config.cameras.len(),
            if inertial.is_some() { "present" } else { "absent" }
        );
        Ok(HeadTracker {
            config,
            rig,
            frames,
            inertial,
            motion,
            fusion: Arc::new(Mutex::new(fusion)),
            tracking,
            tracker: Mutex::new(Some(tracker)),
            sender,
            receiver,
            stop_flag: Arc::new(AtomicBool::new(false)),
            reset_requested: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            last_error,
        })
    }

    /// Start acquisition and the tracking thread.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let Some(tracker) = self.tracker.lock().take() else {
            return Err(TrackingError::DeviceUnavailable("tracker is not available".into()));
        };

        if let Err(e) = self.frames.start_acquisition() {
            *self.tracker.lock() = Some(tracker);
            return Err(e);
        }
        if let Some(imu) = &self.inertial {
            if let Err(e) = imu.start_acquisition() {
                warn!("pipeline: IMU failed to start ({}), running vision-only", e);
                self.last_error.set(&e);
            }
        }

        self.stop_flag.store(false, Ordering::Relaxed);
        let ctx = Context {
            frames: Arc::clone(&self.frames),
            inertial: self.inertial.clone(),
            fusion: Arc::clone(&self.fusion),
            sender: self.sender.clone(),
            last_error: Arc::clone(&self.last_error),
            reset_requested: Arc::clone(&self.reset_requested),
            sync_tolerance_ms: self.config.sync_tolerance_ms,
            sync_timeout_ms: self.config.sync_timeout_ms,
        };
        let stop = Arc::clone(&self.stop_flag);
        let spawned = std::thread::Builder::new()
            .name("headtrack-tracking".into())
            .spawn(move || tracking_loop(ctx, tracker, stop));
        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                if let Some(imu) = &self.inertial {
                    imu.stop_acquisition();
                }
                self.frames.stop_acquisition();
                Err(TrackingError::DeviceUnavailable(format!("failed to spawn tracking thread: {}", e)))
            }
        }
    }

    /// Stop the tracking thread, then acquisition. Every buffer is back in its
    /// pool when this returns.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take() {
            match handle.join() {
                Ok(tracker) => *self.tracker.lock() = Some(tracker),
                Err(_) => log::error!("pipeline: tracking thread panicked"),
            }
        }
        if let Some(imu) = &self.inertial {
            imu.stop_acquisition();
        }
        self.frames.stop_acquisition();
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Next fused pose, blocking.
    pub fn recv(&self) -> Result<FusedPose> {
        self.receiver.recv().map_err(|_| TrackingError::StreamStopped)
    }

    pub fn try_recv(&self) -> Option<FusedPose> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<FusedPose> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => TrackingError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => TrackingError::StreamStopped,
        })
    }

    /// Pose expected `horizon_ms` after the latest fused pose. Never blocks on
    /// the tracking thread.
    pub fn predict_pose(&self, horizon_ms: f64) -> Option<Pose> {
        self.motion.predict_pose(horizon_ms)
    }

    /// Prediction with the configured horizon and latency compensation.
    pub fn predicted_pose(&self) -> Option<Pose> {
        self.motion.predicted_pose()
    }

    pub fn current_pose(&self) -> Option<FusedPose> {
        self.fusion.lock().current_pose()
    }

    pub fn headset_state(&self) -> HeadsetState {
        self.motion.headset_state()
    }

    pub fn set_interaction_mode(&self, mode: InteractionMode) {
        self.motion.set_interaction_mode(mode);
    }

    pub fn set_prediction_horizon(&self, horizon_ms: f64) {
        self.motion.set_prediction_horizon(horizon_ms);
    }

    pub fn set_latency_compensation(&self, latency_ms: f64) {
        self.motion.set_latency_compensation(latency_ms);
    }

    pub fn prediction_config(&self) -> PredictionConfig {
        self.motion.prediction_config()
    }

    pub fn set_prediction_config(&self, prediction: PredictionConfig) {
        self.motion.set_prediction_config(prediction);
    }

    pub fn status(&self) -> TrackerStatus {
        let stats = self.tracking.stats();
        let (fusion, tracking_quality) = {
            let fusion = self.fusion.lock();
            (fusion.quality(), fusion.tracking_quality())
        };
        TrackerStatus {
            running: self.is_running(),
            tracking: stats.status,
            fusion,
            tracking_quality,
            headset_state: self.motion.headset_state(),
            active_camera: self.tracking.active_camera(),
            map_epoch: stats.map_epoch,
            inertial: self.inertial.as_ref().map(|imu| imu.status()),
        }
    }

    pub fn tracking_stats(&self) -> TrackingStats {
        self.tracking.stats()
    }

    /// `T_world_cam` of every camera at the last tracked frame set.
    pub fn camera_poses(&self) -> Vec<(CameraId, Pose)> {
        self.tracking.camera_poses()
    }

    /// IMU calibration snapshot, `None` without an IMU.
    pub fn get_calibration(&self) -> Option<CalibrationState> {
        self.inertial.as_ref().map(|imu| imu.get_calibration())
    }

    pub fn set_calibration(&self, state: CalibrationState) {
        if let Some(imu) = &self.inertial {
            imu.set_calibration(state);
        }
    }

    /// Gravity in the map frame, once fusion has found it.
    pub fn gravity(&self) -> Option<Vector3<f64>> {
        self.fusion.lock().gravity()
    }

    /// Bias estimated by fusion.
    pub fn get_current_bias(&self) -> ImuBias {
        self.fusion.lock().bias()
    }

    /// Seed the bias of both fusion and the inertial interface.
    pub fn set_bias(&self, bias: ImuBias) {
        self.fusion.lock().set_bias(bias);
        if let Some(imu) = &self.inertial {
            imu.set_bias(bias);
        }
    }

    pub fn rig(&self) -> &Arc<CameraRig> {
        &self.rig
    }

    pub fn rig_calibration(&self) -> RigCalibration {
        self.rig.calibration()
    }

    /// Replace the rig geometry. Tracking picks it up at the next frame set,
    /// fusion at the next visual pose.
    pub fn set_rig_calibration(&self, calibration: &RigCalibration) -> Result<()> {
        self.rig.set_calibration(calibration)?;
        self.fusion.lock().set_imu_extrinsic(self.rig.imu_from_ref());
        Ok(())
    }

    pub fn save_rig_calibration(&self, path: &Path) -> Result<()> {
        self.rig.save(path)
    }

    pub fn frame_provider(&self) -> &FrameProvider {
        &self.frames
    }

    pub fn inertial(&self) -> Option<&InertialInterface> {
        self.inertial.as_deref()
    }

    pub fn motion_model(&self) -> &Arc<MotionModel> {
        &self.motion
    }

    /// Most recent steady-state failure of any component.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .message()
            .or_else(|| self.frames.last_error())
            .or_else(|| self.inertial.as_ref().and_then(|imu| imu.last_error()))
    }

    /// Drop the map, the fused state and the motion history.
    pub fn reset(&self) {
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.reset();
        } else {
            self.reset_requested.store(true, Ordering::Relaxed);
        }
        self.fusion.lock().reset();
        self.last_error.clear();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Drop for HeadTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tracking_loop(ctx: Context, mut tracker: MultiCameraTracker, stop_flag: Arc<AtomicBool>) -> MultiCameraTracker {
    info!("pipeline: tracking thread started");
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            info!("pipeline: tracking thread stopping");
            break;
        }
        if ctx.reset_requested.swap(false, Ordering::Relaxed) {
            tracker.reset();
        }

        // Inertial first, so the prior covers the frame set.
        if let Some(imu) = &ctx.inertial {
            let samples = imu.get_measurements(usize::MAX);
            if !samples.is_empty() {
                ctx.fusion.lock().process_imu_measurements(&samples);
            }
        }

        let frames = match ctx
            .frames
            .get_synchronized_frames(ctx.sync_tolerance_ms, ctx.sync_timeout_ms)
        {
            Ok(frames) => frames,
            Err(TrackingError::SynchronizationTimeout) | Err(TrackingError::Timeout) => {
                trace!("pipeline: no frame set, coasting");
                if !coast(&ctx) {
                    break;
                }
                continue;
            }
            Err(TrackingError::StreamStopped) => {
                debug!("pipeline: frame stream stopped");
                break;
            }
            Err(e) => {
                warn!("pipeline: frame acquisition failed: {}", e);
                ctx.last_error.set(&e);
                if !coast(&ctx) {
                    break;
                }
                continue;
            }
        };

        let prior = {
            let fusion = ctx.fusion.lock();
            fusion.current_pose().map(|f| f.pose)
        };
        let output = match tracker.process_frame_set(frames, prior) {
            Ok(output) => output,
            Err(e) => {
                warn!("pipeline: frame set dropped: {}", e);
                ctx.last_error.set(&e);
                continue;
            }
        };

        let fused = {
            let mut fusion = ctx.fusion.lock();
            match output.observation() {
                Some(obs) => Some(fusion.process_visual_tracking(&obs)),
                None => {
                    fusion.report_tracking_lost(output.timestamp_s);
                    fusion.current_pose()
                }
            }
        };
        if output.status == TrackingStatus::Lost {
            ctx.last_error.set(&TrackingError::TrackingLost);
        }
        if let Some(pose) = fused {
            if !publish(&ctx.sender, pose) {
                break;
            }
        }
    }
    tracker
}

/// Publish the inertial-only estimate while no frames arrive.
fn coast(ctx: &Context) -> bool {
    let fused = {
        let mut fusion = ctx.fusion.lock();
        let current = fusion.current_pose();
        if let Some(current) = current {
            fusion.report_tracking_lost(current.pose.timestamp_s);
        }
        fusion.current_pose()
    };
    match fused {
        Some(pose) => publish(&ctx.sender, pose),
        None => true,
    }
}

/// Returns false once nobody listens any more.
fn publish(sender: &Sender<FusedPose>, pose: FusedPose) -> bool {
    match sender.try_send(pose) {
        Ok(()) => true,
        Err(crossbeam_channel::TrySendError::Full(_)) => {
            trace!("pipeline: pose channel full, dropping pose");
            true
        }
        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
            info!("pipeline: pose channel disconnected, stopping");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use crate::sim::{SyntheticCamera, SyntheticImu};

    fn config() -> PipelineConfig {
        PipelineConfig {
            cameras: vec![CameraConfig::new(0, 160, 120), CameraConfig::new(1, 160, 120)],
            ..PipelineConfig::default()
        }
    }

    fn cameras() -> Vec<Box<dyn CameraDriver>> {
        vec![
            Box::new(SyntheticCamera::new("cam0").with_camera_id(0)),
            Box::new(SyntheticCamera::new("cam1").with_camera_id(1)),
        ]
    }

    #[test]
    fn test_camera_count_must_match() {
        let devices = Devices {
            cameras: cameras().into_iter().take(1).collect(),
            imu: None,
            accelerators: Vec::new(),
        };
        assert!(matches!(
            HeadTracker::initialize(config(), devices),
            Err(TrackingError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_broken_imu_degrades_to_vision_only() {
        let devices = Devices {
            cameras: cameras(),
            imu: Some(Box::new(SyntheticImu::new("imu").failing_open())),
            accelerators: Vec::new(),
        };
        let tracker = HeadTracker::initialize(config(), devices).unwrap();
        assert!(tracker.inertial().is_none());
        assert!(tracker.last_error().is_some());
        let status = tracker.status();
        assert!(!status.running);
        assert_eq!(status.inertial, None);
        assert_eq!(status.tracking, TrackingStatus::NotInitialized);
        assert_eq!(status.fusion, FusionQuality::Initializing);
    }

    #[test]
    fn test_broken_camera_aborts() {
        let devices = Devices {
            cameras: vec![
                Box::new(SyntheticCamera::new("cam0").with_camera_id(0)),
                Box::new(SyntheticCamera::new("cam1").with_camera_id(1).failing_open()),
            ],
            imu: None,
            accelerators: Vec::new(),
        };
        assert!(matches!(
            HeadTracker::initialize(config(), devices),
            Err(TrackingError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_prediction_settings_reach_motion_model() {
        let devices = Devices {
            cameras: cameras(),
            imu: None,
            accelerators: Vec::new(),
        };
        let tracker = HeadTracker::initialize(config(), devices).unwrap();
        assert!(tracker.predict_pose(16.0).is_none());
        tracker.set_interaction_mode(InteractionMode::Seated);
        tracker.set_prediction_horizon(20.0);
        tracker.set_latency_compensation(5.0);
        let prediction = tracker.prediction_config();
        assert_eq!(prediction.interaction_mode, InteractionMode::Seated);
        assert_eq!(prediction.horizon_ms, 20.0);
        assert_eq!(prediction.latency_compensation_ms, 5.0);
    }

    #[test]
    fn test_imu_extrinsic_reaches_fusion() {
        use crate::rig::ImuExtrinsic;
        use nalgebra::{Isometry3, Translation3, UnitQuaternion};

        let mount = Isometry3::from_parts(
            Translation3::new(0.0, 0.02, -0.01),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2),
        );
        let mut calibration = RigCalibration::nominal(&config().cameras);
        calibration.imu = ImuExtrinsic::from_isometry(&mount);
        let path = std::env::temp_dir().join(format!("headtrack-pipeline-imu-{}.json", std::process::id()));
        CameraRig::from_calibration(&calibration).unwrap().save(&path).unwrap();

        let devices = Devices {
            cameras: cameras(),
            imu: None,
            accelerators: Vec::new(),
        };
        let tracker = HeadTracker::initialize(
            PipelineConfig {
                calibration_path: Some(path.clone()),
                ..config()
            },
            devices,
        )
        .unwrap();
        std::fs::remove_file(&path).ok();
        let loaded = tracker.fusion.lock().config().imu_from_ref;
        assert!((loaded.translation.vector - mount.translation.vector).norm() < 1e-9);
        assert!(loaded.rotation.angle_to(&mount.rotation) < 1e-6);

        calibration.imu = ImuExtrinsic::default();
        tracker.set_rig_calibration(&calibration).unwrap();
        assert_eq!(tracker.fusion.lock().config().imu_from_ref, Isometry3::identity());
        assert_eq!(tracker.rig_calibration().imu, ImuExtrinsic::default());
    }
}
