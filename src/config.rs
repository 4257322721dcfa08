//! Runtime configuration.
//!
//! Every component takes a plain config struct with sensible defaults.
//! [`PipelineConfig::from_env`] layers `HEADTRACK_*` environment overrides
//! on top of those defaults.

use crate::types::{CameraId, InteractionMode, OperationMode, PixelFormat, PredictionConfig};
use nalgebra::Isometry3;
use std::path::PathBuf;

/// Requested stream settings for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub id: CameraId,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: PixelFormat,
}

impl CameraConfig {
    pub fn new(id: CameraId, width: u32, height: u32) -> Self {
        Self {
            id,
            width,
            height,
            fps: 30.0,
            format: PixelFormat::Gray8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameProviderConfig {
    /// Fixed pool size per camera. Too few starves capture, too many wastes memory.
    pub buffers_per_camera: usize,
    /// Export buffer handles when the driver supports it.
    pub zero_copy: bool,
    /// Poll interval of capture threads, also bounds shutdown latency.
    pub dequeue_timeout_ms: u64,
}

impl Default for FrameProviderConfig {
    fn default() -> Self {
        Self {
            buffers_per_camera: 4,
            zero_copy: true,
            dequeue_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InertialConfig {
    pub rate_hz: u32,
    pub mode: OperationMode,
    /// Ring capacity; the oldest samples are evicted on overflow.
    pub queue_capacity: usize,
    pub read_timeout_ms: u64,
    /// Silence longer than this marks the chip as unreachable.
    pub comm_loss_after_ms: u64,
    /// Gyro magnitude (rad/s) under which the head is treated as still for bias refinement.
    pub stationary_gyro_threshold: f64,
    /// Samples averaged for a bias refinement.
    pub stationary_window: usize,
}

impl Default for InertialConfig {
    fn default() -> Self {
        Self {
            rate_hz: 400,
            mode: OperationMode::VrStabilized,
            queue_capacity: 2048,
            read_timeout_ms: 20,
            comm_loss_after_ms: 250,
            stationary_gyro_threshold: 0.02,
            stationary_window: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub model_path: PathBuf,
    /// Model input size.
    pub width: u32,
    pub height: u32,
    pub max_features: usize,
    /// Detections below this probability are dropped before the cap.
    pub confidence_threshold: f32,
    /// Non-maximum suppression radius in full-resolution pixels.
    pub nms_radius: u32,
    /// Pixels closer than this to the border are ignored.
    pub border: u32,
    pub allow_software_fallback: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/superpoint_160x120_quant.bin"),
            width: 160,
            height: 120,
            max_features: 300,
            confidence_threshold: 0.015,
            nms_radius: 4,
            border: 4,
            allow_software_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    pub parallel_extraction: bool,
    pub extraction_workers: usize,
    /// Depth assumed when projecting a keypoint into another camera.
    pub nominal_depth_m: f64,
    /// Pixel gate around the projected position for cross-camera candidates.
    pub correspondence_gate_px: f64,
    /// Largest accepted L2 distance between unit descriptors.
    pub max_descriptor_distance: f32,
    /// Pixel gate for frame-to-map matching around the predicted projection.
    pub map_match_gate_px: f64,
    pub min_inliers: usize,
    pub reprojection_threshold_px: f64,
    pub pose_iterations: usize,
    /// Handoff is considered once the active camera tracks fewer points than this.
    pub handoff_min_tracked: usize,
    /// A handoff target must see at least this many map points.
    pub handoff_min_visible: usize,
    /// Frame sets an observation stays live.
    pub observation_window: u64,
    /// Triangulated points closer or further than this are rejected (meters).
    pub min_depth_m: f64,
    pub max_depth_m: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            parallel_extraction: true,
            extraction_workers: 4,
            nominal_depth_m: 2.0,
            correspondence_gate_px: 40.0,
            max_descriptor_distance: 0.7,
            map_match_gate_px: 20.0,
            min_inliers: 12,
            reprojection_threshold_px: 3.0,
            pose_iterations: 10,
            handoff_min_tracked: 20,
            handoff_min_visible: 25,
            observation_window: 30,
            min_depth_m: 0.1,
            max_depth_m: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    /// Samples averaged to find gravity at cold start.
    pub gravity_init_samples: usize,
    pub gravity_magnitude: f64,
    /// Continuous-time noise densities.
    pub gyro_noise_density: f64,
    pub accel_noise_density: f64,
    pub gyro_bias_walk: f64,
    pub accel_bias_walk: f64,
    /// Visual pose noise at `min_inliers`; shrinks with more inliers.
    pub visual_position_sigma_m: f64,
    pub visual_rotation_sigma_rad: f64,
    /// Without visual updates for this long the estimate is degraded.
    pub degraded_after_s: f64,
    /// Continuous visual loss longer than this raises the tracking-quality signal.
    pub lost_signal_after_s: f64,
    /// `T_imu_ref`: the reference camera expressed in the IMU frame. The
    /// pipeline takes it from the rig calibration.
    pub imu_from_ref: Isometry3<f64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gravity_init_samples: 50,
            gravity_magnitude: 9.81,
            gyro_noise_density: 1.7e-4,
            accel_noise_density: 2.0e-3,
            gyro_bias_walk: 2.0e-5,
            accel_bias_walk: 3.0e-3,
            visual_position_sigma_m: 0.01,
            visual_rotation_sigma_rad: 0.01,
            degraded_after_s: 0.1,
            lost_signal_after_s: 1.0,
            imu_from_ref: Isometry3::identity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionConfig {
    pub history_len: usize,
    /// Below both: stationary.
    pub stationary_linear_mps: f64,
    pub stationary_angular_rps: f64,
    /// Above either: fast movement.
    pub fast_linear_mps: f64,
    pub fast_angular_rps: f64,
    /// Translation still but rotating faster than this: rotation only.
    pub rotation_angular_rps: f64,
    /// Exponential smoothing factor for derivative estimates (0..1, 1 = no smoothing).
    pub derivative_smoothing: f64,
    /// Jerk magnitude clamp (m/s³).
    pub max_jerk: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            history_len: 64,
            stationary_linear_mps: 0.02,
            stationary_angular_rps: 0.05,
            fast_linear_mps: 0.5,
            fast_angular_rps: 1.5,
            rotation_angular_rps: 0.3,
            derivative_smoothing: 0.6,
            max_jerk: 50.0,
        }
    }
}

/// Everything [`crate::pipeline::HeadTracker`] needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub cameras: Vec<CameraConfig>,
    pub frames: FrameProviderConfig,
    pub inertial: InertialConfig,
    pub extractor: ExtractorConfig,
    pub tracking: TrackingConfig,
    pub fusion: FusionConfig,
    pub motion: MotionConfig,
    pub prediction: PredictionConfig,
    /// Spread allowed inside a synchronized frame set.
    pub sync_tolerance_ms: f64,
    pub sync_timeout_ms: i64,
    pub calibration_path: Option<PathBuf>,
    /// Capacity of the fused pose channel.
    pub pose_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cameras: vec![CameraConfig::new(0, 640, 480), CameraConfig::new(1, 640, 480)],
            frames: FrameProviderConfig::default(),
            inertial: InertialConfig::default(),
            extractor: ExtractorConfig::default(),
            tracking: TrackingConfig::default(),
            fusion: FusionConfig::default(),
            motion: MotionConfig::default(),
            prediction: PredictionConfig::default(),
            sync_tolerance_ms: 5.0,
            sync_timeout_ms: 100,
            calibration_path: None,
            pose_channel_capacity: 64,
        }
    }
}

impl PipelineConfig {
    /// Defaults with `HEADTRACK_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.frames.buffers_per_camera =
            read_env_u32("HEADTRACK_BUFFERS_PER_CAMERA", cfg.frames.buffers_per_camera as u32) as usize;
        cfg.frames.zero_copy = read_env_bool("HEADTRACK_ZERO_COPY", cfg.frames.zero_copy);
        cfg.sync_tolerance_ms = read_env_f64("HEADTRACK_SYNC_TOLERANCE_MS", cfg.sync_tolerance_ms);

        cfg.inertial.rate_hz = read_env_u32("HEADTRACK_IMU_RATE_HZ", cfg.inertial.rate_hz);
        cfg.inertial.queue_capacity =
            read_env_u32("HEADTRACK_IMU_QUEUE", cfg.inertial.queue_capacity as u32) as usize;
        cfg.inertial.mode = match read_env_string("HEADTRACK_IMU_MODE", "vr").as_str() {
            "raw" => OperationMode::Raw,
            "fused" => OperationMode::FusedOrientation,
            "vr" => OperationMode::VrStabilized,
            other => {
                log::warn!(
                    "Unknown HEADTRACK_IMU_MODE='{}', using vr (supported: raw|fused|vr)",
                    other
                );
                OperationMode::VrStabilized
            }
        };

        if let Ok(path) = std::env::var("HEADTRACK_MODEL_PATH") {
            cfg.extractor.model_path = PathBuf::from(path.trim());
        }
        cfg.extractor.max_features =
            read_env_u32("HEADTRACK_MAX_FEATURES", cfg.extractor.max_features as u32) as usize;
        cfg.tracking.extraction_workers =
            read_env_u32("HEADTRACK_EXTRACT_WORKERS", cfg.tracking.extraction_workers as u32).max(1)
                as usize;
        cfg.tracking.parallel_extraction =
            read_env_bool("HEADTRACK_PARALLEL_EXTRACTION", cfg.tracking.parallel_extraction);

        cfg.prediction.horizon_ms = read_env_f64("HEADTRACK_PREDICTION_MS", cfg.prediction.horizon_ms);
        cfg.prediction.latency_compensation_ms =
            read_env_f64("HEADTRACK_LATENCY_MS", cfg.prediction.latency_compensation_ms);
        cfg.prediction.interaction_mode =
            match read_env_string("HEADTRACK_INTERACTION", "standing").as_str() {
                "seated" => InteractionMode::Seated,
                "standing" => InteractionMode::Standing,
                "room" | "roomscale" | "room-scale" => InteractionMode::RoomScale,
                other => {
                    log::warn!(
                        "Unknown HEADTRACK_INTERACTION='{}', using standing (supported: seated|standing|room)",
                        other
                    );
                    InteractionMode::Standing
                }
            };

        if let Ok(path) = std::env::var("HEADTRACK_CALIBRATION") {
            let path = path.trim();
            if !path.is_empty() {
                cfg.calibration_path = Some(PathBuf::from(path));
            }
        }

        cfg
    }
}

pub(crate) fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => {
                    log::warn!("Ignoring invalid {}='{}'", name, v);
                    None
                }
            }
        })
        .unwrap_or(default)
}

pub(crate) fn read_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                log::warn!("Ignoring invalid {}='{}'", name, v);
                None
            }
        })
        .unwrap_or(default)
}

pub(crate) fn read_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Some(n),
            _ => {
                log::warn!("Ignoring invalid {}='{}'", name, v);
                None
            }
        })
        .unwrap_or(default)
}

pub(crate) fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        std::env::set_var("HEADTRACK_TEST_BOOL", "off");
        std::env::set_var("HEADTRACK_TEST_U32", " 12 ");
        std::env::set_var("HEADTRACK_TEST_F64", "not-a-number");
        assert!(!read_env_bool("HEADTRACK_TEST_BOOL", true));
        assert_eq!(read_env_u32("HEADTRACK_TEST_U32", 3), 12);
        assert_eq!(read_env_f64("HEADTRACK_TEST_F64", 1.5), 1.5);
        assert_eq!(read_env_string("HEADTRACK_TEST_UNSET", "vr"), "vr");
    }

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = PipelineConfig::default();
        assert!(cfg.frames.buffers_per_camera >= 2);
        assert!(cfg.prediction.max_prediction_ms >= cfg.prediction.horizon_ms);
        assert!(cfg.motion.fast_linear_mps > cfg.motion.stationary_linear_mps);
        assert_eq!(cfg.cameras.len(), 2);
    }
}
