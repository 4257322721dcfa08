use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Index of a camera inside the rig.
pub type CameraId = usize;

/// Rigid head pose in the world frame.
///
/// Maps points from the reference-camera frame into the world frame:
/// `p_world = rotation * p_ref + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    /// Translation in meters.
    pub translation: Vector3<f64>,
    /// Capture time in seconds on the pipeline clock.
    pub timestamp_s: f64,
}

impl Pose {
    pub fn identity(timestamp_s: f64) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            timestamp_s,
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>, timestamp_s: f64) -> Self {
        Self {
            rotation: iso.rotation,
            translation: iso.translation.vector,
            timestamp_s,
        }
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Quaternion as `[qx, qy, qz, qw]`.
    pub fn quaternion_xyzw(&self) -> [f64; 4] {
        let q = self.rotation.quaternion();
        [q.i, q.j, q.k, q.w]
    }

    /// Translation distance and rotation angle between two poses.
    pub fn distance_to(&self, other: &Pose) -> (f64, f64) {
        let dt = (self.translation - other.translation).norm();
        let dr = self.rotation.angle_to(&other.rotation);
        (dt, dr)
    }
}

/// One bias-corrected inertial measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialSample {
    pub timestamp_s: f64,
    /// Linear acceleration (specific force) in m/s², body frame.
    pub accel: Vector3<f64>,
    /// Angular velocity in rad/s, body frame.
    pub gyro: Vector3<f64>,
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Per-axis calibration quality (0 = unreliable .. 3 = high accuracy) and current bias.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationState {
    pub accel: u8,
    pub gyro: u8,
    pub mag: u8,
    pub system: u8,
    pub bias: ImuBias,
}

impl CalibrationState {
    /// Overall quality is the weakest of the three sensors.
    pub fn recompute_system(&mut self) {
        self.system = self.accel.min(self.gyro).min(self.mag);
    }

    pub fn is_fully_calibrated(&self) -> bool {
        self.accel == 3 && self.gyro == 3 && self.system == 3
    }
}

/// Inertial chip operation mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    /// Uncalibrated gyro, accelerometer and magnetometer.
    Raw = 0,
    /// On-chip fused orientation.
    FusedOrientation = 1,
    /// Orientation with VR stabilization (no sudden heading jumps).
    VrStabilized = 2,
}

/// Camera pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Yuyv,
    Nv12,
    Rgb24,
}

impl PixelFormat {
    /// Bytes needed for one row of `width` pixels (luma plane for NV12).
    pub fn min_stride(self, width: u32) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Nv12 => width as usize,
            PixelFormat::Yuyv => width as usize * 2,
            PixelFormat::Rgb24 => width as usize * 3,
        }
    }

    /// Total buffer size for a frame of the given stride and height.
    pub fn frame_size(self, stride: usize, height: u32) -> usize {
        match self {
            PixelFormat::Nv12 => stride * height as usize * 3 / 2,
            _ => stride * height as usize,
        }
    }

    /// Luma of the pixel at column `x` inside `row`.
    pub fn luma(self, row: &[u8], x: usize) -> u8 {
        match self {
            PixelFormat::Gray8 | PixelFormat::Nv12 => row[x],
            PixelFormat::Yuyv => row[x * 2],
            PixelFormat::Rgb24 => {
                let p = &row[x * 3..x * 3 + 3];
                ((p[0] as u32 * 77 + p[1] as u32 * 150 + p[2] as u32 * 29) >> 8) as u8
            }
        }
    }
}

/// Borrowed view of pixel memory.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
}

impl<'a> ImageView<'a> {
    /// Tightly packed 8-bit grayscale view.
    pub fn gray(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize,
            format: PixelFormat::Gray8,
        }
    }

    #[inline]
    pub fn luma(&self, x: usize, y: usize) -> u8 {
        let row = &self.data[y * self.stride..];
        self.format.luma(row, x)
    }

    /// Bilinear luma at a sub-pixel position, clamped to the image.
    pub fn luma_bilinear(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width as usize).saturating_sub(1);
        let max_y = (self.height as usize).saturating_sub(1);
        let x = x.clamp(0.0, max_x as f32);
        let y = y.clamp(0.0, max_y as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(max_x);
        let y1 = (y0 + 1).min(max_y);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let top = self.luma(x0, y0) as f32 * (1.0 - fx) + self.luma(x1, y0) as f32 * fx;
        let bottom = self.luma(x0, y1) as f32 * (1.0 - fx) + self.luma(x1, y1) as f32 * fx;
        top * (1.0 - fy) + bottom * fy
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.stride >= self.format.min_stride(self.width)
            && self.data.len() >= self.stride * (self.height as usize - 1) + self.format.min_stride(self.width)
    }
}

bitflags::bitflags! {
    /// Capabilities a camera driver reports after configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct CameraCaps: u32 {
        /// Frames can be exported as cross-process buffer handles.
        const ZERO_COPY     = 1 << 0;
        /// Timestamps come from the sensor, not the host.
        const HW_TIMESTAMP  = 1 << 1;
        /// Exposure is triggered by a shared sync line.
        const EXTERNAL_SYNC = 1 << 2;
    }
}

/// A single 2-D detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Pixel column in the full-resolution image.
    pub x: f32,
    /// Pixel row in the full-resolution image.
    pub y: f32,
    /// Detector confidence.
    pub response: f32,
    /// Detection scale in pixels (cell size of the detector).
    pub scale: f32,
}

/// Keypoints and their unit-norm descriptors for one camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub camera_id: CameraId,
    pub frame_id: u64,
    pub timestamp_s: f64,
    pub keypoints: Vec<Keypoint>,
    /// Row-major `keypoints.len() x descriptor_dim`.
    pub descriptors: Vec<f32>,
    pub descriptor_dim: usize,
}

impl FeatureSet {
    pub fn empty(camera_id: CameraId, frame_id: u64, timestamp_s: f64, descriptor_dim: usize) -> Self {
        Self {
            camera_id,
            frame_id,
            timestamp_s,
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            descriptor_dim,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn descriptor(&self, index: usize) -> &[f32] {
        let start = index * self.descriptor_dim;
        &self.descriptors[start..start + self.descriptor_dim]
    }
}

/// L2 distance between two descriptors of equal length.
pub fn descriptor_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Coarse motion classification of the headset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadsetState {
    Stationary = 0,
    SlowMovement = 1,
    FastMovement = 2,
    RotationOnly = 3,
}

/// How the user is expected to move.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionMode {
    Seated = 0,
    Standing = 1,
    RoomScale = 2,
}

impl InteractionMode {
    /// Scale applied to the acceleration and jerk terms of translation prediction.
    pub fn translation_gain(self) -> f64 {
        match self {
            InteractionMode::Seated => 0.5,
            InteractionMode::Standing => 1.0,
            InteractionMode::RoomScale => 1.0,
        }
    }

    /// Largest predicted displacement in meters.
    pub fn max_translation_jump(self) -> f64 {
        match self {
            InteractionMode::Seated => 0.05,
            InteractionMode::Standing => 0.15,
            InteractionMode::RoomScale => 0.30,
        }
    }
}

/// Runtime prediction settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionConfig {
    /// Default horizon used when the caller does not pass one.
    pub horizon_ms: f64,
    /// Requests beyond this are clamped.
    pub max_prediction_ms: f64,
    /// Measured downstream render/display delay, added to every request.
    pub latency_compensation_ms: f64,
    pub interaction_mode: InteractionMode,
    /// Use inertial angular velocity / acceleration for extrapolation.
    pub use_inertial: bool,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            horizon_ms: 16.0,
            max_prediction_ms: 100.0,
            latency_compensation_ms: 0.0,
            interaction_mode: InteractionMode::Standing,
            use_inertial: true,
        }
    }
}
