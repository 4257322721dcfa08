//! C FFI layer for headtrack.
//!
//! Opaque handle API for render engines. The generated C header is written to
//! `include/headtrack.h` by cbindgen.

use crate::config::MotionConfig;
use crate::error::LastError;
use crate::fusion::FusionQuality;
use crate::motion::MotionModel;
use crate::pipeline::HeadTracker;
use crate::types::{HeadsetState, InteractionMode, Pose, PredictionConfig};
use crate::TrackingError;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::ffi::{c_char, c_int};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque standalone pose predictor.
pub struct HtPredictor(MotionModel);

/// Opaque handle over a running [`HeadTracker`].
pub struct HtTracker(HeadTracker);

/// Pose in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HtPose {
    /// Translation [x, y, z] in meters.
    pub translation: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Rotation matrix, flat row-major (9 elements).
    pub rotation: [f64; 9],
    /// Timestamp in seconds on the pipeline clock.
    pub timestamp_s: f64,
}

impl From<&Pose> for HtPose {
    fn from(pose: &Pose) -> Self {
        let m = pose.rotation_matrix();
        HtPose {
            translation: [pose.translation.x, pose.translation.y, pose.translation.z],
            quaternion: pose.quaternion_xyzw(),
            rotation: [
                m[(0, 0)],
                m[(0, 1)],
                m[(0, 2)],
                m[(1, 0)],
                m[(1, 1)],
                m[(1, 2)],
                m[(2, 0)],
                m[(2, 1)],
                m[(2, 2)],
            ],
            timestamp_s: pose.timestamp_s,
        }
    }
}

impl HtPose {
    /// Rebuild a pose from translation, quaternion and timestamp. The rotation
    /// matrix field is ignored.
    fn to_pose(&self) -> Result<Pose, TrackingError> {
        let [x, y, z, w] = self.quaternion;
        let q = Quaternion::new(w, x, y, z);
        let finite = self.translation.iter().chain(self.quaternion.iter()).all(|v| v.is_finite())
            && self.timestamp_s.is_finite();
        if !finite || q.norm() < 1e-9 {
            return Err(TrackingError::InvalidBuffer);
        }
        Ok(Pose {
            rotation: UnitQuaternion::from_quaternion(q),
            translation: Vector3::from(self.translation),
            timestamp_s: self.timestamp_s,
        })
    }
}

/// Create a predictor with default thresholds.
///
/// `horizon_ms` is the default prediction horizon used by
/// `ht_predictor_predict` when it is passed a negative horizon.
#[no_mangle]
pub extern "C" fn ht_predictor_new(mode: InteractionMode, horizon_ms: f64) -> *mut HtPredictor {
    let prediction = PredictionConfig {
        interaction_mode: mode,
        horizon_ms: if horizon_ms.is_finite() && horizon_ms >= 0.0 {
            horizon_ms
        } else {
            PredictionConfig::default().horizon_ms
        },
        ..PredictionConfig::default()
    };
    Box::into_raw(Box::new(HtPredictor(MotionModel::new(MotionConfig::default(), prediction))))
}

/// Free a predictor.
///
/// # Safety
/// `predictor` must be a pointer returned by `ht_predictor_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_free(predictor: *mut HtPredictor) {
    if !predictor.is_null() {
        drop(Box::from_raw(predictor));
    }
}

/// Feed one observed pose. Returns 0 on success, -1 on error.
///
/// # Safety
/// `predictor` and `pose` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_add_pose(predictor: *const HtPredictor, pose: *const HtPose) -> c_int {
    if predictor.is_null() || pose.is_null() {
        return -1;
    }
    match (*pose).to_pose() {
        Ok(p) => {
            (*predictor).0.add_pose(p);
            0
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Predict `horizon_ms` ahead of the latest pose (negative = configured
/// horizon plus latency compensation). Returns 0 on success, -1 when no pose
/// has been added yet.
///
/// # Safety
/// `predictor` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_predict(
    predictor: *const HtPredictor,
    horizon_ms: f64,
    out: *mut HtPose,
) -> c_int {
    if predictor.is_null() || out.is_null() {
        return -1;
    }
    let model = &(*predictor).0;
    let predicted = if horizon_ms < 0.0 {
        model.predicted_pose()
    } else {
        model.predict_pose(horizon_ms)
    };
    write_pose(predicted.as_ref(), out)
}

/// Switch the interaction mode.
///
/// # Safety
/// `predictor` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_set_mode(predictor: *const HtPredictor, mode: InteractionMode) {
    if !predictor.is_null() {
        (*predictor).0.set_interaction_mode(mode);
    }
}

/// Drop the pose history.
///
/// # Safety
/// `predictor` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_reset(predictor: *const HtPredictor) {
    if !predictor.is_null() {
        (*predictor).0.reset();
    }
}

/// Current motion classification. A null handle reads as stationary.
///
/// # Safety
/// `predictor` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_predictor_headset_state(predictor: *const HtPredictor) -> HeadsetState {
    if predictor.is_null() {
        return HeadsetState::Stationary;
    }
    (*predictor).0.headset_state()
}

/// Hand a tracker to C. Free it with `ht_tracker_free`.
pub fn ht_tracker_into_raw(tracker: HeadTracker) -> *mut HtTracker {
    Box::into_raw(Box::new(HtTracker(tracker)))
}

/// Stop a tracker and free its resources.
///
/// # Safety
/// `tracker` must be a pointer returned by `ht_tracker_into_raw`, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_tracker_free(tracker: *mut HtTracker) {
    if !tracker.is_null() {
        drop(Box::from_raw(tracker));
    }
}

/// Render-time prediction `horizon_ms` ahead (negative = configured horizon).
/// Returns 0 on success, -1 before the first fused pose.
///
/// # Safety
/// `tracker` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ht_tracker_predict(tracker: *const HtTracker, horizon_ms: f64, out: *mut HtPose) -> c_int {
    if tracker.is_null() || out.is_null() {
        return -1;
    }
    let tracker = &(*tracker).0;
    let predicted = if horizon_ms < 0.0 {
        tracker.predicted_pose()
    } else {
        tracker.predict_pose(horizon_ms)
    };
    write_pose(predicted.as_ref(), out)
}

/// Latest fused pose. `quality` may be null. Returns 0 on success, -1 before
/// the first fused pose.
///
/// # Safety
/// `tracker` and `out` must be valid pointers, or null; `quality` must be
/// valid or null.
#[no_mangle]
pub unsafe extern "C" fn ht_tracker_current_pose(
    tracker: *const HtTracker,
    out: *mut HtPose,
    quality: *mut FusionQuality,
) -> c_int {
    if tracker.is_null() || out.is_null() {
        return -1;
    }
    let fused = (*tracker).0.current_pose();
    if let (Some(f), false) = (fused.as_ref(), quality.is_null()) {
        quality.write(f.quality);
    }
    write_pose(fused.as_ref().map(|f| &f.pose), out)
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next headtrack API call.
#[no_mangle]
pub extern "C" fn ht_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

unsafe fn write_pose(pose: Option<&Pose>, out: *mut HtPose) -> c_int {
    match pose {
        Some(p) => {
            out.write(HtPose::from(p));
            0
        }
        None => {
            LAST_ERROR.set(&TrackingError::TrackingLost);
            -1
        }
    }
}
