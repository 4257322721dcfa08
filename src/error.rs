use crate::types::CameraId;
use std::fmt;

/// Errors raised by the tracking pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Camera {0} not found")]
    CameraNotFound(CameraId),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Model load failed: {0}")]
    ModelLoadFailure(String),

    #[error("Tensor shape mismatch for {tensor}: expected {expected}, got {actual}")]
    TensorShapeMismatch {
        tensor: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Buffer pool exhausted on camera {0}")]
    BufferStarvation(CameraId),

    #[error("Cross-camera synchronization timed out")]
    SynchronizationTimeout,

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Tracking lost: insufficient inliers")]
    TrackingLost,

    #[error("Inertial sensor communication error: {0}")]
    InertialCommError(String),

    #[error("Rig calibration invalid: {0}")]
    CalibrationInvalid(String),

    #[error("Frame buffer does not belong to this pool or was already recycled")]
    InvalidBuffer,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Stream stopped")]
    StreamStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackingError {
    /// Steady-state failures that have a degraded mode or can simply be retried.
    /// Everything else aborts startup of the component that raised it.
    /// `InvalidParameter` is a caller bug and retrying the same call fails again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TrackingError::BufferStarvation(_)
                | TrackingError::SynchronizationTimeout
                | TrackingError::Timeout
                | TrackingError::TrackingLost
                | TrackingError::InertialCommError(_)
                | TrackingError::CalibrationInvalid(_)
        )
    }
}

/// Thread-safe last-error storage.
///
/// Components record recoverable steady-state failures here instead of
/// aborting; the C layer reads it through `ht_last_error()`.
pub(crate) struct LastError {
    message: parking_lot::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: parking_lot::const_mutex(String::new()),
        }
    }

    pub fn set(&self, err: &TrackingError) {
        let mut msg = self.message.lock();
        *msg = fmt::format(format_args!("{}\0", err));
    }

    pub fn clear(&self) {
        self.message.lock().clear();
    }

    /// Latest message without the trailing NUL.
    pub fn message(&self) -> Option<String> {
        let msg = self.message.lock();
        if msg.is_empty() {
            None
        } else {
            Some(msg.trim_end_matches('\0').to_string())
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        let msg = self.message.lock();
        if msg.is_empty() {
            std::ptr::null()
        } else {
            msg.as_ptr() as *const std::ffi::c_char
        }
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::new()
    }
}
