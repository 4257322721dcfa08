//! Contracts for the kernel-level collaborators the pipeline consumes.
//!
//! Camera and IMU drivers are byte/buffer oriented so that a V4L2 device,
//! an I²C bridge or the synthetic drivers in [`crate::sim`] can all sit
//! behind the same trait objects.

use crate::protocol::{self, SensorReport};
use crate::types::{CameraCaps, ImageView, OperationMode, PixelFormat};
use crate::{Result, TrackingError};
use std::path::Path;
use std::time::Duration;

/// Cross-process buffer handle (e.g. a dma-buf file descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub fd: i32,
    pub offset: usize,
    pub len: usize,
}

/// Stream format requested by the pipeline and negotiated by the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
    pub fps: f64,
}

impl StreamFormat {
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.stride, self.height)
    }
}

/// Metadata of one dequeued exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capture {
    /// Exposure time in seconds on the pipeline clock.
    pub timestamp_s: f64,
}

/// Per-device camera primitives.
pub trait CameraDriver: Send {
    /// Device path or name, used in log and error messages.
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    /// Negotiate the closest supported format to `requested`.
    fn configure(&mut self, requested: &StreamFormat) -> Result<StreamFormat>;

    fn capabilities(&self) -> CameraCaps;

    /// Export the buffer backing pool slot `slot` for zero-copy consumers.
    fn export_buffer(&mut self, _slot: usize, _len: usize) -> Option<BufferHandle> {
        None
    }

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Fill `dst` (the memory of pool slot `slot`) with the next exposure.
    /// Returns `Ok(None)` when no frame arrived within `timeout`.
    fn dequeue(&mut self, slot: usize, dst: &mut [u8], timeout: Duration) -> Result<Option<Capture>>;
}

/// Byte-level access to a fused 9-axis IMU chip.
pub trait ImuDriver: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read one packet into `buf`. Returns 0 on timeout.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Report-level transport over an [`ImuDriver`].
pub struct ImuTransport {
    driver: Box<dyn ImuDriver>,
    buf: [u8; protocol::MAX_PACKET_SIZE],
}

impl ImuTransport {
    pub fn new(driver: Box<dyn ImuDriver>) -> Self {
        Self {
            driver,
            buf: [0u8; protocol::MAX_PACKET_SIZE],
        }
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn open(&mut self) -> Result<()> {
        self.driver
            .open()
            .map_err(|e| TrackingError::DeviceUnavailable(format!("{}: {}", self.driver.name(), e)))
    }

    /// Enable the reports of `mode` at `rate_hz` and disable the others.
    pub fn configure(&mut self, mode: OperationMode, rate_hz: u32) -> Result<()> {
        let enabled = protocol::reports_for_mode(mode);
        let all = [
            OperationMode::Raw,
            OperationMode::FusedOrientation,
            OperationMode::VrStabilized,
        ];
        for other in all {
            for &report in protocol::reports_for_mode(other) {
                if !enabled.contains(&report) {
                    self.write(&protocol::build_set_feature(report, 0))?;
                }
            }
        }
        let interval = protocol::interval_us(rate_hz);
        for &report in enabled {
            self.write(&protocol::build_set_feature(report, interval))?;
        }
        log::debug!(
            "{}: configured {:?} at {} Hz ({} reports)",
            self.driver.name(),
            mode,
            rate_hz,
            enabled.len()
        );
        Ok(())
    }

    /// Liveness probe.
    pub fn probe(&mut self) -> Result<()> {
        self.write(&protocol::build_product_id_request())
    }

    /// Read one packet and decode its reports. Empty on timeout.
    pub fn read_reports(&mut self, timeout: Duration) -> Result<Vec<SensorReport>> {
        let len = self
            .driver
            .read(&mut self.buf, timeout)
            .map_err(|e| TrackingError::InertialCommError(e.to_string()))?;
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(protocol::parse_reports(&self.buf[..len]))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.driver
            .write(data)
            .map_err(|e| TrackingError::InertialCommError(format!("write failed: {}", e)))
    }
}

/// Element storage of a quantized tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    /// Already real-valued (software backend); scale and zero point are ignored.
    F32(Vec<f32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape and quantization parameters of a model output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub scale: f32,
    pub zero_point: i32,
}

/// One model output tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

impl QuantizedTensor {
    /// Real value of element `index`: `(stored - zero_point) * scale`.
    #[inline]
    pub fn dequantize(&self, index: usize) -> f32 {
        match &self.data {
            TensorData::U8(v) => (v[index] as i32 - self.spec.zero_point) as f32 * self.spec.scale,
            TensorData::I8(v) => (v[index] as i32 - self.spec.zero_point) as f32 * self.spec.scale,
            TensorData::F32(v) => v[index],
        }
    }
}

/// What the runtime reports about a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub input_width: u32,
    pub input_height: u32,
    /// `[1, Hc, Wc, cells² + 1]`, channel-last logits.
    pub keypoints: TensorSpec,
    /// `[1, D, Hc, Wc]`, channel-first descriptors.
    pub descriptors: TensorSpec,
}

/// Raw outputs of one inference.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    pub keypoints: QuantizedTensor,
    pub descriptors: QuantizedTensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Accelerator,
    Software,
}

/// Hardware tensor accelerator runtime.
pub trait InferenceBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Load a keypoint/descriptor model compiled for `width x height` input.
    fn load(&mut self, model_path: &Path, width: u32, height: u32) -> Result<ModelInfo>;

    /// Whether `infer_direct` can consume buffer handles without a host copy.
    fn supports_direct_buffer(&self) -> bool {
        false
    }

    /// Run on a grayscale host image of the model's input size.
    fn infer(&mut self, input: &ImageView<'_>) -> Result<ModelOutputs>;

    /// Run on a buffer the accelerator can map directly.
    fn infer_direct(
        &mut self,
        handle: &BufferHandle,
        _width: u32,
        _height: u32,
        _stride: usize,
    ) -> Result<ModelOutputs> {
        Err(TrackingError::UnsupportedFormat(format!(
            "direct buffer fd={} not supported by this backend",
            handle.fd
        )))
    }
}
