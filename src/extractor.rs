//! Keypoint and descriptor extraction.
//!
//! The network emits two quantized tensors: channel-last keypoint logits
//! `[1, Hc, Wc, cells² + 1]` (the last channel is the "no keypoint" dustbin)
//! and channel-first descriptors `[1, D, Hc, Wc]`. Decoding dequantizes,
//! applies a per-cell softmax, thresholds, suppresses non-maxima, maps
//! positions back to the full-resolution image and samples unit-norm
//! descriptors bilinearly from the coarse grid.
//!
//! [`SoftwareBackend`] produces tensors of the same contract from a Harris
//! response and intensity-comparison descriptors, so the decoder does not
//! care which backend ran.

use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::FrameBuffer;
use crate::config::ExtractorConfig;
use crate::driver::{
    BackendKind, BufferHandle, InferenceBackend, ModelInfo, ModelOutputs, QuantizedTensor, TensorData, TensorSpec,
};
use crate::error::TrackingError;
use crate::map::normalize;
use crate::types::{CameraId, FeatureSet, ImageView, Keypoint, PixelFormat};
use crate::Result;

/// Sub-window of the full-resolution image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

/// Keypoints and their descriptors, not yet tied to a camera frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    pub keypoints: Vec<Keypoint>,
    /// Row-major `keypoints.len() x descriptor_dim`, unit-norm rows.
    pub descriptors: Vec<f32>,
    pub descriptor_dim: usize,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn into_feature_set(self, camera_id: CameraId, frame_id: u64, timestamp_s: f64) -> FeatureSet {
        FeatureSet {
            camera_id,
            frame_id,
            timestamp_s,
            keypoints: self.keypoints,
            descriptors: self.descriptors,
            descriptor_dim: self.descriptor_dim,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtractionStats {
    pub frames: u64,
    /// Frames that went through the zero-copy path.
    pub direct_frames: u64,
    pub last_inference: Duration,
    pub last_decode: Duration,
    pub last_keypoints: usize,
}

/// Tensor geometry derived from [`ModelInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    hc: usize,
    wc: usize,
    cell: usize,
    channels: usize,
    dim: usize,
}

impl Layout {
    fn from_model(info: &ModelInfo) -> Result<Self> {
        let kp = &info.keypoints.shape;
        if kp.len() != 4 || kp[0] != 1 || kp[3] < 2 {
            return Err(mismatch("keypoints", "[1, Hc, Wc, cells² + 1]".into(), kp));
        }
        let (hc, wc, channels) = (kp[1], kp[2], kp[3]);
        let cell = ((channels - 1) as f64).sqrt().round() as usize;
        if cell == 0 || cell * cell + 1 != channels {
            return Err(mismatch("keypoints", "cells² + 1 channels".into(), kp));
        }
        let desc = &info.descriptors.shape;
        if desc.len() != 4 || desc[0] != 1 || desc[1] == 0 || desc[2] != hc || desc[3] != wc {
            return Err(mismatch("descriptors", format!("[1, D, {}, {}]", hc, wc), desc));
        }
        if wc * cell != info.input_width as usize || hc * cell != info.input_height as usize {
            return Err(TrackingError::TensorShapeMismatch {
                tensor: "keypoints",
                expected: format!("{}x{} input", info.input_width, info.input_height),
                actual: format!("{}x{} cells of {} px", wc, hc, cell),
            });
        }
        Ok(Self {
            hc,
            wc,
            cell,
            channels,
            dim: desc[1],
        })
    }

    fn width(&self) -> usize {
        self.wc * self.cell
    }

    fn height(&self) -> usize {
        self.hc * self.cell
    }

    fn keypoint_shape(&self) -> [usize; 4] {
        [1, self.hc, self.wc, self.channels]
    }

    fn descriptor_shape(&self) -> [usize; 4] {
        [1, self.dim, self.hc, self.wc]
    }
}

fn mismatch(tensor: &'static str, expected: String, actual: &[usize]) -> TrackingError {
    TrackingError::TensorShapeMismatch {
        tensor,
        expected,
        actual: format!("{:?}", actual),
    }
}

fn check_tensor(tensor: &'static str, t: &QuantizedTensor, shape: [usize; 4]) -> Result<()> {
    let len: usize = shape.iter().product();
    if t.spec.shape != shape || t.data.len() != len {
        return Err(TrackingError::TensorShapeMismatch {
            tensor,
            expected: format!("{:?} ({} elements)", shape, len),
            actual: format!("{:?} ({} elements)", t.spec.shape, t.data.len()),
        });
    }
    Ok(())
}

/// Everything the decoder needs besides the tensors.
#[derive(Debug, Clone, Copy)]
struct DecodeParams {
    threshold: f32,
    /// In model pixels.
    nms_radius: usize,
    max_features: usize,
    /// In output pixels.
    border: f32,
    roi: Option<Roi>,
    out_width: f32,
    out_height: f32,
}

fn decode(outputs: &ModelOutputs, layout: &Layout, params: &DecodeParams) -> Result<Extraction> {
    check_tensor("keypoints", &outputs.keypoints, layout.keypoint_shape())?;
    check_tensor("descriptors", &outputs.descriptors, layout.descriptor_shape())?;

    let (w, h) = (layout.width(), layout.height());
    let cells = layout.cell * layout.cell;
    let mut heat = vec![0.0f32; w * h];
    let mut logits = vec![0.0f32; layout.channels];
    for cy in 0..layout.hc {
        for cx in 0..layout.wc {
            let base = (cy * layout.wc + cx) * layout.channels;
            for (k, l) in logits.iter_mut().enumerate() {
                *l = outputs.keypoints.dequantize(base + k);
            }
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
            for (k, l) in logits.iter().take(cells).enumerate() {
                let y = cy * layout.cell + k / layout.cell;
                let x = cx * layout.cell + k % layout.cell;
                heat[y * w + x] = (l - max).exp() / sum;
            }
        }
    }

    let sx = params.out_width / w as f32;
    let sy = params.out_height / h as f32;
    let to_out = |x: usize, y: usize| ((x as f32 + 0.5) * sx - 0.5, (y as f32 + 0.5) * sy - 0.5);

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let p = heat[y * w + x];
            if p < params.threshold {
                continue;
            }
            let (ox, oy) = to_out(x, y);
            if ox < params.border
                || oy < params.border
                || ox >= params.out_width - params.border
                || oy >= params.out_height - params.border
            {
                continue;
            }
            if params.roi.is_some_and(|roi| !roi.contains(ox, oy)) {
                continue;
            }
            candidates.push((p, x, y));
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let r = params.nms_radius;
    let mut suppressed = vec![false; w * h];
    let mut kept: Vec<(f32, usize, usize)> = Vec::new();
    for (p, x, y) in candidates {
        if kept.len() >= params.max_features {
            break;
        }
        if suppressed[y * w + x] {
            continue;
        }
        kept.push((p, x, y));
        for yy in y.saturating_sub(r)..(y + r + 1).min(h) {
            for xx in x.saturating_sub(r)..(x + r + 1).min(w) {
                suppressed[yy * w + xx] = true;
            }
        }
    }

    let dim = layout.dim;
    let plane = layout.hc * layout.wc;
    let mut keypoints = Vec::with_capacity(kept.len());
    let mut descriptors = Vec::with_capacity(kept.len() * dim);
    let cell = layout.cell as f32;
    for (p, x, y) in kept {
        let gx = ((x as f32 + 0.5) / cell - 0.5).clamp(0.0, (layout.wc - 1) as f32);
        let gy = ((y as f32 + 0.5) / cell - 0.5).clamp(0.0, (layout.hc - 1) as f32);
        let (x0, y0) = (gx.floor() as usize, gy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(layout.wc - 1), (y0 + 1).min(layout.hc - 1));
        let (fx, fy) = (gx - x0 as f32, gy - y0 as f32);
        let weights = [
            (y0 * layout.wc + x0, (1.0 - fx) * (1.0 - fy)),
            (y0 * layout.wc + x1, fx * (1.0 - fy)),
            (y1 * layout.wc + x0, (1.0 - fx) * fy),
            (y1 * layout.wc + x1, fx * fy),
        ];
        let start = descriptors.len();
        for d in 0..dim {
            let v: f32 = weights
                .iter()
                .map(|&(idx, wgt)| wgt * outputs.descriptors.dequantize(d * plane + idx))
                .sum();
            descriptors.push(v);
        }
        let row = &mut descriptors[start..];
        if row.iter().all(|v| v.abs() <= f32::EPSILON) {
            row.fill(1.0 / (dim as f32).sqrt());
        } else {
            normalize(row);
        }

        let (ox, oy) = to_out(x, y);
        keypoints.push(Keypoint {
            x: ox,
            y: oy,
            response: p,
            scale: cell * sx.max(sy),
        });
    }

    Ok(Extraction {
        keypoints,
        descriptors,
        descriptor_dim: dim,
    })
}

/// Runs one backend and decodes its outputs.
pub struct FeatureExtractor {
    config: ExtractorConfig,
    backend: Box<dyn InferenceBackend>,
    info: ModelInfo,
    layout: Layout,
    roi: Option<Roi>,
    stats: ExtractionStats,
    /// Model-sized grayscale copy for host inputs that need resampling.
    scratch: Vec<u8>,
}

impl FeatureExtractor {
    /// Load the model on `accelerator`. Without an accelerator, or when the
    /// load fails and fallback is allowed, the software backend is used.
    pub fn initialize(config: ExtractorConfig, accelerator: Option<Box<dyn InferenceBackend>>) -> Result<Self> {
        let (backend, info) = match accelerator {
            Some(mut backend) => match backend.load(&config.model_path, config.width, config.height) {
                Ok(info) => (backend, info),
                Err(e) if config.allow_software_fallback => {
                    warn!(
                        "extractor: accelerator failed to load {}: {}, using software backend",
                        config.model_path.display(),
                        e
                    );
                    Self::software(&config)?
                }
                Err(e) => {
                    return Err(match e {
                        TrackingError::ModelLoadFailure(_) | TrackingError::TensorShapeMismatch { .. } => e,
                        other => TrackingError::ModelLoadFailure(other.to_string()),
                    })
                }
            },
            None if config.allow_software_fallback => {
                info!("extractor: no accelerator, using software backend");
                Self::software(&config)?
            }
            None => {
                return Err(TrackingError::ModelLoadFailure(
                    "no accelerator available and software fallback disabled".into(),
                ))
            }
        };
        let layout = Layout::from_model(&info)?;
        debug!(
            "extractor: {:?} backend, {}x{} input, {} px cells, {}-d descriptors",
            backend.kind(),
            info.input_width,
            info.input_height,
            layout.cell,
            layout.dim
        );
        Ok(Self {
            config,
            backend,
            info,
            layout,
            roi: None,
            stats: ExtractionStats::default(),
            scratch: Vec::new(),
        })
    }

    fn software(config: &ExtractorConfig) -> Result<(Box<dyn InferenceBackend>, ModelInfo)> {
        let mut backend: Box<dyn InferenceBackend> = Box::new(SoftwareBackend::new());
        let info = backend.load(&config.model_path, config.width, config.height)?;
        Ok((backend, info))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn descriptor_dim(&self) -> usize {
        self.layout.dim
    }

    pub fn stats(&self) -> ExtractionStats {
        self.stats
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Restrict detections to a sub-window of the full-resolution image.
    pub fn set_roi(&mut self, roi: Roi) {
        self.roi = Some(roi);
    }

    pub fn clear_roi(&mut self) {
        self.roi = None;
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Extract from a host image of any size and pixel format. Keypoints are
    /// returned in the image's own pixel coordinates.
    pub fn extract(&mut self, image: &ImageView<'_>) -> Result<Extraction> {
        if !image.is_valid() {
            return Err(TrackingError::UnsupportedFormat(format!(
                "{}x{} image with stride {} and {} bytes",
                image.width,
                image.height,
                image.stride,
                image.data.len()
            )));
        }
        let (w, h) = (self.layout.width(), self.layout.height());
        let started = Instant::now();
        let outputs = if image.format == PixelFormat::Gray8 && image.width as usize == w && image.height as usize == h {
            self.backend.infer(image)?
        } else {
            resample_gray(image, w, h, &mut self.scratch);
            let view = ImageView::gray(&self.scratch, w as u32, h as u32);
            self.backend.infer(&view)?
        };
        self.finish(&outputs, started, image.width, image.height, false)
    }

    /// Zero-copy path: the accelerator maps `handle` itself. The buffer must be
    /// 8-bit grayscale at the model's input size, with `stride * height` bytes
    /// behind the handle.
    pub fn extract_direct_buffer(
        &mut self,
        handle: &BufferHandle,
        width: u32,
        height: u32,
        stride: usize,
    ) -> Result<Extraction> {
        if !self.backend.supports_direct_buffer() {
            return Err(TrackingError::UnsupportedFormat(format!(
                "{:?} backend cannot map buffer handles",
                self.backend.kind()
            )));
        }
        if width != self.info.input_width || height != self.info.input_height {
            return Err(TrackingError::UnsupportedFormat(format!(
                "direct buffer is {}x{}, model expects {}x{}",
                width, height, self.info.input_width, self.info.input_height
            )));
        }
        if stride < width as usize {
            return Err(TrackingError::InvalidParameter(format!(
                "direct buffer stride {} is below width {}",
                stride, width
            )));
        }
        let needed = stride.checked_mul(height as usize).unwrap_or(usize::MAX);
        if needed > handle.len {
            return Err(TrackingError::InvalidParameter(format!(
                "direct buffer holds {} bytes, {} rows of stride {} need {}",
                handle.len, height, stride, needed
            )));
        }
        let started = Instant::now();
        let outputs = self.backend.infer_direct(handle, width, height, stride)?;
        self.finish(&outputs, started, width, height, true)
    }

    /// Extract from a captured frame, taking the zero-copy path when the
    /// frame, the format and the backend allow it.
    pub fn extract_frame(&mut self, frame: &FrameBuffer) -> Result<FeatureSet> {
        let format = frame.format();
        let direct = frame.handle().filter(|_| {
            self.backend.supports_direct_buffer()
                && format.format == PixelFormat::Gray8
                && format.width == self.info.input_width
                && format.height == self.info.input_height
        });
        let extraction = match direct {
            Some(handle) => self.extract_direct_buffer(&handle, format.width, format.height, format.stride)?,
            None => self.extract(&frame.image())?,
        };
        Ok(extraction.into_feature_set(frame.camera_id(), frame.frame_id(), frame.timestamp_s()))
    }

    fn finish(
        &mut self,
        outputs: &ModelOutputs,
        started: Instant,
        out_width: u32,
        out_height: u32,
        direct: bool,
    ) -> Result<Extraction> {
        let inferred = Instant::now();
        let scale = (out_width as f32 / self.layout.width() as f32).max(out_height as f32 / self.layout.height() as f32);
        let params = DecodeParams {
            threshold: self.config.confidence_threshold,
            nms_radius: (self.config.nms_radius as f32 / scale).round() as usize,
            max_features: self.config.max_features,
            border: self.config.border as f32,
            roi: self.roi,
            out_width: out_width as f32,
            out_height: out_height as f32,
        };
        let extraction = decode(outputs, &self.layout, &params)?;
        self.stats.frames += 1;
        if direct {
            self.stats.direct_frames += 1;
        }
        self.stats.last_inference = inferred - started;
        self.stats.last_decode = inferred.elapsed();
        self.stats.last_keypoints = extraction.len();
        Ok(extraction)
    }
}

/// Bilinear resample of any pixel format to packed grayscale.
fn resample_gray(image: &ImageView<'_>, width: usize, height: usize, out: &mut Vec<u8>) {
    out.resize(width * height, 0);
    let sx = image.width as f32 / width as f32;
    let sy = image.height as f32 / height as f32;
    for y in 0..height {
        let src_y = (y as f32 + 0.5) * sy - 0.5;
        for x in 0..width {
            let src_x = (x as f32 + 0.5) * sx - 0.5;
            out[y * width + x] = image.luma_bilinear(src_x, src_y).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// One-pixel cells: the per-cell softmax becomes a per-pixel sigmoid, so no
/// grid alignment decides which corners survive and descriptors are read at
/// the keypoint itself.
const SOFTWARE_CELL: usize = 1;
const SOFTWARE_DIM: usize = 64;
/// Comparison offsets follow a triangular distribution on `[-R, R]`.
const PATTERN_RADIUS: f32 = 8.0;
const PATTERN_SEED: u64 = 0x5eed_f00d;
const HARRIS_K: f32 = 0.04;
/// Responses are normalized by at least this, so flat noise stays below threshold.
const HARRIS_FLOOR: f32 = 1.0e6;
/// Keypoint probabilities are kept inside `[P, 1 - P]` before taking log-odds.
const MIN_PROBABILITY: f32 = 1.0e-4;
const DUSTBIN_LOGIT: f32 = 0.0;

/// CPU implementation of the keypoint/descriptor contract.
///
/// The keypoint probability of a pixel is the square root of its Harris
/// response over the image maximum, emitted as log-odds against a zero
/// dustbin. Descriptors are soft intensity comparisons over a fixed random
/// pattern centred on the pixel. They are only computed where the response
/// is positive; other pixels cannot pass a usable threshold.
pub struct SoftwareBackend {
    width: usize,
    height: usize,
    pattern: Vec<[(f32, f32); 2]>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            pattern: Vec::new(),
        }
    }

    fn harris(&self, image: &ImageView<'_>) -> Vec<f32> {
        let (w, h) = (self.width, self.height);
        let gray: Vec<f32> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| image.luma(x, y) as f32)
            .collect();
        let at = |x: usize, y: usize| gray[y * w + x];

        let mut ixx = vec![0.0f32; w * h];
        let mut iyy = vec![0.0f32; w * h];
        let mut ixy = vec![0.0f32; w * h];
        for y in 1..h.saturating_sub(1) {
            for x in 1..w.saturating_sub(1) {
                let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                    - at(x - 1, y - 1)
                    - 2.0 * at(x - 1, y)
                    - at(x - 1, y + 1))
                    / 8.0;
                let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                    - at(x - 1, y - 1)
                    - 2.0 * at(x, y - 1)
                    - at(x + 1, y - 1))
                    / 8.0;
                let i = y * w + x;
                ixx[i] = gx * gx;
                iyy[i] = gy * gy;
                ixy[i] = gx * gy;
            }
        }

        let mut response = vec![0.0f32; w * h];
        for y in 2..h.saturating_sub(2) {
            for x in 2..w.saturating_sub(2) {
                let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
                for yy in y - 2..=y + 2 {
                    for xx in x - 2..=x + 2 {
                        let i = yy * w + xx;
                        a += ixx[i];
                        b += iyy[i];
                        c += ixy[i];
                    }
                }
                let trace = a + b;
                response[y * w + x] = a * b - c * c - HARRIS_K * trace * trace;
            }
        }
        response
    }

    fn describe(&self, input: &ImageView<'_>, x: usize, y: usize, out: &mut [f32], stride: usize) {
        let (cx, cy) = (x as f32, y as f32);
        for (d, [a, b]) in self.pattern.iter().enumerate() {
            let va = input.luma_bilinear(cx + a.0, cy + a.1);
            let vb = input.luma_bilinear(cx + b.0, cy + b.1);
            out[d * stride] = ((va - vb) / 32.0).clamp(-1.0, 1.0);
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn load(&mut self, _model_path: &Path, width: u32, height: u32) -> Result<ModelInfo> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 {
            return Err(TrackingError::ModelLoadFailure(format!(
                "software backend needs a non-empty input, got {}x{}",
                width, height
            )));
        }
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut coordinate = || (rng.gen_range(-1.0f32..1.0) + rng.gen_range(-1.0f32..1.0)) * PATTERN_RADIUS / 2.0;
        self.pattern = (0..SOFTWARE_DIM)
            .map(|_| [(coordinate(), coordinate()), (coordinate(), coordinate())])
            .collect();
        self.width = w;
        self.height = h;

        let (hc, wc) = (h / SOFTWARE_CELL, w / SOFTWARE_CELL);
        Ok(ModelInfo {
            input_width: width,
            input_height: height,
            keypoints: TensorSpec {
                shape: vec![1, hc, wc, SOFTWARE_CELL * SOFTWARE_CELL + 1],
                scale: 1.0,
                zero_point: 0,
            },
            descriptors: TensorSpec {
                shape: vec![1, SOFTWARE_DIM, hc, wc],
                scale: 1.0,
                zero_point: 0,
            },
        })
    }

    fn infer(&mut self, input: &ImageView<'_>) -> Result<ModelOutputs> {
        if self.pattern.is_empty() {
            return Err(TrackingError::ModelLoadFailure("software backend not loaded".into()));
        }
        if input.width as usize != self.width || input.height as usize != self.height {
            return Err(TrackingError::UnsupportedFormat(format!(
                "software backend expects {}x{}, got {}x{}",
                self.width, self.height, input.width, input.height
            )));
        }
        let (w, h) = (self.width, self.height);
        let plane = w * h;

        let response = self.harris(input);
        let norm = response.iter().copied().fold(HARRIS_FLOOR, f32::max);
        let mut logits = vec![0.0f32; plane * 2];
        let mut desc = vec![0.0f32; SOFTWARE_DIM * plane];
        for y in 0..h {
            for x in 0..w {
                let i = y * w + x;
                let r = response[i];
                let p = (r.max(0.0) / norm).sqrt().clamp(MIN_PROBABILITY, 1.0 - MIN_PROBABILITY);
                logits[2 * i] = (p / (1.0 - p)).ln();
                logits[2 * i + 1] = DUSTBIN_LOGIT;
                if r > 0.0 {
                    self.describe(input, x, y, &mut desc[i..], plane);
                }
            }
        }

        Ok(ModelOutputs {
            keypoints: QuantizedTensor {
                spec: TensorSpec {
                    shape: vec![1, h, w, 2],
                    scale: 1.0,
                    zero_point: 0,
                },
                data: TensorData::F32(logits),
            },
            descriptors: QuantizedTensor {
                spec: TensorSpec {
                    shape: vec![1, SOFTWARE_DIM, h, w],
                    scale: 1.0,
                    zero_point: 0,
                },
                data: TensorData::F32(desc),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::descriptor_distance;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use std::path::PathBuf;

    /// Accelerator stand-in with uint8 outputs and a fixed hot cell.
    struct FakeAccelerator {
        fail_load: bool,
        direct: bool,
        hc: usize,
        wc: usize,
        dim: usize,
    }

    impl FakeAccelerator {
        fn new() -> Self {
            Self {
                fail_load: false,
                direct: true,
                hc: 3,
                wc: 4,
                dim: 16,
            }
        }

        fn outputs(&self) -> ModelOutputs {
            let channels = 65;
            // Quantized logits: zero point 82, scale 0.27; everything at the
            // dustbin except pixel (5, 3) of cell (1, 2).
            let mut kp = vec![82u8; self.hc * self.wc * channels];
            for cell in 0..self.hc * self.wc {
                kp[cell * channels + 64] = 100;
            }
            let hot = (self.wc + 2) * channels + 3 * 8 + 5;
            kp[hot] = 140;
            let desc: Vec<i8> = (0..self.dim * self.hc * self.wc).map(|i| (i % 7) as i8 - 2).collect();
            ModelOutputs {
                keypoints: QuantizedTensor {
                    spec: TensorSpec {
                        shape: vec![1, self.hc, self.wc, channels],
                        scale: 0.269038,
                        zero_point: 82,
                    },
                    data: TensorData::U8(kp),
                },
                descriptors: QuantizedTensor {
                    spec: TensorSpec {
                        shape: vec![1, self.dim, self.hc, self.wc],
                        scale: 0.002378,
                        zero_point: -2,
                    },
                    data: TensorData::I8(desc),
                },
            }
        }
    }

    impl InferenceBackend for FakeAccelerator {
        fn kind(&self) -> BackendKind {
            BackendKind::Accelerator
        }

        fn load(&mut self, _model_path: &Path, width: u32, height: u32) -> Result<ModelInfo> {
            if self.fail_load {
                return Err(TrackingError::ModelLoadFailure("no such model".into()));
            }
            Ok(ModelInfo {
                input_width: width,
                input_height: height,
                keypoints: TensorSpec {
                    shape: vec![1, self.hc, self.wc, 65],
                    scale: 0.269038,
                    zero_point: 82,
                },
                descriptors: TensorSpec {
                    shape: vec![1, self.dim, self.hc, self.wc],
                    scale: 0.002378,
                    zero_point: -2,
                },
            })
        }

        fn supports_direct_buffer(&self) -> bool {
            self.direct
        }

        fn infer(&mut self, _input: &ImageView<'_>) -> Result<ModelOutputs> {
            Ok(self.outputs())
        }

        fn infer_direct(&mut self, _handle: &BufferHandle, _w: u32, _h: u32, _stride: usize) -> Result<ModelOutputs> {
            Ok(self.outputs())
        }
    }

    fn config(width: u32, height: u32) -> ExtractorConfig {
        ExtractorConfig {
            model_path: PathBuf::from("model.bin"),
            width,
            height,
            border: 0,
            ..ExtractorConfig::default()
        }
    }

    /// Dark image with bright axis-aligned squares.
    fn squares(width: usize, height: usize, rects: &[(usize, usize, usize)]) -> Vec<u8> {
        let mut img = vec![20u8; width * height];
        for &(x0, y0, size) in rects {
            for y in y0..(y0 + size).min(height) {
                for x in x0..(x0 + size).min(width) {
                    img[y * width + x] = 220;
                }
            }
        }
        img
    }

    #[test]
    fn test_quantized_decode_finds_hot_pixel() {
        let mut ex = FeatureExtractor::initialize(config(32, 24), Some(Box::new(FakeAccelerator::new()))).unwrap();
        assert_eq!(ex.backend_kind(), BackendKind::Accelerator);
        let img = vec![0u8; 32 * 24];
        let out = ex.extract(&ImageView::gray(&img, 32, 24)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!((out.keypoints[0].x, out.keypoints[0].y), (21.0, 11.0));
        assert_eq!(out.descriptor_dim, 16);
        let norm: f32 = out.descriptors.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_keypoints_map_to_full_resolution() {
        let mut ex = FeatureExtractor::initialize(config(32, 24), Some(Box::new(FakeAccelerator::new()))).unwrap();
        let img = vec![0u8; 64 * 48];
        let out = ex.extract(&ImageView::gray(&img, 64, 48)).unwrap();
        assert_eq!((out.keypoints[0].x, out.keypoints[0].y), (42.5, 22.5));
        assert_eq!(out.keypoints[0].scale, 16.0);
    }

    #[test]
    fn test_roi_filters_keypoints() {
        let mut ex = FeatureExtractor::initialize(config(32, 24), Some(Box::new(FakeAccelerator::new()))).unwrap();
        let img = vec![0u8; 32 * 24];
        ex.set_roi(Roi {
            x: 0.0,
            y: 0.0,
            width: 16.0,
            height: 24.0,
        });
        assert!(ex.extract(&ImageView::gray(&img, 32, 24)).unwrap().is_empty());
        ex.clear_roi();
        assert_eq!(ex.extract(&ImageView::gray(&img, 32, 24)).unwrap().len(), 1);
    }

    #[test]
    fn test_direct_buffer_path() {
        let mut ex = FeatureExtractor::initialize(config(32, 24), Some(Box::new(FakeAccelerator::new()))).unwrap();
        let handle = BufferHandle {
            fd: 7,
            offset: 0,
            len: 32 * 24,
        };
        assert_eq!(ex.extract_direct_buffer(&handle, 32, 24, 32).unwrap().len(), 1);
        assert_eq!(ex.stats().direct_frames, 1);
        assert!(matches!(
            ex.extract_direct_buffer(&handle, 64, 48, 64),
            Err(TrackingError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_short_direct_buffer_is_rejected() {
        let mut ex = FeatureExtractor::initialize(config(32, 24), Some(Box::new(FakeAccelerator::new()))).unwrap();
        let short = BufferHandle {
            fd: 7,
            offset: 0,
            len: 32 * 23,
        };
        assert!(matches!(
            ex.extract_direct_buffer(&short, 32, 24, 32),
            Err(TrackingError::InvalidParameter(_))
        ));
        let padded = BufferHandle {
            fd: 7,
            offset: 0,
            len: 40 * 24 - 1,
        };
        assert!(matches!(
            ex.extract_direct_buffer(&padded, 32, 24, 40),
            Err(TrackingError::InvalidParameter(_))
        ));
        let full = BufferHandle { len: 32 * 24, ..short };
        assert!(matches!(
            ex.extract_direct_buffer(&full, 32, 24, 16),
            Err(TrackingError::InvalidParameter(_))
        ));
        assert_eq!(ex.stats().direct_frames, 0);
        assert_eq!(ex.extract_direct_buffer(&full, 32, 24, 32).unwrap().len(), 1);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let accel = FakeAccelerator {
            dim: 16,
            hc: 3,
            wc: 5,
            ..FakeAccelerator::new()
        };
        let err = FeatureExtractor::initialize(config(32, 24), Some(Box::new(accel))).err().unwrap();
        assert!(matches!(err, TrackingError::TensorShapeMismatch { .. }));
    }

    #[test]
    fn test_load_failure_falls_back_to_software() {
        let accel = FakeAccelerator {
            fail_load: true,
            ..FakeAccelerator::new()
        };
        let ex = FeatureExtractor::initialize(config(64, 48), Some(Box::new(accel))).unwrap();
        assert_eq!(ex.backend_kind(), BackendKind::Software);
        assert_eq!(ex.descriptor_dim(), SOFTWARE_DIM);

        let accel = FakeAccelerator {
            fail_load: true,
            ..FakeAccelerator::new()
        };
        let strict = ExtractorConfig {
            allow_software_fallback: false,
            ..config(64, 48)
        };
        assert!(matches!(
            FeatureExtractor::initialize(strict, Some(Box::new(accel))),
            Err(TrackingError::ModelLoadFailure(_))
        ));
    }

    #[test]
    fn test_software_backend_finds_square_corners() {
        let mut ex = FeatureExtractor::initialize(config(64, 48), None).unwrap();
        let img = squares(64, 48, &[(16, 12, 16)]);
        let out = ex.extract(&ImageView::gray(&img, 64, 48)).unwrap();
        assert!(out.len() >= 4);
        for corner in [(16.0, 12.0), (31.0, 12.0), (16.0, 27.0), (31.0, 27.0)] {
            let nearest = out
                .keypoints
                .iter()
                .map(|k| ((k.x - corner.0).powi(2) + (k.y - corner.1).powi(2)).sqrt())
                .fold(f32::INFINITY, f32::min);
            assert!(nearest < 3.0, "no keypoint near {:?}", corner);
        }
    }

    #[test]
    fn test_software_flat_image_has_no_keypoints() {
        let mut ex = FeatureExtractor::initialize(config(64, 48), None).unwrap();
        let img = vec![128u8; 64 * 48];
        assert!(ex.extract(&ImageView::gray(&img, 64, 48)).unwrap().is_empty());
    }

    #[test]
    fn test_software_descriptors_repeat_under_shift() {
        let mut ex = FeatureExtractor::initialize(config(64, 48), None).unwrap();
        let a = squares(64, 48, &[(16, 16, 12), (40, 8, 6)]);
        let b = squares(64, 48, &[(16, 16, 12), (44, 30, 6)]);
        let fa = ex.extract(&ImageView::gray(&a, 64, 48)).unwrap();
        let fb = ex.extract(&ImageView::gray(&b, 64, 48)).unwrap();
        let find = |f: &Extraction, x: f32, y: f32| {
            f.keypoints
                .iter()
                .position(|k| (k.x - x).abs() < 2.0 && (k.y - y).abs() < 2.0)
        };
        let ia = find(&fa, 16.0, 16.0).unwrap();
        let ib = find(&fb, 16.0, 16.0).unwrap();
        let dim = fa.descriptor_dim;
        let same = descriptor_distance(&fa.descriptors[ia * dim..(ia + 1) * dim], &fb.descriptors[ib * dim..(ib + 1) * dim]);
        assert!(same < 0.5, "distance {}", same);
    }

    #[quickcheck]
    fn prop_software_output_contract(pixels: Vec<u8>, max: u8) -> TestResult {
        if pixels.is_empty() || max == 0 {
            return TestResult::discard();
        }
        let cfg = ExtractorConfig {
            max_features: max as usize % 40 + 1,
            ..config(32, 32)
        };
        let Ok(mut ex) = FeatureExtractor::initialize(cfg.clone(), None) else {
            return TestResult::failed();
        };
        let img: Vec<u8> = pixels.iter().cycle().take(32 * 32).copied().collect();
        let Ok(out) = ex.extract(&ImageView::gray(&img, 32, 32)) else {
            return TestResult::failed();
        };
        let unit = out
            .descriptors
            .chunks(out.descriptor_dim)
            .all(|d| (d.iter().map(|v| v * v).sum::<f32>() - 1.0).abs() < 1e-4);
        let sorted = out.keypoints.windows(2).all(|w| w[0].response >= w[1].response);
        TestResult::from_bool(
            unit && sorted
                && out.len() <= cfg.max_features
                && out.keypoints.iter().all(|k| k.response >= cfg.confidence_threshold)
                && out.descriptors.len() == out.len() * out.descriptor_dim,
        )
    }
}
