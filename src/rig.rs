//! Camera Rig Model: per-camera intrinsics/extrinsics and projection between
//! any camera and the reference frame.
//!
//! Frames follow the usual camera convention: x right, y down, z forward.
//! Each camera's extrinsic is `T_cam_ref`, mapping reference-frame points into
//! that camera (`p_cam = T_cam_ref * p_ref`). The reference camera's extrinsic
//! is the identity.

use crate::config::CameraConfig;
use crate::types::{CameraId, ImageView, PixelFormat};
use crate::{Result, TrackingError};
use nalgebra::{
    Isometry3, Point3, Quaternion, Translation3, Unit, UnitQuaternion, Vector2, Vector3,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Version written into calibration documents.
pub const CALIBRATION_VERSION: u32 = 1;

/// Sphere radius used when the caller has no depth prior (meters).
pub const DEFAULT_SPHERE_RADIUS_M: f64 = 10.0;

/// Smallest depth a point may have to count as in front of a camera.
const MIN_DEPTH: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Brown-Conrady radial/tangential coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn is_zero(&self) -> bool {
        *self == Distortion::default()
    }

    /// Distort a normalized image point.
    pub fn apply(&self, p: Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        Vector2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Fixed-point inversion of [`apply`](Self::apply).
    pub fn remove(&self, d: Vector2<f64>) -> Vector2<f64> {
        if self.is_zero() {
            return d;
        }
        let mut p = d;
        for _ in 0..20 {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            p = Vector2::new((d.x - dx) / radial, (d.y - dy) / radial);
        }
        p
    }
}

/// Static configuration of one camera. Replaced wholesale on re-calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDescriptor {
    pub id: CameraId,
    pub name: String,
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: PixelFormat,
    /// Horizontal and vertical field of view in degrees.
    pub fov_deg: [f64; 2],
    /// `T_cam_ref`.
    pub extrinsic: Isometry3<f64>,
}

impl CameraDescriptor {
    /// Pixel of a point given in this camera's frame, ignoring image bounds.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let n = self.distortion.apply(Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z));
        let k = &self.intrinsics;
        Some(Vector2::new(k.fx * n.x + k.cx, k.fy * n.y + k.cy))
    }

    /// Unit bearing of a pixel in this camera's frame.
    pub fn unproject(&self, px: &Vector2<f64>) -> Unit<Vector3<f64>> {
        let k = &self.intrinsics;
        let d = Vector2::new((px.x - k.cx) / k.fx, (px.y - k.cy) / k.fy);
        let n = self.distortion.remove(d);
        Unit::new_normalize(Vector3::new(n.x, n.y, 1.0))
    }

    pub fn in_bounds(&self, px: &Vector2<f64>) -> bool {
        px.x >= 0.0 && px.y >= 0.0 && px.x < self.width as f64 && px.y < self.height as f64
    }

    pub fn to_camera(&self, p_ref: &Vector3<f64>) -> Vector3<f64> {
        (self.extrinsic * Point3::from(*p_ref)).coords
    }

    pub fn to_reference(&self, p_cam: &Vector3<f64>) -> Vector3<f64> {
        (self.extrinsic.inverse() * Point3::from(*p_cam)).coords
    }

    /// Optical center in the reference frame.
    pub fn center(&self) -> Vector3<f64> {
        self.to_reference(&Vector3::zeros())
    }

    /// Optical axis (+z) expressed in the reference frame.
    pub fn optical_axis(&self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.extrinsic.rotation.inverse() * Vector3::z())
    }

    /// Pixel of a reference-frame point if it is in front of the camera and inside the image.
    pub fn project_visible(&self, p_ref: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.project(&self.to_camera(p_ref)).filter(|px| self.in_bounds(px))
    }
}

/// Immutable geometry of the whole rig.
#[derive(Debug, Clone, PartialEq)]
pub struct RigGeometry {
    cameras: Vec<CameraDescriptor>,
    reference: CameraId,
    /// `T_imu_ref`: reference-frame points into the IMU frame.
    imu_from_ref: Isometry3<f64>,
}

impl RigGeometry {
    pub fn new(cameras: Vec<CameraDescriptor>, reference: CameraId) -> Result<Self> {
        if cameras.is_empty() {
            return Err(TrackingError::CalibrationInvalid("rig has no cameras".into()));
        }
        for (i, cam) in cameras.iter().enumerate() {
            if cameras[..i].iter().any(|c| c.id == cam.id) {
                return Err(TrackingError::CalibrationInvalid(format!(
                    "camera id {} appears twice",
                    cam.id
                )));
            }
            let k = &cam.intrinsics;
            let finite = [k.fx, k.fy, k.cx, k.cy].iter().all(|v| v.is_finite());
            if !finite || k.fx <= 0.0 || k.fy <= 0.0 || cam.width == 0 || cam.height == 0 {
                return Err(TrackingError::CalibrationInvalid(format!(
                    "camera {} has invalid intrinsics or resolution",
                    cam.id
                )));
            }
        }
        if !cameras.iter().any(|c| c.id == reference) {
            return Err(TrackingError::CalibrationInvalid(format!(
                "reference camera {} is not part of the rig",
                reference
            )));
        }
        Ok(Self {
            cameras,
            reference,
            imu_from_ref: Isometry3::identity(),
        })
    }

    /// Mount the IMU at `imu_from_ref` (`T_imu_ref`) instead of on the reference camera.
    pub fn with_imu_extrinsic(mut self, imu_from_ref: Isometry3<f64>) -> Self {
        self.imu_from_ref = imu_from_ref;
        self
    }

    pub fn imu_from_ref(&self) -> Isometry3<f64> {
        self.imu_from_ref
    }

    pub fn reference_camera(&self) -> CameraId {
        self.reference
    }

    pub fn cameras(&self) -> &[CameraDescriptor] {
        &self.cameras
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(|c| c.id).collect()
    }

    pub fn camera(&self, id: CameraId) -> Result<&CameraDescriptor> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or(TrackingError::CameraNotFound(id))
    }

    /// Reference-centered unit directions of `pixels` seen by `camera`,
    /// intersecting each pixel ray with a sphere of `radius` around the
    /// reference origin.
    pub fn project_points_to_sphere(
        &self,
        camera: CameraId,
        pixels: &[Vector2<f64>],
        radius: f64,
    ) -> Result<Vec<Unit<Vector3<f64>>>> {
        let cam = self.camera(camera)?;
        let origin = cam.center();
        let rot = cam.extrinsic.rotation.inverse();
        Ok(pixels
            .iter()
            .map(|px| {
                let dir = rot * cam.unproject(px).into_inner();
                Unit::new_normalize(ray_sphere_point(&origin, &dir, radius))
            })
            .collect())
    }

    /// Pixels of reference-centered directions on a sphere of `radius`, None
    /// where the camera cannot see the point.
    pub fn project_spherical_points_to_camera(
        &self,
        camera: CameraId,
        directions: &[Unit<Vector3<f64>>],
        radius: f64,
    ) -> Result<Vec<Option<Vector2<f64>>>> {
        let cam = self.camera(camera)?;
        Ok(directions
            .iter()
            .map(|d| cam.project_visible(&(d.into_inner() * radius)))
            .collect())
    }

    /// Positive depth in the camera frame and a projection inside the image.
    pub fn is_point_visible_to_camera(&self, camera: CameraId, p_ref: &Vector3<f64>) -> Result<bool> {
        Ok(self.camera(camera)?.project_visible(p_ref).is_some())
    }

    pub fn visible_cameras(&self, p_ref: &Vector3<f64>) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter(|c| c.project_visible(p_ref).is_some())
            .map(|c| c.id)
            .collect()
    }

    /// Among the cameras that see `p_ref`, the one whose optical axis is closest
    /// to the direction of the point.
    pub fn find_best_camera_for_point(&self, p_ref: &Vector3<f64>) -> Option<CameraId> {
        self.cameras
            .iter()
            .filter(|c| c.project_visible(p_ref).is_some())
            .map(|c| {
                let dir = p_ref - c.center();
                let cos = c.optical_axis().dot(&dir) / dir.norm().max(MIN_DEPTH);
                (c.id, cos)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// The camera whose optical axis best matches a reference-frame direction.
    pub fn camera_facing(&self, direction: &Vector3<f64>) -> Option<CameraId> {
        self.cameras
            .iter()
            .map(|c| (c.id, c.optical_axis().dot(direction)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Distance between two optical centers in meters.
    pub fn baseline(&self, a: CameraId, b: CameraId) -> Result<f64> {
        Ok((self.camera(a)?.center() - self.camera(b)?.center()).norm())
    }

    /// Largest baseline in the rig, 0 for a single camera.
    pub fn max_baseline(&self) -> f64 {
        let mut best: f64 = 0.0;
        for (i, a) in self.cameras.iter().enumerate() {
            for b in &self.cameras[i + 1..] {
                best = best.max((a.center() - b.center()).norm());
            }
        }
        best
    }

    /// Pixel of `px` from camera `from` in camera `to`, assuming it lies at
    /// `depth` meters along its ray. None when `to` cannot see it.
    pub fn transfer_pixel(
        &self,
        from: CameraId,
        to: CameraId,
        px: &Vector2<f64>,
        depth: f64,
    ) -> Result<Option<Vector2<f64>>> {
        let src = self.camera(from)?;
        let dst = self.camera(to)?;
        let bearing = src.unproject(px).into_inner();
        let p_cam = bearing * (depth / bearing.z.max(MIN_DEPTH));
        Ok(dst.project_visible(&src.to_reference(&p_cam)))
    }

    /// Equirectangular grayscale stitch of the given images around the reference camera.
    pub fn render_panorama(
        &self,
        images: &[(CameraId, ImageView<'_>)],
        width: u32,
        height: u32,
        radius: f64,
    ) -> Result<Panorama> {
        if width == 0 || height == 0 {
            return Err(TrackingError::UnsupportedFormat("empty panorama".into()));
        }
        let mut sources = Vec::with_capacity(images.len());
        for (id, image) in images {
            let cam = self.camera(*id)?;
            if !image.is_valid() {
                return Err(TrackingError::UnsupportedFormat(format!(
                    "image for camera {} is smaller than its stride/format require",
                    id
                )));
            }
            let sx = image.width as f64 / cam.width as f64;
            let sy = image.height as f64 / cam.height as f64;
            sources.push((cam, image, sx, sy));
        }

        let mut data = vec![0u8; width as usize * height as usize];
        let mut covered = 0usize;
        for v in 0..height {
            let lat = std::f64::consts::FRAC_PI_2 - (v as f64 + 0.5) / height as f64 * std::f64::consts::PI;
            for u in 0..width {
                let lon = (u as f64 + 0.5) / width as f64 * std::f64::consts::TAU - std::f64::consts::PI;
                let dir = Vector3::new(lat.cos() * lon.sin(), -lat.sin(), lat.cos() * lon.cos());
                let p = dir * radius;

                let mut best: Option<(f64, f32)> = None;
                for (cam, image, sx, sy) in &sources {
                    if let Some(px) = cam.project_visible(&p) {
                        let score = cam.optical_axis().dot(&dir);
                        if best.map_or(true, |(s, _)| score > s) {
                            let value = image.luma_bilinear((px.x * sx) as f32, (px.y * sy) as f32);
                            best = Some((score, value));
                        }
                    }
                }
                if let Some((_, value)) = best {
                    data[(v * width + u) as usize] = value.round().clamp(0.0, 255.0) as u8;
                    covered += 1;
                }
            }
        }

        Ok(Panorama {
            width,
            height,
            data,
            covered,
        })
    }
}

fn ray_sphere_point(origin: &Vector3<f64>, dir: &Vector3<f64>, radius: f64) -> Vector3<f64> {
    let d = dir.normalize();
    let b = origin.dot(&d);
    let c = origin.norm_squared() - radius * radius;
    let disc = b * b - c;
    // An origin outside the sphere with a ray missing it degenerates to the bare direction.
    let s = if disc >= 0.0 { -b + disc.sqrt() } else { radius };
    origin + d * s.max(0.0)
}

/// Output of [`RigGeometry::render_panorama`].
#[derive(Debug, Clone, PartialEq)]
pub struct Panorama {
    pub width: u32,
    pub height: u32,
    /// Row-major 8-bit luma.
    pub data: Vec<u8>,
    /// Pixels seen by at least one camera.
    pub covered: usize,
}

// -- Calibration document --

/// One camera in the calibration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub id: CameraId,
    #[serde(default)]
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_format")]
    pub format: PixelFormat,
    pub intrinsics: Intrinsics,
    #[serde(default)]
    pub distortion: Distortion,
    /// Horizontal and vertical field of view in degrees.
    pub fov_deg: [f64; 2],
    /// Rotation of `T_cam_ref` as `[qx, qy, qz, qw]`.
    pub rotation: [f64; 4],
    /// Translation of `T_cam_ref` in meters.
    pub translation: [f64; 3],
}

fn default_fps() -> f64 {
    30.0
}

fn default_format() -> PixelFormat {
    PixelFormat::Gray8
}

/// Pose of the IMU relative to the reference camera, `T_imu_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuExtrinsic {
    /// `[qx, qy, qz, qw]`.
    pub rotation: [f64; 4],
    /// Meters.
    pub translation: [f64; 3],
}

impl Default for ImuExtrinsic {
    fn default() -> Self {
        Self {
            rotation: [0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
        }
    }
}

impl ImuExtrinsic {
    pub fn from_isometry(imu_from_ref: &Isometry3<f64>) -> Self {
        let (rotation, translation) = isometry_parts(imu_from_ref);
        Self { rotation, translation }
    }

    pub fn to_isometry(&self) -> Result<Isometry3<f64>> {
        isometry_from_parts(&self.rotation, &self.translation)
            .ok_or_else(|| TrackingError::CalibrationInvalid("IMU extrinsic is invalid".into()))
    }
}

fn isometry_parts(iso: &Isometry3<f64>) -> ([f64; 4], [f64; 3]) {
    let q = iso.rotation.quaternion();
    let t = iso.translation.vector;
    ([q.i, q.j, q.k, q.w], [t.x, t.y, t.z])
}

fn isometry_from_parts(rotation: &[f64; 4], translation: &[f64; 3]) -> Option<Isometry3<f64>> {
    let [x, y, z, w] = *rotation;
    let q = Quaternion::new(w, x, y, z);
    let norm = q.norm();
    if !norm.is_finite() || norm < 1e-9 || !translation.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Isometry3::from_parts(
        Translation3::new(translation[0], translation[1], translation[2]),
        UnitQuaternion::from_quaternion(q),
    ))
}

/// Self-contained rig calibration as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigCalibration {
    pub version: u32,
    pub reference_camera: CameraId,
    pub cameras: Vec<CameraCalibration>,
    /// Identity when the document predates IMU calibration.
    #[serde(default)]
    pub imu: ImuExtrinsic,
}

impl RigCalibration {
    /// Nominal rig for `cameras`: 100° horizontal FOV each, yawed 60° apart and
    /// spaced 8 cm along x around the head center.
    pub fn nominal(cameras: &[CameraConfig]) -> RigCalibration {
        let n = cameras.len();
        let head_from_cam = |i: usize| {
            let k = i as f64 - (n as f64 - 1.0) / 2.0;
            Isometry3::from_parts(
                Translation3::new(0.08 * k, 0.0, 0.0),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), (60.0f64 * k).to_radians()),
            )
        };
        let ref_from_head = head_from_cam(0).inverse();

        let calibrated: Vec<CameraCalibration> = cameras
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let hfov = 100.0f64;
                let fx = c.width as f64 / 2.0 / (hfov.to_radians() / 2.0).tan();
                let vfov = 2.0 * (c.height as f64 / 2.0 / fx).atan().to_degrees();
                // T_cam_ref = (T_ref_head * T_head_cam)^-1
                let t_cam_ref = (ref_from_head * head_from_cam(i)).inverse();
                CameraCalibration::from_parts(
                    c.id,
                    format!("cam{}", c.id),
                    c.width,
                    c.height,
                    c.fps,
                    c.format,
                    Intrinsics {
                        fx,
                        fy: fx,
                        cx: c.width as f64 / 2.0,
                        cy: c.height as f64 / 2.0,
                    },
                    Distortion::default(),
                    [hfov, vfov],
                    &t_cam_ref,
                )
            })
            .collect();

        RigCalibration {
            version: CALIBRATION_VERSION,
            reference_camera: cameras.first().map_or(0, |c| c.id),
            cameras: calibrated,
            imu: ImuExtrinsic::default(),
        }
    }

    pub fn load(path: &Path) -> Result<RigCalibration> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrackingError::CalibrationInvalid(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| TrackingError::CalibrationInvalid(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn to_geometry(&self) -> Result<RigGeometry> {
        if self.version != CALIBRATION_VERSION {
            return Err(TrackingError::CalibrationInvalid(format!(
                "unsupported document version {}",
                self.version
            )));
        }
        let cameras = self
            .cameras
            .iter()
            .map(CameraCalibration::to_descriptor)
            .collect::<Result<Vec<_>>>()?;
        Ok(RigGeometry::new(cameras, self.reference_camera)?.with_imu_extrinsic(self.imu.to_isometry()?))
    }

    pub fn from_geometry(geometry: &RigGeometry) -> RigCalibration {
        RigCalibration {
            version: CALIBRATION_VERSION,
            reference_camera: geometry.reference,
            cameras: geometry
                .cameras
                .iter()
                .map(|c| {
                    CameraCalibration::from_parts(
                        c.id,
                        c.name.clone(),
                        c.width,
                        c.height,
                        c.fps,
                        c.format,
                        c.intrinsics,
                        c.distortion,
                        c.fov_deg,
                        &c.extrinsic,
                    )
                })
                .collect(),
            imu: ImuExtrinsic::from_isometry(&geometry.imu_from_ref),
        }
    }
}

impl CameraCalibration {
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: CameraId,
        name: String,
        width: u32,
        height: u32,
        fps: f64,
        format: PixelFormat,
        intrinsics: Intrinsics,
        distortion: Distortion,
        fov_deg: [f64; 2],
        extrinsic: &Isometry3<f64>,
    ) -> CameraCalibration {
        let (rotation, translation) = isometry_parts(extrinsic);
        CameraCalibration {
            id,
            name,
            width,
            height,
            fps,
            format,
            intrinsics,
            distortion,
            fov_deg,
            rotation,
            translation,
        }
    }

    pub fn to_descriptor(&self) -> Result<CameraDescriptor> {
        let extrinsic = isometry_from_parts(&self.rotation, &self.translation).ok_or_else(|| {
            TrackingError::CalibrationInvalid(format!("camera {} has an invalid extrinsic", self.id))
        })?;
        Ok(CameraDescriptor {
            id: self.id,
            name: self.name.clone(),
            intrinsics: self.intrinsics,
            distortion: self.distortion,
            width: self.width,
            height: self.height,
            fps: self.fps,
            format: self.format,
            fov_deg: self.fov_deg,
            extrinsic,
        })
    }
}

/// Shared, swappable rig geometry.
///
/// Readers take a cheap snapshot and compute without holding the lock.
pub struct CameraRig {
    geometry: RwLock<Arc<RigGeometry>>,
}

impl CameraRig {
    pub fn new(geometry: RigGeometry) -> Self {
        Self {
            geometry: RwLock::new(Arc::new(geometry)),
        }
    }

    pub fn from_calibration(calibration: &RigCalibration) -> Result<Self> {
        Ok(Self::new(calibration.to_geometry()?))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let rig = Self::from_calibration(&RigCalibration::load(path)?)?;
        log::info!("Loaded rig calibration from {}", path.display());
        Ok(rig)
    }

    /// Load `path`, or fall back to `fallback` with a degraded-accuracy warning.
    pub fn load_or_default(path: &Path, fallback: &RigCalibration) -> Result<Self> {
        match Self::load(path) {
            Ok(rig) => Ok(rig),
            Err(e @ TrackingError::CalibrationInvalid(_)) => {
                log::warn!("{}; using nominal rig geometry, accuracy will be degraded", e);
                Self::from_calibration(fallback)
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.calibration().save(path)?;
        log::info!("Saved rig calibration to {}", path.display());
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RigGeometry> {
        Arc::clone(&self.geometry.read())
    }

    pub fn calibration(&self) -> RigCalibration {
        RigCalibration::from_geometry(&self.snapshot())
    }

    /// Replace the whole rig after re-calibration.
    pub fn set_calibration(&self, calibration: &RigCalibration) -> Result<()> {
        let geometry = calibration.to_geometry()?;
        *self.geometry.write() = Arc::new(geometry);
        log::info!("Rig calibration replaced ({} cameras)", calibration.cameras.len());
        Ok(())
    }

    pub fn reference_camera(&self) -> CameraId {
        self.snapshot().reference_camera()
    }

    pub fn camera(&self, id: CameraId) -> Result<CameraDescriptor> {
        self.snapshot().camera(id).cloned()
    }

    pub fn imu_from_ref(&self) -> Isometry3<f64> {
        self.snapshot().imu_from_ref()
    }

    pub fn project_points_to_sphere(
        &self,
        camera: CameraId,
        pixels: &[Vector2<f64>],
        radius: f64,
    ) -> Result<Vec<Unit<Vector3<f64>>>> {
        self.snapshot().project_points_to_sphere(camera, pixels, radius)
    }

    pub fn project_spherical_points_to_camera(
        &self,
        camera: CameraId,
        directions: &[Unit<Vector3<f64>>],
        radius: f64,
    ) -> Result<Vec<Option<Vector2<f64>>>> {
        self.snapshot()
            .project_spherical_points_to_camera(camera, directions, radius)
    }

    pub fn is_point_visible_to_camera(&self, camera: CameraId, p_ref: &Vector3<f64>) -> Result<bool> {
        self.snapshot().is_point_visible_to_camera(camera, p_ref)
    }

    pub fn find_best_camera_for_point(&self, p_ref: &Vector3<f64>) -> Option<CameraId> {
        self.snapshot().find_best_camera_for_point(p_ref)
    }

    pub fn baseline(&self, a: CameraId, b: CameraId) -> Result<f64> {
        self.snapshot().baseline(a, b)
    }

    pub fn render_panorama(
        &self,
        images: &[(CameraId, ImageView<'_>)],
        width: u32,
        height: u32,
    ) -> Result<Panorama> {
        self.snapshot()
            .render_panorama(images, width, height, DEFAULT_SPHERE_RADIUS_M)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stereo() -> RigGeometry {
        RigCalibration::nominal(&[CameraConfig::new(0, 640, 480), CameraConfig::new(1, 640, 480)])
            .to_geometry()
            .unwrap()
    }

    #[test]
    fn test_reference_extrinsic_is_identity() {
        let rig = stereo();
        let cam0 = rig.camera(0).unwrap();
        assert_relative_eq!(cam0.center(), Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(cam0.optical_axis().into_inner(), Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(rig.baseline(0, 1).unwrap(), 0.08, epsilon = 1e-9);
    }

    #[test]
    fn test_project_unproject_with_distortion() {
        let mut cam = stereo().camera(0).unwrap().clone();
        cam.distortion = Distortion {
            k1: -0.1,
            k2: 0.01,
            p1: 0.001,
            p2: -0.0005,
            k3: 0.0,
        };
        let p = Vector3::new(0.3, -0.2, 2.0);
        let px = cam.project(&p).unwrap();
        let bearing = cam.unproject(&px);
        assert_relative_eq!(bearing.into_inner(), p.normalize(), epsilon = 1e-6);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_sphere_roundtrip() {
        let rig = stereo();
        let pixels = vec![Vector2::new(320.0, 240.0), Vector2::new(100.0, 400.0)];
        let dirs = rig.project_points_to_sphere(1, &pixels, 5.0).unwrap();
        let back = rig.project_spherical_points_to_camera(1, &dirs, 5.0).unwrap();
        for (a, b) in pixels.iter().zip(back) {
            assert_relative_eq!(*a, b.unwrap(), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_transfer_pixel_matches_geometry() {
        let rig = stereo();
        let p_ref = Vector3::new(1.2, 0.1, 2.0);
        let cam0 = rig.camera(0).unwrap();
        let cam1 = rig.camera(1).unwrap();
        let px0 = cam0.project_visible(&p_ref).unwrap();
        let px1 = cam1.project_visible(&p_ref).unwrap();
        let depth0 = cam0.to_camera(&p_ref).z;
        let moved = rig.transfer_pixel(0, 1, &px0, depth0).unwrap().unwrap();
        assert_relative_eq!(moved, px1, epsilon = 1e-6);
    }

    #[test]
    fn test_visibility_and_best_camera() {
        let rig = stereo();
        // Far to the right of camera 0: only camera 1 (yawed +60°) sees it.
        let right = Vector3::new(3.0, 0.0, 0.5);
        assert!(!rig.is_point_visible_to_camera(0, &right).unwrap());
        assert!(rig.is_point_visible_to_camera(1, &right).unwrap());
        assert_eq!(rig.find_best_camera_for_point(&right), Some(1));

        let behind = Vector3::new(0.0, 0.0, -2.0);
        assert!(rig.visible_cameras(&behind).is_empty());
        assert_eq!(rig.find_best_camera_for_point(&behind), None);
        assert!(matches!(
            rig.is_point_visible_to_camera(9, &right),
            Err(TrackingError::CameraNotFound(9))
        ));
    }

    #[test]
    fn test_invalid_documents_are_rejected() {
        let mut cal = RigCalibration::nominal(&[CameraConfig::new(0, 640, 480)]);
        cal.reference_camera = 4;
        assert!(matches!(cal.to_geometry(), Err(TrackingError::CalibrationInvalid(_))));

        let mut cal = RigCalibration::nominal(&[CameraConfig::new(0, 640, 480)]);
        cal.cameras[0].intrinsics.fx = 0.0;
        assert!(matches!(cal.to_geometry(), Err(TrackingError::CalibrationInvalid(_))));

        let mut cal = RigCalibration::nominal(&[CameraConfig::new(0, 640, 480)]);
        cal.cameras[0].rotation = [0.0; 4];
        assert!(matches!(cal.to_geometry(), Err(TrackingError::CalibrationInvalid(_))));
    }

    #[test]
    fn test_imu_extrinsic_round_trips() {
        let mut cal = RigCalibration::nominal(&[CameraConfig::new(0, 640, 480), CameraConfig::new(1, 640, 480)]);
        assert_eq!(cal.to_geometry().unwrap().imu_from_ref(), Isometry3::identity());

        let mount = Isometry3::from_parts(
            Translation3::new(0.01, -0.03, 0.02),
            UnitQuaternion::from_euler_angles(std::f64::consts::FRAC_PI_2, 0.0, 0.2),
        );
        cal.imu = ImuExtrinsic::from_isometry(&mount);
        let rig = CameraRig::from_calibration(&cal).unwrap();
        assert_relative_eq!(rig.imu_from_ref().to_homogeneous(), mount.to_homogeneous(), epsilon = 1e-12);
        assert_eq!(rig.calibration().imu, cal.imu);

        // Documents written before the IMU entry existed still load.
        let mut json: serde_json::Value = serde_json::to_value(&cal).unwrap();
        json.as_object_mut().unwrap().remove("imu");
        let old: RigCalibration = serde_json::from_value(json).unwrap();
        assert_eq!(old.imu, ImuExtrinsic::default());

        cal.imu.rotation = [0.0; 4];
        assert!(matches!(cal.to_geometry(), Err(TrackingError::CalibrationInvalid(_))));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let path = std::env::temp_dir().join(format!("headtrack-bad-rig-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let fallback = RigCalibration::nominal(&[CameraConfig::new(0, 320, 240)]);
        let rig = CameraRig::load_or_default(&path, &fallback).unwrap();
        assert_eq!(rig.camera(0).unwrap().width, 320);
        assert!(matches!(CameraRig::load(&path), Err(TrackingError::CalibrationInvalid(_))));
        std::fs::remove_file(&path).ok();
    }
}
