//! Frame-to-map tracking and the multi-camera orchestrator.
//!
//! [`MapTracker`] estimates the head pose from one camera's keypoints matched
//! against the [`LocalMap`]. [`MultiCameraTracker`] owns the map and drives a
//! [`FrameTracker`] once per frame set with the active camera's features,
//! grows and de-duplicates the map from cross-camera correspondences, hands
//! off between cameras and relocalizes after a loss.
//!
//! Poses are `T_world_ref`: the reference camera in the map frame.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use nalgebra::{Isometry3, Matrix2x3, Matrix3, Matrix3x6, Matrix6, Point3, Vector2, Vector3, Vector6};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::buffer::FrameBuffer;
use crate::config::TrackingConfig;
use crate::error::TrackingError;
use crate::extractor::FeatureExtractor;
use crate::fusion::VisualObservation;
use crate::geometry::skew;
use crate::map::{LocalMap, MapPointId, Observation};
use crate::rig::{CameraDescriptor, CameraRig, RigGeometry};
use crate::types::{descriptor_distance, CameraId, FeatureSet, Pose};
use crate::Result;

/// Consecutive lost frame sets after which the map is rebuilt around the prior.
pub const REBOOTSTRAP_AFTER_LOST: u32 = 10;

/// Nearest-to-second-nearest descriptor distance ratio for global matching.
const RELOCALIZATION_RATIO: f32 = 0.8;

/// Smallest sine of the angle between two rays that still triangulates.
const MIN_PARALLAX_SIN: f64 = 1e-3;

const MIN_POSE_POINTS: usize = 4;
const MIN_DEPTH: f64 = 1e-6;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrackingStatus {
    #[default]
    NotInitialized,
    Tracking,
    Lost,
}

/// How a [`FrameTracker`] finds map points for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Search around each map point's projection under the prior.
    Projection,
    /// Match descriptors against the whole map; the prior only seeds the solve.
    Relocalization,
}

/// One camera's features and the pose to start from.
#[derive(Debug, Clone, Copy)]
pub struct TrackingFrame<'a> {
    pub features: &'a FeatureSet,
    pub camera: &'a CameraDescriptor,
    pub prior: Pose,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult {
    pub pose: Pose,
    /// Inlier `(keypoint index, map point)` pairs.
    pub matches: Vec<(usize, MapPointId)>,
    /// Root-mean-square reprojection error of the inliers in pixels.
    pub rms_px: f64,
}

impl TrackResult {
    pub fn inliers(&self) -> usize {
        self.matches.len()
    }
}

/// Single-camera tracking core.
pub trait FrameTracker: Send {
    /// Estimate the head pose from `frame`. Fails with
    /// [`TrackingError::TrackingLost`] when too few inliers remain.
    fn process_frame(&mut self, frame: &TrackingFrame<'_>, map: &LocalMap) -> Result<TrackResult>;

    fn pose(&self) -> Option<Pose>;

    fn status(&self) -> TrackingStatus;

    fn reset(&mut self);
}

/// Descriptor matching followed by Gauss-Newton PnP with Huber weights.
#[derive(Debug, Clone)]
pub struct MapTracker {
    config: TrackingConfig,
    pose: Option<Pose>,
    status: TrackingStatus,
}

impl MapTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            pose: None,
            status: TrackingStatus::NotInitialized,
        }
    }

    fn lost(&mut self) -> TrackingError {
        self.status = TrackingStatus::Lost;
        TrackingError::TrackingLost
    }

    /// Solve, keep inliers, then re-solve on the inliers only.
    fn solve_inliers(
        &self,
        frame: &TrackingFrame<'_>,
        map: &LocalMap,
        matches: &[(usize, MapPointId)],
        initial: &Isometry3<f64>,
        iterations: usize,
    ) -> Option<(Isometry3<f64>, Vec<(usize, MapPointId)>, f64)> {
        let threshold = self.config.reprojection_threshold_px;
        let observations = gather(frame.features, frame.camera, map, matches);
        let first = solve_pose(frame.camera, &observations.points, initial, iterations, threshold)?;
        let inliers: Vec<usize> = (0..observations.points.len())
            .filter(|&i| first.errors[i] < threshold)
            .collect();
        if inliers.len() < self.config.min_inliers {
            return None;
        }
        let points: Vec<_> = inliers.iter().map(|&i| observations.points[i]).collect();
        let refined = solve_pose(
            frame.camera,
            &points,
            &first.world_from_ref,
            self.config.pose_iterations,
            threshold,
        )?;
        let kept: Vec<usize> = (0..points.len()).filter(|&i| refined.errors[i] < threshold).collect();
        if kept.len() < self.config.min_inliers {
            return None;
        }
        let rms = (kept.iter().map(|&i| refined.errors[i].powi(2)).sum::<f64>() / kept.len() as f64).sqrt();
        let matched = kept.iter().map(|&i| observations.matches[inliers[i]]).collect();
        Some((refined.world_from_ref, matched, rms))
    }
}

impl FrameTracker for MapTracker {
    fn process_frame(&mut self, frame: &TrackingFrame<'_>, map: &LocalMap) -> Result<TrackResult> {
        let prior = frame.prior.to_isometry();
        let (matches, iterations) = match frame.mode {
            MatchMode::Projection => (
                match_projected(
                    frame.features,
                    frame.camera,
                    &prior,
                    map,
                    self.config.map_match_gate_px,
                    self.config.max_descriptor_distance,
                ),
                self.config.pose_iterations,
            ),
            MatchMode::Relocalization => (
                match_global(frame.features, map, self.config.max_descriptor_distance),
                self.config.pose_iterations * 3,
            ),
        };
        trace!(
            "tracker: camera {} {:?}: {} candidate matches",
            frame.camera.id,
            frame.mode,
            matches.len()
        );
        if matches.len() < self.config.min_inliers {
            return Err(self.lost());
        }

        let Some((mut pose, mut inliers, mut rms)) = self.solve_inliers(frame, map, &matches, &prior, iterations) else {
            return Err(self.lost());
        };

        if frame.mode == MatchMode::Relocalization {
            // Global matches are sparse; collect everything the solved pose explains.
            let rematched = match_projected(
                frame.features,
                frame.camera,
                &pose,
                map,
                self.config.map_match_gate_px,
                self.config.max_descriptor_distance,
            );
            if rematched.len() > inliers.len() {
                if let Some(better) =
                    self.solve_inliers(frame, map, &rematched, &pose, self.config.pose_iterations)
                {
                    (pose, inliers, rms) = better;
                }
            }
        }

        let pose = Pose::from_isometry(&pose, frame.features.timestamp_s);
        self.pose = Some(pose);
        self.status = TrackingStatus::Tracking;
        Ok(TrackResult {
            pose,
            matches: inliers,
            rms_px: rms,
        })
    }

    fn pose(&self) -> Option<Pose> {
        self.pose
    }

    fn status(&self) -> TrackingStatus {
        self.status
    }

    fn reset(&mut self) {
        self.pose = None;
        self.status = TrackingStatus::NotInitialized;
    }
}

struct Gathered {
    /// Undistorted normalized image point and world position.
    points: Vec<(Vector2<f64>, Vector3<f64>)>,
    matches: Vec<(usize, MapPointId)>,
}

fn gather(features: &FeatureSet, camera: &CameraDescriptor, map: &LocalMap, matches: &[(usize, MapPointId)]) -> Gathered {
    let mut out = Gathered {
        points: Vec::with_capacity(matches.len()),
        matches: Vec::with_capacity(matches.len()),
    };
    for &(kp, id) in matches {
        let (Some(keypoint), Some(point)) = (features.keypoints.get(kp), map.get(id)) else {
            continue;
        };
        let bearing = camera.unproject(&Vector2::new(keypoint.x as f64, keypoint.y as f64));
        out.points.push((Vector2::new(bearing.x / bearing.z, bearing.y / bearing.z), point.position));
        out.matches.push((kp, point.id));
    }
    out
}

struct PoseSolution {
    world_from_ref: Isometry3<f64>,
    /// Per-observation reprojection error in pixels.
    errors: Vec<f64>,
}

/// Gauss-Newton on `T_ref_world` with a left perturbation `[ω, υ]`.
fn solve_pose(
    camera: &CameraDescriptor,
    observations: &[(Vector2<f64>, Vector3<f64>)],
    initial: &Isometry3<f64>,
    iterations: usize,
    huber_px: f64,
) -> Option<PoseSolution> {
    if observations.len() < MIN_POSE_POINTS {
        return None;
    }
    let k = camera.intrinsics;
    let r_cam = camera.extrinsic.rotation.to_rotation_matrix().into_inner();
    let mut ref_from_world = initial.inverse();

    for _ in 0..iterations.max(1) {
        let mut h = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();
        let mut used = 0;
        for (n, p_world) in observations {
            let p_ref = (ref_from_world * Point3::from(*p_world)).coords;
            let p_cam = camera.to_camera(&p_ref);
            if p_cam.z <= MIN_DEPTH {
                continue;
            }
            let inv_z = 1.0 / p_cam.z;
            let r = Vector2::new(k.fx * (n.x - p_cam.x * inv_z), k.fy * (n.y - p_cam.y * inv_z));
            let j_proj = Matrix2x3::new(
                k.fx * inv_z,
                0.0,
                -k.fx * p_cam.x * inv_z * inv_z,
                0.0,
                k.fy * inv_z,
                -k.fy * p_cam.y * inv_z * inv_z,
            );
            let mut j_ref = Matrix3x6::<f64>::zeros();
            j_ref.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p_ref)));
            j_ref.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
            let j = j_proj * r_cam * j_ref;

            let e = r.norm();
            let w = if e <= huber_px { 1.0 } else { huber_px / e };
            h += j.transpose() * j * w;
            b += j.transpose() * r * w;
            used += 1;
        }
        if used < MIN_POSE_POINTS {
            return None;
        }
        let delta = h.cholesky()?.solve(&b);
        let step = Isometry3::new(
            Vector3::new(delta[3], delta[4], delta[5]),
            Vector3::new(delta[0], delta[1], delta[2]),
        );
        ref_from_world = step * ref_from_world;
        if delta.norm() < 1e-10 {
            break;
        }
    }

    let errors = observations
        .iter()
        .map(|(n, p_world)| {
            let p_cam = camera.to_camera(&(ref_from_world * Point3::from(*p_world)).coords);
            if p_cam.z <= MIN_DEPTH {
                return f64::INFINITY;
            }
            Vector2::new(k.fx * (n.x - p_cam.x / p_cam.z), k.fy * (n.y - p_cam.y / p_cam.z)).norm()
        })
        .collect();
    Some(PoseSolution {
        world_from_ref: ref_from_world.inverse(),
        errors,
    })
}

/// Greedy one-to-one assignment by ascending distance.
fn assign_unique(mut candidates: Vec<(f32, usize, usize)>, left: usize, right: usize) -> Vec<(f32, usize, usize)> {
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut used_left = vec![false; left];
    let mut used_right = vec![false; right];
    candidates
        .into_iter()
        .filter(|&(_, l, r)| {
            if used_left[l] || used_right[r] {
                return false;
            }
            used_left[l] = true;
            used_right[r] = true;
            true
        })
        .collect()
}

/// Match map points to keypoints near their projection under `world_from_ref`.
pub fn match_projected(
    features: &FeatureSet,
    camera: &CameraDescriptor,
    world_from_ref: &Isometry3<f64>,
    map: &LocalMap,
    gate_px: f64,
    max_distance: f32,
) -> Vec<(usize, MapPointId)> {
    let ref_from_world = world_from_ref.inverse();
    let gate2 = gate_px * gate_px;
    let mut ids = Vec::new();
    let mut candidates = Vec::new();
    for point in map.points() {
        if !point.valid || point.descriptor.len() != features.descriptor_dim {
            continue;
        }
        let p_ref = (ref_from_world * Point3::from(point.position)).coords;
        let Some(px) = camera.project_visible(&p_ref) else {
            continue;
        };
        let slot = ids.len();
        ids.push(point.id);
        for (i, kp) in features.keypoints.iter().enumerate() {
            let (dx, dy) = (kp.x as f64 - px.x, kp.y as f64 - px.y);
            if dx * dx + dy * dy > gate2 {
                continue;
            }
            let d = descriptor_distance(features.descriptor(i), &point.descriptor);
            if d <= max_distance {
                candidates.push((d, i, slot));
            }
        }
    }
    assign_unique(candidates, features.len(), ids.len())
        .into_iter()
        .map(|(_, kp, slot)| (kp, ids[slot]))
        .collect()
}

/// Match every keypoint against the whole map with a ratio test.
pub fn match_global(features: &FeatureSet, map: &LocalMap, max_distance: f32) -> Vec<(usize, MapPointId)> {
    let points: Vec<_> = map
        .points()
        .filter(|p| p.valid && p.descriptor.len() == features.descriptor_dim)
        .collect();
    let mut candidates = Vec::new();
    for i in 0..features.len() {
        let descriptor = features.descriptor(i);
        let mut best = (f32::INFINITY, usize::MAX);
        let mut second = f32::INFINITY;
        for (slot, point) in points.iter().enumerate() {
            let d = descriptor_distance(descriptor, &point.descriptor);
            if d < best.0 {
                second = best.0;
                best = (d, slot);
            } else if d < second {
                second = d;
            }
        }
        if best.0 <= max_distance && best.0 < RELOCALIZATION_RATIO * second {
            candidates.push((best.0, i, best.1));
        }
    }
    assign_unique(candidates, features.len(), points.len())
        .into_iter()
        .map(|(_, kp, slot)| (kp, points[slot].id))
        .collect()
}

/// Keypoint `keypoint_a` of `camera_a` and `keypoint_b` of `camera_b` show the same feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub camera_a: CameraId,
    pub keypoint_a: usize,
    pub camera_b: CameraId,
    pub keypoint_b: usize,
    pub distance: f32,
}

/// Cross-camera correspondences between two feature sets. Each keypoint of
/// `a` is placed at the nominal depth and transferred into `b`; candidates
/// inside the pixel gate compete on descriptor distance and each keypoint is
/// used at most once.
pub fn find_correspondences(
    rig: &RigGeometry,
    a: &FeatureSet,
    b: &FeatureSet,
    config: &TrackingConfig,
) -> Result<Vec<Correspondence>> {
    if a.camera_id == b.camera_id || a.descriptor_dim != b.descriptor_dim {
        return Ok(Vec::new());
    }
    let gate2 = config.correspondence_gate_px * config.correspondence_gate_px;
    let mut candidates = Vec::new();
    for (i, kp) in a.keypoints.iter().enumerate() {
        let px = Vector2::new(kp.x as f64, kp.y as f64);
        let Some(target) = rig.transfer_pixel(a.camera_id, b.camera_id, &px, config.nominal_depth_m)? else {
            continue;
        };
        for (j, other) in b.keypoints.iter().enumerate() {
            let (dx, dy) = (other.x as f64 - target.x, other.y as f64 - target.y);
            if dx * dx + dy * dy > gate2 {
                continue;
            }
            let d = descriptor_distance(a.descriptor(i), b.descriptor(j));
            if d <= config.max_descriptor_distance {
                candidates.push((d, i, j));
            }
        }
    }
    Ok(assign_unique(candidates, a.len(), b.len())
        .into_iter()
        .map(|(distance, i, j)| Correspondence {
            camera_a: a.camera_id,
            keypoint_a: i,
            camera_b: b.camera_id,
            keypoint_b: j,
            distance,
        })
        .collect())
}

/// Midpoint triangulation of two pixels, in the reference frame.
///
/// Rejects near-parallel rays, points outside the configured depth range
/// and points that reproject further than twice the inlier threshold.
pub fn triangulate(
    a: &CameraDescriptor,
    px_a: &Vector2<f64>,
    b: &CameraDescriptor,
    px_b: &Vector2<f64>,
    config: &TrackingConfig,
) -> Option<Vector3<f64>> {
    let (o_a, o_b) = (a.center(), b.center());
    let d_a = a.extrinsic.rotation.inverse() * a.unproject(px_a).into_inner();
    let d_b = b.extrinsic.rotation.inverse() * b.unproject(px_b).into_inner();
    let w0 = o_a - o_b;
    let cos = d_a.dot(&d_b);
    let denom = 1.0 - cos * cos;
    if denom < MIN_PARALLAX_SIN * MIN_PARALLAX_SIN {
        return None;
    }
    let (d, e) = (d_a.dot(&w0), d_b.dot(&w0));
    let s = (cos * e - d) / denom;
    let t = (e - cos * d) / denom;
    if s <= 0.0 || t <= 0.0 {
        return None;
    }
    let p = ((o_a + d_a * s) + (o_b + d_b * t)) * 0.5;

    let limit = 2.0 * config.reprojection_threshold_px;
    for (cam, px) in [(a, px_a), (b, px_b)] {
        let p_cam = cam.to_camera(&p);
        if p_cam.z < config.min_depth_m || p_cam.z > config.max_depth_m {
            return None;
        }
        if (cam.project(&p_cam)? - px).norm() > limit {
            return None;
        }
    }
    Some(p)
}

/// Result of one frame set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingOutput {
    pub timestamp_s: f64,
    /// None unless the status is [`TrackingStatus::Tracking`].
    pub pose: Option<Pose>,
    pub status: TrackingStatus,
    pub inliers: usize,
    pub active_camera: CameraId,
    pub map_epoch: u64,
    /// The pose comes from relocalization or a fresh map.
    pub relocalized: bool,
}

impl TrackingOutput {
    pub fn observation(&self) -> Option<VisualObservation> {
        self.pose.map(|pose| VisualObservation {
            pose,
            inliers: self.inliers,
            map_epoch: self.map_epoch,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingStats {
    pub frame_sets: u64,
    /// Inliers of the last tracked pose.
    pub inliers: usize,
    pub map_points: usize,
    pub merges: u64,
    pub pruned: u64,
    pub handoffs: u64,
    pub relocalizations: u64,
    pub lost_frames: u64,
    pub map_epoch: u64,
    pub active_camera: CameraId,
    pub status: TrackingStatus,
}

/// Tracking state other threads may read. One lock per resource, each held
/// only for a copy.
#[derive(Debug, Default)]
pub struct TrackingShared {
    active_camera: Mutex<CameraId>,
    camera_poses: Mutex<Vec<(CameraId, Pose)>>,
    stats: Mutex<TrackingStats>,
}

impl TrackingShared {
    pub fn active_camera(&self) -> CameraId {
        *self.active_camera.lock()
    }

    /// `T_world_cam` of every camera at the last tracked frame set.
    pub fn camera_poses(&self) -> Vec<(CameraId, Pose)> {
        self.camera_poses.lock().clone()
    }

    pub fn camera_pose(&self, camera: CameraId) -> Option<Pose> {
        self.camera_poses.lock().iter().find(|(id, _)| *id == camera).map(|(_, p)| *p)
    }

    pub fn stats(&self) -> TrackingStats {
        *self.stats.lock()
    }
}

/// Drives a [`FrameTracker`] across all cameras of a rig.
pub struct MultiCameraTracker {
    config: TrackingConfig,
    rig: Arc<CameraRig>,
    extractors: Vec<(CameraId, FeatureExtractor)>,
    pool: Option<rayon::ThreadPool>,
    tracker: Box<dyn FrameTracker>,
    map: LocalMap,
    status: TrackingStatus,
    active: CameraId,
    last_pose: Option<Pose>,
    /// Consecutive lost frame sets.
    lost_run: u32,
    /// Frame-set counter; observations are stamped with it.
    frame_index: u64,
    map_epoch: u64,
    stats: TrackingStats,
    shared: Arc<TrackingShared>,
}

impl MultiCameraTracker {
    /// `extractors` holds one extractor per camera that delivers frames.
    pub fn new(
        config: TrackingConfig,
        rig: Arc<CameraRig>,
        extractors: Vec<(CameraId, FeatureExtractor)>,
    ) -> Result<Self> {
        let pool = if config.parallel_extraction && extractors.len() > 1 {
            let workers = config.extraction_workers.clamp(1, extractors.len());
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("headtrack-extract-{}", i))
                .build()
                .map_err(|e| TrackingError::DeviceUnavailable(format!("extraction pool: {}", e)))?;
            debug!("tracking: {} extraction workers", workers);
            Some(pool)
        } else {
            None
        };
        let active = rig.reference_camera();
        Ok(Self {
            tracker: Box::new(MapTracker::new(config.clone())),
            map: LocalMap::new(config.observation_window),
            config,
            rig,
            extractors,
            pool,
            status: TrackingStatus::NotInitialized,
            active,
            last_pose: None,
            lost_run: 0,
            frame_index: 0,
            map_epoch: 0,
            stats: TrackingStats {
                active_camera: active,
                ..TrackingStats::default()
            },
            shared: Arc::new(TrackingShared {
                active_camera: Mutex::new(active),
                ..TrackingShared::default()
            }),
        })
    }

    /// Replace the single-camera core.
    pub fn with_tracker(mut self, tracker: Box<dyn FrameTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn shared(&self) -> Arc<TrackingShared> {
        Arc::clone(&self.shared)
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    pub fn active_camera(&self) -> CameraId {
        self.active
    }

    pub fn map(&self) -> &LocalMap {
        &self.map
    }

    pub fn map_epoch(&self) -> u64 {
        self.map_epoch
    }

    pub fn stats(&self) -> TrackingStats {
        self.stats
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn extractor(&self, camera: CameraId) -> Option<&FeatureExtractor> {
        self.extractors.iter().find(|(id, _)| *id == camera).map(|(_, e)| e)
    }

    pub fn extractor_mut(&mut self, camera: CameraId) -> Option<&mut FeatureExtractor> {
        self.extractors.iter_mut().find(|(id, _)| *id == camera).map(|(_, e)| e)
    }

    /// Drop the map and start over from the next frame set.
    pub fn reset(&mut self) {
        self.map.clear();
        self.tracker.reset();
        self.status = TrackingStatus::NotInitialized;
        self.last_pose = None;
        self.lost_run = 0;
        self.stats.status = self.status;
        self.publish(None);
        info!("tracking: reset");
    }

    /// Extract features from every frame, on the worker pool when enabled.
    pub fn extract(&mut self, frames: &[FrameBuffer]) -> Result<Vec<FeatureSet>> {
        if let Some(frame) = frames
            .iter()
            .find(|f| !self.extractors.iter().any(|(id, _)| *id == f.camera_id()))
        {
            return Err(TrackingError::CameraNotFound(frame.camera_id()));
        }
        let run = |(id, extractor): &mut (CameraId, FeatureExtractor)| {
            frames
                .iter()
                .find(|f| f.camera_id() == *id)
                .map(|frame| extractor.extract_frame(frame))
        };
        let extractors = &mut self.extractors;
        match &self.pool {
            Some(pool) => pool.install(|| extractors.par_iter_mut().filter_map(run).collect()),
            None => extractors.iter_mut().filter_map(run).collect(),
        }
    }

    /// Extract, release the frames, then track.
    pub fn process_frame_set(&mut self, frames: Vec<FrameBuffer>, prior: Option<Pose>) -> Result<TrackingOutput> {
        let features = self.extract(&frames);
        for frame in frames {
            frame.release();
        }
        self.process_features(&features?, prior)
    }

    /// Track one synchronized set of per-camera features. `prior` is the
    /// best guess of the head pose at this frame set (for example the fused
    /// inertial prediction); without one the last tracked pose is used.
    pub fn process_features(&mut self, features: &[FeatureSet], prior: Option<Pose>) -> Result<TrackingOutput> {
        let rig = self.rig.snapshot();
        self.frame_index += 1;
        self.stats.frame_sets += 1;
        let timestamp_s = features
            .iter()
            .map(|f| f.timestamp_s)
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0);

        let mut correspondences = Vec::new();
        for (i, a) in features.iter().enumerate() {
            for b in &features[i + 1..] {
                correspondences.extend(find_correspondences(&rig, a, b, &self.config)?);
            }
        }
        trace!(
            "tracking: frame set {}: {} cross-camera correspondences",
            self.frame_index,
            correspondences.len()
        );

        let prior = prior.or(self.last_pose).map(|p| Pose { timestamp_s, ..p });
        let output = match self.status {
            TrackingStatus::NotInitialized => self.bootstrap(&rig, features, &correspondences, prior, timestamp_s),
            TrackingStatus::Tracking | TrackingStatus::Lost => {
                self.track(&rig, features, &correspondences, prior, timestamp_s)
            }
        };

        self.map.retire_observations(self.frame_index);
        self.publish(output.pose.map(|p| (rig.as_ref(), p)));
        Ok(output)
    }

    fn output(&self, timestamp_s: f64, pose: Option<Pose>, inliers: usize, relocalized: bool) -> TrackingOutput {
        TrackingOutput {
            timestamp_s,
            pose,
            status: self.status,
            inliers,
            active_camera: self.active,
            map_epoch: self.map_epoch,
            relocalized,
        }
    }

    /// Build a fresh map from the correspondences of this frame set. The map
    /// is only replaced when enough points were created.
    fn bootstrap(
        &mut self,
        rig: &RigGeometry,
        features: &[FeatureSet],
        correspondences: &[Correspondence],
        prior: Option<Pose>,
        timestamp_s: f64,
    ) -> TrackingOutput {
        let pose = prior.unwrap_or_else(|| Pose::identity(timestamp_s));
        let world_from_ref = pose.to_isometry();
        let mut map = LocalMap::new(self.config.observation_window);
        let mut centroid = Vector3::zeros();

        for c in correspondences {
            let (Some(a), Some(b)) = (feature_set(features, c.camera_a), feature_set(features, c.camera_b)) else {
                continue;
            };
            let (Ok(cam_a), Ok(cam_b)) = (rig.camera(c.camera_a), rig.camera(c.camera_b)) else {
                continue;
            };
            let (kp_a, kp_b) = (a.keypoints[c.keypoint_a], b.keypoints[c.keypoint_b]);
            let Some(p_ref) = triangulate(
                cam_a,
                &Vector2::new(kp_a.x as f64, kp_a.y as f64),
                cam_b,
                &Vector2::new(kp_b.x as f64, kp_b.y as f64),
                &self.config,
            ) else {
                continue;
            };
            centroid += p_ref.normalize();
            let id = map.insert(
                (world_from_ref * Point3::from(p_ref)).coords,
                a.descriptor(c.keypoint_a),
                self.observation(c.camera_a, c.keypoint_a),
            );
            map.add_observation(id, self.observation(c.camera_b, c.keypoint_b), Some(b.descriptor(c.keypoint_b)));
        }

        // A single camera has no stereo; place its keypoints at the nominal depth.
        if rig.cameras().len() == 1 {
            if let Some((set, cam)) = features.first().and_then(|s| rig.camera(s.camera_id).ok().map(|c| (s, c))) {
                for (i, kp) in set.keypoints.iter().enumerate() {
                    let bearing = cam.unproject(&Vector2::new(kp.x as f64, kp.y as f64)).into_inner();
                    let p_ref = cam.to_reference(&(bearing * (self.config.nominal_depth_m / bearing.z.max(MIN_DEPTH))));
                    centroid += p_ref.normalize();
                    map.insert(
                        (world_from_ref * Point3::from(p_ref)).coords,
                        set.descriptor(i),
                        self.observation(set.camera_id, i),
                    );
                }
            }
        }

        if map.len() < self.config.min_inliers {
            debug!(
                "tracking: bootstrap found {} points, need {}",
                map.len(),
                self.config.min_inliers
            );
            return self.output(timestamp_s, None, 0, false);
        }

        self.map = map;
        self.map_epoch += 1;
        self.tracker.reset();
        self.status = TrackingStatus::Tracking;
        self.lost_run = 0;
        self.active = rig.camera_facing(&centroid).unwrap_or_else(|| rig.reference_camera());
        self.last_pose = Some(pose);
        self.stats.inliers = self.map.len();
        info!(
            "tracking: map epoch {} with {} points, active camera {}",
            self.map_epoch,
            self.map.len(),
            self.active
        );
        self.output(timestamp_s, Some(pose), self.map.len(), true)
    }

    fn track(
        &mut self,
        rig: &RigGeometry,
        features: &[FeatureSet],
        correspondences: &[Correspondence],
        prior: Option<Pose>,
        timestamp_s: f64,
    ) -> TrackingOutput {
        let prior = prior.unwrap_or_else(|| Pose::identity(timestamp_s));

        let primary = feature_set(features, self.active)
            .zip(rig.camera(self.active).ok())
            .and_then(|(set, camera)| {
                let frame = TrackingFrame {
                    features: set,
                    camera,
                    prior,
                    mode: MatchMode::Projection,
                };
                self.tracker.process_frame(&frame, &self.map).ok()
            });

        let (result, relocalized) = match primary {
            Some(result) => (result, false),
            None => {
                if self.status == TrackingStatus::Tracking {
                    warn!("tracking: lost on camera {}, relocalizing", self.active);
                }
                self.status = TrackingStatus::Lost;
                match self.relocalize(rig, features, prior) {
                    Some((camera, result)) => {
                        self.active = camera;
                        self.stats.relocalizations += 1;
                        info!(
                            "tracking: relocalized on camera {} with {} inliers",
                            camera,
                            result.inliers()
                        );
                        (result, true)
                    }
                    None => return self.lost_frame(rig, features, correspondences, Some(prior), timestamp_s),
                }
            }
        };

        self.status = TrackingStatus::Tracking;
        self.lost_run = 0;
        let pose = Pose {
            timestamp_s,
            ..result.pose
        };
        let world_from_ref = pose.to_isometry();
        let visible = self.grow_map(rig, features, correspondences, &world_from_ref, &result.matches);
        self.consider_handoff(result.inliers(), &visible);

        self.last_pose = Some(pose);
        self.stats.inliers = result.inliers();
        trace!(
            "tracking: frame set {} camera {} inliers {} rms {:.2}px",
            self.frame_index,
            self.active,
            result.inliers(),
            result.rms_px
        );
        self.output(timestamp_s, Some(pose), result.inliers(), relocalized)
    }

    /// Global relocalization on every camera; the camera with most inliers wins.
    fn relocalize(&mut self, rig: &RigGeometry, features: &[FeatureSet], prior: Pose) -> Option<(CameraId, TrackResult)> {
        if self.map.is_empty() {
            return None;
        }
        let mut best: Option<(CameraId, TrackResult)> = None;
        for set in features {
            let Ok(camera) = rig.camera(set.camera_id) else {
                continue;
            };
            let frame = TrackingFrame {
                features: set,
                camera,
                prior,
                mode: MatchMode::Relocalization,
            };
            if let Ok(result) = self.tracker.process_frame(&frame, &self.map) {
                if best.as_ref().map_or(true, |(_, b)| result.inliers() > b.inliers()) {
                    best = Some((set.camera_id, result));
                }
            }
        }
        best
    }

    fn lost_frame(
        &mut self,
        rig: &RigGeometry,
        features: &[FeatureSet],
        correspondences: &[Correspondence],
        prior: Option<Pose>,
        timestamp_s: f64,
    ) -> TrackingOutput {
        self.lost_run += 1;
        self.stats.lost_frames += 1;
        if self.lost_run >= REBOOTSTRAP_AFTER_LOST {
            let output = self.bootstrap(rig, features, correspondences, prior, timestamp_s);
            if output.pose.is_some() {
                return output;
            }
        }
        trace!("tracking: lost for {} frame sets", self.lost_run);
        self.output(timestamp_s, None, 0, false)
    }

    /// Record matches in every camera, then merge, extend or triangulate
    /// along the cross-camera correspondences. Returns the number of map
    /// points each camera matched.
    fn grow_map(
        &mut self,
        rig: &RigGeometry,
        features: &[FeatureSet],
        correspondences: &[Correspondence],
        world_from_ref: &Isometry3<f64>,
        active_matches: &[(usize, MapPointId)],
    ) -> Vec<(CameraId, usize)> {
        let mut matched: HashMap<(CameraId, usize), MapPointId> = HashMap::new();
        let mut visible = Vec::with_capacity(features.len());
        for set in features {
            let matches = if set.camera_id == self.active {
                active_matches.to_vec()
            } else {
                let Ok(camera) = rig.camera(set.camera_id) else {
                    continue;
                };
                match_projected(
                    set,
                    camera,
                    world_from_ref,
                    &self.map,
                    self.config.map_match_gate_px,
                    self.config.max_descriptor_distance,
                )
            };
            visible.push((set.camera_id, matches.len()));
            for (kp, id) in matches {
                let obs = self.observation(set.camera_id, kp);
                if let Some(canonical) = self.map.add_observation(id, obs, Some(set.descriptor(kp))) {
                    matched.insert((set.camera_id, kp), canonical);
                }
            }
        }

        let (mut merged, mut created) = (0usize, 0usize);
        for c in correspondences {
            let (Some(a), Some(b)) = (feature_set(features, c.camera_a), feature_set(features, c.camera_b)) else {
                continue;
            };
            let id_a = matched.get(&(c.camera_a, c.keypoint_a)).and_then(|id| self.map.resolve(*id));
            let id_b = matched.get(&(c.camera_b, c.keypoint_b)).and_then(|id| self.map.resolve(*id));
            match (id_a, id_b) {
                (Some(x), Some(y)) if x != y => {
                    if self.map.merge(x, y).is_some() {
                        merged += 1;
                    }
                }
                (Some(_), Some(_)) => {}
                (Some(id), None) => {
                    let obs = self.observation(c.camera_b, c.keypoint_b);
                    if let Some(id) = self.map.add_observation(id, obs, Some(b.descriptor(c.keypoint_b))) {
                        matched.insert((c.camera_b, c.keypoint_b), id);
                    }
                }
                (None, Some(id)) => {
                    let obs = self.observation(c.camera_a, c.keypoint_a);
                    if let Some(id) = self.map.add_observation(id, obs, Some(a.descriptor(c.keypoint_a))) {
                        matched.insert((c.camera_a, c.keypoint_a), id);
                    }
                }
                (None, None) => {
                    let (Ok(cam_a), Ok(cam_b)) = (rig.camera(c.camera_a), rig.camera(c.camera_b)) else {
                        continue;
                    };
                    let (kp_a, kp_b) = (a.keypoints[c.keypoint_a], b.keypoints[c.keypoint_b]);
                    let Some(p_ref) = triangulate(
                        cam_a,
                        &Vector2::new(kp_a.x as f64, kp_a.y as f64),
                        cam_b,
                        &Vector2::new(kp_b.x as f64, kp_b.y as f64),
                        &self.config,
                    ) else {
                        continue;
                    };
                    let id = self.map.insert(
                        (world_from_ref * Point3::from(p_ref)).coords,
                        a.descriptor(c.keypoint_a),
                        self.observation(c.camera_a, c.keypoint_a),
                    );
                    self.map
                        .add_observation(id, self.observation(c.camera_b, c.keypoint_b), Some(b.descriptor(c.keypoint_b)));
                    matched.insert((c.camera_a, c.keypoint_a), id);
                    matched.insert((c.camera_b, c.keypoint_b), id);
                    created += 1;
                }
            }
        }
        if merged > 0 || created > 0 {
            debug!(
                "tracking: frame set {}: {} new points, {} merges, {} total",
                self.frame_index,
                created,
                merged,
                self.map.len()
            );
        }
        visible
    }

    /// Switch the active camera when it tracks too little and another camera
    /// sees enough of the map.
    fn consider_handoff(&mut self, tracked: usize, visible: &[(CameraId, usize)]) {
        if tracked >= self.config.handoff_min_tracked {
            return;
        }
        let target = visible
            .iter()
            .filter(|(id, count)| *id != self.active && *count >= self.config.handoff_min_visible)
            .max_by_key(|(_, count)| *count);
        if let Some(&(camera, count)) = target {
            info!(
                "tracking: handoff camera {} -> {} ({} tracked, {} visible)",
                self.active, camera, tracked, count
            );
            self.active = camera;
            self.stats.handoffs += 1;
        }
    }

    fn observation(&self, camera_id: CameraId, keypoint: usize) -> Observation {
        Observation {
            camera_id,
            frame_id: self.frame_index,
            keypoint,
        }
    }

    /// Copy state into the shared snapshot. With a pose, every camera's pose
    /// follows from its extrinsic.
    fn publish(&mut self, pose: Option<(&RigGeometry, Pose)>) {
        let map_stats = self.map.stats();
        self.stats.map_points = map_stats.points;
        self.stats.merges = map_stats.merges;
        self.stats.pruned = map_stats.pruned;
        self.stats.map_epoch = self.map_epoch;
        self.stats.active_camera = self.active;
        self.stats.status = self.status;

        *self.shared.active_camera.lock() = self.active;
        if let Some((rig, pose)) = pose {
            let world_from_ref = pose.to_isometry();
            let poses = rig
                .cameras()
                .iter()
                .map(|c| (c.id, Pose::from_isometry(&(world_from_ref * c.extrinsic.inverse()), pose.timestamp_s)))
                .collect();
            *self.shared.camera_poses.lock() = poses;
        }
        *self.shared.stats.lock() = self.stats;
    }
}

fn feature_set(features: &[FeatureSet], camera: CameraId) -> Option<&FeatureSet> {
    features.iter().find(|f| f.camera_id == camera)
}
