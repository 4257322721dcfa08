//! Local map of triangulated points shared by all cameras.
//!
//! Points live in the reference camera's world frame. When two points turn
//! out to be the same physical feature they are merged: the one with more
//! observations survives (lower id on a tie) and the other id is redirected to
//! it. Redirections always point straight at a live survivor, so repeated or
//! transitive merges never build chains.

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};
use nalgebra::Vector3;

use crate::types::CameraId;

/// Handle of a [`MapPoint`] inside a [`LocalMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl fmt::Display for MapPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// One detection of a map point: which camera, which frame, which keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Observation {
    pub camera_id: CameraId,
    pub frame_id: u64,
    pub keypoint: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint {
    pub id: MapPointId,
    /// World frame, meters.
    pub position: Vector3<f64>,
    /// Unit-norm representative descriptor.
    pub descriptor: Vec<f32>,
    pub observations: Vec<Observation>,
    /// Cleared once the point has no live observations.
    pub valid: bool,
    /// Number of descriptors folded into `descriptor`.
    descriptor_weight: u32,
}

impl MapPoint {
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Latest frame that observed the point.
    pub fn last_seen(&self) -> Option<u64> {
        self.observations.iter().map(|o| o.frame_id).max()
    }

    pub fn is_observed_by(&self, camera_id: CameraId) -> bool {
        self.observations.iter().any(|o| o.camera_id == camera_id)
    }

    fn add_observation(&mut self, obs: Observation) -> bool {
        if self.observations.contains(&obs) {
            return false;
        }
        self.observations.push(obs);
        true
    }

    /// Fold a new descriptor into the running mean and re-normalize.
    fn blend_descriptor(&mut self, descriptor: &[f32], weight: u32) {
        if descriptor.len() != self.descriptor.len() || weight == 0 {
            return;
        }
        let total = (self.descriptor_weight + weight) as f32;
        let a = self.descriptor_weight as f32 / total;
        let b = weight as f32 / total;
        for (d, n) in self.descriptor.iter_mut().zip(descriptor) {
            *d = a * *d + b * n;
        }
        normalize(&mut self.descriptor);
        self.descriptor_weight = self.descriptor_weight.saturating_add(weight);
    }
}

/// Counters reported through tracking statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub points: usize,
    pub merges: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone)]
pub struct LocalMap {
    points: HashMap<MapPointId, MapPoint>,
    /// Merged-away id -> surviving id.
    replaced: HashMap<MapPointId, MapPointId>,
    next_id: u64,
    /// Observations older than this many frames are retired.
    observation_window: u64,
    merges: u64,
    pruned: u64,
}

impl LocalMap {
    pub fn new(observation_window: u64) -> Self {
        Self {
            points: HashMap::new(),
            replaced: HashMap::new(),
            next_id: 0,
            observation_window: observation_window.max(1),
            merges: 0,
            pruned: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            points: self.points.len(),
            merges: self.merges,
            pruned: self.pruned,
        }
    }

    /// Create a point from its first observation.
    pub fn insert(&mut self, position: Vector3<f64>, descriptor: &[f32], observation: Observation) -> MapPointId {
        let id = MapPointId(self.next_id);
        self.next_id += 1;
        let mut desc = descriptor.to_vec();
        normalize(&mut desc);
        self.points.insert(
            id,
            MapPoint {
                id,
                position,
                descriptor: desc,
                observations: vec![observation],
                valid: true,
                descriptor_weight: 1,
            },
        );
        trace!("map: new point {} at {:?}", id, position.as_slice());
        id
    }

    /// Live id that `id` stands for, following a merge if there was one.
    pub fn resolve(&self, id: MapPointId) -> Option<MapPointId> {
        let canonical = self.replaced.get(&id).copied().unwrap_or(id);
        self.points.contains_key(&canonical).then_some(canonical)
    }

    pub fn get(&self, id: MapPointId) -> Option<&MapPoint> {
        self.points.get(&self.resolve(id)?)
    }

    pub fn get_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        let canonical = self.resolve(id)?;
        self.points.get_mut(&canonical)
    }

    pub fn points(&self) -> impl Iterator<Item = &MapPoint> {
        self.points.values().filter(|p| p.valid)
    }

    pub fn ids(&self) -> Vec<MapPointId> {
        let mut ids: Vec<_> = self.points.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Record another detection of a point, optionally refining its
    /// descriptor. Returns the canonical id.
    pub fn add_observation(
        &mut self,
        id: MapPointId,
        observation: Observation,
        descriptor: Option<&[f32]>,
    ) -> Option<MapPointId> {
        let canonical = self.resolve(id)?;
        let point = self.points.get_mut(&canonical)?;
        if point.add_observation(observation) {
            if let Some(desc) = descriptor {
                point.blend_descriptor(desc, 1);
            }
        }
        Some(canonical)
    }

    pub fn set_position(&mut self, id: MapPointId, position: Vector3<f64>) -> bool {
        match self.get_mut(id) {
            Some(point) => {
                point.position = position;
                true
            }
            None => false,
        }
    }

    /// Merge two points known to be the same feature and return the survivor.
    /// Merging a point with itself, or a pair that was already merged, is a
    /// no-op that returns the existing canonical id.
    pub fn merge(&mut self, a: MapPointId, b: MapPointId) -> Option<MapPointId> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;
        if a == b {
            return Some(a);
        }
        let (na, nb) = (self.points[&a].num_observations(), self.points[&b].num_observations());
        let (keep, drop) = if na > nb || (na == nb && a < b) { (a, b) } else { (b, a) };

        let loser = self.points.remove(&drop)?;
        let survivor = self.points.get_mut(&keep)?;
        let (ws, wl) = (survivor.num_observations() as f64, loser.num_observations() as f64);
        survivor.position = (survivor.position * ws + loser.position * wl) / (ws + wl).max(1.0);
        survivor.blend_descriptor(&loser.descriptor, loser.descriptor_weight);
        for obs in loser.observations {
            survivor.add_observation(obs);
        }

        for target in self.replaced.values_mut() {
            if *target == drop {
                *target = keep;
            }
        }
        self.replaced.insert(drop, keep);
        self.merges += 1;
        trace!("map: merged {} into {}", drop, keep);
        Some(keep)
    }

    /// Drop observations that fell out of the window ending at
    /// `current_frame` and prune points left with none. Returns the number
    /// of pruned points.
    pub fn retire_observations(&mut self, current_frame: u64) -> usize {
        let oldest = current_frame.saturating_sub(self.observation_window);
        let mut dead = Vec::new();
        for point in self.points.values_mut() {
            point.observations.retain(|o| o.frame_id >= oldest);
            if point.observations.is_empty() {
                point.valid = false;
                dead.push(point.id);
            }
        }
        for id in &dead {
            self.points.remove(id);
        }
        if !dead.is_empty() {
            self.replaced.retain(|_, target| !dead.contains(target));
            self.pruned += dead.len() as u64;
            debug!("map: pruned {} points, {} remain", dead.len(), self.points.len());
        }
        dead.len()
    }

    /// Remove every point. Ids are never reused.
    pub fn clear(&mut self) {
        self.points.clear();
        self.replaced.clear();
    }
}

pub(crate) fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
