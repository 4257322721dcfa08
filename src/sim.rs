//! Synthetic camera and IMU drivers.
//!
//! They implement the same driver traits as real hardware, so the threaded
//! components can run in tests and demos without devices attached.

use crate::driver::{BufferHandle, CameraDriver, Capture, ImuDriver, StreamFormat};
use crate::protocol::{self, RotationKind, SensorReport};
use crate::rig::RigGeometry;
use crate::types::{CameraCaps, CameraId, PixelFormat, Pose};
use crate::{Result, TrackingError};
use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Head trajectory: `T_world_ref` at a given time.
pub type Trajectory = Arc<dyn Fn(f64) -> Pose + Send + Sync>;

/// Shared time origin so simulated cameras and IMU agree on timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    epoch: Instant,
}

impl SimClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Sleep until `t` seconds after the epoch, or at most `max`.
    /// Returns whether `t` was reached.
    fn wait_until(&self, t: f64, max: Duration) -> bool {
        let wait = t - self.now_s();
        if wait <= 0.0 {
            return true;
        }
        if wait > max.as_secs_f64() {
            std::thread::sleep(max);
            return false;
        }
        std::thread::sleep(Duration::from_secs_f64(wait));
        true
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Draws frames for synthetic cameras.
pub trait SceneRenderer: Send + Sync {
    fn render(&self, camera: CameraId, timestamp_s: f64, format: &StreamFormat, dst: &mut [u8]);
}

/// Write an RGB color into pixel `(x, y)` of a frame in any supported layout.
pub fn put_pixel(format: &StreamFormat, dst: &mut [u8], x: usize, y: usize, rgb: [u8; 3]) {
    let row = y * format.stride;
    let luma = ((rgb[0] as u32 * 77 + rgb[1] as u32 * 150 + rgb[2] as u32 * 29) >> 8) as u8;
    match format.format {
        PixelFormat::Gray8 | PixelFormat::Nv12 => dst[row + x] = luma,
        PixelFormat::Yuyv => {
            dst[row + 2 * x] = luma;
            dst[row + 2 * x + 1] = 128;
        }
        PixelFormat::Rgb24 => dst[row + 3 * x..row + 3 * x + 3].copy_from_slice(&rgb),
    }
}

fn fill(format: &StreamFormat, dst: &mut [u8], rgb: [u8; 3]) {
    for y in 0..format.height as usize {
        for x in 0..format.width as usize {
            put_pixel(format, dst, x, y, rgb);
        }
    }
    if format.format == PixelFormat::Nv12 {
        let luma_end = format.stride * format.height as usize;
        for b in dst[luma_end..].iter_mut() {
            *b = 128;
        }
    }
}

/// A single colored disk on a plain background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskScene {
    pub background: [u8; 3],
    pub color: [u8; 3],
    /// Disk center as a fraction of image width/height.
    pub center: [f64; 2],
    /// Disk radius as a fraction of image width.
    pub radius: f64,
}

impl DiskScene {
    pub fn new(color: [u8; 3]) -> Self {
        Self {
            background: [16, 16, 16],
            color,
            center: [0.5, 0.5],
            radius: 0.15,
        }
    }

    pub fn render_frame(&self, format: &StreamFormat, dst: &mut [u8]) {
        fill(format, dst, self.background);
        let cx = self.center[0] * format.width as f64;
        let cy = self.center[1] * format.height as f64;
        let r = self.radius * format.width as f64;
        let (x0, x1) = ((cx - r).floor().max(0.0) as usize, ((cx + r).ceil() as usize).min(format.width as usize));
        let (y0, y1) = ((cy - r).floor().max(0.0) as usize, ((cy + r).ceil() as usize).min(format.height as usize));
        for y in y0..y1 {
            for x in x0..x1 {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                if dx * dx + dy * dy <= r * r {
                    put_pixel(format, dst, x, y, self.color);
                }
            }
        }
    }

    /// Tightly packed grayscale rendering.
    pub fn render_gray(&self, width: u32, height: u32) -> Vec<u8> {
        let format = StreamFormat {
            width,
            height,
            stride: width as usize,
            format: PixelFormat::Gray8,
            fps: 30.0,
        };
        let mut data = vec![0u8; format.frame_size()];
        self.render_frame(&format, &mut data);
        data
    }
}

impl SceneRenderer for DiskScene {
    fn render(&self, _camera: CameraId, _timestamp_s: f64, format: &StreamFormat, dst: &mut [u8]) {
        self.render_frame(format, dst);
    }
}

/// Side of a landmark texture, in cells.
const PATCH_CELLS: usize = 5;

/// Smallest angle between two landmarks of [`PointScene::random`].
pub const MIN_SEPARATION_RAD: f64 = 8.0 * std::f64::consts::PI / 180.0;

/// Textured landmarks in the world, seen by a moving rig.
pub struct PointScene {
    pub landmarks: Vec<Vector3<f64>>,
    textures: Vec<[u8; PATCH_CELLS * PATCH_CELLS]>,
    rig: Arc<RigGeometry>,
    trajectory: Trajectory,
    /// Pixels per texture cell at the rig's native resolution.
    cell_px: usize,
}

impl PointScene {
    pub fn new(landmarks: Vec<Vector3<f64>>, rig: Arc<RigGeometry>, trajectory: Trajectory, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let textures = landmarks
            .iter()
            .map(|_| {
                let mut t = [0u8; PATCH_CELLS * PATCH_CELLS];
                for v in t.iter_mut() {
                    *v = if rng.gen::<bool>() { 230 } else { 40 };
                }
                t
            })
            .collect();
        Self {
            landmarks,
            textures,
            rig,
            trajectory,
            cell_px: 2,
        }
    }

    /// Up to `count` landmarks scattered on a shell 2..4 m around the world
    /// origin, at least [`MIN_SEPARATION_RAD`] apart as seen from the origin.
    /// Fewer are placed when the shell fills up.
    pub fn random(count: usize, rig: Arc<RigGeometry>, trajectory: Trajectory, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let min_cos = MIN_SEPARATION_RAD.cos();
        let mut directions: Vec<Vector3<f64>> = Vec::with_capacity(count);
        let mut landmarks = Vec::with_capacity(count);
        for _ in 0..count * 50 {
            if landmarks.len() == count {
                break;
            }
            let dir = loop {
                let v = Vector3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-0.6..0.6),
                    rng.gen_range(-1.0..1.0),
                );
                if v.norm() > 0.2 {
                    break v.normalize();
                }
            };
            if directions.iter().any(|d| d.dot(&dir) > min_cos) {
                continue;
            }
            directions.push(dir);
            landmarks.push(dir * rng.gen_range(2.0..4.0));
        }
        Self::new(landmarks, rig, trajectory, seed)
    }
}

impl SceneRenderer for PointScene {
    fn render(&self, camera: CameraId, timestamp_s: f64, format: &StreamFormat, dst: &mut [u8]) {
        fill(format, dst, [24, 24, 24]);
        let cam = match self.rig.camera(camera) {
            Ok(cam) => cam,
            Err(_) => return,
        };
        let world_from_ref = (self.trajectory)(timestamp_s).to_isometry();
        let ref_from_world = world_from_ref.inverse();
        let sx = format.width as f64 / cam.width as f64;
        let sy = format.height as f64 / cam.height as f64;
        let half = (PATCH_CELLS * self.cell_px) as f64 / 2.0;

        for (landmark, texture) in self.landmarks.iter().zip(&self.textures) {
            let p_ref = (ref_from_world * Point3::from(*landmark)).coords;
            let px = match cam.project_visible(&p_ref) {
                Some(px) => px,
                None => continue,
            };
            let x0 = (px.x * sx - half).round() as i64;
            let y0 = (px.y * sy - half).round() as i64;
            for cy in 0..PATCH_CELLS {
                for cx in 0..PATCH_CELLS {
                    let v = texture[cy * PATCH_CELLS + cx];
                    for dy in 0..self.cell_px {
                        for dx in 0..self.cell_px {
                            let x = x0 + (cx * self.cell_px + dx) as i64;
                            let y = y0 + (cy * self.cell_px + dy) as i64;
                            if x >= 0 && y >= 0 && (x as u32) < format.width && (y as u32) < format.height {
                                put_pixel(format, dst, x as usize, y as usize, [v, v, v]);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Camera driver producing frames from a [`SceneRenderer`].
///
/// Without a clock, frames are produced as fast as they are dequeued with
/// timestamps `offset + n * period`. With a clock, each frame is released at
/// its timestamp.
pub struct SyntheticCamera {
    name: String,
    camera_id: CameraId,
    caps: CameraCaps,
    offset_s: f64,
    period_s: Option<f64>,
    clock: Option<SimClock>,
    scene: Option<Arc<dyn SceneRenderer>>,
    script: Option<VecDeque<f64>>,
    format: Option<StreamFormat>,
    next_index: u64,
    started: bool,
    fail_open: bool,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            camera_id: 0,
            caps: CameraCaps::HW_TIMESTAMP,
            offset_s: 0.0,
            period_s: None,
            clock: None,
            scene: None,
            script: None,
            format: None,
            next_index: 0,
            started: false,
            fail_open: false,
        }
    }

    /// Rig camera this driver renders for.
    pub fn with_camera_id(mut self, id: CameraId) -> Self {
        self.camera_id = id;
        self
    }

    pub fn with_timing(mut self, offset_s: f64, period_s: f64) -> Self {
        self.offset_s = offset_s;
        self.period_s = Some(period_s);
        self
    }

    pub fn with_clock(mut self, clock: SimClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_scene(mut self, scene: Arc<dyn SceneRenderer>) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn with_caps(mut self, caps: CameraCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Emit exactly these timestamps, in order, then go quiet.
    pub fn with_timestamps(mut self, timestamps: Vec<f64>) -> Self {
        self.script = Some(timestamps.into());
        self
    }

    /// Make `open` fail, as an unplugged device would.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn next_timestamp(&mut self, timeout: Duration) -> Option<f64> {
        if let Some(script) = self.script.as_mut() {
            let ts = script.pop_front();
            if ts.is_none() {
                std::thread::sleep(timeout);
            }
            return ts;
        }

        let period = self.period_s.unwrap_or(1.0 / 30.0);
        if let Some(clock) = self.clock {
            // A slow consumer skips frames instead of replaying a backlog.
            let now = clock.now_s();
            let due = self.offset_s + self.next_index as f64 * period;
            if now - due > period {
                self.next_index = ((now - self.offset_s) / period).ceil().max(0.0) as u64;
            }
            let ts = self.offset_s + self.next_index as f64 * period;
            if !clock.wait_until(ts, timeout) {
                return None;
            }
            self.next_index += 1;
            return Some(ts);
        }

        let ts = self.offset_s + self.next_index as f64 * period;
        self.next_index += 1;
        Some(ts)
    }
}

impl CameraDriver for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(TrackingError::DeviceUnavailable(format!("{}: no such device", self.name)));
        }
        Ok(())
    }

    fn configure(&mut self, requested: &StreamFormat) -> Result<StreamFormat> {
        let format = *requested;
        if self.period_s.is_none() && format.fps > 0.0 {
            self.period_s = Some(1.0 / format.fps);
        }
        self.format = Some(format);
        Ok(format)
    }

    fn capabilities(&self) -> CameraCaps {
        self.caps
    }

    fn export_buffer(&mut self, slot: usize, len: usize) -> Option<BufferHandle> {
        if self.caps.contains(CameraCaps::ZERO_COPY) {
            Some(BufferHandle {
                fd: 1000 + slot as i32,
                offset: 0,
                len,
            })
        } else {
            None
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            return Err(TrackingError::DeviceUnavailable(format!("{}: not configured", self.name)));
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn dequeue(&mut self, _slot: usize, dst: &mut [u8], timeout: Duration) -> Result<Option<Capture>> {
        let format = match (self.started, self.format) {
            (true, Some(format)) => format,
            _ => return Err(TrackingError::DeviceUnavailable(format!("{}: not streaming", self.name))),
        };
        let timestamp_s = match self.next_timestamp(timeout) {
            Some(ts) => ts,
            None => return Ok(None),
        };
        if let Some(scene) = &self.scene {
            scene.render(self.camera_id, timestamp_s, &format, dst);
        }
        Ok(Some(Capture { timestamp_s }))
    }
}

/// True inertial motion in the body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuMotion {
    /// Angular velocity, rad/s.
    pub gyro: Vector3<f64>,
    /// Specific force, m/s².
    pub accel: Vector3<f64>,
}

pub type MotionProfile = Arc<dyn Fn(f64) -> ImuMotion + Send + Sync>;

/// What an IMU mounted at `imu_from_ref` (`T_imu_ref`) on a head following
/// `trajectory` measures. `gravity_world` is the gravity acceleration vector
/// in world coordinates.
pub fn trajectory_motion(
    trajectory: Trajectory,
    gravity_world: Vector3<f64>,
    imu_from_ref: Isometry3<f64>,
) -> MotionProfile {
    let ref_from_imu = imu_from_ref.inverse();
    let h = 1e-3;
    Arc::new(move |t| {
        let imu = |t: f64| trajectory(t).to_isometry() * ref_from_imu;
        let (p0, p1, p2) = (imu(t - h), imu(t), imu(t + h));
        let accel_world =
            (p2.translation.vector - 2.0 * p1.translation.vector + p0.translation.vector) / (h * h);
        let delta = p1.rotation.inverse() * p2.rotation;
        ImuMotion {
            gyro: delta.scaled_axis() / h,
            accel: p1.rotation.inverse() * (accel_world - gravity_world),
        }
    })
}

/// IMU driver that answers set-feature commands and emits encoded sensor reports.
pub struct SyntheticImu {
    name: String,
    clock: Option<SimClock>,
    motion: MotionProfile,
    gyro_bias: Vector3<f64>,
    chip_gyro_bias: Vector3<f64>,
    noise: f64,
    rng: StdRng,
    silent: bool,
    fail_open: bool,
    enabled: Vec<u8>,
    interval_s: f64,
    next_index: u64,
    orientation: UnitQuaternion<f64>,
    last_time: Option<f64>,
    packet: Vec<u8>,
}

impl SyntheticImu {
    /// A still IMU with gravity along +z.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: None,
            motion: Arc::new(|_| ImuMotion {
                gyro: Vector3::zeros(),
                accel: Vector3::new(0.0, 0.0, 9.81),
            }),
            gyro_bias: Vector3::zeros(),
            chip_gyro_bias: Vector3::new(0.02, -0.01, 0.015),
            noise: 0.0,
            rng: StdRng::seed_from_u64(7),
            silent: false,
            fail_open: false,
            enabled: Vec::new(),
            interval_s: 1.0 / 400.0,
            next_index: 0,
            orientation: UnitQuaternion::identity(),
            last_time: None,
            packet: Vec::with_capacity(protocol::MAX_PACKET_SIZE),
        }
    }

    /// IMU rigidly attached to the reference camera of a head following `trajectory`.
    /// `gravity_world` is the gravity acceleration vector in world coordinates.
    pub fn from_trajectory(name: impl Into<String>, trajectory: Trajectory, gravity_world: Vector3<f64>) -> Self {
        Self::mounted(name, trajectory, gravity_world, Isometry3::identity())
    }

    /// IMU at `imu_from_ref` (`T_imu_ref`) on a head following `trajectory`.
    pub fn mounted(
        name: impl Into<String>,
        trajectory: Trajectory,
        gravity_world: Vector3<f64>,
        imu_from_ref: Isometry3<f64>,
    ) -> Self {
        Self {
            motion: trajectory_motion(trajectory, gravity_world, imu_from_ref),
            ..Self::new(name)
        }
    }

    pub fn with_clock(mut self, clock: SimClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Residual gyro bias left after the chip's own calibration.
    pub fn with_gyro_bias(mut self, bias: Vector3<f64>) -> Self {
        self.gyro_bias = bias;
        self
    }

    /// Uniform noise of amplitude `amplitude` on gyro and accel.
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Never answer reads.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn jitter(&mut self) -> Vector3<f64> {
        if self.noise <= 0.0 {
            return Vector3::zeros();
        }
        let a = self.noise;
        Vector3::new(
            self.rng.gen_range(-a..a),
            self.rng.gen_range(-a..a),
            self.rng.gen_range(-a..a),
        )
    }

    fn build_packet(&mut self, t: f64) {
        let motion = (self.motion)(t);
        if let Some(last) = self.last_time {
            self.orientation *= UnitQuaternion::from_scaled_axis(motion.gyro * (t - last));
        }
        self.last_time = Some(t);

        let ticks = (t / protocol::TIME_TICK_S).round() as u32;
        let gyro = motion.gyro + self.gyro_bias + self.jitter();
        let accel = motion.accel + self.jitter();

        self.packet.clear();
        protocol::encode_report(&SensorReport::Timebase { ticks }, &mut self.packet);
        let enabled = self.enabled.clone();
        for report in enabled {
            let decoded = match report {
                protocol::REPORT_ACCELEROMETER => SensorReport::Accelerometer {
                    value: accel,
                    accuracy: 3,
                    delay_ticks: 0,
                },
                protocol::REPORT_GYROSCOPE => SensorReport::Gyroscope {
                    value: gyro,
                    accuracy: 3,
                    delay_ticks: 0,
                },
                protocol::REPORT_GYROSCOPE_UNCALIBRATED => SensorReport::GyroscopeUncalibrated {
                    value: gyro + self.chip_gyro_bias,
                    bias: self.chip_gyro_bias,
                    accuracy: 3,
                    delay_ticks: 0,
                },
                protocol::REPORT_MAGNETIC_FIELD => SensorReport::MagneticField {
                    value: self.orientation.inverse() * Vector3::new(0.0, 22.0, -40.0),
                    accuracy: 3,
                    delay_ticks: 0,
                },
                protocol::REPORT_ROTATION_VECTOR => SensorReport::Rotation {
                    kind: RotationKind::Absolute,
                    orientation: self.orientation,
                    accuracy: 3,
                    delay_ticks: 0,
                },
                protocol::REPORT_ARVR_ROTATION_VECTOR => SensorReport::Rotation {
                    kind: RotationKind::ArvrAbsolute,
                    orientation: self.orientation,
                    accuracy: 3,
                    delay_ticks: 0,
                },
                _ => continue,
            };
            protocol::encode_report(&decoded, &mut self.packet);
        }
    }
}

impl ImuDriver for SyntheticImu {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(TrackingError::DeviceUnavailable(format!("{}: no such device", self.name)));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < protocol::SET_FEATURE_LEN || data[0] != protocol::CMD_SET_FEATURE {
            return Ok(());
        }
        let report = data[1];
        let interval_us = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
        self.enabled.retain(|&r| r != report);
        if interval_us > 0 {
            self.enabled.push(report);
            self.interval_s = interval_us as f64 * 1e-6;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.silent {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        if let Some(clock) = self.clock {
            let now = clock.now_s();
            if now - self.next_index as f64 * self.interval_s > 0.1 {
                self.next_index = (now / self.interval_s).ceil() as u64;
            }
            if !clock.wait_until(self.next_index as f64 * self.interval_s, timeout) {
                return Ok(0);
            }
        }
        let t = self.next_index as f64 * self.interval_s;
        self.next_index += 1;

        self.build_packet(t);
        let n = self.packet.len().min(buf.len());
        buf[..n].copy_from_slice(&self.packet[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ImuTransport;
    use crate::types::OperationMode;

    #[test]
    fn test_disk_scene_draws_disk() {
        let scene = DiskScene::new([255, 0, 0]);
        let img = scene.render_gray(64, 48);
        let center = img[24 * 64 + 32];
        let corner = img[0];
        assert!(center > corner);
    }

    #[test]
    fn test_random_scene_spreads_landmarks() {
        let rig = Arc::new(
            crate::rig::RigCalibration::nominal(&[
                crate::config::CameraConfig::new(0, 160, 120),
                crate::config::CameraConfig::new(1, 160, 120),
            ])
            .to_geometry()
            .unwrap(),
        );
        let scene = PointScene::random(400, rig, Arc::new(Pose::identity), 3);
        assert!(scene.landmarks.len() > 100);
        assert!(scene.landmarks.len() <= 400);
        for (i, a) in scene.landmarks.iter().enumerate() {
            let n = a.norm();
            assert!((2.0..4.0).contains(&n));
            for b in &scene.landmarks[i + 1..] {
                assert!(a.angle(b) >= MIN_SEPARATION_RAD - 1e-9);
            }
        }
    }

    #[test]
    fn test_scripted_camera_timestamps() {
        let mut cam = SyntheticCamera::new("cam").with_timestamps(vec![0.1, 0.2]);
        let fmt = StreamFormat {
            width: 4,
            height: 4,
            stride: 4,
            format: PixelFormat::Gray8,
            fps: 30.0,
        };
        cam.configure(&fmt).unwrap();
        cam.start().unwrap();
        let mut buf = vec![0u8; 16];
        let timeout = Duration::from_millis(1);
        assert_eq!(cam.dequeue(0, &mut buf, timeout).unwrap().unwrap().timestamp_s, 0.1);
        assert_eq!(cam.dequeue(0, &mut buf, timeout).unwrap().unwrap().timestamp_s, 0.2);
        assert!(cam.dequeue(0, &mut buf, timeout).unwrap().is_none());
    }

    #[test]
    fn test_imu_follows_configured_reports() {
        let mut transport = ImuTransport::new(Box::new(SyntheticImu::new("imu")));
        transport.open().unwrap();
        transport.configure(OperationMode::Raw, 200).unwrap();
        let reports = transport.read_reports(Duration::from_millis(1)).unwrap();
        assert!(matches!(reports[0], SensorReport::Timebase { ticks: 0 }));
        assert!(reports
            .iter()
            .any(|r| matches!(r, SensorReport::GyroscopeUncalibrated { .. })));
        assert!(!reports.iter().any(|r| matches!(r, SensorReport::Rotation { .. })));

        let next = transport.read_reports(Duration::from_millis(1)).unwrap();
        // 200 Hz = 50 ticks of 100 µs.
        assert!(matches!(next[0], SensorReport::Timebase { ticks: 50 }));
    }
}
