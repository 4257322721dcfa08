//! Frame Provider: per-camera capture threads feeding pooled buffers to consumers.

use crate::buffer::{BufferPool, FrameBuffer};
use crate::config::{CameraConfig, FrameProviderConfig};
use crate::driver::{CameraDriver, StreamFormat};
use crate::error::LastError;
use crate::types::{CameraCaps, CameraId};
use crate::{Result, TrackingError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Slice used when blocking indefinitely, so shutdown is noticed.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct FrameCounters {
    captured: AtomicU64,
    delivered: AtomicU64,
    dropped_out_of_order: AtomicU64,
    dropped_unsynchronized: AtomicU64,
    starvation_events: AtomicU64,
    dequeue_errors: AtomicU64,
}

/// Per-camera capture statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub captured: u64,
    pub delivered: u64,
    /// Driver frames whose timestamp did not increase.
    pub dropped_out_of_order: u64,
    /// Frames discarded while aligning a synchronized set.
    pub dropped_unsynchronized: u64,
    pub starvation_events: u64,
    pub dequeue_errors: u64,
}

struct CameraSlot {
    id: CameraId,
    name: String,
    format: StreamFormat,
    caps: CameraCaps,
    zero_copy: bool,
    pool: Arc<BufferPool>,
    sender: Sender<FrameBuffer>,
    receiver: Receiver<FrameBuffer>,
    counters: Arc<FrameCounters>,
    driver: Mutex<Option<Box<dyn CameraDriver>>>,
    thread: Mutex<Option<JoinHandle<Box<dyn CameraDriver>>>>,
}

enum Wait {
    NonBlocking,
    Until(Instant),
    Forever,
}

impl Wait {
    fn from_timeout_ms(timeout_ms: i64) -> Self {
        match timeout_ms {
            0 => Wait::NonBlocking,
            t if t < 0 => Wait::Forever,
            t => Wait::Until(Instant::now() + Duration::from_millis(t as u64)),
        }
    }
}

/// Acquires frames from every camera of the rig into reusable buffers.
pub struct FrameProvider {
    config: FrameProviderConfig,
    cameras: Vec<CameraSlot>,
    running: Arc<AtomicBool>,
    /// Heads carried over between synchronized reads.
    sync_stash: Mutex<Vec<Option<FrameBuffer>>>,
    last_error: Arc<LastError>,
}

impl FrameProvider {
    /// Open and configure every camera and allocate its buffer pool.
    pub fn initialize(
        cameras: Vec<(CameraConfig, Box<dyn CameraDriver>)>,
        config: FrameProviderConfig,
    ) -> Result<FrameProvider> {
        if config.buffers_per_camera == 0 {
            return Err(TrackingError::DeviceUnavailable(
                "buffer pool must hold at least one buffer".into(),
            ));
        }

        let mut slots: Vec<CameraSlot> = Vec::with_capacity(cameras.len());
        for (cam_cfg, mut driver) in cameras {
            if slots.iter().any(|s| s.id == cam_cfg.id) {
                return Err(TrackingError::DeviceUnavailable(format!(
                    "camera id {} configured twice",
                    cam_cfg.id
                )));
            }

            driver.open().map_err(|e| {
                TrackingError::DeviceUnavailable(format!("{}: open failed: {}", driver.name(), e))
            })?;

            let requested = StreamFormat {
                width: cam_cfg.width,
                height: cam_cfg.height,
                stride: cam_cfg.format.min_stride(cam_cfg.width),
                format: cam_cfg.format,
                fps: cam_cfg.fps,
            };
            let format = driver.configure(&requested)?;
            if format.width == 0 || format.height == 0 || format.stride < format.format.min_stride(format.width) {
                return Err(TrackingError::UnsupportedFormat(format!(
                    "{}: negotiated {}x{} stride {} {:?}",
                    driver.name(),
                    format.width,
                    format.height,
                    format.stride,
                    format.format
                )));
            }
            if format.format != requested.format {
                log::warn!(
                    "{}: requested {:?}, driver negotiated {:?}",
                    driver.name(),
                    requested.format,
                    format.format
                );
            }

            let caps = driver.capabilities();
            let count = config.buffers_per_camera;
            let mut handles = Vec::with_capacity(count);
            let mut zero_copy = config.zero_copy && caps.contains(CameraCaps::ZERO_COPY);
            if zero_copy {
                for slot in 0..count {
                    handles.push(driver.export_buffer(slot, format.frame_size()));
                }
                if handles.iter().any(Option::is_none) {
                    log::info!("{}: buffer export failed, using copying path", driver.name());
                    zero_copy = false;
                    handles.clear();
                }
            }

            let pool = BufferPool::new(cam_cfg.id, format, count, handles);
            let (sender, receiver) = crossbeam_channel::bounded(count);

            log::info!(
                "Opened camera {} ({}): {}x{} {:?} @ {:.1} fps, {} buffers, zero-copy={}",
                cam_cfg.id,
                driver.name(),
                format.width,
                format.height,
                format.format,
                format.fps,
                count,
                zero_copy
            );

            slots.push(CameraSlot {
                id: cam_cfg.id,
                name: driver.name().to_string(),
                format,
                caps,
                zero_copy,
                pool,
                sender,
                receiver,
                counters: Arc::new(FrameCounters::default()),
                driver: Mutex::new(Some(driver)),
                thread: Mutex::new(None),
            });
        }

        let n = slots.len();
        Ok(FrameProvider {
            config,
            cameras: slots,
            running: Arc::new(AtomicBool::new(false)),
            sync_stash: Mutex::new((0..n).map(|_| None).collect()),
            last_error: Arc::new(LastError::new()),
        })
    }

    /// Start one capture thread per camera.
    pub fn start_acquisition(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for cam in &self.cameras {
            let mut driver = match cam.driver.lock().take() {
                Some(d) => d,
                None => continue,
            };
            if let Err(e) = driver.start() {
                *cam.driver.lock() = Some(driver);
                self.stop_acquisition();
                return Err(TrackingError::DeviceUnavailable(format!(
                    "{}: start failed: {}",
                    cam.name, e
                )));
            }

            let ctx = CaptureContext {
                camera_id: cam.id,
                pool: Arc::clone(&cam.pool),
                sender: cam.sender.clone(),
                running: Arc::clone(&self.running),
                counters: Arc::clone(&cam.counters),
                last_error: Arc::clone(&self.last_error),
                zero_copy: cam.zero_copy,
                poll: Duration::from_millis(self.config.dequeue_timeout_ms.max(1)),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("headtrack-cam{}", cam.id))
                .spawn(move || capture_loop(driver, ctx));
            match spawned {
                Ok(handle) => *cam.thread.lock() = Some(handle),
                Err(e) => {
                    self.stop_acquisition();
                    return Err(TrackingError::DeviceUnavailable(format!(
                        "failed to spawn capture thread for camera {}: {}",
                        cam.id, e
                    )));
                }
            }
        }
        log::info!("Acquisition started on {} cameras", self.cameras.len());
        Ok(())
    }

    /// Signal capture threads, join them, stop the devices and reclaim every queued buffer.
    ///
    /// Buffers already handed to consumers return to their pools when dropped.
    pub fn stop_acquisition(&self) {
        self.running.store(false, Ordering::SeqCst);
        for cam in &self.cameras {
            let handle = cam.thread.lock().take();
            if let Some(handle) = handle {
                match handle.join() {
                    Ok(mut driver) => {
                        if let Err(e) = driver.stop() {
                            log::warn!("{}: stop failed: {}", cam.name, e);
                        }
                        *cam.driver.lock() = Some(driver);
                    }
                    Err(_) => log::error!("capture thread of camera {} panicked", cam.id),
                }
            }
            while let Ok(frame) = cam.receiver.try_recv() {
                frame.release();
            }
        }
        for head in self.sync_stash.lock().iter_mut() {
            *head = None;
        }
        log::debug!("Acquisition stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(|c| c.id).collect()
    }

    pub fn format(&self, camera_id: CameraId) -> Result<StreamFormat> {
        Ok(self.camera(camera_id)?.format)
    }

    pub fn capabilities(&self, camera_id: CameraId) -> Result<CameraCaps> {
        Ok(self.camera(camera_id)?.caps)
    }

    pub fn zero_copy_active(&self, camera_id: CameraId) -> Result<bool> {
        Ok(self.camera(camera_id)?.zero_copy)
    }

    pub fn buffers_available(&self, camera_id: CameraId) -> Result<usize> {
        Ok(self.camera(camera_id)?.pool.available())
    }

    pub fn stats(&self, camera_id: CameraId) -> Result<FrameStats> {
        let c = &self.camera(camera_id)?.counters;
        Ok(FrameStats {
            captured: c.captured.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_out_of_order: c.dropped_out_of_order.load(Ordering::Relaxed),
            dropped_unsynchronized: c.dropped_unsynchronized.load(Ordering::Relaxed),
            starvation_events: c.starvation_events.load(Ordering::Relaxed),
            dequeue_errors: c.dequeue_errors.load(Ordering::Relaxed),
        })
    }

    /// Latest steady-state failure reported by a capture thread.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.message()
    }

    /// Next unconsumed frame of `camera_id`.
    ///
    /// `timeout_ms`: 0 = non-blocking, negative = block until a frame arrives or
    /// acquisition stops, positive = wait at most that long.
    pub fn get_next_frame(&self, camera_id: CameraId, timeout_ms: i64) -> Result<FrameBuffer> {
        let cam = self.camera(camera_id)?;
        self.recv_frame(cam, &Wait::from_timeout_ms(timeout_ms))
    }

    /// One frame per camera, ordered like [`camera_ids`](Self::camera_ids), whose
    /// timestamps all lie within `max_time_diff_ms` of each other.
    ///
    /// The oldest head is discarded until the set aligns. On timeout the heads
    /// gathered so far are kept for the next call.
    pub fn get_synchronized_frames(
        &self,
        max_time_diff_ms: f64,
        timeout_ms: i64,
    ) -> Result<Vec<FrameBuffer>> {
        let wait = Wait::from_timeout_ms(timeout_ms);
        let max_diff_s = max_time_diff_ms.max(0.0) / 1000.0;

        // Taken out of the lock so no lock is held while blocking on a channel.
        let mut heads = std::mem::take(&mut *self.sync_stash.lock());
        heads.resize_with(self.cameras.len(), || None);

        let outcome = loop {
            let mut failed = None;
            for (i, cam) in self.cameras.iter().enumerate() {
                if heads[i].is_none() {
                    match self.recv_frame(cam, &wait) {
                        Ok(frame) => heads[i] = Some(frame),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
            }
            if let Some(e) = failed {
                break Err(e);
            }

            let mut oldest = 0;
            let mut min_ts = f64::INFINITY;
            let mut max_ts = f64::NEG_INFINITY;
            for (i, head) in heads.iter().enumerate() {
                if let Some(frame) = head {
                    let ts = frame.timestamp_s();
                    if ts < min_ts {
                        min_ts = ts;
                        oldest = i;
                    }
                    max_ts = max_ts.max(ts);
                }
            }

            if max_ts - min_ts <= max_diff_s {
                break Ok(heads.iter_mut().filter_map(Option::take).collect::<Vec<_>>());
            }

            if let Some(stale) = heads[oldest].take() {
                self.cameras[oldest]
                    .counters
                    .dropped_unsynchronized
                    .fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "camera {}: discarding frame {} ({:.1} ms behind)",
                    stale.camera_id(),
                    stale.frame_id(),
                    (max_ts - stale.timestamp_s()) * 1000.0
                );
                stale.release();
            }
        };

        match outcome {
            Ok(frames) => Ok(frames),
            Err(e) => {
                if self.is_running() {
                    *self.sync_stash.lock() = heads;
                }
                Err(match e {
                    TrackingError::Timeout => TrackingError::SynchronizationTimeout,
                    other => other,
                })
            }
        }
    }

    /// Return a frame to its pool.
    pub fn release_frame(&self, frame: FrameBuffer) {
        frame.release();
    }

    fn camera(&self, camera_id: CameraId) -> Result<&CameraSlot> {
        self.cameras
            .iter()
            .find(|c| c.id == camera_id)
            .ok_or(TrackingError::CameraNotFound(camera_id))
    }

    fn recv_frame(&self, cam: &CameraSlot, wait: &Wait) -> Result<FrameBuffer> {
        let received = match wait {
            Wait::NonBlocking => match cam.receiver.try_recv() {
                Ok(frame) => Ok(frame),
                Err(TryRecvError::Empty) => Err(RecvTimeoutError::Timeout),
                Err(TryRecvError::Disconnected) => Err(RecvTimeoutError::Disconnected),
            },
            Wait::Until(deadline) => cam
                .receiver
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            Wait::Forever => loop {
                match cam.receiver.recv_timeout(POLL_SLICE) {
                    Err(RecvTimeoutError::Timeout) if self.is_running() => continue,
                    other => break other,
                }
            },
        };

        match received {
            Ok(frame) => {
                cam.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) if !self.is_running() => Err(TrackingError::StreamStopped),
            Err(RecvTimeoutError::Timeout) if cam.pool.available() == 0 => {
                Err(TrackingError::BufferStarvation(cam.id))
            }
            Err(RecvTimeoutError::Timeout) => Err(TrackingError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TrackingError::StreamStopped),
        }
    }
}

impl Drop for FrameProvider {
    fn drop(&mut self) {
        self.stop_acquisition();
    }
}

struct CaptureContext {
    camera_id: CameraId,
    pool: Arc<BufferPool>,
    sender: Sender<FrameBuffer>,
    running: Arc<AtomicBool>,
    counters: Arc<FrameCounters>,
    last_error: Arc<LastError>,
    zero_copy: bool,
    poll: Duration,
}

/// Capture loop of one camera. Returns the driver so acquisition can restart.
fn capture_loop(mut driver: Box<dyn CameraDriver>, ctx: CaptureContext) -> Box<dyn CameraDriver> {
    let mut next_frame_id: u64 = 1;
    let mut last_timestamp = f64::NEG_INFINITY;
    let mut starving = false;

    log::debug!("Capture thread for camera {} started", ctx.camera_id);

    while ctx.running.load(Ordering::Relaxed) {
        let mut lease = match ctx.pool.acquire_timeout(ctx.poll) {
            Some(lease) => {
                starving = false;
                lease
            }
            None => {
                ctx.counters.starvation_events.fetch_add(1, Ordering::Relaxed);
                if !starving {
                    log::warn!(
                        "camera {}: all {} buffers in use, capture stalled",
                        ctx.camera_id,
                        ctx.pool.capacity()
                    );
                    ctx.last_error.set(&TrackingError::BufferStarvation(ctx.camera_id));
                }
                starving = true;
                continue;
            }
        };

        let slot = lease.token().slot;
        let capture = match driver.dequeue(slot, lease.data_mut(), ctx.poll) {
            Ok(Some(capture)) => capture,
            Ok(None) => continue,
            Err(e) => {
                ctx.counters.dequeue_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("camera {}: dequeue failed: {}", ctx.camera_id, e);
                ctx.last_error.set(&e);
                std::thread::sleep(ctx.poll);
                continue;
            }
        };

        if capture.timestamp_s <= last_timestamp {
            ctx.counters.dropped_out_of_order.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "camera {}: dropping frame at {:.6}s, not after {:.6}s",
                ctx.camera_id,
                capture.timestamp_s,
                last_timestamp
            );
            continue;
        }
        last_timestamp = capture.timestamp_s;

        let frame = lease.into_frame(next_frame_id, capture.timestamp_s, ctx.zero_copy);
        next_frame_id += 1;
        ctx.counters.captured.fetch_add(1, Ordering::Relaxed);

        match ctx.sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                log::trace!("camera {}: frame queue full, dropping frame", ctx.camera_id);
                frame.release();
            }
            Err(TrySendError::Disconnected(_)) => {
                log::info!("camera {}: consumer gone, stopping capture", ctx.camera_id);
                break;
            }
        }
    }

    log::debug!("Capture thread for camera {} stopping", ctx.camera_id);
    driver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SyntheticCamera;

    fn provider(offsets: &[f64], period: f64, buffers: usize) -> FrameProvider {
        let cameras = offsets
            .iter()
            .enumerate()
            .map(|(i, &offset)| {
                let driver: Box<dyn CameraDriver> =
                    Box::new(SyntheticCamera::new(format!("sim{}", i)).with_timing(offset, period));
                (CameraConfig::new(i, 64, 48), driver)
            })
            .collect();
        FrameProvider::initialize(
            cameras,
            FrameProviderConfig {
                buffers_per_camera: buffers,
                zero_copy: false,
                dequeue_timeout_ms: 5,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_camera() {
        let p = provider(&[0.0], 0.01, 2);
        assert!(matches!(
            p.get_next_frame(7, 0),
            Err(TrackingError::CameraNotFound(7))
        ));
    }

    #[test]
    fn test_not_started_reports_stopped() {
        let p = provider(&[0.0], 0.01, 2);
        assert!(matches!(p.get_next_frame(0, 10), Err(TrackingError::StreamStopped)));
    }

    #[test]
    fn test_frames_strictly_increasing() {
        let p = provider(&[0.0], 0.005, 3);
        p.start_acquisition().unwrap();
        let mut last_ts = f64::NEG_INFINITY;
        let mut last_id = 0;
        for _ in 0..20 {
            let frame = p.get_next_frame(0, 1000).unwrap();
            assert!(frame.timestamp_s() > last_ts);
            assert!(frame.frame_id() > last_id);
            last_ts = frame.timestamp_s();
            last_id = frame.frame_id();
            p.release_frame(frame);
        }
        p.stop_acquisition();
        assert_eq!(p.buffers_available(0).unwrap(), 3);
    }

    #[test]
    fn test_starvation_is_reported() {
        let p = provider(&[0.0], 0.002, 2);
        p.start_acquisition().unwrap();
        let a = p.get_next_frame(0, 1000).unwrap();
        let b = p.get_next_frame(0, 1000).unwrap();
        assert_eq!(p.buffers_available(0).unwrap(), 0);
        assert!(matches!(
            p.get_next_frame(0, 50),
            Err(TrackingError::BufferStarvation(0))
        ));
        drop(a);
        drop(b);
        assert!(p.get_next_frame(0, 1000).is_ok());
        p.stop_acquisition();
        assert!(p.stats(0).unwrap().starvation_events > 0);
    }

    #[test]
    fn test_synchronized_sets_respect_tolerance() {
        // Camera 1 lags camera 0 by 3 ms, well inside the 5 ms gate.
        let p = provider(&[0.0, 0.003], 0.01, 4);
        p.start_acquisition().unwrap();
        for _ in 0..10 {
            let set = p.get_synchronized_frames(5.0, 1000).unwrap();
            assert_eq!(set.len(), 2);
            let spread = (set[0].timestamp_s() - set[1].timestamp_s()).abs();
            assert!(spread <= 0.005 + 1e-9, "spread {}", spread);
        }
        p.stop_acquisition();
    }

    #[test]
    fn test_synchronization_times_out_when_never_aligned() {
        // 40 ms apart with a 5 ms gate never aligns.
        let p = provider(&[0.0, 0.04], 0.1, 4);
        p.start_acquisition().unwrap();
        let res = p.get_synchronized_frames(5.0, 50);
        assert!(matches!(res, Err(TrackingError::SynchronizationTimeout)));
        p.stop_acquisition();
        assert_eq!(p.buffers_available(0).unwrap(), 4);
        assert_eq!(p.buffers_available(1).unwrap(), 4);
    }
}
