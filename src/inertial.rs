//! Inertial Interface: acquisition thread for a fused 9-axis IMU.
//!
//! Samples land in a bounded, time-ordered ring. When full, the oldest sample
//! is evicted. Calibration quality and bias are kept as a snapshot that the
//! acquisition thread replaces as the chip reports better confidence.

use crate::config::InertialConfig;
use crate::driver::{ImuDriver, ImuTransport};
use crate::error::LastError;
use crate::protocol::{RotationKind, SensorReport, TIME_TICK_S};
use crate::types::{CalibrationState, ImuBias, InertialSample, OperationMode};
use crate::{Result, TrackingError};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Health of the inertial path.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InertialStatus {
    Stopped = 0,
    Running = 1,
    /// The chip stopped answering; consumers should fall back to vision only.
    CommLost = 2,
}

/// Bounded FIFO of samples with strictly increasing timestamps.
pub(crate) struct SampleQueue {
    samples: VecDeque<InertialSample>,
    capacity: usize,
    evicted: u64,
    rejected: u64,
}

impl SampleQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
            rejected: 0,
        }
    }

    /// Append a sample. Samples not newer than the tail are rejected.
    pub(crate) fn push(&mut self, sample: InertialSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp_s <= last.timestamp_s {
                self.rejected += 1;
                return false;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
            self.evicted += 1;
        }
        self.samples.push_back(sample);
        true
    }

    pub(crate) fn drain(&mut self, max: usize) -> Vec<InertialSample> {
        let n = max.min(self.samples.len());
        self.samples.drain(..n).collect()
    }

    /// Copy of every sample with `start <= t <= end`.
    pub(crate) fn range(&self, start: f64, end: f64) -> Vec<InertialSample> {
        if end < start {
            return Vec::new();
        }
        let lo = self.samples.partition_point(|s| s.timestamp_s < start);
        let hi = self.samples.partition_point(|s| s.timestamp_s <= end);
        self.samples.range(lo..hi).copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }
}

struct Shared {
    queue: Mutex<SampleQueue>,
    calibration: Mutex<CalibrationState>,
    orientation: Mutex<Option<(f64, UnitQuaternion<f64>)>>,
    /// Mode/rate change waiting to be applied by the acquisition thread.
    pending: Mutex<Option<(OperationMode, u32)>>,
    mode: Mutex<OperationMode>,
    rate_hz: AtomicU32,
    running: AtomicBool,
    comm_lost: AtomicBool,
    packets: AtomicU64,
    last_error: LastError,
}

/// Acquisition and calibration state of the IMU chip.
pub struct InertialInterface {
    config: InertialConfig,
    shared: Arc<Shared>,
    stop_flag: Arc<AtomicBool>,
    transport: Mutex<Option<ImuTransport>>,
    thread: Mutex<Option<JoinHandle<ImuTransport>>>,
}

impl InertialInterface {
    /// Open the chip and enable the reports of the configured mode.
    pub fn initialize(driver: Box<dyn ImuDriver>, config: InertialConfig) -> Result<InertialInterface> {
        let mut transport = ImuTransport::new(driver);
        transport.open()?;
        transport
            .configure(config.mode, config.rate_hz)
            .map_err(|e| TrackingError::DeviceUnavailable(format!("{}: {}", transport.name(), e)))?;

        log::info!(
            "Opened IMU {} in {:?} mode at {} Hz",
            transport.name(),
            config.mode,
            config.rate_hz
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(SampleQueue::new(config.queue_capacity)),
            calibration: Mutex::new(CalibrationState::default()),
            orientation: Mutex::new(None),
            pending: Mutex::new(None),
            mode: Mutex::new(config.mode),
            rate_hz: AtomicU32::new(config.rate_hz),
            running: AtomicBool::new(false),
            comm_lost: AtomicBool::new(false),
            packets: AtomicU64::new(0),
            last_error: LastError::new(),
        });

        Ok(InertialInterface {
            config,
            shared,
            stop_flag: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(Some(transport)),
            thread: Mutex::new(None),
        })
    }

    /// Spawn the acquisition thread.
    pub fn start_acquisition(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let transport = self
            .transport
            .lock()
            .take()
            .ok_or_else(|| TrackingError::DeviceUnavailable("IMU transport unavailable".into()))?;

        self.stop_flag.store(false, Ordering::SeqCst);
        self.shared.comm_lost.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop_flag);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("headtrack-imu".into())
            .spawn(move || acquisition_loop(transport, shared, stop, config))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                TrackingError::DeviceUnavailable(format!("Failed to spawn IMU thread: {}", e))
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop and join the acquisition thread. Queued samples stay readable.
    pub fn stop_acquisition(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            match handle.join() {
                Ok(transport) => *self.transport.lock() = Some(transport),
                Err(_) => log::error!("IMU acquisition thread panicked"),
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> InertialStatus {
        if !self.shared.running.load(Ordering::SeqCst) {
            InertialStatus::Stopped
        } else if self.shared.comm_lost.load(Ordering::SeqCst) {
            InertialStatus::CommLost
        } else {
            InertialStatus::Running
        }
    }

    /// Drain up to `max_samples` in arrival order. Never blocks.
    pub fn get_measurements(&self, max_samples: usize) -> Vec<InertialSample> {
        self.shared.queue.lock().drain(max_samples)
    }

    /// Samples with `start_s <= t <= end_s`, left in the queue.
    pub fn get_measurements_in_time_range(&self, start_s: f64, end_s: f64) -> Vec<InertialSample> {
        self.shared.queue.lock().range(start_s, end_s)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Samples lost to overflow since start.
    pub fn evicted(&self) -> u64 {
        self.shared.queue.lock().evicted
    }

    pub fn get_calibration(&self) -> CalibrationState {
        *self.shared.calibration.lock()
    }

    /// Override the whole calibration snapshot, e.g. from an external estimator.
    pub fn set_calibration(&self, mut state: CalibrationState) {
        state.recompute_system();
        *self.shared.calibration.lock() = state;
    }

    pub fn get_current_bias(&self) -> ImuBias {
        self.shared.calibration.lock().bias
    }

    pub fn set_bias(&self, bias: ImuBias) {
        self.shared.calibration.lock().bias = bias;
        log::debug!("IMU bias set: gyro={:?} accel={:?}", bias.gyro.as_slice(), bias.accel.as_slice());
    }

    pub fn operation_mode(&self) -> OperationMode {
        *self.shared.mode.lock()
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.rate_hz.load(Ordering::SeqCst)
    }

    /// Switch the chip mode. Applied by the acquisition thread if running.
    pub fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.reconfigure(mode, self.sample_rate())
    }

    pub fn set_sample_rate(&self, rate_hz: u32) -> Result<()> {
        if rate_hz == 0 {
            return Err(TrackingError::UnsupportedFormat("IMU sample rate must be positive".into()));
        }
        self.reconfigure(self.operation_mode(), rate_hz)
    }

    /// Latest on-chip orientation and its timestamp, if the mode reports one.
    pub fn latest_orientation(&self) -> Option<(f64, UnitQuaternion<f64>)> {
        *self.shared.orientation.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.message()
    }

    fn reconfigure(&self, mode: OperationMode, rate_hz: u32) -> Result<()> {
        // The transport is either parked here or owned by the thread. It stays
        // parked until the new mode is recorded.
        let mut parked = self.transport.lock();
        match parked.as_mut() {
            Some(transport) => transport.configure(mode, rate_hz)?,
            None => *self.shared.pending.lock() = Some((mode, rate_hz)),
        }
        *self.shared.mode.lock() = mode;
        self.shared.rate_hz.store(rate_hz, Ordering::SeqCst);
        drop(parked);
        log::info!("IMU switched to {:?} at {} Hz", mode, rate_hz);
        Ok(())
    }
}

impl Drop for InertialInterface {
    fn drop(&mut self) {
        self.stop_acquisition();
    }
}

/// Chip bias changes smaller than this (rad/s) keep the still window.
const CHIP_BIAS_EPSILON: f64 = 1e-6;

/// Turns decoded reports into samples and calibration updates.
struct ReportDecoder {
    base_ticks: Option<u64>,
    last_raw_ticks: u32,
    wraps: u64,
    accel: Option<Vector3<f64>>,
    /// Bias the chip reports alongside uncalibrated gyro values. The still
    /// window restarts whenever it changes.
    chip_gyro_bias: Vector3<f64>,
    still_sum: Vector3<f64>,
    still_count: usize,
    threshold: f64,
    window: usize,
}

impl ReportDecoder {
    fn new(config: &InertialConfig) -> Self {
        Self {
            base_ticks: None,
            last_raw_ticks: 0,
            wraps: 0,
            accel: None,
            chip_gyro_bias: Vector3::zeros(),
            still_sum: Vector3::zeros(),
            still_count: 0,
            threshold: config.stationary_gyro_threshold,
            window: config.stationary_window.max(1),
        }
    }

    fn time_of(&self, delay_ticks: u8) -> Option<f64> {
        self.base_ticks
            .map(|base| (base + delay_ticks as u64) as f64 * TIME_TICK_S)
    }

    fn handle(&mut self, report: SensorReport, shared: &Shared) {
        match report {
            SensorReport::Timebase { ticks } => {
                if self.base_ticks.is_some() && ticks < self.last_raw_ticks {
                    self.wraps += 1;
                }
                self.last_raw_ticks = ticks;
                self.base_ticks = Some((self.wraps << 32) | ticks as u64);
            }
            SensorReport::Accelerometer { value, accuracy, .. } => {
                self.accel = Some(value);
                let mut cal = shared.calibration.lock();
                cal.accel = accuracy;
                cal.recompute_system();
            }
            SensorReport::LinearAcceleration { .. } => {}
            SensorReport::MagneticField { accuracy, .. } => {
                let mut cal = shared.calibration.lock();
                cal.mag = accuracy;
                cal.recompute_system();
            }
            SensorReport::Rotation { kind, orientation, accuracy, delay_ticks } => {
                if let Some(t) = self.time_of(delay_ticks) {
                    *shared.orientation.lock() = Some((t, orientation));
                }
                // Game vectors carry no magnetic reference.
                if matches!(kind, RotationKind::Absolute | RotationKind::ArvrAbsolute) {
                    let mut cal = shared.calibration.lock();
                    cal.mag = accuracy;
                    cal.recompute_system();
                }
            }
            SensorReport::Gyroscope { value, accuracy, delay_ticks } => {
                self.gyro(value, accuracy, delay_ticks, shared);
            }
            SensorReport::GyroscopeUncalibrated { value, bias, accuracy, delay_ticks } => {
                if (bias - self.chip_gyro_bias).norm() > CHIP_BIAS_EPSILON {
                    // Residuals measured against the old chip bias no longer apply.
                    if self.still_count > 0 {
                        log::debug!(
                            "IMU: chip gyro bias moved to {:?}, restarting still window",
                            bias.as_slice()
                        );
                    }
                    self.chip_gyro_bias = bias;
                    self.still_sum = Vector3::zeros();
                    self.still_count = 0;
                }
                self.gyro(value - bias, accuracy, delay_ticks, shared);
            }
        }
    }

    /// `gyro` has the chip's own bias removed already.
    fn gyro(&mut self, gyro: Vector3<f64>, accuracy: u8, delay_ticks: u8, shared: &Shared) {
        let bias = {
            let mut cal = shared.calibration.lock();
            cal.gyro = accuracy;
            cal.recompute_system();
            cal.bias
        };

        let corrected = gyro - bias.gyro;
        if accuracy >= 2 {
            self.refine_bias(gyro, corrected, shared);
        }

        let (timestamp_s, accel) = match (self.time_of(delay_ticks), self.accel) {
            (Some(t), Some(a)) => (t, a),
            _ => {
                log::trace!("IMU: gyro report before timebase/accel, skipped");
                return;
            }
        };

        let sample = InertialSample {
            timestamp_s,
            accel: accel - bias.accel,
            gyro: corrected,
        };
        if !shared.queue.lock().push(sample) {
            log::trace!("IMU: non-increasing timestamp {:.6}s rejected", timestamp_s);
        }
    }

    fn refine_bias(&mut self, gyro: Vector3<f64>, corrected: Vector3<f64>, shared: &Shared) {
        if corrected.norm() > self.threshold {
            self.still_sum = Vector3::zeros();
            self.still_count = 0;
            return;
        }
        self.still_sum += gyro;
        self.still_count += 1;
        if self.still_count >= self.window {
            let estimate = self.still_sum / self.still_count as f64;
            shared.calibration.lock().bias.gyro = estimate;
            log::debug!("Gyro bias refined over {} still samples: {:?}", self.still_count, estimate.as_slice());
            self.still_sum = Vector3::zeros();
            self.still_count = 0;
        }
    }
}

fn acquisition_loop(
    mut transport: ImuTransport,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    config: InertialConfig,
) -> ImuTransport {
    let read_timeout = Duration::from_millis(config.read_timeout_ms.max(1));
    let comm_loss_after = Duration::from_millis(config.comm_loss_after_ms.max(1));
    let mut decoder = ReportDecoder::new(&config);
    let mut last_data = Instant::now();
    let mut last_probe = Instant::now();

    log::info!("IMU reader started ({})", transport.name());

    while !stop.load(Ordering::Relaxed) {
        let pending = shared.pending.lock().take();
        if let Some((mode, rate)) = pending {
            if let Err(e) = transport.configure(mode, rate) {
                log::warn!("IMU reconfigure failed: {}", e);
                shared.last_error.set(&e);
            }
        }

        let reports = match transport.read_reports(read_timeout) {
            Ok(reports) => reports,
            Err(e) => {
                log::trace!("IMU read error: {}", e);
                shared.last_error.set(&e);
                Vec::new()
            }
        };

        if reports.is_empty() {
            if last_data.elapsed() >= comm_loss_after {
                if !shared.comm_lost.swap(true, Ordering::SeqCst) {
                    log::warn!(
                        "IMU silent for {} ms, degrading to vision only",
                        last_data.elapsed().as_millis()
                    );
                    shared
                        .last_error
                        .set(&TrackingError::InertialCommError("no reports from chip".into()));
                }
                if last_probe.elapsed() >= comm_loss_after {
                    last_probe = Instant::now();
                    if let Err(e) = transport.probe() {
                        log::trace!("IMU probe failed: {}", e);
                    }
                }
            }
            continue;
        }

        last_data = Instant::now();
        if shared.comm_lost.swap(false, Ordering::SeqCst) {
            log::info!("IMU communication restored");
        }
        shared.packets.fetch_add(1, Ordering::Relaxed);

        for report in reports {
            decoder.handle(report, &shared);
        }
    }

    log::info!("IMU reader stopping (stop flag set)");
    transport
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SyntheticImu;
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;

    fn sample(t: f64) -> InertialSample {
        InertialSample {
            timestamp_s: t,
            accel: Vector3::new(0.0, 0.0, 9.81),
            gyro: Vector3::zeros(),
        }
    }

    #[test]
    fn test_queue_evicts_oldest() {
        let mut q = SampleQueue::new(3);
        for i in 0..5 {
            assert!(q.push(sample(i as f64)));
        }
        assert_eq!(q.evicted, 2);
        let times: Vec<f64> = q.drain(10).iter().map(|s| s.timestamp_s).collect();
        assert_eq!(times, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_queue_rejects_out_of_order() {
        let mut q = SampleQueue::new(8);
        assert!(q.push(sample(1.0)));
        assert!(!q.push(sample(1.0)));
        assert!(!q.push(sample(0.5)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.rejected, 2);
    }

    #[test]
    fn test_queue_range_is_contiguous_and_non_destructive() {
        let mut q = SampleQueue::new(16);
        for i in 0..10 {
            q.push(sample(i as f64 * 0.1));
        }
        let r = q.range(0.25, 0.55);
        let times: Vec<f64> = r.iter().map(|s| s.timestamp_s).collect();
        assert_eq!(times.len(), 3);
        assert_relative_eq!(times[0], 0.3, epsilon = 1e-12);
        assert_relative_eq!(times[2], 0.5, epsilon = 1e-12);
        assert_eq!(q.len(), 10);
        assert!(q.range(0.9, 0.1).is_empty());
    }

    #[quickcheck]
    fn prop_queue_stays_ordered(times: Vec<u16>, cap: u8) -> bool {
        let mut q = SampleQueue::new(cap as usize % 32 + 1);
        for t in times {
            q.push(sample(t as f64));
        }
        let out = q.drain(usize::MAX);
        out.windows(2).all(|w| w[0].timestamp_s < w[1].timestamp_s)
    }

    #[test]
    fn test_acquisition_produces_calibrated_samples() {
        let imu = SyntheticImu::new("imu").with_gyro_bias(Vector3::new(0.01, 0.0, -0.01));
        let cfg = InertialConfig {
            stationary_window: 20,
            ..InertialConfig::default()
        };
        let inertial = InertialInterface::initialize(Box::new(imu), cfg).unwrap();
        inertial.start_acquisition().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while inertial.queued() < 50 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(inertial.status(), InertialStatus::Running);

        let samples = inertial.get_measurements(1000);
        assert!(samples.len() >= 50);
        assert!(samples.windows(2).all(|w| w[0].timestamp_s < w[1].timestamp_s));
        assert_relative_eq!(samples[0].accel.z, 9.81, epsilon = 0.02);

        let cal = inertial.get_calibration();
        assert_eq!(cal.gyro, 3);
        assert_relative_eq!(cal.bias.gyro.x, 0.01, epsilon = 0.005);

        inertial.stop_acquisition();
        assert_eq!(inertial.status(), InertialStatus::Stopped);
    }

    #[test]
    fn test_mode_switch_while_running() {
        let imu = SyntheticImu::new("imu");
        let inertial = InertialInterface::initialize(Box::new(imu), InertialConfig::default()).unwrap();
        inertial.start_acquisition().unwrap();
        inertial.set_operation_mode(OperationMode::Raw).unwrap();
        inertial.set_sample_rate(200).unwrap();
        assert_eq!(inertial.operation_mode(), OperationMode::Raw);
        assert_eq!(inertial.sample_rate(), 200);
        assert!(inertial.set_sample_rate(0).is_err());
        inertial.stop_acquisition();
    }

    #[test]
    fn test_silence_reports_comm_lost() {
        let imu = SyntheticImu::new("imu").silent();
        let cfg = InertialConfig {
            comm_loss_after_ms: 30,
            read_timeout_ms: 5,
            ..InertialConfig::default()
        };
        let inertial = InertialInterface::initialize(Box::new(imu), cfg).unwrap();
        inertial.start_acquisition().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while inertial.status() != InertialStatus::CommLost && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(inertial.status(), InertialStatus::CommLost);
        assert!(inertial.last_error().is_some());
        inertial.stop_acquisition();
    }

    #[test]
    fn test_set_bias_snapshot() {
        let inertial =
            InertialInterface::initialize(Box::new(SyntheticImu::new("imu")), InertialConfig::default())
                .unwrap();
        let bias = ImuBias {
            gyro: Vector3::new(0.1, 0.2, 0.3),
            accel: Vector3::new(-0.1, 0.0, 0.05),
        };
        inertial.set_bias(bias);
        assert_eq!(inertial.get_current_bias(), bias);
        let mut cal = inertial.get_calibration();
        cal.accel = 3;
        cal.gyro = 2;
        cal.mag = 1;
        inertial.set_calibration(cal);
        assert_eq!(inertial.get_calibration().system, 1);
    }

    fn shared() -> Shared {
        Shared {
            queue: Mutex::new(SampleQueue::new(64)),
            calibration: Mutex::new(CalibrationState::default()),
            orientation: Mutex::new(None),
            pending: Mutex::new(None),
            mode: Mutex::new(OperationMode::Raw),
            rate_hz: AtomicU32::new(100),
            running: AtomicBool::new(false),
            comm_lost: AtomicBool::new(false),
            packets: AtomicU64::new(0),
            last_error: LastError::new(),
        }
    }

    fn uncalibrated(value: f64, bias: f64) -> SensorReport {
        SensorReport::GyroscopeUncalibrated {
            value: Vector3::new(value, 0.0, 0.0),
            bias: Vector3::new(bias, 0.0, 0.0),
            accuracy: 3,
            delay_ticks: 0,
        }
    }

    #[test]
    fn test_chip_bias_change_restarts_still_window() {
        let shared = shared();
        let mut decoder = ReportDecoder::new(&InertialConfig {
            stationary_window: 4,
            ..InertialConfig::default()
        });

        // Residual of 0.012 against the first chip bias, then 0.004 once the
        // chip refines its own estimate.
        for _ in 0..3 {
            decoder.handle(uncalibrated(0.012, 0.0), &shared);
        }
        for _ in 0..3 {
            decoder.handle(uncalibrated(0.012, 0.008), &shared);
        }
        assert_eq!(shared.calibration.lock().bias.gyro, Vector3::zeros());

        decoder.handle(uncalibrated(0.012, 0.008), &shared);
        assert_relative_eq!(shared.calibration.lock().bias.gyro.x, 0.004, epsilon = 1e-12);
        assert_eq!(decoder.chip_gyro_bias.x, 0.008);
    }

    #[test]
    fn test_only_absolute_rotation_sets_mag_accuracy() {
        let shared = shared();
        let mut decoder = ReportDecoder::new(&InertialConfig::default());
        let rotation = |kind, accuracy| SensorReport::Rotation {
            kind,
            orientation: UnitQuaternion::identity(),
            accuracy,
            delay_ticks: 0,
        };

        decoder.handle(rotation(RotationKind::Game, 3), &shared);
        decoder.handle(rotation(RotationKind::ArvrGame, 3), &shared);
        assert_eq!(shared.calibration.lock().mag, 0);

        decoder.handle(rotation(RotationKind::ArvrAbsolute, 2), &shared);
        assert_eq!(shared.calibration.lock().mag, 2);
        decoder.handle(rotation(RotationKind::Absolute, 3), &shared);
        assert_eq!(shared.calibration.lock().mag, 3);
        decoder.handle(rotation(RotationKind::Game, 1), &shared);
        assert_eq!(shared.calibration.lock().mag, 3);
    }

    #[test]
    fn test_reconfigure_races_with_start() {
        let inertial =
            InertialInterface::initialize(Box::new(SyntheticImu::new("imu")), InertialConfig::default())
                .unwrap();
        for round in 0..20u32 {
            std::thread::scope(|s| {
                let reconfigure = s.spawn(|| {
                    for i in 0..20 {
                        inertial.set_sample_rate(100 + round + i).unwrap();
                    }
                });
                inertial.start_acquisition().unwrap();
                reconfigure.join().unwrap();
            });
            assert_eq!(inertial.status(), InertialStatus::Running);
            inertial.stop_acquisition();
        }
        assert_eq!(inertial.status(), InertialStatus::Stopped);
        assert_eq!(inertial.sample_rate(), 100 + 19 + 19);
    }
}
