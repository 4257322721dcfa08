//! End-to-end runs of the tracking pipeline on synthetic hardware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use headtrack::config::CameraConfig;
use headtrack::driver::CameraDriver;
use headtrack::fusion::FusedPose;
use headtrack::inertial::InertialStatus;
use headtrack::pipeline::{Devices, HeadTracker, TrackerStatus};
use headtrack::rig::{CameraRig, ImuExtrinsic, RigCalibration};
use headtrack::tracking::TrackingStatus;
use headtrack::sim::{PointScene, SceneRenderer, SimClock, SyntheticCamera, SyntheticImu, Trajectory};
use headtrack::{InteractionMode, PipelineConfig, Pose};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> PipelineConfig {
    PipelineConfig {
        cameras: vec![CameraConfig::new(0, 160, 120), CameraConfig::new(1, 160, 120)],
        ..PipelineConfig::default()
    }
}

/// Slow yaw with a gentle sideways drift.
fn trajectory() -> Trajectory {
    Arc::new(|t| Pose {
        rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.05 * t),
        translation: Vector3::new(0.02 * t, 0.0, 0.0),
        timestamp_s: t,
    })
}

fn devices(config: &PipelineConfig, clock: SimClock, with_imu: bool) -> Devices {
    mounted_devices(config, clock, with_imu.then(Isometry3::identity))
}

/// Cameras on the nominal rig and, with `imu_from_ref`, an IMU at that mount.
fn mounted_devices(config: &PipelineConfig, clock: SimClock, imu_from_ref: Option<Isometry3<f64>>) -> Devices {
    let geometry = Arc::new(RigCalibration::nominal(&config.cameras).to_geometry().unwrap());
    let scene: Arc<dyn SceneRenderer> = Arc::new(PointScene::random(400, geometry, trajectory(), 3));
    let cameras = config
        .cameras
        .iter()
        .map(|c| {
            Box::new(
                SyntheticCamera::new(format!("cam{}", c.id))
                    .with_camera_id(c.id)
                    .with_clock(clock)
                    .with_scene(Arc::clone(&scene)),
            ) as Box<dyn CameraDriver>
        })
        .collect();
    let imu = imu_from_ref.map(|mount| {
        Box::new(SyntheticImu::mounted("imu", trajectory(), Vector3::new(0.0, 9.81, 0.0), mount).with_clock(clock))
            as Box<dyn headtrack::driver::ImuDriver>
    });
    Devices {
        cameras,
        imu,
        accelerators: Vec::new(),
    }
}

fn collect(tracker: &HeadTracker, count: usize, deadline: Duration) -> Vec<FusedPose> {
    let start = Instant::now();
    let mut poses = Vec::new();
    while poses.len() < count && start.elapsed() < deadline {
        if let Ok(pose) = tracker.recv_timeout(Duration::from_millis(200)) {
            poses.push(pose);
        }
    }
    poses
}

/// Status once the tracker has built a map and is tracking against it.
fn wait_for_tracking(tracker: &HeadTracker, deadline: Duration) -> Option<TrackerStatus> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        let status = tracker.status();
        if status.tracking == TrackingStatus::Tracking && status.map_epoch >= 1 {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
fn test_visual_inertial_stream() {
    init_logger();
    let config = config();
    let clock = SimClock::new();
    let tracker = HeadTracker::initialize(config.clone(), devices(&config, clock, true)).unwrap();
    tracker.set_interaction_mode(InteractionMode::Seated);
    tracker.start().unwrap();
    assert!(tracker.is_running());

    let poses = collect(&tracker, 10, Duration::from_secs(5));
    assert!(!poses.is_empty(), "no fused pose within 5 s");
    for pair in poses.windows(2) {
        assert!(pair[1].pose.timestamp_s >= pair[0].pose.timestamp_s);
    }

    let status = wait_for_tracking(&tracker, Duration::from_secs(5)).expect("no map within 5 s");
    assert!(status.running);
    assert_eq!(status.tracking, TrackingStatus::Tracking);
    assert!(status.map_epoch >= 1);
    assert_eq!(status.inertial, Some(InertialStatus::Running));
    assert!(tracker.tracking_stats().map_epoch >= 1);

    let latest = tracker.current_pose().unwrap();
    let predicted = tracker.predict_pose(16.0).unwrap();
    assert!(predicted.timestamp_s >= latest.pose.timestamp_s - 0.1);

    tracker.stop();
    assert!(!tracker.is_running());
    assert_eq!(tracker.inertial().map(|imu| imu.status()), Some(InertialStatus::Stopped));
}

#[test]
fn test_vision_only_lifecycle_releases_buffers() {
    init_logger();
    let config = config();
    let clock = SimClock::new();
    let tracker = HeadTracker::initialize(config.clone(), devices(&config, clock, false)).unwrap();
    assert!(tracker.inertial().is_none());

    for _ in 0..2 {
        tracker.start().unwrap();
        let status = wait_for_tracking(&tracker, Duration::from_secs(5)).expect("no map within 5 s");
        assert_eq!(status.tracking, TrackingStatus::Tracking);
        assert!(!collect(&tracker, 1, Duration::from_secs(5)).is_empty());
        assert!(tracker.current_pose().is_some());
        tracker.stop();
        let provider = tracker.frame_provider();
        for id in provider.camera_ids() {
            assert_eq!(provider.buffers_available(id).unwrap(), config.frames.buffers_per_camera);
        }
    }
    let stats = tracker.tracking_stats();
    assert!(stats.frame_sets > 0);
    assert!(stats.map_epoch >= 1);
    assert_eq!(tracker.status().inertial, None);
}

#[test]
fn test_reset_clears_fused_state() {
    init_logger();
    let config = config();
    let clock = SimClock::new();
    let tracker = HeadTracker::initialize(config.clone(), devices(&config, clock, true)).unwrap();
    tracker.start().unwrap();
    assert!(!collect(&tracker, 1, Duration::from_secs(5)).is_empty());
    tracker.stop();

    tracker.reset();
    assert!(tracker.current_pose().is_none());
    assert!(tracker.try_recv().is_none());
    assert_eq!(tracker.status().tracking, TrackingStatus::NotInitialized);
}

#[test]
fn test_rotated_imu_mount_from_calibration() {
    init_logger();
    let mount = Isometry3::from_parts(
        Translation3::new(0.01, 0.03, -0.02),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::FRAC_PI_2),
    );
    let mut calibration = RigCalibration::nominal(&config().cameras);
    calibration.imu = ImuExtrinsic::from_isometry(&mount);
    let path = std::env::temp_dir().join(format!("headtrack-mounted-imu-{}.json", std::process::id()));
    CameraRig::from_calibration(&calibration).unwrap().save(&path).unwrap();

    let config = PipelineConfig {
        calibration_path: Some(path.clone()),
        ..config()
    };
    let clock = SimClock::new();
    let tracker = HeadTracker::initialize(config.clone(), mounted_devices(&config, clock, Some(mount))).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(tracker.rig_calibration().imu, calibration.imu);

    tracker.start().unwrap();
    wait_for_tracking(&tracker, Duration::from_secs(5)).expect("no map within 5 s");
    let start = Instant::now();
    while tracker.gravity().is_none() && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(20));
    }
    // Let the filter settle on gravity before reading it.
    assert!(!collect(&tracker, 30, Duration::from_secs(5)).is_empty());
    let gravity = tracker.gravity().expect("fusion never aligned");
    tracker.stop();

    // Gravity points down the world +y axis whatever way the IMU sits.
    let down = gravity.normalize();
    assert!((down - Vector3::new(0.0, 1.0, 0.0)).norm() < 0.1, "gravity {:?}", down);
}
