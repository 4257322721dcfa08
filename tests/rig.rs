//! Camera rig model across calibration documents, panoramas and visibility.

use std::sync::Arc;

use approx::assert_relative_eq;
use headtrack::config::{CameraConfig, FrameProviderConfig};
use headtrack::driver::CameraDriver;
use headtrack::frame::FrameProvider;
use headtrack::rig::{CameraRig, RigCalibration};
use headtrack::sim::{DiskScene, SyntheticCamera};
use headtrack::{ImageView, TrackingError};
use nalgebra::{Vector2, Vector3};

fn nominal() -> RigCalibration {
    RigCalibration::nominal(&[CameraConfig::new(0, 160, 120), CameraConfig::new(1, 160, 120)])
}

#[test]
fn test_calibration_file_round_trip() {
    let path = std::env::temp_dir().join(format!("headtrack-rig-{}.json", std::process::id()));
    let rig = CameraRig::from_calibration(&nominal()).unwrap();
    rig.save(&path).unwrap();

    let loaded = CameraRig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded.reference_camera(), 0);
    for id in [0, 1] {
        let a = rig.camera(id).unwrap();
        let b = loaded.camera(id).unwrap();
        assert_eq!((a.width, a.height), (b.width, b.height));
        assert_relative_eq!(a.intrinsics.fx, b.intrinsics.fx, epsilon = 1e-9);
        assert_relative_eq!(a.center(), b.center(), epsilon = 1e-9);
        assert_relative_eq!(a.optical_axis().into_inner(), b.optical_axis().into_inner(), epsilon = 1e-9);
    }
    assert_relative_eq!(loaded.baseline(0, 1).unwrap(), 0.08, epsilon = 1e-9);
}

#[test]
fn test_missing_calibration_falls_back_to_nominal() {
    let path = std::env::temp_dir().join("headtrack-rig-does-not-exist.json");
    let rig = CameraRig::load_or_default(&path, &nominal()).unwrap();
    assert_eq!(rig.snapshot().camera_ids(), vec![0, 1]);
}

#[test]
fn test_recalibration_replaces_the_whole_rig() {
    let rig = CameraRig::from_calibration(&nominal()).unwrap();
    let before = rig.snapshot();

    let mut wider = nominal();
    for cam in &mut wider.cameras {
        cam.translation[0] *= 1.5;
    }
    rig.set_calibration(&wider).unwrap();
    assert_relative_eq!(rig.baseline(0, 1).unwrap(), 0.12, epsilon = 1e-9);
    // Snapshots taken earlier keep their geometry.
    assert_relative_eq!(before.baseline(0, 1).unwrap(), 0.08, epsilon = 1e-9);

    let mut broken = nominal();
    broken.cameras[1].intrinsics.fy = -1.0;
    assert!(matches!(rig.set_calibration(&broken), Err(TrackingError::CalibrationInvalid(_))));
    assert_relative_eq!(rig.baseline(0, 1).unwrap(), 0.12, epsilon = 1e-9);
}

#[test]
fn test_overlap_and_exclusive_regions() {
    let rig = CameraRig::from_calibration(&nominal()).unwrap();

    // Between both optical axes: seen by both, closer to camera 1's axis.
    let shared = Vector3::new(1.5, 0.0, 2.5);
    assert!(rig.is_point_visible_to_camera(0, &shared).unwrap());
    assert!(rig.is_point_visible_to_camera(1, &shared).unwrap());

    // Straight ahead of camera 0, 60° off camera 1's axis.
    let ahead = Vector3::new(0.0, 0.0, 3.0);
    assert!(rig.is_point_visible_to_camera(0, &ahead).unwrap());
    assert!(!rig.is_point_visible_to_camera(1, &ahead).unwrap());
    assert_eq!(rig.find_best_camera_for_point(&ahead), Some(0));

    // A pixel from camera 0 lifted to the sphere lands in camera 1 only when
    // it falls in the overlap.
    let right_edge = rig.project_points_to_sphere(0, &[Vector2::new(150.0, 60.0)], 3.0).unwrap();
    let left_edge = rig.project_points_to_sphere(0, &[Vector2::new(5.0, 60.0)], 3.0).unwrap();
    assert!(rig.project_spherical_points_to_camera(1, &right_edge, 3.0).unwrap()[0].is_some());
    assert!(rig.project_spherical_points_to_camera(1, &left_edge, 3.0).unwrap()[0].is_none());
}

#[test]
fn test_panorama_covers_both_views() {
    let rig = CameraRig::from_calibration(&nominal()).unwrap();
    let scene = DiskScene::new([255, 255, 255]);
    let gray = scene.render_gray(160, 120);

    let single = rig
        .render_panorama(&[(0, ImageView::gray(&gray, 160, 120))], 360, 180)
        .unwrap();
    let both = rig
        .render_panorama(
            &[(0, ImageView::gray(&gray, 160, 120)), (1, ImageView::gray(&gray, 160, 120))],
            360,
            180,
        )
        .unwrap();

    assert_eq!(both.data.len(), 360 * 180);
    assert!(single.covered > 0);
    assert!(both.covered > single.covered);
    assert!(both.covered < both.data.len());
    // Two disks show up as bright pixels.
    let bright = |p: &headtrack::rig::Panorama| p.data.iter().filter(|&&v| v > 200).count();
    assert!(bright(&both) > bright(&single));

    assert!(matches!(
        rig.render_panorama(&[(5, ImageView::gray(&gray, 160, 120))], 360, 180),
        Err(TrackingError::CameraNotFound(5))
    ));
}

#[test]
fn test_injected_disk_frames_stitch() {
    let calibration = nominal();
    let rig = CameraRig::from_calibration(&calibration).unwrap();
    let configs = [CameraConfig::new(0, 160, 120), CameraConfig::new(1, 160, 120)];
    let cameras = configs
        .iter()
        .zip([[255, 0, 0], [0, 0, 255]])
        .map(|(c, color)| {
            let driver: Box<dyn CameraDriver> = Box::new(
                SyntheticCamera::new(format!("cam{}", c.id))
                    .with_camera_id(c.id)
                    .with_timing(0.0, 1.0 / 30.0)
                    .with_scene(Arc::new(DiskScene::new(color))),
            );
            (c.clone(), driver)
        })
        .collect();
    let provider = FrameProvider::initialize(cameras, FrameProviderConfig::default()).unwrap();
    provider.start_acquisition().unwrap();
    let frames = provider.get_synchronized_frames(5.0, 1000).unwrap();
    assert_eq!(frames.len(), 2);

    let images: Vec<_> = frames.iter().map(|f| (f.camera_id(), f.image())).collect();
    let panorama = rig.render_panorama(&images, 360, 180).unwrap();
    assert!(panorama.covered > 0);
    assert!(panorama.data.iter().any(|&v| v > 16));
    drop(images);
    for frame in frames {
        provider.release_frame(frame);
    }
    provider.stop_acquisition();

    // A point straight ahead of camera 0 is outside camera 1's field of view,
    // and camera 0 is the best match for it.
    let ahead = Vector3::new(0.0, 0.1, 4.0);
    assert!(!rig.is_point_visible_to_camera(1, &ahead).unwrap());
    assert_eq!(rig.find_best_camera_for_point(&ahead), Some(0));
    let right = Vector3::new(4.0, 0.0, 2.0);
    assert_eq!(rig.find_best_camera_for_point(&right), Some(1));
}
