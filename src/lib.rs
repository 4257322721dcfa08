//! # headtrack - multi-camera visual-inertial 6DOF head tracking
//!
//! Real-time pose tracking for VR headsets with several wide-angle cameras
//! and a fused IMU. Provides:
//! - Synchronized multi-camera capture over pooled, optionally zero-copy buffers
//! - Inertial acquisition with calibration and bias tracking
//! - Accelerated keypoint and descriptor extraction with a software fallback
//! - Camera rig model, cross-camera correspondence and a shared local map
//! - Visual-inertial fusion and render-time pose prediction
//! - C FFI for render engines
//!
//! ## Quick Start
//! ```no_run
//! use headtrack::pipeline::{Devices, HeadTracker};
//! use headtrack::sim::{SyntheticCamera, SyntheticImu};
//! use headtrack::PipelineConfig;
//! use std::time::Duration;
//!
//! let config = PipelineConfig::from_env();
//! let devices = Devices {
//!     cameras: vec![
//!         Box::new(SyntheticCamera::new("cam0").with_camera_id(0)),
//!         Box::new(SyntheticCamera::new("cam1").with_camera_id(1)),
//!     ],
//!     imu: Some(Box::new(SyntheticImu::new("imu"))),
//!     accelerators: Vec::new(),
//! };
//! let tracker = HeadTracker::initialize(config, devices).unwrap();
//! tracker.start().unwrap();
//! for _ in 0..100 {
//!     let fused = tracker.recv_timeout(Duration::from_secs(1)).unwrap();
//!     println!("pos: {:?} ({:?})", fused.pose.translation, fused.quality);
//!     let render = tracker.predict_pose(16.0);
//!     println!("render at: {:?}", render.map(|p| p.translation));
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod driver;
pub mod protocol;
pub mod buffer;
pub mod frame;
pub mod inertial;
pub mod extractor;
pub mod rig;
pub mod map;
pub mod geometry;
pub mod tracking;
pub mod preintegration;
pub mod fusion;
pub mod motion;
pub mod pipeline;
pub mod sim;
pub mod ffi;

pub use config::PipelineConfig;
pub use error::TrackingError;
pub use types::*;
pub use pipeline::HeadTracker;

/// Result type alias for headtrack operations.
pub type Result<T> = std::result::Result<T, TrackingError>;
