// Robot configuration: bus address, safety limits, base geometry, cameras.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::motor::kinematics::{BASE_RADIUS, MAX_RAW, WHEEL_RADIUS};

/// Serial port for the Feetech motor bus
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Where calibration records are persisted
pub const DEFAULT_CALIBRATION_PATH: &str = "config/calibration.json";

/// Safety limit on how far one command may move a joint from its present
/// position, in the joint's normalized unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxRelativeTarget {
    Global(f32),
    PerMotor(HashMap<String, f32>),
}

impl MaxRelativeTarget {
    /// Limit for one motor; motors without an entry are unlimited.
    pub fn limit_for(&self, motor: &str) -> f32 {
        match self {
            Self::Global(limit) => *limit,
            Self::PerMotor(limits) => limits.get(motor).copied().unwrap_or(f32::INFINITY),
        }
    }
}

/// Image rotation applied by the capture backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: String,
    #[serde(default)]
    pub rotation: Rotation,
}

/// LeKiwi robot configuration. Built once at process start, read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeKiwiConfig {
    #[serde(default = "default_port")]
    pub port: String,

    /// No clamping when absent.
    #[serde(default)]
    pub max_relative_target: Option<MaxRelativeTarget>,

    #[serde(default = "default_true")]
    pub disable_torque_on_disconnect: bool,

    /// Normalize arm joints in degrees instead of symmetric percentages.
    #[serde(default)]
    pub use_degrees: bool,

    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,

    #[serde(default = "default_wheel_radius")]
    pub wheel_radius: f32,

    #[serde(default = "default_base_radius")]
    pub base_radius: f32,

    /// Cap on raw wheel speed commands, ticks/s.
    #[serde(default = "default_max_raw_speed")]
    pub max_raw_speed: i16,

    #[serde(default = "default_cameras")]
    pub cameras: HashMap<String, CameraConfig>,
}

impl Default for LeKiwiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_relative_target: None,
            disable_torque_on_disconnect: true,
            use_degrees: false,
            calibration_path: default_calibration_path(),
            wheel_radius: WHEEL_RADIUS,
            base_radius: BASE_RADIUS,
            max_raw_speed: MAX_RAW,
            cameras: default_cameras(),
        }
    }
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from(DEFAULT_CALIBRATION_PATH)
}

fn default_wheel_radius() -> f32 {
    WHEEL_RADIUS
}

fn default_base_radius() -> f32 {
    BASE_RADIUS
}

fn default_max_raw_speed() -> i16 {
    MAX_RAW
}

fn default_cameras() -> HashMap<String, CameraConfig> {
    HashMap::from([
        (
            "front".to_string(),
            CameraConfig {
                device: "/dev/video0".to_string(),
                rotation: Rotation::Cw180,
            },
        ),
        (
            "wrist".to_string(),
            CameraConfig {
                device: "/dev/video2".to_string(),
                rotation: Rotation::Cw90,
            },
        ),
    ])
}
