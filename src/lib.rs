// LeKiwi robot control core: motion translation and calibration for a
// mobile manipulator (3-wheel omnidirectional base + 6-joint arm) on a
// shared Feetech serial servo bus.
//
// The hosting process owns one `LeKiwi` handle, serializes access to it,
// and exposes it however it likes; everything here is synchronous.

pub mod camera;
pub mod config;
pub mod error;
pub mod messages;
pub mod motor;
pub mod robot;

pub use camera::{AsyncCamera, Camera, CameraError, Frame, FrameSource};
pub use config::{CameraConfig, LeKiwiConfig, MaxRelativeTarget};
pub use error::RobotError;
pub use messages::{Action, Axis, Channel, Observation};
pub use robot::LeKiwi;
