// Motor control module for the LeKiwi robot
//
// Provides:
// - The motor bus contract and its Feetech STS3215 implementation
// - Sign-magnitude register codec
// - Omniwheel kinematics (body velocity <-> raw wheel velocities)
// - Calibration records, persistence, and the operator-driven procedure

pub mod bus;
pub mod calibration;
pub mod encoding;
pub mod feetech;
pub mod kinematics;
#[cfg(test)]
pub(crate) mod mock;

pub use bus::{Motor, MotorBus, MotorNormMode, OperatingMode, Register};
pub use calibration::{
    CalibrationProcedure, CalibrationState, CalibrationStore, JsonCalibrationStore,
    MotorCalibration, OperatorConsole, StdinConsole,
};
pub use feetech::{FeetechBus, FeetechError};
pub use kinematics::{BaseKinematics, BodyVelocity, KinematicsError, WheelVelocities};
