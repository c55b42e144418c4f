// Motor bus contract shared by the robot pipeline and the calibration
// procedure.
//
// One implementation exists per hardware family; `FeetechBus` covers the
// STS3215 servos. Registers are named logically here: each implementation
// owns its control-table addresses, widths, and sign encodings.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use super::calibration::MotorCalibration;
use crate::error::RobotError;

/// How normalized values map onto a motor's calibrated raw range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorNormMode {
    /// Degrees about the homed mid-range reference.
    Degrees,
    /// Symmetric percentage of the calibrated range, -100 to 100.
    RangeM100_100,
    /// Unsigned percentage of the calibrated range, 0 to 100.
    Range0_100,
}

/// One addressable servo on the bus. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motor {
    pub name: String,
    pub id: u8,
    pub model: String,
    pub norm_mode: MotorNormMode,
}

impl Motor {
    pub fn new(name: &str, id: u8, model: &str, norm_mode: MotorNormMode) -> Self {
        Self {
            name: name.to_string(),
            id,
            model: model.to_string(),
            norm_mode,
        }
    }
}

/// Servo operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    Step = 3,
}

/// Logical register names used across the bus contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    MinPositionLimit,
    MaxPositionLimit,
    PCoefficient,
    DCoefficient,
    ICoefficient,
    HomingOffset,
    OperatingMode,
    TorqueEnable,
    GoalPosition,
    GoalVelocity,
    Lock,
    PresentPosition,
    PresentVelocity,
}

/// Contract between the robot and a servo bus implementation.
///
/// The bus owns the wire protocol, the register codec for signed fields, and
/// value normalization: position values cross this boundary normalized per
/// the motor's [`MotorNormMode`], velocity values as raw signed ticks/s.
/// `write` takes raw register values and is meant for configuration
/// registers; goal values go through the batched paths.
///
/// Callers serialize access externally; the bus is half-duplex and assumes a
/// single outstanding request.
pub trait MotorBus {
    fn connect(&mut self) -> Result<(), RobotError>;
    fn disconnect(&mut self, disable_torque: bool) -> Result<(), RobotError>;
    fn is_connected(&self) -> bool;

    /// Whether the hardware matches a complete in-memory calibration set.
    fn is_calibrated(&mut self) -> Result<bool, RobotError>;

    /// Motors on the bus, in definition order.
    fn motors(&self) -> &[Motor];

    fn motor_names(&self) -> Vec<String> {
        self.motors().iter().map(|m| m.name.clone()).collect()
    }

    fn read(&mut self, register: Register, motor: &str) -> Result<f32, RobotError>;
    fn write(&mut self, register: Register, motor: &str, value: i32) -> Result<(), RobotError>;

    /// One batched read of the same register across several motors.
    fn sync_read(
        &mut self,
        register: Register,
        motors: &[String],
    ) -> Result<HashMap<String, f32>, RobotError>;

    /// One batched write of the same register across several motors,
    /// retried up to `num_retry` extra times on failure.
    fn sync_write(
        &mut self,
        register: Register,
        values: &HashMap<String, f32>,
        num_retry: u32,
    ) -> Result<(), RobotError>;

    /// Program a full calibration set into the hardware and keep it as the
    /// session's in-memory reference.
    fn write_calibration(
        &mut self,
        calibration: &HashMap<String, MotorCalibration>,
    ) -> Result<(), RobotError>;

    /// `None` targets every motor on the bus.
    fn disable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError>;
    fn enable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError>;

    /// Make each motor's current raw position its mid-range reference and
    /// return the homing offsets written.
    fn set_half_turn_homings(
        &mut self,
        motors: &[String],
    ) -> Result<HashMap<String, i32>, RobotError>;

    /// Continuously sample raw positions until `stop` flips, returning the
    /// observed minima and maxima. At least one sample is taken.
    fn record_ranges_of_motion(
        &mut self,
        motors: &[String],
        stop: &AtomicBool,
    ) -> Result<(HashMap<String, u16>, HashMap<String, u16>), RobotError>;
}
