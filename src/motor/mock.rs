// Test doubles for the bus, camera, store, and operator console contracts.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::bus::{Motor, MotorBus, Register};
use super::calibration::{
    CalibrationStore, HALF_TURN_HOMING, MotorCalibration, OperatorConsole,
};
use crate::camera::{Camera, CameraError, Frame};
use crate::error::RobotError;
use crate::robot::default_motors;

pub(crate) struct MockBus {
    pub motors: Vec<Motor>,
    pub connected: bool,
    pub calibration: Option<HashMap<String, MotorCalibration>>,
    /// Values served by `sync_read(PresentPosition, ..)`.
    pub positions: HashMap<String, f32>,
    /// Values served by `sync_read(PresentVelocity, ..)`.
    pub velocities: HashMap<String, f32>,
    /// Raw readings served during half-turn homing (default 2047).
    pub half_turn_readings: HashMap<String, u16>,
    /// Raw position samples replayed while recording ranges.
    pub range_samples: HashMap<String, Vec<u16>>,
    pub writes: Vec<(Register, String, i32)>,
    pub sync_writes: Vec<(Register, HashMap<String, f32>, u32)>,
    pub torque_events: Vec<(String, Vec<String>)>,
    pub disconnects: Vec<bool>,
    pub fail_record_ranges: bool,
    /// Number of sync-write attempts that fail before one succeeds.
    pub fail_sync_writes: u32,
}

impl MockBus {
    pub fn new(motors: Vec<Motor>) -> Self {
        Self {
            motors,
            connected: false,
            calibration: None,
            positions: HashMap::new(),
            velocities: HashMap::new(),
            half_turn_readings: HashMap::new(),
            range_samples: HashMap::new(),
            writes: Vec::new(),
            sync_writes: Vec::new(),
            torque_events: Vec::new(),
            disconnects: Vec::new(),
            fail_record_ranges: false,
            fail_sync_writes: 0,
        }
    }

    /// Bus with the standard 9-motor LeKiwi table.
    pub fn lekiwi() -> Self {
        Self::new(default_motors(false))
    }

    fn resolve(&self, motors: Option<&[String]>) -> Vec<String> {
        match motors {
            Some(motors) => motors.to_vec(),
            None => self.motor_names(),
        }
    }
}

impl MotorBus for MockBus {
    fn connect(&mut self) -> Result<(), RobotError> {
        if self.connected {
            return Err(RobotError::AlreadyConnected);
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self, disable_torque: bool) -> Result<(), RobotError> {
        if !self.connected {
            return Err(RobotError::NotConnected);
        }
        self.disconnects.push(disable_torque);
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_calibrated(&mut self) -> Result<bool, RobotError> {
        Ok(self.calibration.is_some())
    }

    fn motors(&self) -> &[Motor] {
        &self.motors
    }

    fn read(&mut self, _register: Register, motor: &str) -> Result<f32, RobotError> {
        Ok(self.positions.get(motor).copied().unwrap_or(0.0))
    }

    fn write(&mut self, register: Register, motor: &str, value: i32) -> Result<(), RobotError> {
        self.writes.push((register, motor.to_string(), value));
        Ok(())
    }

    fn sync_read(
        &mut self,
        register: Register,
        motors: &[String],
    ) -> Result<HashMap<String, f32>, RobotError> {
        let source = match register {
            Register::PresentVelocity => &self.velocities,
            _ => &self.positions,
        };
        Ok(motors
            .iter()
            .map(|name| (name.clone(), source.get(name).copied().unwrap_or(0.0)))
            .collect())
    }

    fn sync_write(
        &mut self,
        register: Register,
        values: &HashMap<String, f32>,
        num_retry: u32,
    ) -> Result<(), RobotError> {
        self.sync_writes.push((register, values.clone(), num_retry));
        let attempts = num_retry + 1;
        if self.fail_sync_writes >= attempts {
            self.fail_sync_writes -= attempts;
            return Err(RobotError::bus(io::Error::other("sync write failed")));
        }
        self.fail_sync_writes = 0;
        Ok(())
    }

    fn write_calibration(
        &mut self,
        calibration: &HashMap<String, MotorCalibration>,
    ) -> Result<(), RobotError> {
        self.calibration = Some(calibration.clone());
        Ok(())
    }

    fn disable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError> {
        let resolved = self.resolve(motors);
        self.torque_events.push(("disable".to_string(), resolved));
        Ok(())
    }

    fn enable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError> {
        let resolved = self.resolve(motors);
        self.torque_events.push(("enable".to_string(), resolved));
        Ok(())
    }

    fn set_half_turn_homings(
        &mut self,
        motors: &[String],
    ) -> Result<HashMap<String, i32>, RobotError> {
        Ok(motors
            .iter()
            .map(|name| {
                let reading = self.half_turn_readings.get(name).copied().unwrap_or(2047);
                (name.clone(), reading as i32 - HALF_TURN_HOMING)
            })
            .collect())
    }

    fn record_ranges_of_motion(
        &mut self,
        motors: &[String],
        _stop: &AtomicBool,
    ) -> Result<(HashMap<String, u16>, HashMap<String, u16>), RobotError> {
        if self.fail_record_ranges {
            return Err(RobotError::bus(io::Error::other("read failed")));
        }
        let mut mins = HashMap::new();
        let mut maxes = HashMap::new();
        for name in motors {
            let samples = self
                .range_samples
                .get(name)
                .cloned()
                .unwrap_or_else(|| vec![2047]);
            mins.insert(name.clone(), samples.iter().copied().min().unwrap_or(2047));
            maxes.insert(name.clone(), samples.iter().copied().max().unwrap_or(2047));
        }
        Ok((mins, maxes))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockCamera {
    pub connected: bool,
    pub frame: Option<Frame>,
    pub fail_connect: bool,
}

impl MockCamera {
    pub fn with_frame(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            ..Self::default()
        }
    }
}

impl Camera for MockCamera {
    fn connect(&mut self) -> Result<(), CameraError> {
        if self.fail_connect {
            return Err(CameraError::Capture("mock connect failure".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_latest_frame(&self) -> Result<Frame, CameraError> {
        if !self.connected {
            return Err(CameraError::NotConnected);
        }
        self.frame.clone().ok_or(CameraError::NoFrame)
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Rc<RefCell<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    records: Option<HashMap<String, MotorCalibration>>,
    saved: Vec<HashMap<String, MotorCalibration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: HashMap<String, MotorCalibration>) -> Self {
        let store = Self::default();
        store.inner.borrow_mut().records = Some(records);
        store
    }

    pub fn saved(&self) -> Vec<HashMap<String, MotorCalibration>> {
        self.inner.borrow().saved.clone()
    }
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> Option<HashMap<String, MotorCalibration>> {
        self.inner.borrow().records.clone()
    }

    fn save(&self, calibration: &HashMap<String, MotorCalibration>) {
        self.inner.borrow_mut().saved.push(calibration.clone());
    }
}

/// Console whose operator is always ready and stops recording immediately.
#[derive(Clone, Default)]
pub(crate) struct ScriptedConsole {
    ready: Rc<RefCell<usize>>,
    stop: Rc<RefCell<usize>>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_prompts(&self) -> usize {
        *self.ready.borrow()
    }

    pub fn stop_prompts(&self) -> usize {
        *self.stop.borrow()
    }
}

impl OperatorConsole for ScriptedConsole {
    fn wait_for_ready(&mut self, _prompt: &str) -> io::Result<()> {
        *self.ready.borrow_mut() += 1;
        Ok(())
    }

    fn stop_signal(&mut self, _prompt: &str) -> io::Result<Arc<AtomicBool>> {
        *self.stop.borrow_mut() += 1;
        Ok(Arc::new(AtomicBool::new(true)))
    }
}
