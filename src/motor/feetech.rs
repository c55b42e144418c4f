// Feetech STS3215 serial protocol implementation
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::bus::{Motor, MotorBus, Register};
use super::calibration::{HALF_TURN_HOMING, MotorCalibration};
use super::encoding::{decode_sign_magnitude, encode_sign_magnitude};
use crate::error::RobotError;

/// Default serial configuration for Feetech motors
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Sync instructions address every motor at once
const BROADCAST_ID: u8 = 0xFE;

/// Delay between position samples while recording ranges of motion
const RANGE_SAMPLE_PERIOD: Duration = Duration::from_millis(10);

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// STS3215 control-table entry: address, width in bytes, and the sign bit
/// for sign-magnitude encoded registers.
struct RegSpec {
    addr: u8,
    size: u8,
    sign_bit: Option<u32>,
}

/// Velocity registers carry their sign in bit 15, the homing offset in
/// bit 11; everything else is plain unsigned.
const fn reg_spec(register: Register) -> RegSpec {
    let (addr, size, sign_bit) = match register {
        // EEPROM area (persists across power cycles)
        Register::MinPositionLimit => (9, 2, None),
        Register::MaxPositionLimit => (11, 2, None),
        Register::PCoefficient => (21, 1, None),
        Register::DCoefficient => (22, 1, None),
        Register::ICoefficient => (23, 1, None),
        Register::HomingOffset => (31, 2, Some(11)),

        // RAM area (volatile)
        Register::OperatingMode => (33, 1, None),
        Register::TorqueEnable => (40, 1, None),
        Register::GoalPosition => (42, 2, None),
        Register::GoalVelocity => (46, 2, Some(15)),
        Register::Lock => (55, 1, None),
        Register::PresentPosition => (56, 2, None),
        Register::PresentVelocity => (58, 2, Some(15)),
    };
    RegSpec { addr, size, sign_bit }
}

/// Position registers cross the bus contract normalized; everything else is
/// raw.
fn is_normalized(register: Register) -> bool {
    matches!(register, Register::GoalPosition | Register::PresentPosition)
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("unknown motor: {0}")]
    UnknownMotor(String),

    #[error("no calibration for motor {0}")]
    MissingCalibration(String),

    #[error("bus is not open")]
    NotOpen,
}

impl From<FeetechError> for RobotError {
    fn from(err: FeetechError) -> Self {
        RobotError::bus(err)
    }
}

/// Serial bus for Feetech servos, the conforming [`MotorBus`] implementation
/// for the STS3215 family.
pub struct FeetechBus {
    port_name: String,
    baudrate: u32,
    port: Option<Box<dyn SerialPort>>,
    motors: Vec<Motor>,
    calibration: Option<HashMap<String, MotorCalibration>>,
}

impl FeetechBus {
    pub fn new(port_name: &str, motors: Vec<Motor>) -> Self {
        Self::with_baudrate(port_name, DEFAULT_BAUDRATE, motors)
    }

    pub fn with_baudrate(port_name: &str, baudrate: u32, motors: Vec<Motor>) -> Self {
        Self {
            port_name: port_name.to_string(),
            baudrate,
            port: None,
            motors,
            calibration: None,
        }
    }

    /// Calibration records currently programmed for this session.
    pub fn calibration(&self) -> Option<&HashMap<String, MotorCalibration>> {
        self.calibration.as_ref()
    }

    fn motor(&self, name: &str) -> Result<&Motor, FeetechError> {
        self.motors
            .iter()
            .find(|motor| motor.name == name)
            .ok_or_else(|| FeetechError::UnknownMotor(name.to_string()))
    }

    fn motor_calibration(&self, name: &str) -> Result<&MotorCalibration, FeetechError> {
        self.calibration
            .as_ref()
            .and_then(|calibration| calibration.get(name))
            .ok_or_else(|| FeetechError::MissingCalibration(name.to_string()))
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        // Checksum over id, length, instruction, params
        packet.push(Self::checksum(&packet[2..]));
        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<(), FeetechError> {
        let port = self.port.as_mut().ok_or(FeetechError::NotOpen)?;
        port.write_all(packet)?;
        port.flush()?;
        Ok(())
    }

    /// Read a response packet and return its parameter bytes
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>, FeetechError> {
        let port = self.port.as_mut().ok_or(FeetechError::NotOpen)?;

        let mut header = [0u8; 2];
        port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("invalid header: {header:02X?}"),
            });
        }

        let mut id_length = [0u8; 2];
        port.read_exact(&mut id_length)?;
        let id = id_length[0];
        let length = id_length[1] as usize;

        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {expected_id}, got {id}"),
            });
        }

        // Remaining bytes are error + params + checksum
        let mut remaining = vec![0u8; length];
        port.read_exact(&mut remaining)?;

        let mut checksum_data = vec![id, length as u8];
        checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
        let expected_checksum = Self::checksum(&checksum_data);
        let received_checksum = remaining[remaining.len() - 1];
        if expected_checksum != received_checksum {
            return Err(FeetechError::ChecksumMismatch { id });
        }

        let error_status = remaining[0];
        if error_status != 0 {
            return Err(FeetechError::MotorError {
                id,
                status: error_status,
            });
        }

        Ok(remaining[1..remaining.len() - 1].to_vec())
    }

    /// Ping a motor to check if it's responding
    fn ping(&mut self, id: u8) -> Result<bool, FeetechError> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read one register from one motor, returning the unsigned wire value
    fn read_register(&mut self, id: u8, spec: &RegSpec) -> Result<u32, FeetechError> {
        let params = [spec.addr, spec.size];
        let packet = Self::build_packet(id, Instruction::Read, &params);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        if response.len() < spec.size as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("expected {} bytes, got {}", spec.size, response.len()),
            });
        }
        Ok(match spec.size {
            1 => response[0] as u32,
            _ => u16::from_le_bytes([response[0], response[1]]) as u32,
        })
    }

    /// Write one register on one motor (little-endian wire value)
    fn write_register(&mut self, id: u8, spec: &RegSpec, raw: u32) -> Result<(), FeetechError> {
        let mut params = vec![spec.addr];
        params.push((raw & 0xFF) as u8);
        if spec.size == 2 {
            params.push(((raw >> 8) & 0xFF) as u8);
        }
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write to motor {id}: addr={}, raw={raw}", spec.addr);
        self.send_packet(&packet)?;

        // Status response acknowledges the write
        let _ = self.read_response(id)?;
        Ok(())
    }

    /// Decode an unsigned wire value into the register's signed range
    fn from_wire(spec: &RegSpec, raw: u32) -> i32 {
        match spec.sign_bit {
            Some(sign_bit) => decode_sign_magnitude(raw, sign_bit),
            None => raw as i32,
        }
    }

    /// Encode a signed value into the register's unsigned wire format
    fn to_wire(spec: &RegSpec, value: i32) -> Result<u32, RobotError> {
        match spec.sign_bit {
            Some(sign_bit) => Ok(encode_sign_magnitude(value, sign_bit)?),
            None => Ok(value as u32),
        }
    }

    fn read_signed(&mut self, id: u8, register: Register) -> Result<i32, FeetechError> {
        let spec = reg_spec(register);
        let raw = self.read_register(id, &spec)?;
        Ok(Self::from_wire(&spec, raw))
    }

    /// One sync-write frame: same register, one value per motor
    fn sync_write_frame(&mut self, spec: &RegSpec, entries: &[(u8, u32)]) -> Result<(), FeetechError> {
        if entries.is_empty() {
            return Ok(());
        }

        // Sync write format:
        // [start_addr, data_length, id1, data1..., id2, data2..., ...]
        let mut params = vec![spec.addr, spec.size];
        for &(id, raw) in entries {
            params.push(id);
            params.push((raw & 0xFF) as u8);
            if spec.size == 2 {
                params.push(((raw >> 8) & 0xFF) as u8);
            }
        }

        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} motors: addr={}", entries.len(), spec.addr);
        self.send_packet(&packet)?;

        // Sync write has no response
        Ok(())
    }

    /// One sync-read frame: request once, then one response per motor in
    /// request order
    fn sync_read_frame(&mut self, spec: &RegSpec, ids: &[u8]) -> Result<Vec<u32>, FeetechError> {
        let mut params = vec![spec.addr, spec.size];
        params.extend_from_slice(ids);
        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncRead, &params);
        self.send_packet(&packet)?;

        let mut values = Vec::with_capacity(ids.len());
        for &id in ids {
            let response = self.read_response(id)?;
            if response.len() < spec.size as usize {
                return Err(FeetechError::InvalidResponse {
                    id,
                    reason: format!("expected {} bytes, got {}", spec.size, response.len()),
                });
            }
            values.push(match spec.size {
                1 => response[0] as u32,
                _ => u16::from_le_bytes([response[0], response[1]]) as u32,
            });
        }
        Ok(values)
    }

    fn set_torque(&mut self, motors: Option<&[String]>, enabled: bool) -> Result<(), RobotError> {
        let names = match motors {
            Some(motors) => motors.to_vec(),
            None => self.motor_names(),
        };
        let value = u32::from(enabled);
        for name in &names {
            let id = self.motor(name)?.id;
            self.write_register(id, &reg_spec(Register::TorqueEnable), value)?;
            self.write_register(id, &reg_spec(Register::Lock), value)?;
        }
        Ok(())
    }
}

impl MotorBus for FeetechBus {
    fn connect(&mut self) -> Result<(), RobotError> {
        if self.port.is_some() {
            return Err(RobotError::AlreadyConnected);
        }

        info!("Opening motor bus on {}", self.port_name);
        let port = serialport::new(&self.port_name, self.baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()
            .map_err(FeetechError::from)?;
        self.port = Some(port);

        // Every configured motor must respond before the bus is usable
        let ids: Vec<(String, u8)> = self
            .motors
            .iter()
            .map(|motor| (motor.name.clone(), motor.id))
            .collect();
        for (name, id) in ids {
            match self.ping(id) {
                Ok(true) => debug!("Motor {name} ({id}) responding"),
                Ok(false) => {
                    warn!("Motor {name} ({id}) not responding to ping");
                    self.port = None;
                    return Err(FeetechError::Timeout { id }.into());
                }
                Err(e) => {
                    self.port = None;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, disable_torque: bool) -> Result<(), RobotError> {
        if self.port.is_none() {
            return Err(RobotError::NotConnected);
        }
        if disable_torque {
            self.set_torque(None, false)?;
        }
        self.port = None;
        info!("Motor bus on {} closed", self.port_name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn is_calibrated(&mut self) -> Result<bool, RobotError> {
        let Some(calibration) = self.calibration.clone() else {
            return Ok(false);
        };

        // Compare hardware registers against the session's record set.
        for (name, cal) in &calibration {
            let id = self.motor(name)?.id;
            let homing = self.read_signed(id, Register::HomingOffset)?;
            let min = self.read_signed(id, Register::MinPositionLimit)?;
            let max = self.read_signed(id, Register::MaxPositionLimit)?;
            if homing != cal.homing_offset
                || min != cal.range_min as i32
                || max != cal.range_max as i32
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn motors(&self) -> &[Motor] {
        &self.motors
    }

    fn read(&mut self, register: Register, motor: &str) -> Result<f32, RobotError> {
        let (id, norm_mode) = {
            let motor = self.motor(motor)?;
            (motor.id, motor.norm_mode)
        };
        let value = self.read_signed(id, register)?;
        if is_normalized(register) {
            let cal = self.motor_calibration(motor)?;
            Ok(cal.normalize(value, norm_mode))
        } else {
            Ok(value as f32)
        }
    }

    fn write(&mut self, register: Register, motor: &str, value: i32) -> Result<(), RobotError> {
        let id = self.motor(motor)?.id;
        let spec = reg_spec(register);
        let raw = Self::to_wire(&spec, value)?;
        self.write_register(id, &spec, raw)?;
        Ok(())
    }

    fn sync_read(
        &mut self,
        register: Register,
        motors: &[String],
    ) -> Result<HashMap<String, f32>, RobotError> {
        let spec = reg_spec(register);
        let mut ids = Vec::with_capacity(motors.len());
        for name in motors {
            ids.push(self.motor(name)?.id);
        }

        let raws = self.sync_read_frame(&spec, &ids)?;
        let mut values = HashMap::with_capacity(motors.len());
        for (name, raw) in motors.iter().zip(raws) {
            let signed = Self::from_wire(&spec, raw);
            let value = if is_normalized(register) {
                let norm_mode = self.motor(name)?.norm_mode;
                self.motor_calibration(name)?.normalize(signed, norm_mode)
            } else {
                signed as f32
            };
            values.insert(name.clone(), value);
        }
        Ok(values)
    }

    fn sync_write(
        &mut self,
        register: Register,
        values: &HashMap<String, f32>,
        num_retry: u32,
    ) -> Result<(), RobotError> {
        let spec = reg_spec(register);

        // Encode everything up front so a bad value never reaches the wire.
        let mut entries = Vec::with_capacity(values.len());
        for (name, &value) in values {
            let (id, norm_mode) = {
                let motor = self.motor(name)?;
                (motor.id, motor.norm_mode)
            };
            let signed = if is_normalized(register) {
                self.motor_calibration(name)?.denormalize(value, norm_mode)
            } else {
                value.round() as i32
            };
            entries.push((id, Self::to_wire(&spec, signed)?));
        }

        let mut attempt = 0;
        loop {
            match self.sync_write_frame(&spec, &entries) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < num_retry => {
                    attempt += 1;
                    warn!("Sync write failed (attempt {attempt}/{num_retry}): {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_calibration(
        &mut self,
        calibration: &HashMap<String, MotorCalibration>,
    ) -> Result<(), RobotError> {
        for (name, cal) in calibration {
            let id = self.motor(name)?.id;
            let homing_spec = reg_spec(Register::HomingOffset);
            let homing = Self::to_wire(&homing_spec, cal.homing_offset)?;
            self.write_register(id, &homing_spec, homing)?;
            self.write_register(id, &reg_spec(Register::MinPositionLimit), cal.range_min as u32)?;
            self.write_register(id, &reg_spec(Register::MaxPositionLimit), cal.range_max as u32)?;
        }
        self.calibration = Some(calibration.clone());
        info!("Programmed calibration for {} motors", calibration.len());
        Ok(())
    }

    fn disable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError> {
        self.set_torque(motors, false)
    }

    fn enable_torque(&mut self, motors: Option<&[String]>) -> Result<(), RobotError> {
        self.set_torque(motors, true)
    }

    fn set_half_turn_homings(
        &mut self,
        motors: &[String],
    ) -> Result<HashMap<String, i32>, RobotError> {
        let mut offsets = HashMap::with_capacity(motors.len());
        let position_spec = reg_spec(Register::PresentPosition);
        let homing_spec = reg_spec(Register::HomingOffset);
        for name in motors {
            let id = self.motor(name)?.id;
            let raw = self.read_register(id, &position_spec)? as i32;

            // The current pose becomes the mid-range reference tick.
            let offset = raw - HALF_TURN_HOMING;
            self.write_register(id, &homing_spec, Self::to_wire(&homing_spec, offset)?)?;
            offsets.insert(name.clone(), offset);
        }
        Ok(offsets)
    }

    fn record_ranges_of_motion(
        &mut self,
        motors: &[String],
        stop: &AtomicBool,
    ) -> Result<(HashMap<String, u16>, HashMap<String, u16>), RobotError> {
        let mut ids = Vec::with_capacity(motors.len());
        for name in motors {
            ids.push(self.motor(name)?.id);
        }
        let spec = reg_spec(Register::PresentPosition);

        let mut mins: HashMap<String, u16> = HashMap::new();
        let mut maxes: HashMap<String, u16> = HashMap::new();
        loop {
            for (name, &id) in motors.iter().zip(ids.iter()) {
                match self.read_register(id, &spec) {
                    Ok(raw) => {
                        let raw = raw as u16;
                        mins.entry(name.clone())
                            .and_modify(|min| *min = (*min).min(raw))
                            .or_insert(raw);
                        maxes
                            .entry(name.clone())
                            .and_modify(|max| *max = (*max).max(raw))
                            .or_insert(raw);
                    }
                    Err(e) => warn!("Dropped range sample for {name}: {e}"),
                }
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(RANGE_SAMPLE_PERIOD);
        }
        Ok((mins, maxes))
    }
}
