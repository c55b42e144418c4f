// Calibration records, persistence, and the operator-driven procedure that
// produces them.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bus::{MotorBus, MotorNormMode, OperatingMode, Register};
use crate::error::RobotError;

/// One mechanical revolution in raw encoder ticks.
pub const TICKS_PER_REVOLUTION: u16 = 4096;

/// Fixed bounds for motors that rotate continuously.
pub const FULL_TURN_BOUNDS: (u16, u16) = (0, 4095);

/// Raw tick treated as the mid-range reference after half-turn homing.
pub const HALF_TURN_HOMING: i32 = (TICKS_PER_REVOLUTION as i32 - 1) / 2;

const MID_TICK: f32 = TICKS_PER_REVOLUTION as f32 / 2.0;
const TICKS_PER_DEG: f32 = TICKS_PER_REVOLUTION as f32 / 360.0;

/// Per-motor calibration: zero reference and motion-range bounds.
///
/// `range_min < range_max` for range-recorded motors; full-turn motors carry
/// the fixed bounds `[0, 4095]`. `drive_mode` marks direction inversion and
/// is currently always 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub drive_mode: u8,
    pub homing_offset: i32,
    pub range_min: u16,
    pub range_max: u16,
}

impl MotorCalibration {
    fn span_fraction(&self, raw: i32) -> f32 {
        let min = self.range_min as f32;
        let max = self.range_max as f32;
        if max <= min {
            return 0.0;
        }
        ((raw as f32).clamp(min, max) - min) / (max - min)
    }

    /// Raw ticks to the motor's normalized unit.
    pub fn normalize(&self, raw: i32, mode: MotorNormMode) -> f32 {
        match mode {
            MotorNormMode::Degrees => (raw as f32 - MID_TICK) / TICKS_PER_DEG,
            MotorNormMode::RangeM100_100 => self.span_fraction(raw) * 200.0 - 100.0,
            MotorNormMode::Range0_100 => self.span_fraction(raw) * 100.0,
        }
    }

    /// Normalized unit back to raw ticks, rounded and clamped into the
    /// calibrated range.
    pub fn denormalize(&self, value: f32, mode: MotorNormMode) -> i32 {
        let min = self.range_min as f32;
        let max = self.range_max as f32;
        let raw = match mode {
            MotorNormMode::Degrees => value * TICKS_PER_DEG + MID_TICK,
            MotorNormMode::RangeM100_100 => (value + 100.0) / 200.0 * (max - min) + min,
            MotorNormMode::Range0_100 => value / 100.0 * (max - min) + min,
        };
        (raw.round() as i32).clamp(self.range_min as i32, self.range_max as i32)
    }
}

/// Motors that rotate continuously have no bounded range to record.
pub fn is_full_turn(motor: &str) -> bool {
    motor.contains("wheel") || motor.contains("wrist_roll")
}

// =========================================================================
// Persistence
// =========================================================================

/// Durable storage for calibration record sets.
///
/// Both directions are nonfatal: a failed load reads as "no calibration
/// present", a failed save leaves the in-memory/in-hardware calibration
/// valid but not durable. Failures are logged, never propagated.
pub trait CalibrationStore {
    fn load(&self) -> Option<HashMap<String, MotorCalibration>>;
    fn save(&self, calibration: &HashMap<String, MotorCalibration>);
}

/// JSON-file calibration store.
pub struct JsonCalibrationStore {
    path: PathBuf,
}

impl JsonCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self) -> Option<HashMap<String, MotorCalibration>> {
        if !self.path.exists() {
            debug!("Calibration file not found: {}", self.path.display());
            return None;
        }
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read calibration from {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(calibration) => {
                info!("Loaded calibration from {}", self.path.display());
                Some(calibration)
            }
            Err(e) => {
                warn!("Failed to parse calibration from {}: {e}", self.path.display());
                None
            }
        }
    }

    fn save(&self, calibration: &HashMap<String, MotorCalibration>) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create {}: {e}", parent.display());
                return;
            }
        }
        let json = match serde_json::to_string_pretty(calibration) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize calibration: {e}");
                return;
            }
        };
        match fs::write(&self.path, json) {
            Ok(()) => info!("Saved calibration to {}", self.path.display()),
            Err(e) => warn!("Failed to save calibration to {}: {e}", self.path.display()),
        }
    }
}

// =========================================================================
// Operator console
// =========================================================================

/// Blocking operator signals that gate the calibration procedure. Waits are
/// unbounded: the procedure sits in its current state until the operator
/// confirms.
pub trait OperatorConsole {
    /// Show `prompt` and block until the operator confirms.
    fn wait_for_ready(&mut self, prompt: &str) -> io::Result<()>;

    /// Show `prompt` and return a flag that flips once the operator signals
    /// stop, without blocking the caller.
    fn stop_signal(&mut self, prompt: &str) -> io::Result<Arc<AtomicBool>>;
}

/// Terminal-backed console: both signals are the ENTER key.
#[derive(Debug, Default)]
pub struct StdinConsole;

impl StdinConsole {
    pub fn new() -> Self {
        Self
    }
}

fn wait_for_enter() -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let result = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press && key.code == KeyCode::Enter => {
                break Ok(());
            }
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };
    terminal::disable_raw_mode()?;
    result
}

impl OperatorConsole for StdinConsole {
    fn wait_for_ready(&mut self, prompt: &str) -> io::Result<()> {
        println!("{prompt}");
        wait_for_enter()
    }

    fn stop_signal(&mut self, prompt: &str) -> io::Result<Arc<AtomicBool>> {
        println!("{prompt}");
        let flag = Arc::new(AtomicBool::new(false));
        let stop = flag.clone();
        thread::spawn(move || {
            if let Err(e) = wait_for_enter() {
                warn!("Operator console failed, stopping recording: {e}");
            }
            stop.store(true, Ordering::Relaxed);
        });
        Ok(flag)
    }
}

// =========================================================================
// Procedure
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    AwaitingHomingPose,
    RecordingRange,
    Finalizing,
    Persisted,
}

/// Operator-driven calibration of every motor on the bus.
///
/// Runs `Idle → AwaitingHomingPose → RecordingRange → Finalizing →
/// Persisted`; the record set only exists once `Persisted` is reached, so an
/// interruption anywhere earlier leaves the robot uncalibrated. The
/// procedure must hold exclusive access to the bus for its whole duration.
pub struct CalibrationProcedure<'a, B: MotorBus + ?Sized> {
    bus: &'a mut B,
    arm_motors: &'a [String],
    base_motors: &'a [String],
    state: CalibrationState,
}

impl<'a, B: MotorBus + ?Sized> CalibrationProcedure<'a, B> {
    pub fn new(bus: &'a mut B, arm_motors: &'a [String], base_motors: &'a [String]) -> Self {
        Self {
            bus,
            arm_motors,
            base_motors,
            state: CalibrationState::Idle,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn run(
        &mut self,
        console: &mut dyn OperatorConsole,
        store: &dyn CalibrationStore,
    ) -> Result<HashMap<String, MotorCalibration>, RobotError> {
        info!("Running calibration");

        // The arm must be freely movable and in position mode before the
        // operator poses it.
        self.bus.disable_torque(Some(self.arm_motors))?;
        for name in self.arm_motors {
            self.bus
                .write(Register::OperatingMode, name, OperatingMode::Position as i32)?;
        }
        self.state = CalibrationState::AwaitingHomingPose;

        console.wait_for_ready(
            "Move the robot to the middle of its range of motion and press ENTER...",
        )?;
        let mut homing_offsets = self.bus.set_half_turn_homings(self.arm_motors)?;
        for name in self.base_motors {
            homing_offsets.insert(name.clone(), 0);
        }

        let all_motors: Vec<String> = self
            .arm_motors
            .iter()
            .chain(self.base_motors.iter())
            .cloned()
            .collect();
        let bounded: Vec<String> = all_motors
            .iter()
            .filter(|name| !is_full_turn(name))
            .cloned()
            .collect();

        self.state = CalibrationState::RecordingRange;
        let stop = console.stop_signal(
            "Move all bounded joints through their entire ranges of motion.\n\
             Recording positions. Press ENTER to stop...",
        )?;
        let (mut range_mins, mut range_maxes) =
            self.bus.record_ranges_of_motion(&bounded, &stop)?;

        self.state = CalibrationState::Finalizing;
        for name in all_motors.iter().filter(|name| is_full_turn(name)) {
            range_mins.insert(name.clone(), FULL_TURN_BOUNDS.0);
            range_maxes.insert(name.clone(), FULL_TURN_BOUNDS.1);
        }

        let mut calibration = HashMap::new();
        for motor in self.bus.motors() {
            let Some(&homing_offset) = homing_offsets.get(&motor.name) else {
                continue;
            };
            calibration.insert(
                motor.name.clone(),
                MotorCalibration {
                    id: motor.id,
                    drive_mode: 0,
                    homing_offset,
                    range_min: range_mins.get(&motor.name).copied().unwrap_or(FULL_TURN_BOUNDS.0),
                    range_max: range_maxes.get(&motor.name).copied().unwrap_or(FULL_TURN_BOUNDS.1),
                },
            );
        }

        // One logical set: hardware first, then the durable store.
        self.bus.write_calibration(&calibration)?;
        store.save(&calibration);
        self.state = CalibrationState::Persisted;
        info!("Calibration complete");
        Ok(calibration)
    }
}
