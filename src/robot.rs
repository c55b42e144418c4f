// LeKiwi robot: connection lifecycle, action/observation pipeline, and the
// safety clamp over joint position goals.
//
// All entry points are synchronous and bounded by bus round-trip latency;
// the caller serializes access (the bus is half-duplex).

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::LeKiwiConfig;
use crate::error::RobotError;
use crate::messages::{Action, Axis, Channel, Observation};
use crate::motor::bus::{Motor, MotorBus, MotorNormMode, OperatingMode, Register};
use crate::motor::calibration::{
    CalibrationProcedure, CalibrationStore, JsonCalibrationStore, OperatorConsole, StdinConsole,
};
use crate::motor::feetech::FeetechBus;
use crate::motor::kinematics::{BaseKinematics, WheelVelocities};

/// Retry budget for the zero-velocity stop write
const STOP_BASE_RETRIES: u32 = 5;

/// Position-loop gains written to every arm motor
const ARM_P_COEFFICIENT: i32 = 16;
const ARM_I_COEFFICIENT: i32 = 0;
const ARM_D_COEFFICIENT: i32 = 32;

/// The standard LeKiwi motor table: six arm joints and three wheels on one
/// bus.
pub fn default_motors(use_degrees: bool) -> Vec<Motor> {
    let body_mode = if use_degrees {
        MotorNormMode::Degrees
    } else {
        MotorNormMode::RangeM100_100
    };
    vec![
        // arm
        Motor::new("arm_shoulder_pan", 1, "sts3215", body_mode),
        Motor::new("arm_shoulder_lift", 2, "sts3215", body_mode),
        Motor::new("arm_elbow_flex", 3, "sts3215", body_mode),
        Motor::new("arm_wrist_flex", 4, "sts3215", body_mode),
        Motor::new("arm_wrist_roll", 5, "sts3215", body_mode),
        Motor::new("arm_gripper", 6, "sts3215", MotorNormMode::Range0_100),
        // base
        Motor::new("base_left_wheel", 7, "sts3215", MotorNormMode::RangeM100_100),
        Motor::new("base_back_wheel", 8, "sts3215", MotorNormMode::RangeM100_100),
        Motor::new("base_right_wheel", 9, "sts3215", MotorNormMode::RangeM100_100),
    ]
}

/// LeKiwi robot with a mobile omnidirectional base and a manipulator arm.
///
/// Owned by the hosting process and handed into request handlers; created at
/// startup, torn down at shutdown.
pub struct LeKiwi<B: MotorBus> {
    config: LeKiwiConfig,
    bus: B,
    cameras: HashMap<String, Box<dyn Camera>>,
    store: Box<dyn CalibrationStore>,
    console: Box<dyn OperatorConsole>,
    kinematics: BaseKinematics,
    arm_motors: Vec<String>,
    base_motors: Vec<String>,
}

impl LeKiwi<FeetechBus> {
    /// Robot on a Feetech bus with a JSON-file calibration store and a
    /// terminal operator console. Cameras are built by the host from
    /// `config.cameras` and passed in.
    pub fn new(
        config: LeKiwiConfig,
        cameras: HashMap<String, Box<dyn Camera>>,
    ) -> Result<Self, RobotError> {
        let bus = FeetechBus::new(&config.port, default_motors(config.use_degrees));
        let store = Box::new(JsonCalibrationStore::new(config.calibration_path.clone()));
        Self::with_parts(config, bus, cameras, store, Box::new(StdinConsole::new()))
    }
}

impl<B: MotorBus> LeKiwi<B> {
    /// Robot over explicit collaborator implementations.
    pub fn with_parts(
        config: LeKiwiConfig,
        bus: B,
        cameras: HashMap<String, Box<dyn Camera>>,
        store: Box<dyn CalibrationStore>,
        console: Box<dyn OperatorConsole>,
    ) -> Result<Self, RobotError> {
        let kinematics =
            BaseKinematics::new(config.wheel_radius, config.base_radius, config.max_raw_speed)?;
        let arm_motors = bus
            .motor_names()
            .into_iter()
            .filter(|name| name.starts_with("arm"))
            .collect();
        let base_motors = bus
            .motor_names()
            .into_iter()
            .filter(|name| name.starts_with("base"))
            .collect();
        Ok(Self {
            config,
            bus,
            cameras,
            store,
            console,
            kinematics,
            arm_motors,
            base_motors,
        })
    }

    /// Connected means the bus and every configured camera are up.
    pub fn is_connected(&self) -> bool {
        self.bus.is_connected() && self.cameras.values().all(|camera| camera.is_connected())
    }

    pub fn is_calibrated(&mut self) -> Result<bool, RobotError> {
        self.bus.is_calibrated()
    }

    /// Connect to the robot hardware.
    ///
    /// Persisted calibration is applied when present; otherwise, when
    /// `calibrate` is set and the motors report uncalibrated, the blocking
    /// interactive procedure runs before anything else proceeds.
    pub fn connect(&mut self, calibrate: bool) -> Result<(), RobotError> {
        if self.is_connected() {
            return Err(RobotError::AlreadyConnected);
        }
        self.bus.connect()?;

        if let Some(records) = self.store.load() {
            info!("Applying persisted calibration to motors");
            self.bus.disable_torque(None)?;
            self.bus.write_calibration(&records)?;
            self.bus.enable_torque(None)?;
        } else if calibrate && !self.bus.is_calibrated()? {
            info!("Robot not calibrated, running interactive calibration");
            self.run_calibration()?;
        }

        for (name, camera) in &mut self.cameras {
            camera.connect()?;
            debug!("Camera {name} connected");
        }

        self.configure()?;
        info!("LeKiwi robot connected");
        Ok(())
    }

    /// Set operating modes and gains: arm joints in position mode, wheels in
    /// velocity mode, the whole block bracketed by a torque release.
    fn configure(&mut self) -> Result<(), RobotError> {
        self.bus.disable_torque(None)?;
        for name in &self.arm_motors {
            self.bus
                .write(Register::OperatingMode, name, OperatingMode::Position as i32)?;
            self.bus.write(Register::PCoefficient, name, ARM_P_COEFFICIENT)?;
            self.bus.write(Register::ICoefficient, name, ARM_I_COEFFICIENT)?;
            self.bus.write(Register::DCoefficient, name, ARM_D_COEFFICIENT)?;
        }
        for name in &self.base_motors {
            self.bus
                .write(Register::OperatingMode, name, OperatingMode::Velocity as i32)?;
        }
        self.bus.enable_torque(None)?;
        Ok(())
    }

    /// Run the interactive calibration procedure.
    ///
    /// Blocks on operator input for an unbounded time; never call this from
    /// a request-serving context. The caller's exclusivity contract covers
    /// the whole procedure.
    pub fn calibrate(&mut self) -> Result<(), RobotError> {
        self.run_calibration()
    }

    fn run_calibration(&mut self) -> Result<(), RobotError> {
        let mut procedure =
            CalibrationProcedure::new(&mut self.bus, &self.arm_motors, &self.base_motors);
        procedure.run(&mut *self.console, &*self.store)?;
        Ok(())
    }

    /// One batched read of arm positions and base velocities, decoded into a
    /// single observation. Camera frames are whatever capture last
    /// completed.
    pub fn get_observation(&mut self) -> Result<Observation, RobotError> {
        if !self.is_connected() {
            return Err(RobotError::NotConnected);
        }

        let start = Instant::now();
        let arm_pos = self.bus.sync_read(Register::PresentPosition, &self.arm_motors)?;
        let base_vel = self.bus.sync_read(Register::PresentVelocity, &self.base_motors)?;

        let wheels = WheelVelocities::new(
            raw_reading(&base_vel, "base_left_wheel"),
            raw_reading(&base_vel, "base_back_wheel"),
            raw_reading(&base_vel, "base_right_wheel"),
        );
        let body = self.kinematics.wheel_raw_to_body(wheels);
        debug!("Read motor state: {:.1}ms", start.elapsed().as_secs_f64() * 1e3);

        let mut observation = Observation::default();
        for (name, value) in arm_pos {
            observation.channels.insert(Channel::Position(name), value);
        }
        observation.channels.insert(Channel::Velocity(Axis::X), body.x);
        observation.channels.insert(Channel::Velocity(Axis::Y), body.y);
        observation.channels.insert(Channel::Velocity(Axis::Theta), body.theta);

        for (name, camera) in &self.cameras {
            match camera.read_latest_frame() {
                Ok(frame) => {
                    observation.frames.insert(name.clone(), frame);
                }
                Err(e) => debug!("No frame from camera {name}: {e}"),
            }
        }
        Ok(observation)
    }

    /// Send one command: forward kinematics for the base, clamped position
    /// goals for the arm, one batched write per register. Returns the action
    /// actually sent.
    pub fn send_action(&mut self, action: &Action) -> Result<Action, RobotError> {
        if !self.is_connected() {
            return Err(RobotError::NotConnected);
        }

        let mut arm_goals: HashMap<String, f32> = action
            .positions()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let body = action.body_velocity();
        let wheels = self.kinematics.body_to_wheel_raw(body);

        // Safety: cap each goal's distance from the present position. Needs
        // one fresh read, taken just before clamping.
        if let Some(max_relative) = &self.config.max_relative_target {
            let present = self.bus.sync_read(Register::PresentPosition, &self.arm_motors)?;
            for (name, goal) in arm_goals.iter_mut() {
                let Some(&present_pos) = present.get(name) else {
                    continue;
                };
                let limit = max_relative.limit_for(name);
                let delta = *goal - present_pos;
                if delta.abs() > limit {
                    let clamped = present_pos + delta.signum() * limit;
                    debug!("Clamped {name} goal {goal:.1} -> {clamped:.1}");
                    *goal = clamped;
                }
            }
        }

        self.bus.sync_write(Register::GoalPosition, &arm_goals, 0)?;
        self.bus
            .sync_write(Register::GoalVelocity, &wheel_goal_map(wheels), 0)?;

        let mut sent = Action::new();
        for (name, value) in &arm_goals {
            sent.insert(Channel::Position(name.clone()), *value);
        }
        sent.set_body_velocity(body);
        Ok(sent)
    }

    /// Zero the base velocities. The priority safety path: retried locally
    /// and attempted regardless of any other in-flight state.
    pub fn stop_base(&mut self) -> Result<(), RobotError> {
        let zeros: HashMap<String, f32> = self
            .base_motors
            .iter()
            .map(|name| (name.clone(), 0.0))
            .collect();
        match self
            .bus
            .sync_write(Register::GoalVelocity, &zeros, STOP_BASE_RETRIES)
        {
            Ok(()) => {
                info!("Base motors stopped");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop base motors: {e}");
                Err(e)
            }
        }
    }

    /// Disconnect from the robot hardware, stopping the base first.
    pub fn disconnect(&mut self) -> Result<(), RobotError> {
        if !self.is_connected() {
            return Err(RobotError::NotConnected);
        }

        self.stop_base()?;
        self.bus.disconnect(self.config.disable_torque_on_disconnect)?;
        for camera in self.cameras.values_mut() {
            camera.disconnect();
        }

        info!("LeKiwi robot disconnected");
        Ok(())
    }
}

impl<B: MotorBus> Drop for LeKiwi<B> {
    fn drop(&mut self) {
        // Best-effort stop if the handle dies while the bus is live.
        if self.bus.is_connected() {
            if let Err(e) = self.stop_base() {
                warn!("Failed to stop base on drop: {e}");
            }
        }
    }
}

fn raw_reading(values: &HashMap<String, f32>, motor: &str) -> i16 {
    values.get(motor).copied().unwrap_or(0.0) as i16
}

fn wheel_goal_map(wheels: WheelVelocities) -> HashMap<String, f32> {
    HashMap::from([
        ("base_left_wheel".to_string(), wheels.left as f32),
        ("base_back_wheel".to_string(), wheels.back as f32),
        ("base_right_wheel".to_string(), wheels.right as f32),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::config::MaxRelativeTarget;
    use crate::motor::calibration::MotorCalibration;
    use crate::motor::mock::{MemoryStore, MockBus, MockCamera, ScriptedConsole};

    fn robot_with(
        config: LeKiwiConfig,
        bus: MockBus,
        cameras: HashMap<String, Box<dyn Camera>>,
        store: MemoryStore,
    ) -> LeKiwi<MockBus> {
        LeKiwi::with_parts(
            config,
            bus,
            cameras,
            Box::new(store),
            Box::new(ScriptedConsole::new()),
        )
        .unwrap()
    }

    fn connected_robot(config: LeKiwiConfig) -> LeKiwi<MockBus> {
        let mut bus = MockBus::lekiwi();
        bus.connected = true;
        let mut camera = MockCamera::with_frame(Frame::default());
        camera.connected = true;
        let cameras: HashMap<String, Box<dyn Camera>> =
            HashMap::from([("front".to_string(), Box::new(camera) as Box<dyn Camera>)]);
        robot_with(config, bus, cameras, MemoryStore::new())
    }

    fn sample_records() -> HashMap<String, MotorCalibration> {
        default_motors(false)
            .into_iter()
            .map(|motor| {
                (
                    motor.name.clone(),
                    MotorCalibration {
                        id: motor.id,
                        drive_mode: 0,
                        homing_offset: 0,
                        range_min: 0,
                        range_max: 4095,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn connected_requires_bus_and_every_camera() {
        let mut bus = MockBus::lekiwi();
        bus.connected = true;
        let mut up = MockCamera::default();
        up.connected = true;
        let down = MockCamera::default();
        let cameras: HashMap<String, Box<dyn Camera>> = HashMap::from([
            ("front".to_string(), Box::new(up) as Box<dyn Camera>),
            ("wrist".to_string(), Box::new(down) as Box<dyn Camera>),
        ]);
        let robot = robot_with(LeKiwiConfig::default(), bus, cameras, MemoryStore::new());

        // Bus up, one of two cameras down: not connected.
        assert!(!robot.is_connected());
    }

    #[test]
    fn motion_calls_require_connection() {
        let mut robot = robot_with(
            LeKiwiConfig::default(),
            MockBus::lekiwi(),
            HashMap::new(),
            MemoryStore::new(),
        );

        assert!(matches!(robot.get_observation(), Err(RobotError::NotConnected)));
        assert!(matches!(
            robot.send_action(&Action::new()),
            Err(RobotError::NotConnected)
        ));
        assert!(matches!(robot.disconnect(), Err(RobotError::NotConnected)));
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut robot = connected_robot(LeKiwiConfig::default());
        assert!(matches!(robot.connect(false), Err(RobotError::AlreadyConnected)));
    }

    #[test]
    fn connect_applies_persisted_calibration_inside_torque_bracket() {
        let records = sample_records();
        let cameras: HashMap<String, Box<dyn Camera>> = HashMap::from([(
            "front".to_string(),
            Box::new(MockCamera::with_frame(Frame::default())) as Box<dyn Camera>,
        )]);
        let mut robot = robot_with(
            LeKiwiConfig::default(),
            MockBus::lekiwi(),
            cameras,
            MemoryStore::with_records(records.clone()),
        );

        robot.connect(true).unwrap();
        assert!(robot.is_connected());
        assert_eq!(robot.bus.calibration.as_ref(), Some(&records));

        let all = robot.bus.motor_names();
        assert_eq!(
            robot.bus.torque_events[..2],
            [("disable".to_string(), all.clone()), ("enable".to_string(), all)]
        );
    }

    #[test]
    fn connect_with_calibrate_runs_procedure_when_uncalibrated() {
        let cameras: HashMap<String, Box<dyn Camera>> = HashMap::from([(
            "front".to_string(),
            Box::new(MockCamera::with_frame(Frame::default())) as Box<dyn Camera>,
        )]);
        let store = MemoryStore::new();
        let mut robot = robot_with(
            LeKiwiConfig::default(),
            MockBus::lekiwi(),
            cameras,
            store.clone(),
        );

        robot.connect(true).unwrap();
        assert!(robot.bus.calibration.is_some());
        assert_eq!(store.saved().len(), 1);
    }

    #[test]
    fn connect_configures_modes_and_gains() {
        let mut robot = robot_with(
            LeKiwiConfig::default(),
            MockBus::lekiwi(),
            HashMap::new(),
            MemoryStore::with_records(sample_records()),
        );
        robot.connect(false).unwrap();

        assert!(robot.bus.writes.contains(&(
            Register::OperatingMode,
            "arm_elbow_flex".to_string(),
            OperatingMode::Position as i32
        )));
        assert!(robot.bus.writes.contains(&(
            Register::PCoefficient,
            "arm_elbow_flex".to_string(),
            ARM_P_COEFFICIENT
        )));
        assert!(robot.bus.writes.contains(&(
            Register::DCoefficient,
            "arm_elbow_flex".to_string(),
            ARM_D_COEFFICIENT
        )));
        assert!(robot.bus.writes.contains(&(
            Register::OperatingMode,
            "base_back_wheel".to_string(),
            OperatingMode::Velocity as i32
        )));
    }

    #[test]
    fn observation_merges_positions_velocity_and_frames() {
        let mut robot = connected_robot(LeKiwiConfig::default());
        robot.bus.positions.insert("arm_gripper".to_string(), 42.0);
        // Pure rotation: equal raw velocity on all three wheels.
        for wheel in ["base_left_wheel", "base_back_wheel", "base_right_wheel"] {
            robot.bus.velocities.insert(wheel.to_string(), 500.0);
        }

        let observation = robot.get_observation().unwrap();
        assert_eq!(
            observation.channels[&Channel::Position("arm_gripper".to_string())],
            42.0
        );

        let body = observation.body_velocity();
        assert!(body.x.abs() < 1e-3, "x = {}", body.x);
        assert!(body.y.abs() < 1e-3, "y = {}", body.y);
        assert!(body.theta > 0.0);
        assert!(observation.frames.contains_key("front"));
    }

    #[test]
    fn send_action_clamps_goals_toward_present_position() {
        let mut config = LeKiwiConfig::default();
        config.max_relative_target = Some(MaxRelativeTarget::Global(10.0));
        let mut robot = connected_robot(config);
        robot.bus.positions.insert("arm_wrist_flex".to_string(), 50.0);
        robot.bus.positions.insert("arm_elbow_flex".to_string(), 50.0);
        robot.bus.positions.insert("arm_gripper".to_string(), 50.0);

        let mut action = Action::new();
        action.set_position("arm_wrist_flex", 100.0); // over the limit
        action.set_position("arm_elbow_flex", 12.0); // over, negative delta
        action.set_position("arm_gripper", 55.0); // within bounds

        let sent = robot.send_action(&action).unwrap();
        assert_eq!(
            sent.get(&Channel::Position("arm_wrist_flex".to_string())),
            Some(60.0)
        );
        assert_eq!(
            sent.get(&Channel::Position("arm_elbow_flex".to_string())),
            Some(40.0)
        );
        assert_eq!(
            sent.get(&Channel::Position("arm_gripper".to_string())),
            Some(55.0)
        );

        // The clamped goals are what went to the bus.
        let (_, values, _) = robot
            .bus
            .sync_writes
            .iter()
            .find(|(register, _, _)| *register == Register::GoalPosition)
            .unwrap();
        assert_eq!(values["arm_wrist_flex"], 60.0);
        assert_eq!(values["arm_elbow_flex"], 40.0);
    }

    #[test]
    fn send_action_translates_body_velocity_to_wheels() {
        let mut robot = connected_robot(LeKiwiConfig::default());
        let mut action = Action::new();
        action.insert(Channel::Velocity(Axis::X), 0.1);

        let sent = robot.send_action(&action).unwrap();
        assert_eq!(sent.get(&Channel::Velocity(Axis::X)), Some(0.1));
        assert_eq!(sent.get(&Channel::Velocity(Axis::Y)), Some(0.0));

        let (_, values, _) = robot
            .bus
            .sync_writes
            .iter()
            .find(|(register, _, _)| *register == Register::GoalVelocity)
            .unwrap();
        assert!((values["base_left_wheel"] + 1129.0).abs() <= 1.0);
        assert_eq!(values["base_back_wheel"], 0.0);
        assert!((values["base_right_wheel"] - 1129.0).abs() <= 1.0);
    }

    #[test]
    fn stop_base_zeroes_wheels_with_retries() {
        let mut robot = connected_robot(LeKiwiConfig::default());
        robot.bus.fail_sync_writes = 3; // survivable with 5 retries
        robot.stop_base().unwrap();

        let (register, values, num_retry) = robot.bus.sync_writes.last().unwrap();
        assert_eq!(*register, Register::GoalVelocity);
        assert_eq!(*num_retry, STOP_BASE_RETRIES);
        assert_eq!(values.len(), 3);
        assert!(values.values().all(|value| *value == 0.0));
    }

    #[test]
    fn stop_base_surfaces_exhausted_retries() {
        let mut robot = connected_robot(LeKiwiConfig::default());
        robot.bus.fail_sync_writes = 100;
        assert!(matches!(robot.stop_base(), Err(RobotError::Bus(_))));
    }

    #[test]
    fn disconnect_stops_base_and_honors_torque_config() {
        let mut config = LeKiwiConfig::default();
        config.disable_torque_on_disconnect = true;
        let mut robot = connected_robot(config);

        robot.disconnect().unwrap();
        assert!(!robot.is_connected());
        assert_eq!(robot.bus.disconnects, vec![true]);

        let (register, values, _) = robot.bus.sync_writes.last().unwrap();
        assert_eq!(*register, Register::GoalVelocity);
        assert!(values.values().all(|value| *value == 0.0));
    }
}
