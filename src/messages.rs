// Typed channel keys and the action/observation maps exchanged with the
// robot pipeline.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::camera::Frame;
use crate::motor::kinematics::BodyVelocity;

/// Body-frame axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    Theta,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Theta => write!(f, "theta"),
        }
    }
}

/// One addressable value at the pipeline boundary: a named arm joint's
/// normalized position, or one body-velocity component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Position(String),
    Velocity(Axis),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Position(motor) => write!(f, "{motor}.pos"),
            Channel::Velocity(axis) => write!(f, "{axis}.vel"),
        }
    }
}

/// Command map sent to the robot: position goals for arm joints, velocity
/// goals for the base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Action {
    channels: HashMap<Channel, f32>,
}

impl Action {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Channel, value: f32) {
        self.channels.insert(channel, value);
    }

    pub fn get(&self, channel: &Channel) -> Option<f32> {
        self.channels.get(channel).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn set_position(&mut self, motor: &str, value: f32) {
        self.insert(Channel::Position(motor.to_string()), value);
    }

    pub fn set_body_velocity(&mut self, body: BodyVelocity) {
        self.insert(Channel::Velocity(Axis::X), body.x);
        self.insert(Channel::Velocity(Axis::Y), body.y);
        self.insert(Channel::Velocity(Axis::Theta), body.theta);
    }

    /// Commanded body velocity; axes without a channel read as zero.
    pub fn body_velocity(&self) -> BodyVelocity {
        let axis = |axis| self.get(&Channel::Velocity(axis)).unwrap_or(0.0);
        BodyVelocity::new(axis(Axis::X), axis(Axis::Y), axis(Axis::Theta))
    }

    /// Position goals, one per targeted motor.
    pub fn positions(&self) -> impl Iterator<Item = (&str, f32)> {
        self.channels.iter().filter_map(|(channel, &value)| match channel {
            Channel::Position(motor) => Some((motor.as_str(), value)),
            Channel::Velocity(_) => None,
        })
    }

    pub fn channels(&self) -> &HashMap<Channel, f32> {
        &self.channels
    }
}

/// One snapshot of robot state: normalized arm positions, decoded body
/// velocity, and the latest frame from each camera.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub channels: HashMap<Channel, f32>,
    pub frames: HashMap<String, Frame>,
}

impl Observation {
    pub fn body_velocity(&self) -> BodyVelocity {
        let axis = |axis| {
            self.channels
                .get(&Channel::Velocity(axis))
                .copied()
                .unwrap_or(0.0)
        };
        BodyVelocity::new(axis(Axis::X), axis(Axis::Y), axis(Axis::Theta))
    }
}
