// Omniwheel kinematics for the LeKiwi 3-wheel base.
//
// Converts body-frame velocities (x, y, theta) to raw wheel commands and
// decodes raw wheel readings back into body-frame velocities.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

/// Wheel configuration for the LeKiwi base
pub const WHEEL_RADIUS: f32 = 0.05; // meters
pub const BASE_RADIUS: f32 = 0.125; // meters (distance from center to wheel)

/// Wheel mounting angles (degrees) with -90° offset
/// Left wheel at 240°, Back wheel at 0°, Right wheel at 120°
const WHEEL_ANGLES_DEG: [f32; 3] = [240.0 - 90.0, 0.0 - 90.0, 120.0 - 90.0];

/// Motor resolution: 4096 steps per revolution
const STEPS_PER_REVOLUTION: f32 = 4096.0;
const STEPS_PER_DEG: f32 = STEPS_PER_REVOLUTION / 360.0;

/// Maximum raw velocity command (safety limit)
pub const MAX_RAW: i16 = 3000;

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum KinematicsError {
    #[error("wheel mapping matrix is singular (det = {det})")]
    Singular { det: f32 },
}

/// Body-frame velocity: x, y in m/s, theta in deg/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyVelocity {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl BodyVelocity {
    pub fn new(x: f32, y: f32, theta: f32) -> Self {
        Self { x, y, theta }
    }
}

/// Raw wheel velocity values for the three base motors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelVelocities {
    pub left: i16,
    pub back: i16,
    pub right: i16,
}

impl WheelVelocities {
    pub fn new(left: i16, back: i16, right: i16) -> Self {
        Self { left, back, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns velocities as array [left, back, right]
    pub fn as_array(&self) -> [i16; 3] {
        [self.left, self.back, self.right]
    }
}

/// Convert degrees per second to raw motor ticks
fn degps_to_raw(degps: f32) -> i16 {
    let speed_in_steps = degps * STEPS_PER_DEG;
    let speed_int = speed_in_steps.round() as i32;

    // Clamp to signed 16-bit range
    speed_int.clamp(-0x8000, 0x7FFF) as i16
}

/// Convert raw motor ticks back to degrees per second
fn raw_to_degps(raw: i16) -> f32 {
    raw as f32 / STEPS_PER_DEG
}

fn mapping_matrix(base_radius: f32) -> [[f32; 3]; 3] {
    let mut m = [[0.0f32; 3]; 3];
    for (row, &angle_deg) in m.iter_mut().zip(WHEEL_ANGLES_DEG.iter()) {
        let angle_rad = angle_deg * (PI / 180.0);
        *row = [angle_rad.cos(), angle_rad.sin(), base_radius];
    }
    m
}

fn det3(m: &[[f32; 3]; 3]) -> f32 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn invert3(m: &[[f32; 3]; 3], det: f32) -> [[f32; 3]; 3] {
    let mut inv = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let a = m[(j + 1) % 3][(i + 1) % 3];
            let b = m[(j + 2) % 3][(i + 2) % 3];
            let c = m[(j + 1) % 3][(i + 2) % 3];
            let d = m[(j + 2) % 3][(i + 1) % 3];
            inv[i][j] = (a * b - c * d) / det;
        }
    }
    inv
}

fn mat_mul(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Bidirectional body ⇄ wheel transform for the omniwheel base.
///
/// The mapping matrix and its inverse are fixed at construction; a singular
/// matrix is rejected there, so the per-call paths never re-validate it.
pub struct BaseKinematics {
    wheel_radius: f32,
    max_raw: i16,
    m: [[f32; 3]; 3],
    m_inv: [[f32; 3]; 3],
}

impl BaseKinematics {
    pub fn new(wheel_radius: f32, base_radius: f32, max_raw: i16) -> Result<Self, KinematicsError> {
        let m = mapping_matrix(base_radius);
        let det = det3(&m);
        if det.abs() < 1e-6 {
            return Err(KinematicsError::Singular { det });
        }
        Ok(Self {
            wheel_radius,
            max_raw,
            m,
            m_inv: invert3(&m, det),
        })
    }

    /// Convert body-frame velocities to raw wheel commands.
    ///
    /// When any wheel would exceed `max_raw` ticks/s, all three wheels are
    /// scaled by the same factor so the largest lands exactly on the cap and
    /// the ratio between wheels is preserved.
    pub fn body_to_wheel_raw(&self, body: BodyVelocity) -> WheelVelocities {
        let theta_rad = body.theta * (PI / 180.0);
        let wheel_linear = mat_mul(&self.m, [body.x, body.y, theta_rad]);

        // Linear speed (m/s) -> angular speed (deg/s) per wheel
        let mut wheel_degps =
            wheel_linear.map(|linear| linear / self.wheel_radius * (180.0 / PI));

        let max_raw_computed = wheel_degps
            .iter()
            .map(|degps| degps.abs() * STEPS_PER_DEG)
            .fold(0.0f32, f32::max);

        if max_raw_computed > self.max_raw as f32 {
            let scale = self.max_raw as f32 / max_raw_computed;
            for degps in &mut wheel_degps {
                *degps *= scale;
            }
        }

        WheelVelocities {
            left: degps_to_raw(wheel_degps[0]),
            back: degps_to_raw(wheel_degps[1]),
            right: degps_to_raw(wheel_degps[2]),
        }
    }

    /// Convert raw wheel readings back to body-frame velocities.
    pub fn wheel_raw_to_body(&self, wheels: WheelVelocities) -> BodyVelocity {
        let wheel_linear = wheels
            .as_array()
            .map(|raw| raw_to_degps(raw) * (PI / 180.0) * self.wheel_radius);

        let v = mat_mul(&self.m_inv, wheel_linear);
        BodyVelocity {
            x: v[0],
            y: v[1],
            theta: v[2] * (180.0 / PI),
        }
    }
}
