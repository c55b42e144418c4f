// Crate-level error surface.
//
// Persistence failures never appear here: the calibration store degrades to
// warnings by contract. Bus failures stay opaque so the interface layer can
// translate them without this crate guessing at their shape.

use crate::camera::CameraError;
use crate::motor::encoding::ValueOutOfRangeError;
use crate::motor::kinematics::KinematicsError;

#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    #[error("robot is not connected")]
    NotConnected,

    #[error("robot is already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Kinematics(#[from] KinematicsError),

    #[error(transparent)]
    ValueOutOfRange(#[from] ValueOutOfRangeError),

    #[error("camera failure: {0}")]
    Camera(#[from] CameraError),

    #[error("operator console failure: {0}")]
    Console(#[from] std::io::Error),

    #[error("bus communication failure: {0}")]
    Bus(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RobotError {
    pub fn bus(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Bus(Box::new(err))
    }
}
