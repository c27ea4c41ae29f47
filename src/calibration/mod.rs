//! Post-hoc metric scale calibration.

pub mod scale;

pub use scale::{Calibration, ControlPoint, ControlTarget, DistanceConstraint, ScaleCalibrator};
