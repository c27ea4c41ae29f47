pub mod calibration;
pub mod capability;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod map;
pub mod mapping;
pub mod optimizer;
pub mod synthetic;
pub mod system;
pub mod tracking;
