//! Reading inputs and writing reconstruction artifacts.

pub mod control_points;
pub mod dataset;
pub mod export;
pub mod ply;
pub mod poses;
pub mod tum;

pub use dataset::Dataset;
pub use export::{CloudPoint, ExportPaths, Exporter, PointCloud, Trajectory, TrajectoryRecord, TrajectoryStats};
