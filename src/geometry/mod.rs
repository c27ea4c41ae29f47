//! Geometry: rigid and similarity transforms, camera model, and the
//! two-view, PnP and triangulation solvers used during registration.

pub mod camera;
pub mod pnp;
pub mod ransac;
pub mod se3;
pub mod sim3;
pub mod triangulation;
pub mod two_view;

pub use camera::{DistortionModel, Intrinsics};
pub use pnp::{solve_pnp_ransac, PnPResult};
pub use ransac::RansacConfig;
pub use se3::SE3;
pub use sim3::Sim3;
pub use triangulation::TriangulationConfig;
