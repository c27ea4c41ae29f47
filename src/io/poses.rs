//! Camera pose lists: JSON records and a COLMAP-style text table.
//!
//! Both carry camera-to-world poses with quaternions in w, x, y, z order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::export::{Trajectory, TrajectoryRecord};

/// One camera in `camera_poses.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraPoseRecord {
    pub image_id: u64,
    pub image_name: String,
    pub camera_id: u32,
    pub frame_index: u64,
    pub timestamp: f64,
    pub translation: [f64; 3],
    /// Row-major camera-to-world rotation.
    pub rotation_matrix: [[f64; 3]; 3],
    /// [w, x, y, z]
    pub quaternion: [f64; 4],
    #[serde(rename = "num_points3D")]
    pub num_points3d: usize,
}

impl From<&TrajectoryRecord> for CameraPoseRecord {
    fn from(r: &TrajectoryRecord) -> Self {
        let t = r.pose_wc.translation;
        let q = r.pose_wc.rotation;
        let m = r.pose_wc.rotation_matrix();
        Self {
            image_id: r.image_id,
            image_name: r.image_name.clone(),
            camera_id: r.camera_id,
            frame_index: r.frame_index,
            timestamp: r.timestamp,
            translation: [t.x, t.y, t.z],
            rotation_matrix: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
            quaternion: [q.w, q.i, q.j, q.k],
            num_points3d: r.num_landmarks,
        }
    }
}

pub fn camera_pose_records(trajectory: &Trajectory) -> Vec<CameraPoseRecord> {
    trajectory.records.iter().map(CameraPoseRecord::from).collect()
}

pub fn write_camera_poses_json(path: &Path, trajectory: &Trajectory) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &camera_pose_records(trajectory))
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn read_camera_poses_json(path: &Path) -> Result<Vec<CameraPoseRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
}

/// `IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME`, one camera per line.
pub fn write_colmap_poses(path: &Path, trajectory: &Trajectory) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "# Image poses, camera-to-world")?;
    writeln!(w, "# IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME")?;
    for r in &trajectory.records {
        let t = r.pose_wc.translation;
        let q = r.pose_wc.rotation;
        writeln!(
            w,
            "{} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {} {}",
            r.image_id, q.w, q.i, q.j, q.k, t.x, t.y, t.z, r.camera_id, r.image_name
        )?;
    }
    w.flush()?;
    Ok(())
}
