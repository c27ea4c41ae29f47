//! Exporter: point cloud and trajectory snapshots of the store.
//!
//! Only registered keyframes are exported. An optional store-to-metric
//! [`Sim3`] is applied to every position and camera pose on the way out;
//! the store itself is not touched.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nalgebra::Vector3;
use tracing::info;

use crate::geometry::{Intrinsics, Sim3, SE3};
use crate::map::PoseGraph;

use super::{ply, poses, tum};

/// One exported landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudPoint {
    pub position: Vector3<f64>,
    pub color: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<CloudPoint>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True if any point carries a color.
    pub fn has_colors(&self) -> bool {
        self.points.iter().any(|p| p.color.is_some())
    }
}

/// One exported camera.
#[derive(Debug, Clone)]
pub struct TrajectoryRecord {
    /// 1-based image id.
    pub image_id: u64,
    pub frame_index: u64,
    pub timestamp: f64,
    pub image_name: String,
    /// 1-based id of the intrinsics this camera uses.
    pub camera_id: u32,
    /// Camera-to-world pose.
    pub pose_wc: SE3,
    /// Landmarks observed by this camera.
    pub num_landmarks: usize,
}

/// Registered cameras sorted by frame index.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub records: Vec<TrajectoryRecord>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.records.iter().map(|r| r.pose_wc.translation).collect()
    }

    /// Path statistics; `None` with fewer than two cameras.
    pub fn stats(&self) -> Option<TrajectoryStats> {
        TrajectoryStats::from_positions(&self.positions())
    }
}

/// Summary of a camera path.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryStats {
    pub total_length: f64,
    pub mean_step: f64,
    pub bbox_min: Vector3<f64>,
    pub bbox_max: Vector3<f64>,
    pub center: Vector3<f64>,
}

impl TrajectoryStats {
    pub fn from_positions(positions: &[Vector3<f64>]) -> Option<Self> {
        if positions.len() < 2 {
            return None;
        }
        let steps: Vec<f64> = positions.windows(2).map(|w| (w[1] - w[0]).norm()).collect();
        let total_length: f64 = steps.iter().sum();

        let mut bbox_min = positions[0];
        let mut bbox_max = positions[0];
        for p in positions {
            bbox_min = bbox_min.inf(p);
            bbox_max = bbox_max.sup(p);
        }
        let center = positions.iter().sum::<Vector3<f64>>() / positions.len() as f64;

        Some(Self {
            total_length,
            mean_step: total_length / steps.len() as f64,
            bbox_min,
            bbox_max,
            center,
        })
    }

    pub fn bbox_size(&self) -> Vector3<f64> {
        self.bbox_max - self.bbox_min
    }

    pub fn log(&self) {
        let size = self.bbox_size();
        info!("[Export] trajectory length: {:.3} units", self.total_length);
        info!("[Export] mean step: {:.3} units", self.mean_step);
        info!("[Export] bounding box: {:.3} x {:.3} x {:.3}", size.x, size.y, size.z);
        info!(
            "[Export] center: ({:.3}, {:.3}, {:.3})",
            self.center.x, self.center.y, self.center.z
        );
    }
}

/// Paths written by [`Exporter::write_all`].
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub point_cloud: PathBuf,
    pub tum: PathBuf,
    pub camera_poses: PathBuf,
    pub colmap_poses: PathBuf,
}

impl ExportPaths {
    pub fn all(&self) -> [&Path; 4] {
        [&self.point_cloud, &self.tum, &self.camera_poses, &self.colmap_poses]
    }
}

pub struct Exporter {
    cloud: PointCloud,
    trajectory: Trajectory,
}

impl Exporter {
    /// Snapshot the store, applying `transform` if given.
    pub fn new(graph: &PoseGraph, transform: Option<&Sim3>) -> Self {
        let map_point = |p: &Vector3<f64>| transform.map_or(*p, |t| t.transform_point(p));
        let map_pose = |pose: &SE3| transform.map_or(*pose, |t| t.transform_pose(pose));

        let mut landmarks: Vec<_> = graph.landmarks().collect();
        landmarks.sort_by_key(|lm| lm.id);
        let cloud = PointCloud {
            points: landmarks
                .into_iter()
                .map(|lm| CloudPoint {
                    position: map_point(&lm.position),
                    color: lm.color,
                })
                .collect(),
        };

        let mut cameras: Vec<Intrinsics> = Vec::new();
        let records = graph
            .registered_temporal_order()
            .into_iter()
            .filter_map(|kf| {
                let pose_wc = kf.pose_wc()?;
                let camera_id = match cameras.iter().position(|c| *c == kf.intrinsics) {
                    Some(i) => i + 1,
                    None => {
                        cameras.push(kf.intrinsics);
                        cameras.len()
                    }
                };
                Some(TrajectoryRecord {
                    image_id: kf.id.0 + 1,
                    frame_index: kf.frame_index(),
                    timestamp: kf.timestamp(),
                    image_name: kf.keyframe.frame.image.to_string(),
                    camera_id: camera_id as u32,
                    pose_wc: map_pose(pose_wc),
                    num_landmarks: kf.num_landmarks(),
                })
            })
            .collect();

        Self {
            cloud,
            trajectory: Trajectory { records },
        }
    }

    pub fn point_cloud(&self) -> &PointCloud {
        &self.cloud
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Write every artifact under `dir`.
    ///
    /// Layout: `points3d.ply` plus `poses/{trajectory_tum.txt,
    /// camera_poses.json, images_poses.txt}`.
    pub fn write_all(&self, dir: &Path) -> Result<ExportPaths> {
        let poses_dir = dir.join("poses");
        fs::create_dir_all(&poses_dir).with_context(|| format!("Failed to create {}", poses_dir.display()))?;

        let paths = ExportPaths {
            point_cloud: dir.join("points3d.ply"),
            tum: poses_dir.join("trajectory_tum.txt"),
            camera_poses: poses_dir.join("camera_poses.json"),
            colmap_poses: poses_dir.join("images_poses.txt"),
        };

        ply::write_ply(&paths.point_cloud, &self.cloud)?;
        tum::write_tum(&paths.tum, &self.trajectory)?;
        poses::write_camera_poses_json(&paths.camera_poses, &self.trajectory)?;
        poses::write_colmap_poses(&paths.colmap_poses, &self.trajectory)?;

        info!(
            "[Export] {} points, {} cameras written to {}",
            self.cloud.len(),
            self.trajectory.len(),
            dir.display()
        );
        if let Some(stats) = self.trajectory.stats() {
            stats.log();
        }
        Ok(paths)
    }
}
