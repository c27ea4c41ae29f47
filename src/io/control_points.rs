//! Control points from CSV: `kind,id,x,y,z`.
//!
//! `kind` is `landmark` (id = landmark id) or `camera` (id = frame index of
//! the keyframe). Coordinates are metric.

use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;

use crate::calibration::{ControlPoint, ControlTarget};
use crate::error::CalibrationError;
use crate::map::{LandmarkId, PoseGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Landmark,
    Camera,
}

/// A control point as written in the file, before resolving against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPointRecord {
    pub kind: ControlKind,
    pub id: u64,
    pub metric: Vector3<f64>,
}

impl ControlPointRecord {
    pub fn resolve(&self, graph: &PoseGraph) -> Result<ControlPoint, CalibrationError> {
        let target = match self.kind {
            ControlKind::Landmark => ControlTarget::Landmark(LandmarkId::new(self.id)),
            ControlKind::Camera => graph
                .keyframe_for_frame(self.id)
                .map(ControlTarget::Camera)
                .ok_or_else(|| CalibrationError::UnknownTarget(format!("camera at frame {}", self.id)))?,
        };
        Ok(ControlPoint {
            target,
            metric: self.metric,
        })
    }
}

pub fn read_control_points(path: &Path) -> Result<Vec<ControlPointRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut records = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 5 {
            bail!("{}: row {} needs kind,id,x,y,z", path.display(), line + 1);
        }
        let kind = match rec[0].to_ascii_lowercase().as_str() {
            "landmark" => ControlKind::Landmark,
            "camera" => ControlKind::Camera,
            other => bail!("{}: unknown control point kind {:?}", path.display(), other),
        };
        let id: u64 = rec[1].parse().with_context(|| format!("bad id {:?}", &rec[1]))?;
        let metric = Vector3::new(rec[2].parse()?, rec[3].parse()?, rec[4].parse()?);
        records.push(ControlPointRecord { kind, id, metric });
    }
    Ok(records)
}

/// Read and resolve in one step.
pub fn load_control_points(path: &Path, graph: &PoseGraph) -> Result<Vec<ControlPoint>> {
    read_control_points(path)?
        .iter()
        .map(|r| r.resolve(graph).map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Intrinsics, SE3};
    use crate::tracking::{Displacement, FeatureSet, Frame, ImageRef, Keyframe};
    use std::sync::Arc;

    #[test]
    fn test_read_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.csv");
        std::fs::write(
            &path,
            "kind,id,x,y,z\nlandmark, 4, 1.0, 2.0, 3.0\n# comment\nCamera,12,0,0,0.5\n",
        )
        .unwrap();

        let records = read_control_points(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ControlKind::Landmark);
        assert_eq!(records[0].id, 4);
        assert_eq!(records[1].metric, Vector3::new(0.0, 0.0, 0.5));

        let mut graph = PoseGraph::new();
        let kf = Arc::new(Keyframe::new(
            Frame::new(12, 1.2, ImageRef::new("frame_000012.png")),
            Arc::new(FeatureSet::default()),
            Displacement::Unavailable,
        ));
        let kf_id = graph.insert_keyframe(kf, Intrinsics::pinhole(500.0, 500.0, 320.0, 240.0));
        graph.set_pose(kf_id, SE3::identity());

        let cp = records[1].resolve(&graph).unwrap();
        assert_eq!(cp.target, ControlTarget::Camera(kf_id));
        let cp = records[0].resolve(&graph).unwrap();
        assert_eq!(cp.target, ControlTarget::Landmark(LandmarkId::new(4)));

        let missing = ControlPointRecord {
            kind: ControlKind::Camera,
            id: 7,
            metric: Vector3::zeros(),
        };
        assert!(matches!(missing.resolve(&graph), Err(CalibrationError::UnknownTarget(_))));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.csv");
        std::fs::write(&path, "kind,id,x,y,z\nplane,1,0,0,0\n").unwrap();
        assert!(read_control_points(&path).is_err());
    }
}
