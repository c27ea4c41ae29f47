//! TUM trajectory format: `timestamp tx ty tz qx qy qz qw`, one camera per line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;

use crate::geometry::SE3;

use super::export::Trajectory;

/// A pose read back from a TUM file.
#[derive(Debug, Clone)]
pub struct TumPose {
    pub timestamp: f64,
    /// Camera-to-world pose.
    pub pose_wc: SE3,
}

pub fn write_tum(path: &Path, trajectory: &Trajectory) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "# TUM trajectory format")?;
    writeln!(w, "# timestamp tx ty tz qx qy qz qw")?;
    for record in &trajectory.records {
        let t = record.pose_wc.translation;
        let q = record.pose_wc.rotation;
        writeln!(
            w,
            "{:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
            record.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_tum(path: &Path) -> Result<Vec<TumPose>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut poses = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let fields: Vec<&str> = rec.iter().filter(|f| !f.is_empty()).collect();
        if fields.len() < 8 {
            continue;
        }
        let v: Vec<f64> = fields[..8]
            .iter()
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("Bad TUM line in {}", path.display()))?;
        // File order is qx qy qz qw.
        let pose_wc = SE3::from_quaternion(v[7], v[4], v[5], v[6], Vector3::new(v[1], v[2], v[3]));
        poses.push(TumPose {
            timestamp: v[0],
            pose_wc,
        });
    }
    Ok(poses)
}
