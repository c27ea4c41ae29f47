//! On-disk feature dataset.
//!
//! Layout:
//! ```text
//! <root>/camera.yaml          fx, fy, cx, cy [, distortion]
//! <root>/frames.csv           index,timestamp,image
//! <root>/features/<index>.csv x,y,r,g,b,d0,d1,...
//! ```
//! Color columns may be left empty. The dataset is both a [`FrameSource`]
//! and a [`FeatureExtractor`]; feature files are read on demand.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector2;

use crate::capability::{FeatureExtractor, FrameSource};
use crate::error::CapabilityError;
use crate::geometry::Intrinsics;
use crate::tracking::{FeatureSet, Frame, ImageRef, Keypoint};

#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
    intrinsics: Intrinsics,
    frames: Vec<Frame>,
}

impl Dataset {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let intrinsics = load_intrinsics(&root.join("camera.yaml"))?;
        let frames = load_frame_list(&root.join("frames.csv"), intrinsics)?;
        if frames.is_empty() {
            tracing::warn!("[Dataset] {} lists no frames", root.display());
        }
        Ok(Self {
            root,
            intrinsics,
            frames,
        })
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn features_path(&self, index: u64) -> PathBuf {
        self.root.join("features").join(format!("{index}.csv"))
    }
}

impl FrameSource for Dataset {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, position: usize) -> Option<Frame> {
        self.frames.get(position).cloned()
    }
}

impl FeatureExtractor for Dataset {
    fn extract(&self, frame: &Frame) -> Result<FeatureSet, CapabilityError> {
        let path = self.features_path(frame.index);
        read_features(&path).map_err(|e| CapabilityError::Unavailable(format!("{e:#}")))
    }
}

fn load_intrinsics(path: &Path) -> Result<Intrinsics> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let intrinsics: Intrinsics =
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))?;
    if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
        bail!("{}: focal lengths must be positive", path.display());
    }
    Ok(intrinsics)
}

fn load_frame_list(path: &Path, intrinsics: Intrinsics) -> Result<Vec<Frame>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut frames = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 3 {
            continue;
        }
        let index: u64 = rec[0].trim().parse().with_context(|| format!("bad frame index {:?}", &rec[0]))?;
        let timestamp: f64 = rec[1].trim().parse().with_context(|| format!("bad timestamp {:?}", &rec[1]))?;
        let image = ImageRef::new(rec[2].trim());
        frames.push(Frame::new(index, timestamp, image).with_intrinsics(intrinsics));
    }
    frames.sort_by_key(|f| f.index);
    Ok(frames)
}

fn read_features(path: &Path) -> Result<FeatureSet> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut keypoints = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 5 {
            bail!("{}: expected x,y,r,g,b,d0.. columns", path.display());
        }
        let pixel = Vector2::new(rec[0].trim().parse()?, rec[1].trim().parse()?);
        let color = match (rec[2].trim(), rec[3].trim(), rec[4].trim()) {
            ("", "", "") => None,
            (r, g, b) => Some([r.parse()?, g.parse()?, b.parse()?]),
        };
        let descriptor = rec
            .iter()
            .skip(5)
            .map(|d| d.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("{}: bad descriptor value", path.display()))?;
        keypoints.push(Keypoint {
            pixel,
            descriptor,
            color,
        });
    }
    Ok(FeatureSet::new(keypoints))
}

/// Write frames and their features in the layout [`Dataset::open`] reads.
pub fn write_dataset<'a, I>(root: &Path, intrinsics: &Intrinsics, frames: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a Frame, &'a FeatureSet)>,
{
    let features_dir = root.join("features");
    fs::create_dir_all(&features_dir).with_context(|| format!("Failed to create {}", features_dir.display()))?;

    let camera = File::create(root.join("camera.yaml"))?;
    serde_yaml::to_writer(camera, intrinsics)?;

    let mut list = BufWriter::new(File::create(root.join("frames.csv"))?);
    writeln!(list, "index,timestamp,image")?;

    for (frame, features) in frames {
        writeln!(list, "{},{:.6},{}", frame.index, frame.timestamp, frame.image)?;

        let path = features_dir.join(format!("{}.csv", frame.index));
        let mut w = BufWriter::new(File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?);
        let dims = features.keypoints.first().map_or(0, |kp| kp.descriptor.len());
        let header: Vec<String> = ["x", "y", "r", "g", "b"]
            .iter()
            .map(|s| s.to_string())
            .chain((0..dims).map(|i| format!("d{i}")))
            .collect();
        writeln!(w, "{}", header.join(","))?;
        for kp in &features.keypoints {
            let color = kp
                .color
                .map_or_else(|| ",,".to_string(), |[r, g, b]| format!("{r},{g},{b}"));
            let desc: Vec<String> = kp.descriptor.iter().map(|d| d.to_string()).collect();
            write!(w, "{:.4},{:.4},{}", kp.pixel.x, kp.pixel.y, color)?;
            if !desc.is_empty() {
                write!(w, ",{}", desc.join(","))?;
            }
            writeln!(w)?;
        }
        w.flush()?;
    }
    list.flush()?;
    Ok(())
}
