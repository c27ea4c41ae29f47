use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_sfm::calibration::{Calibration, ControlPoint};
use rust_sfm::capability::{FeatureExtractor, FrameSource};
use rust_sfm::config::PipelineConfig;
use rust_sfm::io::control_points::load_control_points;
use rust_sfm::io::dataset::{write_dataset, Dataset};
use rust_sfm::synthetic::{SceneConfig, SyntheticScene};
use rust_sfm::system::{Pipeline, PipelineReport};

/// Incremental structure-from-motion: keyframes in, metric point cloud and
/// camera trajectory out.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconstruct an on-disk feature dataset.
    Run {
        /// Directory with camera.yaml, frames.csv and features/.
        dataset: PathBuf,
        /// Output directory for the point cloud and poses.
        #[arg(long)]
        out: PathBuf,
        /// YAML pipeline configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        /// CSV of control points (kind,id,x,y,z) for metric scale.
        #[arg(long)]
        control_points: Option<PathBuf>,
    },
    /// Generate a synthetic sequence, reconstruct it and calibrate against ground truth.
    Synthetic {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Fraction of landmarks shared by consecutive frames.
        #[arg(long, default_value_t = 0.7)]
        overlap: f64,
        /// Maximum pixel noise.
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "rust_sfm=debug" } else { "rust_sfm=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            dataset,
            out,
            config,
            control_points,
        } => run_dataset(&dataset, &out, config.as_deref(), control_points.as_deref()),
        Command::Synthetic {
            out,
            frames,
            overlap,
            noise,
            config,
        } => run_synthetic(&out, frames, overlap, noise, config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
}

fn run_dataset(root: &Path, out: &Path, config: Option<&Path>, control_points: Option<&Path>) -> Result<()> {
    let mut config = load_config(config)?;
    let dataset = Arc::new(Dataset::open(root)?);
    config.default_intrinsics = *dataset.intrinsics();
    info!("[Dataset] {}: {} frames", root.display(), dataset.len());

    let mut pipeline =
        Pipeline::with_builtin_capabilities(config, Arc::clone(&dataset) as Arc<dyn FeatureExtractor>);
    let report = pipeline.run(dataset.as_ref());
    finish(&pipeline, &report, out, |pipeline| match control_points {
        Some(path) => load_control_points(path, &pipeline.graph()).map(Some),
        None => Ok(None),
    })
}

fn run_synthetic(out: &Path, frames: usize, overlap: f64, noise: f64, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let scene = Arc::new(SyntheticScene::generate(SceneConfig {
        num_frames: frames,
        overlap,
        pixel_noise: noise,
        ..SceneConfig::default()
    }));

    // Also written as a dataset so `run` can replay it.
    let frame_list: Vec<_> = (0..scene.num_frames()).filter_map(|i| scene.frame(i)).collect();
    let features: Vec<_> = (0..scene.num_frames()).filter_map(|i| scene.features(i).cloned()).collect();
    write_dataset(
        &out.join("dataset"),
        scene.intrinsics(),
        frame_list.iter().zip(features.iter().map(|f| f.as_ref())),
    )?;

    let mut pipeline = Pipeline::with_builtin_capabilities(config, Arc::clone(&scene) as Arc<dyn FeatureExtractor>);
    let report = pipeline.run(scene.as_ref());
    finish(&pipeline, &report, out, |pipeline| {
        Ok(Some(scene.control_points(&pipeline.graph(), 50)))
    })
}

/// Calibrate (when control points are available), export and write the report.
fn finish<F>(pipeline: &Pipeline, report: &PipelineReport, out: &Path, control_points: F) -> Result<()>
where
    F: FnOnce(&Pipeline) -> Result<Option<Vec<ControlPoint>>>,
{
    fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let report_path = out.join("report.json");
    let file = File::create(&report_path).with_context(|| format!("Failed to create {}", report_path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;

    if !report.status.has_reconstruction() {
        bail!("reconstruction failed: {}", report.status);
    }

    let calibration: Option<Calibration> = match control_points(pipeline)? {
        Some(points) => match pipeline.calibrate(&points) {
            Ok(calibration) => {
                info!(
                    "[Calibration] scale {:.4}, rms {:.4} over {} points",
                    calibration.transform.scale,
                    calibration.rms_error,
                    points.len()
                );
                Some(calibration)
            }
            Err(e) => {
                warn!("[Calibration] {}; exporting in reconstruction scale", e);
                None
            }
        },
        None => None,
    };

    let paths = pipeline
        .exporter(calibration.as_ref().map(|c| &c.transform))
        .write_all(out)?;
    for path in paths.all() {
        info!("[Export] wrote {}", path.display());
    }
    Ok(())
}
