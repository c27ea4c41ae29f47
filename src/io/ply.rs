//! ASCII PLY point clouds.
//!
//! Vertices carry `x y z` and, when any point has a color, `red green blue`
//! as uchar. Points without a color are written gray.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nalgebra::Vector3;

use super::export::{CloudPoint, PointCloud};

const DEFAULT_COLOR: [u8; 3] = [128, 128, 128];

pub fn write_ply(path: &Path, cloud: &PointCloud) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let colored = cloud.has_colors();

    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", cloud.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    if colored {
        writeln!(w, "property uchar red")?;
        writeln!(w, "property uchar green")?;
        writeln!(w, "property uchar blue")?;
    }
    writeln!(w, "end_header")?;

    for p in &cloud.points {
        let v = p.position;
        if colored {
            let [r, g, b] = p.color.unwrap_or(DEFAULT_COLOR);
            writeln!(w, "{:.6} {:.6} {:.6} {} {} {}", v.x, v.y, v.z, r, g, b)?;
        } else {
            writeln!(w, "{:.6} {:.6} {:.6}", v.x, v.y, v.z)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Read an ASCII PLY written by [`write_ply`] (or any ASCII PLY whose
/// vertex element starts with x y z, optionally followed by red green blue).
pub fn read_ply(path: &Path) -> Result<PointCloud> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut num_vertices = None;
    let mut properties: Vec<String> = Vec::new();
    let mut in_vertex = false;
    let mut header_done = false;

    let magic = lines.next().transpose()?;
    if magic.as_deref().map(str::trim) != Some("ply") {
        bail!("{} is not a PLY file", path.display());
    }

    for line in lines.by_ref() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["format", fmt, ..] if *fmt != "ascii" => bail!("unsupported PLY format {}", fmt),
            ["element", "vertex", n] => {
                num_vertices = Some(n.parse::<usize>().context("bad vertex count")?);
                in_vertex = true;
            }
            ["element", ..] => in_vertex = false,
            ["property", _, name] if in_vertex => properties.push(name.to_string()),
            ["end_header"] => {
                header_done = true;
                break;
            }
            _ => {}
        }
    }
    if !header_done {
        bail!("{}: missing end_header", path.display());
    }
    let Some(num_vertices) = num_vertices else {
        bail!("{}: no vertex element", path.display());
    };
    let column = |name: &str| properties.iter().position(|p| p == name);
    let (Some(ix), Some(iy), Some(iz)) = (column("x"), column("y"), column("z")) else {
        bail!("{}: vertex element lacks x/y/z", path.display());
    };
    let rgb = match (column("red"), column("green"), column("blue")) {
        (Some(r), Some(g), Some(b)) => Some((r, g, b)),
        _ => None,
    };

    let mut points = Vec::with_capacity(num_vertices);
    for line in lines.take(num_vertices) {
        let line = line?;
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() < properties.len() {
            bail!("{}: short vertex line {:?}", path.display(), line);
        }
        let position = Vector3::new(values[ix].parse()?, values[iy].parse()?, values[iz].parse()?);
        let color = match rgb {
            Some((r, g, b)) => Some([values[r].parse()?, values[g].parse()?, values[b].parse()?]),
            None => None,
        };
        points.push(CloudPoint { position, color });
    }
    if points.len() != num_vertices {
        bail!("{}: expected {} vertices, found {}", path.display(), num_vertices, points.len());
    }
    Ok(PointCloud { points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_colored_cloud_round_trip() {
        let cloud = PointCloud {
            points: vec![
                CloudPoint {
                    position: Vector3::new(1.0, -2.5, 3.25),
                    color: Some([255, 0, 10]),
                },
                CloudPoint {
                    position: Vector3::new(0.0, 0.0, 1.0),
                    color: None,
                },
            ],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        write_ply(&path, &cloud).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("element vertex 2"));
        assert!(text.contains("property uchar red"));

        let read = read_ply(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_relative_eq!(read.points[0].position, cloud.points[0].position, epsilon = 1e-6);
        assert_eq!(read.points[0].color, Some([255, 0, 10]));
        assert_eq!(read.points[1].color, Some(DEFAULT_COLOR));
    }

    #[test]
    fn test_uncolored_cloud_has_no_color_properties() {
        let cloud = PointCloud {
            points: vec![CloudPoint {
                position: Vector3::new(1.0, 2.0, 3.0),
                color: None,
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        write_ply(&path, &cloud).unwrap();
        let read = read_ply(&path).unwrap();
        assert_eq!(read.points[0].color, None);
    }

    #[test]
    fn test_rejects_non_ply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ply");
        std::fs::write(&path, "not a ply\n").unwrap();
        assert!(read_ply(&path).is_err());
    }
}
