use crate::frame::Frame;
use crate::pipeline::SweepEntry;
use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;

/// Evenly spaced scan positions from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Loads a focus stack from images matching a glob pattern.
///
/// Files are sorted by path and assigned positions spread evenly from
/// `z_start` to `z_end`, as if a stage had stepped through them in order.
pub fn load_focus_stack(pattern: &str, z_start: f64, z_end: f64, pixel_pitch: f64) -> Result<Vec<SweepEntry>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("Invalid image pattern {pattern}"))?
        .collect::<std::result::Result<_, _>>()
        .context("Failed to list focus stack images")?;
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("No images match {}", pattern);
    }

    let positions = linspace(z_start, z_end, paths.len());
    let mut entries = Vec::with_capacity(paths.len());
    for (path, position) in paths.iter().zip(positions) {
        let img = image::open(path).with_context(|| format!("Failed to load image {}", path.display()))?;
        let frame = Frame::from_image(&img, pixel_pitch)
            .with_context(|| format!("Unusable image {}", path.display()))?;
        entries.push(SweepEntry { position, frame });
    }

    info!("loaded {} frames from {pattern}, z {z_start} to {z_end}", entries.len());
    Ok(entries)
}
