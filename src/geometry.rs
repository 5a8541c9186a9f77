//! Target geometry metadata supplied alongside each frame.

use crate::error::{MeasureError, Result};
use crate::frame::{Frame, Roi};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Angular intensity profile of the star's sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarWaveform {
    Sinusoidal,
    /// Classic binary Siemens star.
    SquareWave,
}

/// Siemens star: `sector_pairs` dark/bright pairs between two radii.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarGeometry {
    /// Nominal center `(x, y)` in pixels.
    pub center: (f64, f64),
    pub inner_radius: f64,
    pub outer_radius: f64,
    pub sector_pairs: u32,
    /// Michelson contrast of the printed target, (max - min) / (max + min).
    pub nominal_contrast: f64,
    pub waveform: StarWaveform,
}

impl StarGeometry {
    pub fn validate(&self, frame: &Frame) -> Result<()> {
        if self.sector_pairs == 0 {
            return Err(MeasureError::degenerate("star has no sector pairs"));
        }
        if !(self.inner_radius > 0.0 && self.outer_radius - self.inner_radius > 0.0) {
            return Err(MeasureError::degenerate(format!(
                "radius span [{}, {}] is empty",
                self.inner_radius, self.outer_radius
            )));
        }
        if !(self.nominal_contrast > 0.0 && self.nominal_contrast <= 1.0) {
            return Err(MeasureError::degenerate(format!(
                "nominal contrast {} outside (0, 1]",
                self.nominal_contrast
            )));
        }
        self.check_extent(frame, self.center)
    }

    /// Fails when the outer ring around `center` leaves the frame.
    pub fn check_extent(&self, frame: &Frame, center: (f64, f64)) -> Result<()> {
        let (cx, cy) = center;
        let r = self.outer_radius;
        let max_x = (frame.width() - 1) as f64;
        let max_y = (frame.height() - 1) as f64;
        if cx - r < 0.0 || cy - r < 0.0 || cx + r > max_x || cy + r > max_y {
            return Err(MeasureError::GeometryOutOfBounds {
                what: format!("star of radius {r:.1}"),
                min_x: cx - r,
                max_x: cx + r,
                min_y: cy - r,
                max_y: cy + r,
                width: frame.width(),
                height: frame.height(),
            });
        }
        Ok(())
    }

    /// Spatial frequency in cycles per pixel seen along a ring of `radius`.
    pub fn frequency_at(&self, radius: f64, harmonic: u32) -> f64 {
        (harmonic as f64 * self.sector_pairs as f64) / (2.0 * PI * radius)
    }

    /// Amplitude of harmonic `h` relative to the waveform's half swing.
    pub fn harmonic_amplitude(&self, harmonic: u32) -> Result<f64> {
        match self.waveform {
            StarWaveform::Sinusoidal if harmonic == 1 => Ok(1.0),
            StarWaveform::Sinusoidal => Err(MeasureError::degenerate(format!(
                "a sinusoidal star has no harmonic {harmonic}"
            ))),
            StarWaveform::SquareWave if harmonic % 2 == 1 => Ok(4.0 / (PI * harmonic as f64)),
            StarWaveform::SquareWave => Err(MeasureError::degenerate(format!(
                "a square-wave star has no even harmonic {harmonic}"
            ))),
        }
    }
}

/// Slanted edge inside a rectangular region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeGeometry {
    pub roi: Roi,
    /// Edge direction in degrees from the image's vertical axis (0 = vertical,
    /// 90 = horizontal). Picks the scan direction when present.
    pub angle_estimate_deg: Option<f64>,
}

impl EdgeGeometry {
    pub fn validate(&self, frame: &Frame) -> Result<()> {
        if self.roi.width < 8 || self.roi.height < 8 {
            return Err(MeasureError::degenerate(format!(
                "edge ROI {}x{} is smaller than 8x8",
                self.roi.width, self.roi.height
            )));
        }
        frame.roi(self.roi).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum TargetGeometry {
    Star(StarGeometry),
    Edge(EdgeGeometry),
}

impl TargetGeometry {
    pub fn validate(&self, frame: &Frame) -> Result<()> {
        match self {
            TargetGeometry::Star(star) => star.validate(frame),
            TargetGeometry::Edge(edge) => edge.validate(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(size: u32) -> Frame {
        Frame::new(size, size, vec![0.5; (size * size) as usize], 0.01, 12).unwrap()
    }

    fn star() -> StarGeometry {
        StarGeometry {
            center: (50.0, 50.0),
            inner_radius: 10.0,
            outer_radius: 40.0,
            sector_pairs: 16,
            nominal_contrast: 0.8,
            waveform: StarWaveform::Sinusoidal,
        }
    }

    #[test]
    fn test_star_validation() {
        let f = frame(101);
        assert!(star().validate(&f).is_ok());

        let mut s = star();
        s.sector_pairs = 0;
        assert!(matches!(s.validate(&f), Err(MeasureError::DegenerateGeometry { .. })));

        let mut s = star();
        s.outer_radius = s.inner_radius;
        assert!(matches!(s.validate(&f), Err(MeasureError::DegenerateGeometry { .. })));

        let mut s = star();
        s.outer_radius = 55.0;
        assert!(matches!(s.validate(&f), Err(MeasureError::GeometryOutOfBounds { .. })));
    }

    #[test]
    fn test_star_frequency_mapping() {
        let s = star();
        let f = s.frequency_at(16.0 / (2.0 * PI) * 4.0, 1);
        assert!((f - 0.25).abs() < 1e-12);
        assert!((s.frequency_at(20.0, 3) - 3.0 * s.frequency_at(20.0, 1)).abs() < 1e-12);
    }

    #[test]
    fn test_square_wave_harmonics() {
        let mut s = star();
        s.waveform = StarWaveform::SquareWave;
        assert!((s.harmonic_amplitude(1).unwrap() - 4.0 / PI).abs() < 1e-12);
        assert!((s.harmonic_amplitude(3).unwrap() - 4.0 / (3.0 * PI)).abs() < 1e-12);
        assert!(s.harmonic_amplitude(2).is_err());
    }

    #[test]
    fn test_edge_roi_out_of_bounds() {
        let f = frame(64);
        let edge = TargetGeometry::Edge(EdgeGeometry {
            roi: Roi::new(40, 10, 30, 30),
            angle_estimate_deg: Some(5.0),
        });
        assert!(matches!(edge.validate(&f), Err(MeasureError::GeometryOutOfBounds { .. })));
    }
}
