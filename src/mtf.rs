//! Frequency/modulation curves shared by the Siemens-star and slanted-edge paths.

use crate::error::{MeasureError, Result};
use crate::frame::Frame;
use crate::geometry::TargetGeometry;
use crate::settings::{CrossingInterpolation, MeasureSettings, MtfSettings};
use log::debug;
use serde::{Deserialize, Serialize};

/// One modulation sample. `frequency` is in cycles per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPoint {
    pub frequency: f64,
    pub modulation: f64,
}

/// Modulation versus spatial frequency, ordered by frequency.
///
/// The first point is always `(0, 1)`. Dips are kept as measured; the curve is
/// never forced to be monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtfCurve {
    points: Vec<FrequencyPoint>,
    pixel_pitch: f64,
    interpolation: CrossingInterpolation,
    threshold: f64,
    /// Frequency where the curve first falls through `threshold`, if it does.
    crossing: Option<f64>,
}

/// Anything that turns a frame into an [`MtfCurve`].
pub trait MtfProducer {
    fn measure_mtf(&self, frame: &Frame, settings: &MeasureSettings) -> Result<MtfCurve>;
}

impl MtfProducer for TargetGeometry {
    fn measure_mtf(&self, frame: &Frame, settings: &MeasureSettings) -> Result<MtfCurve> {
        match self {
            TargetGeometry::Star(star) => star.measure_mtf(frame, settings),
            TargetGeometry::Edge(edge) => edge.measure_mtf(frame, settings),
        }
    }
}

/// Measures the MTF of whichever target the frame shows.
pub fn measure_mtf(frame: &Frame, target: &TargetGeometry, settings: &MeasureSettings) -> Result<MtfCurve> {
    target.measure_mtf(frame, settings)
}

impl MtfCurve {
    /// Builds a curve from unordered samples.
    ///
    /// Samples at non-positive or non-finite frequencies are dropped in favour
    /// of the `(0, 1)` anchor, samples sharing a frequency are averaged and
    /// modulation is clamped to `[0, 1]`.
    pub fn from_points(points: Vec<FrequencyPoint>, pixel_pitch: f64, settings: &MtfSettings) -> Self {
        let mut raw: Vec<FrequencyPoint> = points
            .into_iter()
            .filter(|p| p.frequency.is_finite() && p.frequency > 0.0 && p.modulation.is_finite())
            .collect();
        raw.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));

        let mut merged: Vec<(f64, f64, usize)> = Vec::with_capacity(raw.len());
        for p in raw {
            match merged.last_mut() {
                Some(last) if last.0 == p.frequency => {
                    last.1 += p.modulation;
                    last.2 += 1;
                }
                _ => merged.push((p.frequency, p.modulation, 1)),
            }
        }

        let mut out = Vec::with_capacity(merged.len() + 1);
        out.push(FrequencyPoint {
            frequency: 0.0,
            modulation: 1.0,
        });
        out.extend(merged.into_iter().map(|(f, sum, n)| FrequencyPoint {
            frequency: f,
            modulation: (sum / n as f64).clamp(0.0, 1.0),
        }));

        let mut curve = Self {
            points: out,
            pixel_pitch,
            interpolation: settings.crossing,
            threshold: settings.threshold,
            crossing: None,
        };
        curve.crossing = curve.frequency_at(settings.threshold).ok();
        if curve.crossing.is_none() {
            debug!(
                "MTF curve with {} points never falls through {}",
                curve.points.len(),
                settings.threshold
            );
        }
        curve
    }

    pub fn points(&self) -> &[FrequencyPoint] {
        &self.points
    }

    pub fn pixel_pitch(&self) -> f64 {
        self.pixel_pitch
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Crossing of the configured threshold, `None` if the curve stays above it.
    pub fn crossing(&self) -> Option<f64> {
        self.crossing
    }

    /// Frequency at 50% modulation, in cycles per pixel.
    pub fn mtf50(&self) -> Result<f64> {
        if self.threshold == 0.5 {
            return self.crossing.ok_or_else(|| self.no_crossing(0.5));
        }
        self.frequency_at(0.5)
    }

    /// MTF50 in cycles per unit length of the pixel pitch.
    pub fn mtf50_per_unit(&self) -> Result<f64> {
        self.mtf50().map(|f| self.to_cycles_per_unit(f))
    }

    pub fn to_cycles_per_unit(&self, cycles_per_pixel: f64) -> f64 {
        cycles_per_pixel / self.pixel_pitch
    }

    /// The curve with frequencies expressed per unit length.
    pub fn points_per_unit(&self) -> Vec<FrequencyPoint> {
        self.points
            .iter()
            .map(|p| FrequencyPoint {
                frequency: self.to_cycles_per_unit(p.frequency),
                modulation: p.modulation,
            })
            .collect()
    }

    /// First downward crossing of `threshold`, in cycles per pixel.
    pub fn frequency_at(&self, threshold: f64) -> Result<f64> {
        let tangents = match self.interpolation {
            CrossingInterpolation::Linear => None,
            CrossingInterpolation::MonotoneCubic => Some(monotone_tangents(&self.points)),
        };

        for i in 0..self.points.len().saturating_sub(1) {
            let (a, b) = (self.points[i], self.points[i + 1]);
            if !(a.modulation >= threshold && b.modulation < threshold) {
                continue;
            }
            let f = match &tangents {
                None => {
                    let t = (a.modulation - threshold) / (a.modulation - b.modulation);
                    a.frequency + t * (b.frequency - a.frequency)
                }
                Some(m) => {
                    let (mut lo, mut hi) = (a.frequency, b.frequency);
                    for _ in 0..64 {
                        let mid = 0.5 * (lo + hi);
                        if hermite(a, b, m[i], m[i + 1], mid) >= threshold {
                            lo = mid;
                        } else {
                            hi = mid;
                        }
                    }
                    0.5 * (lo + hi)
                }
            };
            return Ok(f);
        }
        Err(self.no_crossing(threshold))
    }

    /// Modulation at `frequency` (cycles per pixel), `None` beyond the last sample.
    pub fn modulation_at(&self, frequency: f64) -> Option<f64> {
        if frequency <= 0.0 {
            return Some(1.0);
        }
        let i = self.points.iter().position(|p| p.frequency >= frequency)?;
        let b = self.points[i];
        if b.frequency == frequency || i == 0 {
            return Some(b.modulation);
        }
        let a = self.points[i - 1];
        Some(match self.interpolation {
            CrossingInterpolation::Linear => {
                let t = (frequency - a.frequency) / (b.frequency - a.frequency);
                a.modulation + t * (b.modulation - a.modulation)
            }
            CrossingInterpolation::MonotoneCubic => {
                let m = monotone_tangents(&self.points);
                hermite(a, b, m[i - 1], m[i], frequency)
            }
        })
    }

    fn no_crossing(&self, threshold: f64) -> MeasureError {
        let (min, max) = self
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.modulation), hi.max(p.modulation))
            });
        MeasureError::NoCrossing {
            threshold,
            min_modulation: min,
            max_modulation: max,
            max_frequency: self.points.last().map_or(0.0, |p| p.frequency),
        }
    }
}

/// Fritsch-Carlson tangents: zero at local extrema, limited so each interval
/// of the Hermite interpolant stays monotone.
fn monotone_tangents(points: &[FrequencyPoint]) -> Vec<f64> {
    let n = points.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let secants: Vec<f64> = points
        .windows(2)
        .map(|w| (w[1].modulation - w[0].modulation) / (w[1].frequency - w[0].frequency))
        .collect();

    let mut m = vec![0.0; n];
    m[0] = secants[0];
    m[n - 1] = secants[n - 2];
    for i in 1..n - 1 {
        m[i] = if secants[i - 1] * secants[i] <= 0.0 {
            0.0
        } else {
            0.5 * (secants[i - 1] + secants[i])
        };
    }
    for (i, &d) in secants.iter().enumerate() {
        if d == 0.0 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
            continue;
        }
        let alpha = m[i] / d;
        let beta = m[i + 1] / d;
        let norm = alpha * alpha + beta * beta;
        if norm > 9.0 {
            let tau = 3.0 / norm.sqrt();
            m[i] = tau * alpha * d;
            m[i + 1] = tau * beta * d;
        }
    }
    m
}

fn hermite(a: FrequencyPoint, b: FrequencyPoint, ma: f64, mb: f64, x: f64) -> f64 {
    let h = b.frequency - a.frequency;
    let t = (x - a.frequency) / h;
    let (t2, t3) = (t * t, t * t * t);
    (2.0 * t3 - 3.0 * t2 + 1.0) * a.modulation
        + (t3 - 2.0 * t2 + t) * h * ma
        + (-2.0 * t3 + 3.0 * t2) * b.modulation
        + (t3 - t2) * h * mb
}
