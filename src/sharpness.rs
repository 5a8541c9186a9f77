//! # Single-number focus metrics
//!
//! Each metric maps a region of a frame to one scalar that grows as the image
//! gets sharper:
//!
//! - **Tenengrad**: mean squared Sobel gradient magnitude, optionally keeping
//!   only gradients above a threshold.
//! - **Laplacian variance**: variance of the 4-neighbour Laplacian.
//! - **Spectral band**: share of (mean-removed) power inside a frequency band.
//! - **High-frequency ratio**: power above a cutoff divided by power below it.
//!
//! The set is closed; [`FocusMetric`] carries each variant's parameters and
//! [`FocusMetric::evaluate`] is the single entry point.
//!
//! Metrics scale with exposure and are not corrected for it. When the source
//! frame reports clipping the value is still returned, tagged with
//! [`Advisory::UnreliableMetric`].

use crate::error::{Advisory, MeasureError, Result};
use crate::frame::{Annulus, Frame, Roi, RoiView};
use crate::geometry::StarGeometry;
use crate::sampler::refine_center;
use crate::settings::CenterRefinementSettings;
use crate::spectral::{power_spectrum_2d, radial_frequency};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FocusMetric {
    Tenengrad {
        /// Squared Sobel magnitudes at or below this contribute zero.
        #[serde(default)]
        threshold: Option<f64>,
    },
    LaplacianVariance,
    /// Frequencies in cycles per pixel, `low <= f < high`.
    SpectralBand { low: f64, high: f64 },
    HighFrequencyRatio { cutoff: f64 },
}

/// Parameter-free tag of a [`FocusMetric`], recorded with every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Tenengrad,
    LaplacianVariance,
    SpectralBand,
    HighFrequencyRatio,
}

/// Where in the frame a metric is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "region", rename_all = "snake_case")]
pub enum MetricRegion {
    Full,
    Rect { roi: Roi },
    /// Band around a star center, as fractions of its outer radius. Gradient
    /// metrics honour the band; spectral metrics use its bounding box.
    TargetAnnulus { inner_frac: f64, outer_frac: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub kind: MetricKind,
    pub value: f64,
    pub advisory: Option<Advisory>,
}

impl FocusMetric {
    pub fn kind(&self) -> MetricKind {
        match self {
            FocusMetric::Tenengrad { .. } => MetricKind::Tenengrad,
            FocusMetric::LaplacianVariance => MetricKind::LaplacianVariance,
            FocusMetric::SpectralBand { .. } => MetricKind::SpectralBand,
            FocusMetric::HighFrequencyRatio { .. } => MetricKind::HighFrequencyRatio,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            FocusMetric::Tenengrad { threshold: Some(t) } if !(t >= 0.0) => Err(
                MeasureError::setting("metric.threshold", "must be non-negative"),
            ),
            FocusMetric::SpectralBand { low, high } if !(low >= 0.0 && low < high) => Err(
                MeasureError::setting("metric.low", "need 0 <= low < high"),
            ),
            FocusMetric::HighFrequencyRatio { cutoff } if !(cutoff > 0.0 && cutoff < 0.5) => Err(
                MeasureError::setting("metric.cutoff", "must lie in (0, 0.5)"),
            ),
            _ => Ok(()),
        }
    }

    /// Evaluates the metric over `view`. Pure: identical inputs give identical bits.
    pub fn evaluate(&self, view: &RoiView<'_>) -> MetricValue {
        let value = match *self {
            FocusMetric::Tenengrad { threshold } => tenengrad(view, threshold),
            FocusMetric::LaplacianVariance => laplacian_variance(view),
            FocusMetric::SpectralBand { low, high } => spectral_band_ratio(view, low, high),
            FocusMetric::HighFrequencyRatio { cutoff } => high_frequency_ratio(view, cutoff),
        };

        let clip = view.clip_flags();
        let advisory = clip.any().then(|| {
            debug!("{:?} computed on a clipped frame: {clip:?}", self.kind());
            Advisory::UnreliableMetric {
                saturated: clip.saturated,
                black_clipped: clip.black_clipped,
            }
        });

        MetricValue {
            kind: self.kind(),
            value,
            advisory,
        }
    }
}

impl MetricRegion {
    /// Resolves the region against a frame; `star` is needed for annuli.
    ///
    /// An annulus is centered where [`refine_center`] puts the star in this
    /// frame, the same center the star MTF is measured around.
    pub fn view<'a>(
        &self,
        frame: &'a Frame,
        star: Option<&StarGeometry>,
        centering: &CenterRefinementSettings,
    ) -> Result<RoiView<'a>> {
        match self {
            MetricRegion::Full => Ok(frame.full_view()),
            MetricRegion::Rect { roi } => frame.roi(*roi),
            MetricRegion::TargetAnnulus {
                inner_frac,
                outer_frac,
            } => {
                let star = star.ok_or_else(|| {
                    MeasureError::degenerate("annulus region requested without star geometry")
                })?;
                if !(*inner_frac >= 0.0 && inner_frac < outer_frac) {
                    return Err(MeasureError::degenerate(format!(
                        "annulus fractions [{inner_frac}, {outer_frac}] are empty"
                    )));
                }
                let (cx, cy) = refine_center(frame, star, centering)?.center;
                frame.annulus_view(Annulus {
                    cx,
                    cy,
                    inner: inner_frac * star.outer_radius,
                    outer: outer_frac * star.outer_radius,
                })
            }
        }
    }
}

/// Sobel derivatives at an interior pixel of `view` (1 <= x < width - 1).
#[inline]
pub(crate) fn sobel_at(view: &RoiView<'_>, x: u32, y: u32) -> (f64, f64) {
    let p = |dx: i32, dy: i32| view.get((x as i32 + dx) as u32, (y as i32 + dy) as u32);
    let gx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
    let gy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
    (gx, gy)
}

fn tenengrad(view: &RoiView<'_>, threshold: Option<f64>) -> f64 {
    let (width, height) = (view.width(), view.height());
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut count = 0usize;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            if !view.contains(x, y) {
                continue;
            }
            let (gx, gy) = sobel_at(view, x, y);
            let g2 = gx * gx + gy * gy;
            count += 1;
            match threshold {
                Some(t) if g2 <= t => {}
                _ => sum += g2,
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    sum / count as f64
}

/// Computes the variance of the Laplacian over the region.
/// The Laplacian operator highlights regions of rapid intensity change,
/// which correspond to edges. A sharp image has more high-frequency content
/// and thus a higher Laplacian variance.
fn laplacian_variance(view: &RoiView<'_>) -> f64 {
    let (width, height) = (view.width(), view.height());

    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut laplacian_values = Vec::with_capacity((width * height) as usize);

    // Apply Laplacian kernel (using 3x3 kernel)
    // [ 0  1  0 ]
    // [ 1 -4  1 ]
    // [ 0  1  0 ]
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            if !view.contains(x, y) {
                continue;
            }
            let center = view.get(x, y);
            let top = view.get(x, y - 1);
            let bottom = view.get(x, y + 1);
            let left = view.get(x - 1, y);
            let right = view.get(x + 1, y);

            laplacian_values.push(top + bottom + left + right - 4.0 * center);
        }
    }

    if laplacian_values.is_empty() {
        return 0.0;
    }

    let mean: f64 = laplacian_values.iter().sum::<f64>() / laplacian_values.len() as f64;
    laplacian_values
        .iter()
        .map(|&x| (x - mean).powi(2))
        .sum::<f64>()
        / laplacian_values.len() as f64
}

/// Power split into (inside predicate, outside predicate), DC excluded.
fn split_power(view: &RoiView<'_>, inside: impl Fn(f64) -> bool) -> (f64, f64) {
    let (w, h) = (view.width() as usize, view.height() as usize);
    let power = power_spectrum_2d(&view.to_vec(), w, h);
    let (mut hit, mut miss) = (0.0, 0.0);
    for ky in 0..h {
        for kx in 0..w {
            if kx == 0 && ky == 0 {
                continue;
            }
            let p = power[ky * w + kx];
            if inside(radial_frequency(kx, ky, w, h)) {
                hit += p;
            } else {
                miss += p;
            }
        }
    }
    (hit, miss)
}

fn spectral_band_ratio(view: &RoiView<'_>, low: f64, high: f64) -> f64 {
    if view.width() < 4 || view.height() < 4 {
        return 0.0;
    }
    let (band, rest) = split_power(view, |f| f >= low && f < high);
    let total = band + rest;
    if total <= 0.0 {
        return 0.0;
    }
    band / total
}

fn high_frequency_ratio(view: &RoiView<'_>, cutoff: f64) -> f64 {
    if view.width() < 4 || view.height() < 4 {
        return 0.0;
    }
    let (high, low) = split_power(view, |f| f >= cutoff);
    if low <= 0.0 {
        return 0.0;
    }
    high / low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ClipFlags;
    use crate::synthetic;

    fn all_metrics() -> Vec<FocusMetric> {
        vec![
            FocusMetric::Tenengrad { threshold: None },
            FocusMetric::LaplacianVariance,
            FocusMetric::SpectralBand {
                low: 0.15,
                high: 0.5,
            },
            FocusMetric::HighFrequencyRatio { cutoff: 0.15 },
        ]
    }

    #[test]
    fn test_sharpness_calculation() {
        let frame = Frame::new(10, 10, vec![0.3; 100], 1.0, 8).unwrap();
        for metric in all_metrics() {
            let v = metric.evaluate(&frame.full_view());
            assert_eq!(v.value, 0.0, "{:?}", metric);
            assert!(v.advisory.is_none());
        }
    }

    #[test]
    fn test_sharper_edge_scores_higher() {
        let sharp = synthetic::slanted_edge(64, 64, 5.0, 0.2, 0.8, 0.7, 1);
        let soft = synthetic::slanted_edge(64, 64, 5.0, 0.2, 0.8, 2.5, 1);
        for metric in all_metrics() {
            let a = metric.evaluate(&sharp.full_view()).value;
            let b = metric.evaluate(&soft.full_view()).value;
            assert!(a > b, "{:?}: sharp {a} <= soft {b}", metric);
        }
    }

    #[test]
    fn test_tenengrad_threshold_drops_weak_gradients() {
        let frame = synthetic::slanted_edge(32, 32, 5.0, 0.2, 0.8, 1.0, 1);
        let view = frame.full_view();
        let plain = FocusMetric::Tenengrad { threshold: None }.evaluate(&view).value;
        let gated = FocusMetric::Tenengrad {
            threshold: Some(0.05),
        }
        .evaluate(&view)
        .value;
        assert!(gated < plain);
        assert!(gated > 0.0);
    }

    #[test]
    fn test_clipped_frame_flags_unreliable_metric() {
        let frame = synthetic::slanted_edge(32, 32, 5.0, 0.2, 0.8, 1.0, 1).with_clip_flags(ClipFlags {
            saturated: true,
            black_clipped: false,
        });
        let v = FocusMetric::LaplacianVariance.evaluate(&frame.full_view());
        assert!(v.value > 0.0);
        assert_eq!(
            v.advisory,
            Some(Advisory::UnreliableMetric {
                saturated: true,
                black_clipped: false
            })
        );
    }

    #[test]
    fn test_annulus_region_requires_star() {
        let frame = synthetic::sinusoidal_star(101, 101, (50.0, 50.0), 12, 0.5, 0.4, 1.0);
        let region = MetricRegion::TargetAnnulus {
            inner_frac: 0.6,
            outer_frac: 0.95,
        };
        let centering = CenterRefinementSettings::default();
        assert!(region.view(&frame, None, &centering).is_err());

        let star = StarGeometry {
            center: (50.0, 50.0),
            inner_radius: 5.0,
            outer_radius: 45.0,
            sector_pairs: 12,
            nominal_contrast: 0.8,
            waveform: crate::geometry::StarWaveform::Sinusoidal,
        };
        let view = region.view(&frame, Some(&star), &centering).unwrap();
        let masked = FocusMetric::Tenengrad { threshold: None }.evaluate(&view).value;
        let full = FocusMetric::Tenengrad { threshold: None }
            .evaluate(&frame.full_view())
            .value;
        assert!(masked > 0.0);
        // gradient energy falls off as 1/r^2, the outer band sees less of it
        assert!(masked < full);
    }

    #[test]
    fn test_annulus_follows_refined_star_center() {
        let frame = synthetic::sinusoidal_star(121, 121, (60.0, 60.0), 12, 0.5, 0.4, 1.0);
        let star = StarGeometry {
            center: (61.5, 59.0),
            inner_radius: 5.0,
            outer_radius: 50.0,
            sector_pairs: 12,
            nominal_contrast: 0.8,
            waveform: crate::geometry::StarWaveform::Sinusoidal,
        };
        let region = MetricRegion::TargetAnnulus {
            inner_frac: 0.3,
            outer_frac: 0.9,
        };
        let centering = CenterRefinementSettings::default();
        let refined = refine_center(&frame, &star, &centering).unwrap().center;
        assert!((refined.0 - 60.0).abs() < 0.5 && (refined.1 - 60.0).abs() < 0.5);

        let view = region.view(&frame, Some(&star), &centering).unwrap();
        let expected = frame
            .annulus_view(Annulus {
                cx: refined.0,
                cy: refined.1,
                inner: 15.0,
                outer: 45.0,
            })
            .unwrap();
        assert_eq!(view.roi(), expected.roi());
        for y in 0..view.height() {
            for x in 0..view.width() {
                assert_eq!(view.contains(x, y), expected.contains(x, y));
            }
        }

        let nominal = CenterRefinementSettings {
            enabled: false,
            ..Default::default()
        };
        let unrefined = region.view(&frame, Some(&star), &nominal).unwrap();
        assert_ne!(unrefined.roi(), view.roi());
    }

    #[test]
    fn test_metric_validation() {
        assert!(FocusMetric::SpectralBand { low: 0.3, high: 0.2 }.validate().is_err());
        assert!(FocusMetric::HighFrequencyRatio { cutoff: 0.7 }.validate().is_err());
        assert!(FocusMetric::Tenengrad { threshold: Some(-1.0) }.validate().is_err());
        assert!(FocusMetric::LaplacianVariance.validate().is_ok());
    }
}
