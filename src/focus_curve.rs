//! # Focus curve and best-focus localization
//!
//! A [`FocusCurve`] collects one metric sample per scan position during a
//! sweep and, once finalized, locates the best-focus position:
//!
//! ```text
//! Collecting --finalize()--> Finalizing --analyze()--> Analyzed
//!                                                  \-> Inconclusive
//! ```
//!
//! Analysis smooths the samples, takes the discrete maximum and refines it
//! with a parabolic or Gaussian vertex through the maximum and its two
//! neighbours. Curve width at a fixed fraction of the peak height is the
//! depth-of-focus proxy. Secondary maxima of comparable height mark the curve
//! as multi-lobe.
//!
//! Confidence is the geometric mean of three terms in `[0, 1]`:
//!
//! - symmetry of the half-widths left and right of the peak,
//! - `1 - width / sweep span`,
//! - `snr / (snr + snr_reference)`, with noise taken from the residual of
//!   the smoothing,
//!
//! scaled by the share of samples not flagged unreliable and by the
//! multi-lobe penalty when secondary lobes are present.
//!
//! A flat curve, or one whose maximum sits on the first or last sample,
//! ends `Inconclusive` with a best-effort estimate at confidence 0.

use crate::error::{Advisory, MeasureError, Result};
use crate::settings::{PeakInterpolation, PeakSettings, SmoothingKind};
use crate::sharpness::MetricKind;
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusMetricSample {
    pub position: f64,
    pub value: f64,
    pub kind: MetricKind,
    /// False when the metric could not be computed; such samples are kept
    /// for reporting but ignored by the analysis.
    pub valid: bool,
    pub advisory: Option<Advisory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveState {
    Collecting,
    Finalizing,
    Analyzed,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveShape {
    Unimodal,
    /// Secondary maxima of comparable height, typical of tilt or astigmatism.
    MultiLobe,
    Flat,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakEstimate {
    pub position: f64,
    pub value: f64,
    pub confidence: f64,
    pub shape: CurveShape,
    /// Width at `width_fraction` of the peak height, in position units.
    pub width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FocusOutcome {
    Analyzed { peak: PeakEstimate },
    Inconclusive { reason: String, best_effort: Option<PeakEstimate> },
}

impl FocusOutcome {
    /// The located peak, or the best-effort estimate of an inconclusive curve.
    pub fn peak(&self) -> Option<&PeakEstimate> {
        match self {
            FocusOutcome::Analyzed { peak } => Some(peak),
            FocusOutcome::Inconclusive { best_effort, .. } => best_effort.as_ref(),
        }
    }
}

/// Metric samples of one sweep, ordered by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusCurve {
    samples: Vec<FocusMetricSample>,
    state: CurveState,
    outcome: Option<FocusOutcome>,
}

impl Default for FocusCurve {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusCurve {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            state: CurveState::Collecting,
            outcome: None,
        }
    }

    pub fn state(&self) -> CurveState {
        self.state
    }

    pub fn samples(&self) -> &[FocusMetricSample] {
        &self.samples
    }

    pub fn outcome(&self) -> Option<&FocusOutcome> {
        self.outcome.as_ref()
    }

    /// Appends a sample; positions must strictly increase.
    pub fn push(&mut self, sample: FocusMetricSample) -> Result<()> {
        if self.state != CurveState::Collecting {
            return Err(self.state_error("append samples"));
        }
        let last = self.samples.last().map_or(f64::NEG_INFINITY, |s| s.position);
        if !(sample.position.is_finite() && sample.position > last) {
            return Err(MeasureError::SampleOutOfOrder {
                position: sample.position,
                last,
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Closes the curve for appends.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state != CurveState::Collecting {
            return Err(self.state_error("finalize"));
        }
        self.state = CurveState::Finalizing;
        Ok(())
    }

    /// Locates the peak of a finalized curve. Repeated calls return the
    /// first outcome.
    pub fn analyze(&mut self, settings: &PeakSettings) -> Result<&FocusOutcome> {
        match self.state {
            CurveState::Collecting => return Err(self.state_error("analyze")),
            CurveState::Finalizing => {
                let outcome = locate_peak(&self.samples, settings);
                self.state = match outcome {
                    FocusOutcome::Analyzed { .. } => CurveState::Analyzed,
                    FocusOutcome::Inconclusive { .. } => CurveState::Inconclusive,
                };
                self.outcome = Some(outcome);
            }
            CurveState::Analyzed | CurveState::Inconclusive => {}
        }
        self.outcome
            .as_ref()
            .ok_or_else(|| self.state_error("report an outcome"))
    }

    fn state_error(&self, action: &str) -> MeasureError {
        MeasureError::SweepState {
            state: format!("{:?}", self.state).to_lowercase(),
            action: action.to_string(),
        }
    }
}

/// Quadratic Savitzky-Golay or moving-average smoothing with windows that
/// shrink symmetrically at the ends.
pub fn smooth(values: &[f64], kind: SmoothingKind, window: usize) -> Vec<f64> {
    let n = values.len();
    let half = window / 2;
    if kind == SmoothingKind::None || half == 0 {
        return values.to_vec();
    }
    (0..n)
        .map(|i| {
            let m = half.min(i).min(n - 1 - i);
            if m == 0 {
                return values[i];
            }
            match kind {
                SmoothingKind::MovingAverage => {
                    values[i - m..=i + m].iter().sum::<f64>() / (2 * m + 1) as f64
                }
                _ => {
                    let mf = m as f64;
                    let norm = (2.0 * mf - 1.0) * (2.0 * mf + 1.0) * (2.0 * mf + 3.0);
                    let base = 3.0 * (3.0 * mf * mf + 3.0 * mf - 1.0);
                    (-(m as i64)..=m as i64)
                        .map(|j| {
                            let c = (base - 15.0 * (j * j) as f64) / norm;
                            c * values[(i as i64 + j) as usize]
                        })
                        .sum()
                }
            }
        })
        .collect()
}

/// Vertex of the parabola through three points, clamped to their span.
fn parabola_vertex(x: [f64; 3], y: [f64; 3]) -> Option<(f64, f64)> {
    let (d0, d2) = (x[1] - x[0], x[1] - x[2]);
    let denom = d0 * (y[1] - y[2]) - d2 * (y[1] - y[0]);
    if denom == 0.0 {
        return None;
    }
    let xv = x[1] - 0.5 * (d0 * d0 * (y[1] - y[2]) - d2 * d2 * (y[1] - y[0])) / denom;
    let xv = xv.clamp(x[0], x[2]);

    // Lagrange form of the same parabola
    let l = |k: usize, i: usize, j: usize| (xv - x[i]) * (xv - x[j]) / ((x[k] - x[i]) * (x[k] - x[j]));
    let yv = y[0] * l(0, 1, 2) + y[1] * l(1, 0, 2) + y[2] * l(2, 0, 1);
    Some((xv, yv))
}

fn gaussian_vertex(x: [f64; 3], y: [f64; 3]) -> Option<(f64, f64)> {
    if y.iter().any(|&v| v <= 0.0) {
        return None;
    }
    let (xv, ly) = parabola_vertex(x, y.map(f64::ln))?;
    Some((xv, ly.exp()))
}

/// Position where the curve falls through `level` walking outward from `peak`.
fn crossing(positions: &[f64], values: &[f64], peak: usize, level: f64, step: isize) -> Option<f64> {
    let mut i = peak as isize;
    loop {
        let next = i + step;
        if next < 0 || next as usize >= values.len() {
            return None;
        }
        let (a, b) = (i as usize, next as usize);
        if values[b] < level {
            let t = (values[a] - level) / (values[a] - values[b]);
            return Some(positions[a] + t * (positions[b] - positions[a]));
        }
        i = next;
    }
}

fn count_lobes(values: &[f64], peak: usize, base: f64, settings: &PeakSettings) -> usize {
    let height = values[peak] - base;
    if height <= 0.0 {
        return 0;
    }
    let n = values.len();
    let mut lobes = 0;
    for j in 0..n {
        // an end sample only has to beat its one neighbour
        let candidate = match j {
            0 => values[0] > values[1],
            j if j == n - 1 => values[j] > values[j - 1],
            j => values[j] > values[j - 1] && values[j] >= values[j + 1],
        };
        if j == peak || !candidate {
            continue;
        }
        if values[j] - base < settings.lobe_tolerance * height {
            continue;
        }
        let (lo, hi) = if j < peak { (j, peak) } else { (peak, j) };
        let dip = values[lo..=hi].iter().copied().fold(f64::INFINITY, f64::min);
        if values[j] - dip >= settings.lobe_prominence * height {
            debug!("secondary lobe at index {j}, {:.3} of peak height", (values[j] - base) / height);
            lobes += 1;
        }
    }
    lobes
}

fn inconclusive(reason: impl Into<String>, best_effort: Option<PeakEstimate>) -> FocusOutcome {
    let reason = reason.into();
    info!("focus curve inconclusive: {reason}");
    FocusOutcome::Inconclusive { reason, best_effort }
}

/// Peak localization over the valid samples of a curve.
pub fn locate_peak(samples: &[FocusMetricSample], settings: &PeakSettings) -> FocusOutcome {
    let valid: Vec<&FocusMetricSample> = samples.iter().filter(|s| s.valid).collect();
    let positions: Vec<f64> = valid.iter().map(|s| s.position).collect();
    let raw: Vec<f64> = valid.iter().map(|s| s.value).collect();
    let n = raw.len();

    let best_effort = |idx: usize, values: &[f64], shape: CurveShape| PeakEstimate {
        position: positions[idx],
        value: values[idx],
        confidence: 0.0,
        shape,
        width: None,
    };

    if n < 3 {
        let best = (0..n).max_by(|&a, &b| raw[a].total_cmp(&raw[b]));
        return inconclusive(
            format!("{n} valid samples, need at least 3"),
            best.map(|i| best_effort(i, &raw, CurveShape::Inconclusive)),
        );
    }

    let smoothed = smooth(&raw, settings.smoothing, settings.smoothing_window);
    // first maximum wins ties
    let peak = (0..n).fold(0, |best, i| if smoothed[i] > smoothed[best] { i } else { best });
    let base = smoothed.iter().copied().fold(f64::INFINITY, f64::min);
    let top = smoothed[peak];

    let span = top - base;
    if span <= settings.flat_tolerance * top.abs().max(f64::MIN_POSITIVE) {
        return inconclusive(
            format!("relative span {:.4} below flatness tolerance", span / top.abs().max(f64::MIN_POSITIVE)),
            Some(best_effort(peak, &smoothed, CurveShape::Flat)),
        );
    }
    if peak == 0 || peak == n - 1 {
        return inconclusive(
            "maximum at the sweep boundary",
            Some(best_effort(peak, &smoothed, CurveShape::Inconclusive)),
        );
    }

    let level = base + settings.width_fraction * span;
    let left = crossing(&positions, &smoothed, peak, level, -1);
    let right = crossing(&positions, &smoothed, peak, level, 1);
    let width_lo = left.unwrap_or(positions[0]);
    let width_hi = right.unwrap_or(positions[n - 1]);
    let width = width_hi - width_lo;

    let xs = [positions[peak - 1], positions[peak], positions[peak + 1]];
    let ys = [smoothed[peak - 1], smoothed[peak], smoothed[peak + 1]];
    let step = 0.5 * (xs[2] - xs[0]);
    let use_gaussian = match settings.interpolation {
        PeakInterpolation::Parabolic => false,
        PeakInterpolation::Gaussian => true,
        PeakInterpolation::Auto => width < settings.gaussian_max_width_steps * step,
    };
    let vertex = if use_gaussian {
        gaussian_vertex(xs, ys).or_else(|| parabola_vertex(xs, ys))
    } else {
        parabola_vertex(xs, ys)
    };
    let (position, value) = vertex.unwrap_or((xs[1], ys[1]));

    let half_lo = position - width_lo;
    let half_hi = width_hi - position;
    let symmetry = if half_lo > 0.0 && half_hi > 0.0 {
        half_lo.min(half_hi) / half_lo.max(half_hi)
    } else {
        0.0
    };
    let sweep_span = positions[n - 1] - positions[0];
    let width_term = (1.0 - width / sweep_span).clamp(0.0, 1.0);

    let noise = (raw
        .iter()
        .zip(&smoothed)
        .map(|(r, s)| (r - s) * (r - s))
        .sum::<f64>()
        / n as f64)
        .sqrt();
    let snr_term = if noise > 0.0 {
        let snr = span / noise;
        snr / (snr + settings.snr_reference)
    } else {
        1.0
    };

    let lobes = count_lobes(&smoothed, peak, base, settings);
    let shape = if lobes > 0 {
        CurveShape::MultiLobe
    } else {
        CurveShape::Unimodal
    };

    let reliable = valid.iter().filter(|s| s.advisory.is_none()).count() as f64 / n as f64;
    let mut confidence = (symmetry * width_term * snr_term).cbrt() * reliable;
    if lobes > 0 {
        confidence *= settings.multi_lobe_penalty;
    }
    let confidence = confidence.clamp(0.0, 1.0);

    info!(
        "best focus at {position:.4} (value {value:.4}, {shape:?}, confidence {confidence:.3}, width {width:.4})"
    );
    FocusOutcome::Analyzed {
        peak: PeakEstimate {
            position,
            value,
            confidence,
            shape,
            width: Some(width),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample(position: f64, value: f64) -> FocusMetricSample {
        FocusMetricSample {
            position,
            value,
            kind: MetricKind::Tenengrad,
            valid: true,
            advisory: None,
        }
    }

    fn analyze(points: impl IntoIterator<Item = (f64, f64)>, settings: &PeakSettings) -> FocusOutcome {
        let mut curve = FocusCurve::new();
        for (x, y) in points {
            curve.push(sample(x, y)).unwrap();
        }
        curve.finalize().unwrap();
        curve.analyze(settings).unwrap().clone()
    }

    fn gaussian(x: f64, mu: f64, sigma: f64) -> f64 {
        (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    #[test]
    fn test_noisy_parabola_peak() {
        let mut rng = StdRng::seed_from_u64(7);
        let points: Vec<(f64, f64)> = (-10..=10)
            .map(|i| {
                let x = i as f64;
                (x, 1000.0 - 5.0 * (x - 0.3).powi(2) + rng.gen_range(-2.0..=2.0))
            })
            .collect();
        let outcome = analyze(points, &PeakSettings::default());
        let FocusOutcome::Analyzed { peak } = outcome else {
            panic!("expected a peak, got {outcome:?}");
        };
        assert_abs_diff_eq!(peak.position, 0.3, epsilon = 0.25);
        assert_eq!(peak.shape, CurveShape::Unimodal);
        assert!(peak.confidence > 0.0 && peak.confidence <= 1.0);
        assert!(peak.width.unwrap() > 10.0);
    }

    #[test]
    fn test_bimodal_curve_is_multi_lobe_with_lower_confidence() {
        let noise: Vec<f64> = {
            let mut rng = StdRng::seed_from_u64(11);
            (0..21).map(|_| rng.gen_range(-0.005..=0.005)).collect()
        };
        let xs: Vec<f64> = (-10..=10).map(|i| i as f64).collect();

        let single = analyze(
            xs.iter()
                .zip(&noise)
                .map(|(&x, &e)| (x, 0.1 + gaussian(x, 4.0, 1.5) + e)),
            &PeakSettings::default(),
        );
        let double = analyze(
            xs.iter()
                .zip(&noise)
                .map(|(&x, &e)| (x, 0.1 + gaussian(x, 4.0, 1.5) + 0.9 * gaussian(x, -4.0, 1.5) + e)),
            &PeakSettings::default(),
        );

        let single = single.peak().unwrap().clone();
        let double = double.peak().unwrap().clone();
        assert_eq!(single.shape, CurveShape::Unimodal);
        assert_eq!(double.shape, CurveShape::MultiLobe);
        assert!(double.confidence < single.confidence);
        assert_abs_diff_eq!(double.position, 4.0, epsilon = 0.5);
    }

    #[test]
    fn test_lobe_cut_off_by_sweep_end_is_counted() {
        let xs: Vec<f64> = (-10..=10).map(|i| i as f64).collect();
        let single = analyze(
            xs.iter().map(|&x| (x, 0.1 + gaussian(x, -2.0, 2.5))),
            &PeakSettings::default(),
        );
        // the second lobe peaks at x = 11, past the last sample
        let truncated = analyze(
            xs.iter()
                .map(|&x| (x, 0.1 + gaussian(x, -2.0, 2.5) + 0.9 * gaussian(x, 11.0, 2.5))),
            &PeakSettings::default(),
        );

        let single = single.peak().unwrap().clone();
        let truncated = truncated.peak().unwrap().clone();
        assert_eq!(single.shape, CurveShape::Unimodal);
        assert_eq!(truncated.shape, CurveShape::MultiLobe);
        assert!(truncated.confidence < single.confidence);
        assert_abs_diff_eq!(truncated.position, -2.0, epsilon = 0.5);
    }

    #[test]
    fn test_gaussian_vertex_is_exact_for_gaussian_peaks() {
        let settings = PeakSettings {
            smoothing: SmoothingKind::None,
            interpolation: PeakInterpolation::Gaussian,
            ..Default::default()
        };
        let points = (-6..=6).map(|i| (i as f64, 100.0 * gaussian(i as f64, 0.3, 0.8)));
        let peak = analyze(points, &settings).peak().unwrap().clone();
        assert_abs_diff_eq!(peak.position, 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(peak.value, 100.0, epsilon = 1e-6);

        let parabolic = PeakSettings {
            interpolation: PeakInterpolation::Parabolic,
            ..settings
        };
        let points = (-6..=6).map(|i| (i as f64, 100.0 * gaussian(i as f64, 0.3, 0.8)));
        let rough = analyze(points, &parabolic).peak().unwrap().clone();
        assert!((rough.position - 0.3).abs() > 1e-3);
    }

    #[test]
    fn test_flat_and_monotonic_curves_are_inconclusive() {
        let flat = analyze((0..10).map(|i| (i as f64, 5.0 + 0.01 * (i % 2) as f64)), &PeakSettings::default());
        match &flat {
            FocusOutcome::Inconclusive { best_effort: Some(p), .. } => {
                assert_eq!(p.shape, CurveShape::Flat);
                assert_eq!(p.confidence, 0.0);
            }
            other => panic!("expected flat, got {other:?}"),
        }

        let rising = analyze((0..10).map(|i| (i as f64, 1.0 + i as f64)), &PeakSettings::default());
        assert!(matches!(rising, FocusOutcome::Inconclusive { .. }));
        assert_eq!(rising.peak().unwrap().position, 9.0);
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut curve = FocusCurve::new();
        curve.push(sample(0.0, 1.0)).unwrap();
        assert!(matches!(
            curve.push(sample(0.0, 2.0)),
            Err(MeasureError::SampleOutOfOrder { .. })
        ));
        assert!(matches!(
            curve.analyze(&PeakSettings::default()),
            Err(MeasureError::SweepState { .. })
        ));

        curve.push(sample(1.0, 3.0)).unwrap();
        curve.push(sample(2.0, 1.5)).unwrap();
        curve.finalize().unwrap();
        assert_eq!(curve.state(), CurveState::Finalizing);
        assert!(matches!(
            curve.push(sample(3.0, 1.0)),
            Err(MeasureError::SweepState { .. })
        ));

        let first = curve.analyze(&PeakSettings::default()).unwrap().clone();
        assert_eq!(curve.state(), CurveState::Analyzed);
        assert_eq!(curve.analyze(&PeakSettings::default()).unwrap(), &first);
        assert!(curve.finalize().is_err());
    }

    #[test]
    fn test_invalid_samples_are_ignored_and_advisories_lower_confidence() {
        let mut rng = StdRng::seed_from_u64(3);
        let points: Vec<(f64, f64)> = (-8..=8)
            .map(|i| (i as f64, 50.0 - (i as f64).powi(2) * 0.5 + rng.gen_range(-0.2..=0.2)))
            .collect();

        let clean = analyze(points.clone(), &PeakSettings::default());

        let mut curve = FocusCurve::new();
        for (k, &(x, y)) in points.iter().enumerate() {
            let mut s = sample(x, y);
            if k == 3 {
                s.advisory = Some(Advisory::UnreliableMetric {
                    saturated: true,
                    black_clipped: false,
                });
            }
            curve.push(s).unwrap();
            if k == 5 {
                curve
                    .push(FocusMetricSample {
                        valid: false,
                        value: 0.0,
                        ..sample(x + 0.5, 0.0)
                    })
                    .unwrap();
            }
        }
        curve.finalize().unwrap();
        let flagged = curve.analyze(&PeakSettings::default()).unwrap().clone();

        let (a, b) = (clean.peak().unwrap(), flagged.peak().unwrap());
        assert_eq!(a.position, b.position);
        assert!(b.confidence < a.confidence);
    }

    #[test]
    fn test_savitzky_golay_preserves_quadratics() {
        let values: Vec<f64> = (0..9).map(|i| 3.0 - (i as f64 - 4.2).powi(2)).collect();
        let smoothed = smooth(&values, SmoothingKind::SavitzkyGolay, 5);
        for (a, b) in values.iter().zip(&smoothed) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        let averaged = smooth(&values, SmoothingKind::MovingAverage, 5);
        assert!(averaged[4] < values[4]);
    }
}
