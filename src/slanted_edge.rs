//! Slanted-edge spatial frequency response.
//!
//! 1. Locate the edge on every row (or column) as the windowed centroid of
//!    the derivative and fit a straight line through those points.
//! 2. Project every ROI pixel onto the edge normal and average into bins of
//!    `1 / oversampling` pixels. The slant spreads the pixel phases across the
//!    bins, which is what gives the super-resolved edge spread function.
//! 3. Smooth the ESF, differentiate it to the LSF, window the LSF and take
//!    its magnitude spectrum.
//! 4. Normalize to the zero-frequency term and divide out the known responses
//!    of the derivative, the smoothing and (optionally) the pixel aperture.

use crate::error::{MeasureError, Result};
use crate::frame::{Frame, RoiView};
use crate::geometry::EdgeGeometry;
use crate::mtf::{FrequencyPoint, MtfCurve, MtfProducer};
use crate::sampler::{project_edge_pixels, EdgeLine};
use crate::settings::{EdgeSettings, MeasureSettings};
use crate::spectral::{dft_magnitudes, window};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Oversampled edge and line spread functions on a shared distance axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeProfile {
    pub oversampling: usize,
    /// Bin centers in pixels from the fitted edge; strictly increasing.
    pub distances: Vec<f64>,
    pub esf: Vec<f64>,
    /// Derivative of the smoothed ESF, before windowing, dark-to-bright positive.
    pub lsf: Vec<f64>,
    /// Bins that received no pixel and were filled by interpolation.
    pub empty_bins: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMeasurement {
    pub line: EdgeLine,
    /// Edge angle from its scan axis, in degrees.
    pub angle_deg: f64,
    /// Rows (or columns) that contributed to the line fit.
    pub fitted_lines: usize,
    pub profile: EdgeProfile,
    pub curve: MtfCurve,
}

pub fn measure_edge(frame: &Frame, edge: &EdgeGeometry, settings: &MeasureSettings) -> Result<EdgeMeasurement> {
    settings.validate()?;
    edge.validate(frame)?;
    let cfg = &settings.edge;
    let view = frame.roi(edge.roi)?;

    let transposed = match edge.angle_estimate_deg {
        Some(angle) => angle.abs() > 45.0,
        None => mostly_horizontal(&view),
    };
    let (line, fitted_lines) = fit_edge_line(&view, transposed, cfg)?;

    let angle_deg = line.angle_deg().abs();
    if angle_deg < cfg.min_angle_deg || angle_deg > cfg.max_angle_deg {
        debug!("rejecting edge at {angle_deg:.2} deg (transposed={transposed})");
        return Err(MeasureError::EdgeAngleOutOfRange {
            angle_deg,
            min_deg: cfg.min_angle_deg,
            max_deg: cfg.max_angle_deg,
        });
    }

    let profile = edge_profile(&view, &line, cfg)?;
    let points = sfr(&profile, angle_deg.to_radians(), cfg)?;
    let curve = MtfCurve::from_points(points, frame.pixel_pitch(), &settings.mtf);
    info!(
        "edge: {angle_deg:.2} deg over {fitted_lines} lines, {} ESF bins ({} empty)",
        profile.esf.len(),
        profile.empty_bins
    );

    Ok(EdgeMeasurement {
        line,
        angle_deg,
        fitted_lines,
        profile,
        curve,
    })
}

impl MtfProducer for EdgeGeometry {
    fn measure_mtf(&self, frame: &Frame, settings: &MeasureSettings) -> Result<MtfCurve> {
        measure_edge(frame, self, settings).map(|m| m.curve)
    }
}

/// True when vertical gradients dominate, i.e. the edge runs along x.
fn mostly_horizontal(view: &RoiView<'_>) -> bool {
    let (mut gx, mut gy) = (0.0, 0.0);
    for y in 0..view.height() - 1 {
        for x in 0..view.width() - 1 {
            let v = view.get(x, y);
            gx += (view.get(x + 1, y) - v).abs();
            gy += (view.get(x, y + 1) - v).abs();
        }
    }
    gy > gx
}

/// Two-pass line fit. Each line's edge location is the centroid of the
/// derivative inside a tapered window: first around that line's strongest
/// transition, then around the first fitted line. Both passes drop points
/// further than `fit_outlier_px` from their initial fit and refit.
fn fit_edge_line(view: &RoiView<'_>, transposed: bool, cfg: &EdgeSettings) -> Result<(EdgeLine, usize)> {
    let (len_u, len_v) = if transposed {
        (view.height(), view.width())
    } else {
        (view.width(), view.height())
    };
    let at = |u: u32, v: u32| {
        if transposed {
            view.get(v, u)
        } else {
            view.get(u, v)
        }
    };

    let derivatives: Vec<Vec<f64>> = (0..len_v)
        .map(|v| (0..len_u - 1).map(|u| at(u + 1, v) - at(u, v)).collect())
        .collect();
    // dark-to-bright transitions count positive
    let polarity = if derivatives.iter().flatten().sum::<f64>() < 0.0 {
        -1.0
    } else {
        1.0
    };
    let half = cfg.fit_window_px;

    let coarse: Vec<(f64, f64)> = derivatives
        .iter()
        .enumerate()
        .filter_map(|(v, d)| {
            let peak = d
                .iter()
                .enumerate()
                .max_by(|a, b| (a.1 * polarity).total_cmp(&(b.1 * polarity)))
                .map(|(u, _)| u as f64 + 0.5)?;
            windowed_centroid(d, polarity, peak, half).map(|u| (v as f64, u))
        })
        .collect();
    let ((offset, slope), _) = robust_fit(&coarse, cfg.fit_outlier_px)?;

    let refined: Vec<(f64, f64)> = derivatives
        .iter()
        .enumerate()
        .filter_map(|(v, d)| {
            let center = offset + slope * v as f64;
            windowed_centroid(d, polarity, center, half).map(|u| (v as f64, u))
        })
        .collect();
    let ((offset, slope), used) = robust_fit(&refined, cfg.fit_outlier_px)?;

    Ok((
        EdgeLine {
            offset,
            slope,
            transposed,
        },
        used,
    ))
}

/// Centroid of `polarity * d` under a Hamming taper of half width `half`
/// centered on `center`. Sample `u` of the derivative sits at `u + 0.5`.
fn windowed_centroid(d: &[f64], polarity: f64, center: f64, half: f64) -> Option<f64> {
    let (mut sw, mut su) = (0.0, 0.0);
    for (u, &x) in d.iter().enumerate() {
        let pos = u as f64 + 0.5;
        let offset = pos - center;
        if offset.abs() >= half {
            continue;
        }
        let w = polarity * x * (0.54 + 0.46 * (PI * offset / half).cos());
        sw += w;
        su += w * pos;
    }
    (sw > 0.0).then(|| su / sw)
}

/// Least-squares fit, refit once without the points further than
/// `outlier_px` from the first line.
fn robust_fit(points: &[(f64, f64)], outlier_px: f64) -> Result<((f64, f64), usize)> {
    let first = least_squares(points)?;
    let kept: Vec<(f64, f64)> = points
        .iter()
        .copied()
        .filter(|&(v, u)| (u - first.0 - first.1 * v).abs() <= outlier_px)
        .collect();
    if kept.len() < points.len() && kept.len() >= 3 {
        debug!("edge fit: dropped {} outlier lines", points.len() - kept.len());
        Ok((least_squares(&kept)?, kept.len()))
    } else {
        Ok((first, points.len()))
    }
}

/// Fits `u = offset + slope * v` to `(v, u)` pairs.
fn least_squares(points: &[(f64, f64)]) -> Result<(f64, f64)> {
    if points.len() < 3 {
        return Err(MeasureError::degenerate(format!(
            "only {} ROI lines cross an edge",
            points.len()
        )));
    }
    let n = points.len() as f64;
    let mean_v = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_u = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut svv, mut svu) = (0.0, 0.0);
    for &(v, u) in points {
        svv += (v - mean_v) * (v - mean_v);
        svu += (v - mean_v) * (u - mean_u);
    }
    if svv <= 0.0 {
        return Err(MeasureError::degenerate("edge points do not span the ROI"));
    }
    let slope = svu / svv;
    Ok((mean_u - slope * mean_v, slope))
}

fn edge_profile(view: &RoiView<'_>, line: &EdgeLine, cfg: &EdgeSettings) -> Result<EdgeProfile> {
    let os = cfg.oversampling;
    let (len_u, len_v) = if line.transposed {
        (view.height() as f64, view.width() as f64)
    } else {
        (view.width() as f64, view.height() as f64)
    };

    // Usable half width: every line must see the full ESF support.
    let norm = (1.0 + line.slope * line.slope).sqrt();
    let margin = [0.0, len_v - 1.0]
        .iter()
        .map(|&v| {
            let u = line.offset + line.slope * v;
            u.min(len_u - 1.0 - u)
        })
        .fold(f64::INFINITY, f64::min)
        / norm;
    let half_width = cfg.esf_half_width_px.min(margin);
    if half_width < 4.0 {
        return Err(MeasureError::degenerate(format!(
            "edge lies {margin:.1} px from the ROI border, need at least 4"
        )));
    }

    let half_bins = (half_width * os as f64).floor() as usize;
    let n = 2 * half_bins;
    let mut sums = vec![0.0; n];
    let mut counts = vec![0usize; n];
    for s in project_edge_pixels(view, line) {
        let bin = (s.distance * os as f64).floor() + half_bins as f64;
        if bin >= 0.0 && bin < n as f64 {
            sums[bin as usize] += s.value;
            counts[bin as usize] += 1;
        }
    }

    let mut esf: Vec<Option<f64>> = sums
        .iter()
        .zip(&counts)
        .map(|(&s, &c)| (c > 0).then(|| s / c as f64))
        .collect();
    let empty_bins = fill_gaps(&mut esf)?;
    let esf: Vec<f64> = esf.into_iter().flatten().collect();
    let esf = moving_average(&esf, cfg.esf_smoothing_bins);

    let mut lsf = central_difference(&esf);
    if esf[n - 1] < esf[0] {
        lsf.iter_mut().for_each(|v| *v = -*v);
    }

    let distances = (0..n)
        .map(|i| (i as f64 - half_bins as f64 + 0.5) / os as f64)
        .collect();

    Ok(EdgeProfile {
        oversampling: os,
        distances,
        esf,
        lsf,
        empty_bins,
    })
}

/// Linear interpolation over runs of empty bins; ends copy their neighbour.
fn fill_gaps(bins: &mut [Option<f64>]) -> Result<usize> {
    let known: Vec<usize> = (0..bins.len()).filter(|&i| bins[i].is_some()).collect();
    let (Some(&first), Some(&last)) = (known.first(), known.last()) else {
        return Err(MeasureError::degenerate("no pixels fall inside the ESF support"));
    };
    let empty = bins.len() - known.len();

    let first_value = bins[first];
    let last_value = bins[last];
    bins[..first].iter_mut().for_each(|b| *b = first_value);
    bins[last + 1..].iter_mut().for_each(|b| *b = last_value);
    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if let (Some(va), Some(vb)) = (bins[a], bins[b]) {
            for i in a + 1..b {
                let t = (i - a) as f64 / (b - a) as f64;
                bins[i] = Some(va + t * (vb - va));
            }
        }
    }
    Ok(empty)
}

fn moving_average(values: &[f64], width: usize) -> Vec<f64> {
    let half = width / 2;
    if half == 0 {
        return values.to_vec();
    }
    let n = values.len();
    (0..n)
        .map(|i| {
            let h = half.min(i).min(n - 1 - i);
            values[i - h..=i + h].iter().sum::<f64>() / (2 * h + 1) as f64
        })
        .collect()
}

fn central_difference(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => 0.5 * (values[i + 1] - values[i - 1]),
        })
        .collect()
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Windowed LSF spectrum with DC normalized to exactly one.
fn sfr(profile: &EdgeProfile, angle_rad: f64, cfg: &EdgeSettings) -> Result<Vec<FrequencyPoint>> {
    let n = profile.lsf.len();
    let os = profile.oversampling as f64;
    let delta = 1.0 / os;

    let mass: f64 = profile.lsf.iter().map(|v| v.abs()).sum();
    if mass <= 0.0 {
        return Err(MeasureError::degenerate("edge has no contrast"));
    }
    let centroid = profile
        .lsf
        .iter()
        .enumerate()
        .map(|(i, v)| i as f64 * v.abs())
        .sum::<f64>()
        / mass;
    let taper = window(cfg.window, n, centroid);
    let windowed: Vec<f64> = profile.lsf.iter().zip(&taper).map(|(v, w)| v * w).collect();

    let mags = dft_magnitudes(&windowed);
    let dc = mags[0];
    if dc <= 0.0 {
        return Err(MeasureError::degenerate("line spread function integrates to zero"));
    }

    // moving_average spans 2 * (w / 2) + 1 bins
    let smoothing = (2 * (cfg.esf_smoothing_bins / 2) + 1) as f64;
    let mut points = Vec::with_capacity(mags.len());
    for (k, &m) in mags.iter().enumerate().skip(1) {
        let f = k as f64 * os / n as f64;
        if f > cfg.max_frequency {
            break;
        }
        let mut response = 1.0;
        if cfg.derivative_correction {
            let w = 2.0 * PI * f * delta;
            // central difference, then the moving average on the ESF
            response *= w.sin() / w;
            response *= (smoothing * PI * f * delta).sin() / (smoothing * (PI * f * delta).sin());
        }
        if cfg.aperture_correction {
            response *= sinc(f * angle_rad.cos()) * sinc(f * angle_rad.sin());
        }
        if (cfg.derivative_correction || cfg.aperture_correction) && response < cfg.min_aperture_response {
            debug!("SFR truncated at {f:.3} cy/px, correction response {response:.3}");
            break;
        }
        points.push(FrequencyPoint {
            frequency: f,
            modulation: (m / dc / response).clamp(0.0, 1.0),
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Roi;
    use crate::synthetic;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn geometry() -> EdgeGeometry {
        EdgeGeometry {
            roi: Roi::new(0, 0, 100, 100),
            angle_estimate_deg: None,
        }
    }

    #[test]
    fn test_edge_mtf50_matches_gaussian() {
        let sigma = 1.5;
        let frame = synthetic::slanted_edge(100, 100, 5.0, 0.1, 0.9, sigma, 1);
        let m = measure_edge(&frame, &geometry(), &MeasureSettings::default()).unwrap();

        assert_relative_eq!(m.angle_deg, 5.0, epsilon = 0.1);
        assert_eq!(m.curve.points()[0].modulation, 1.0);
        let expected = synthetic::gaussian_mtf50(sigma);
        assert_relative_eq!(m.curve.mtf50().unwrap(), expected, max_relative = 0.05);
    }

    #[test]
    fn test_edge_mtf50_is_angle_invariant() {
        let sigma = 1.5;
        let mtf50 = |angle: f64| {
            let frame = synthetic::slanted_edge(100, 100, angle, 0.1, 0.9, sigma, 1);
            measure_edge(&frame, &geometry(), &MeasureSettings::default())
                .unwrap()
                .curve
                .mtf50()
                .unwrap()
        };
        let (a, b) = (mtf50(5.0), mtf50(8.0));
        assert_relative_eq!(a, b, max_relative = 0.03);
        assert_relative_eq!(b, synthetic::gaussian_mtf50(sigma), max_relative = 0.05);
    }

    #[test]
    fn test_edge_profile_invariants() {
        let frame = synthetic::slanted_edge(100, 100, 8.0, 0.9, 0.1, 1.5, 1);
        let m = measure_edge(&frame, &geometry(), &MeasureSettings::default()).unwrap();
        let p = &m.profile;
        assert_eq!(p.oversampling, 4);
        assert!(p.distances.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(p.esf.len(), p.distances.len());
        // bright-to-dark edge still yields a positive line spread
        assert!(p.lsf.iter().sum::<f64>() > 0.0);
        assert!(m.curve.points().iter().all(|q| (0.0..=1.0).contains(&q.modulation)));
    }

    #[test]
    fn test_near_axis_and_steep_edges_are_rejected() {
        for angle in [0.5, 40.0] {
            let frame = synthetic::slanted_edge(100, 100, angle, 0.1, 0.9, 1.5, 1);
            match measure_edge(&frame, &geometry(), &MeasureSettings::default()) {
                Err(MeasureError::EdgeAngleOutOfRange { angle_deg, .. }) => {
                    assert!((angle_deg - angle).abs() < 1.0, "{angle_deg} vs {angle}");
                }
                other => panic!("angle {angle}: expected rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_horizontal_edge_is_scanned_by_columns() {
        // 84 deg from vertical is 6 deg from horizontal
        let frame = synthetic::slanted_edge(100, 100, 84.0, 0.1, 0.9, 1.5, 1);
        let m = measure_edge(&frame, &geometry(), &MeasureSettings::default()).unwrap();
        assert!(m.line.transposed);
        assert_relative_eq!(m.angle_deg, 6.0, epsilon = 0.1);
        assert_relative_eq!(
            m.curve.mtf50().unwrap(),
            synthetic::gaussian_mtf50(1.5),
            max_relative = 0.05
        );
    }

    #[test]
    fn test_aperture_correction_recovers_optical_mtf() {
        let sigma = 1.0;
        let frame = synthetic::slanted_edge(100, 100, 5.0, 0.1, 0.9, sigma, 8);
        let mut settings = MeasureSettings::default();
        let raw = measure_edge(&frame, &geometry(), &settings).unwrap().curve.mtf50().unwrap();

        settings.edge.aperture_correction = true;
        let corrected = measure_edge(&frame, &geometry(), &settings).unwrap().curve.mtf50().unwrap();

        assert!(raw < corrected);
        assert_relative_eq!(corrected, synthetic::gaussian_mtf50(sigma), max_relative = 0.05);
    }

    fn with_noise(frame: &Frame, amplitude: f32, seed: u64) -> Frame {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = frame
            .as_raw()
            .iter()
            .map(|&v| v + rng.gen_range(-amplitude..amplitude))
            .collect();
        Frame::new(frame.width(), frame.height(), data, frame.pixel_pitch(), frame.bit_depth()).unwrap()
    }

    #[test]
    fn test_noisy_edge_keeps_angle_and_mtf50() {
        let sigma = 1.5;
        let clean = synthetic::slanted_edge(100, 100, 5.0, 0.1, 0.9, sigma, 1);
        for (amplitude, seed) in [(0.005, 1), (0.01, 2), (0.02, 3)] {
            let frame = with_noise(&clean, amplitude, seed);
            let m = measure_edge(&frame, &geometry(), &MeasureSettings::default()).unwrap();
            assert!(
                (m.angle_deg - 5.0).abs() < 0.3,
                "noise {amplitude}: angle {}",
                m.angle_deg
            );
            assert_relative_eq!(
                m.curve.mtf50().unwrap(),
                synthetic::gaussian_mtf50(sigma),
                max_relative = 0.1
            );
        }
    }

    #[test]
    fn test_even_smoothing_length_is_rejected() {
        let frame = synthetic::slanted_edge(100, 100, 5.0, 0.1, 0.9, 1.5, 1);
        let mut settings = MeasureSettings::default();
        settings.edge.esf_smoothing_bins = 4;
        match measure_edge(&frame, &geometry(), &settings) {
            Err(MeasureError::InvalidSettings { field, .. }) => assert_eq!(field, "edge.esf_smoothing_bins"),
            other => panic!("expected invalid settings, got {other:?}"),
        }
    }

    #[test]
    fn test_smoothing_correction_uses_effective_length() {
        // moving_average(_, 2) spans three bins, so it is corrected as three
        let profile = EdgeProfile {
            oversampling: 4,
            distances: (0..64).map(|i| (i as f64 - 31.5) / 4.0).collect(),
            esf: vec![0.0; 64],
            lsf: (0..64).map(|i| if i == 32 { 1.0 } else { 0.0 }).collect(),
            empty_bins: 0,
        };
        let mut cfg = EdgeSettings::default();
        cfg.window = crate::settings::WindowFunction::Rectangular;
        cfg.esf_smoothing_bins = 2;
        let even = sfr(&profile, 0.1, &cfg).unwrap();
        cfg.esf_smoothing_bins = 3;
        let odd = sfr(&profile, 0.1, &cfg).unwrap();
        assert_eq!(even.len(), odd.len());
        for (a, b) in even.iter().zip(&odd) {
            assert_relative_eq!(a.modulation, b.modulation, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_roi_outside_frame() {
        let frame = synthetic::slanted_edge(64, 64, 5.0, 0.1, 0.9, 1.5, 1);
        let err = measure_edge(&frame, &geometry(), &MeasureSettings::default()).unwrap_err();
        assert!(matches!(err, MeasureError::GeometryOutOfBounds { .. }));
    }
}
