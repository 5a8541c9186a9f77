//! Siemens-star contrast extraction.
//!
//! A star with `N` sector pairs repeats `N` times around any ring, so a ring
//! of radius `r` carries the spatial frequency `N / (2 pi r)` cycles per pixel.
//! Contrast is read from the harmonic projection of the ring profile onto that
//! frequency rather than from its min/max, which keeps print defects and
//! higher harmonics out of the estimate.

use crate::error::{MeasureError, Result};
use crate::frame::Frame;
use crate::geometry::StarGeometry;
use crate::mtf::{FrequencyPoint, MtfCurve, MtfProducer};
use crate::sampler::{refine_center, ring_sample_count, sample_ring, CenterEstimate, RingProfile};
use crate::settings::MeasureSettings;
use crate::spectral::dft_magnitudes;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Contrast measured on one ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingContrast {
    pub radius: f64,
    /// Cycles per pixel.
    pub frequency: f64,
    pub samples_per_cycle: f64,
    pub mean: f64,
    /// Amplitude of the projected harmonic, in intensity units.
    pub amplitude: f64,
    /// Amplitude over mean, normalized by the target's nominal contrast.
    pub modulation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarMeasurement {
    pub center: CenterEstimate,
    pub rings: Vec<RingContrast>,
    /// Rings skipped because they were sampled too coarsely; always
    /// `InsufficientAngularSampling`.
    pub excluded: Vec<MeasureError>,
    pub curve: MtfCurve,
}

/// Harmonic contrast of a single ring profile at `order` cycles per turn.
/// Returns `(mean, amplitude)`.
pub fn harmonic_projection(profile: &RingProfile, order: u32) -> (f64, f64) {
    let n = profile.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let m = order as f64;
    let (mut sum, mut re, mut im) = (0.0, 0.0, 0.0);
    for (k, &v) in profile.samples.iter().enumerate() {
        let phase = m * profile.angle(k);
        sum += v;
        re += v * phase.cos();
        im += v * phase.sin();
    }
    let scale = 2.0 / n as f64;
    (sum / n as f64, scale * (re * re + im * im).sqrt())
}

/// Measures contrast on `settings.star.num_radii` rings between the star's
/// inner and outer radius, after re-estimating its center.
pub fn measure_star(frame: &Frame, star: &StarGeometry, settings: &MeasureSettings) -> Result<StarMeasurement> {
    settings.validate()?;
    star.validate(frame)?;
    let cfg = &settings.star;
    let waveform_gain = star.harmonic_amplitude(cfg.harmonic)?;
    let order = cfg.harmonic * star.sector_pairs;

    let center = refine_center(frame, star, &settings.sampler.center)?;

    let step = (star.outer_radius - star.inner_radius) / (cfg.num_radii - 1) as f64;
    let mut rings = Vec::with_capacity(cfg.num_radii);
    let mut excluded = Vec::new();
    for i in 0..cfg.num_radii {
        let radius = star.inner_radius + step * i as f64;
        let samples = ring_sample_count(radius, cfg.angular_oversampling);
        let samples_per_cycle = samples as f64 / order as f64;
        if samples_per_cycle < cfg.min_samples_per_cycle {
            debug!(
                "excluding ring r={radius:.2}: {samples_per_cycle:.2} samples per cycle < {}",
                cfg.min_samples_per_cycle
            );
            excluded.push(MeasureError::InsufficientAngularSampling {
                radius,
                samples_per_cycle,
                required: cfg.min_samples_per_cycle,
            });
            continue;
        }

        let profile = sample_ring(frame, center.center, radius, samples, settings.sampler.interpolation)?;
        let (mean, amplitude) = harmonic_projection(&profile, order);
        if mean <= 0.0 {
            return Err(MeasureError::degenerate(format!(
                "ring at radius {radius:.2} has non-positive mean intensity {mean}"
            )));
        }
        let modulation = amplitude / mean / (star.nominal_contrast * waveform_gain);
        rings.push(RingContrast {
            radius,
            frequency: star.frequency_at(radius, cfg.harmonic),
            samples_per_cycle,
            mean,
            amplitude,
            modulation,
        });
    }

    if rings.is_empty() {
        // every ring was too coarse; report the best-sampled one
        return Err(excluded
            .pop()
            .unwrap_or_else(|| MeasureError::degenerate("no rings requested")));
    }

    let points = rings
        .iter()
        .map(|r| FrequencyPoint {
            frequency: r.frequency,
            modulation: r.modulation,
        })
        .collect();
    let curve = MtfCurve::from_points(points, frame.pixel_pitch(), &settings.mtf);
    info!(
        "star: {} rings measured, {} excluded, center ({:.2}, {:.2})",
        rings.len(),
        excluded.len(),
        center.center.0,
        center.center.1
    );

    Ok(StarMeasurement {
        center,
        rings,
        excluded,
        curve,
    })
}

impl MtfProducer for StarGeometry {
    fn measure_mtf(&self, frame: &Frame, settings: &MeasureSettings) -> Result<MtfCurve> {
        measure_star(frame, self, settings).map(|m| m.curve)
    }
}

/// Harmonic magnitudes of one ring, relative to its mean: index `k` holds the
/// contrast of the `k`-cycles-per-turn component, index 0 is 1.
pub fn angular_spectrum(
    frame: &Frame,
    center: (f64, f64),
    radius: f64,
    settings: &MeasureSettings,
) -> Result<Vec<f64>> {
    let samples = ring_sample_count(radius, settings.star.angular_oversampling);
    let profile = sample_ring(frame, center, radius, samples, settings.sampler.interpolation)?;
    let mags = dft_magnitudes(&profile.samples);
    let dc = mags[0];
    if dc <= 0.0 {
        return Err(MeasureError::degenerate(format!(
            "ring at radius {radius:.2} has no mean intensity"
        )));
    }
    Ok(mags
        .iter()
        .enumerate()
        .map(|(k, &m)| if k == 0 { 1.0 } else { 2.0 * m / dc })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::StarWaveform;
    use crate::synthetic;
    use approx::assert_relative_eq;

    fn star(n: u32, inner: f64, outer: f64, waveform: StarWaveform) -> StarGeometry {
        StarGeometry {
            center: (100.0, 100.0),
            inner_radius: inner,
            outer_radius: outer,
            sector_pairs: n,
            nominal_contrast: 0.8,
            waveform,
        }
    }

    #[test]
    fn test_sinusoidal_star_matches_gaussian_mtf() {
        let sigma = 1.0;
        let frame = synthetic::sinusoidal_star(201, 201, (100.0, 100.0), 16, 0.5, 0.4, sigma);
        let geometry = star(16, 26.0, 80.0, StarWaveform::Sinusoidal);
        let m = measure_star(&frame, &geometry, &MeasureSettings::default()).unwrap();

        assert_eq!(m.rings.len(), 20);
        assert!(m.excluded.is_empty());
        for ring in &m.rings {
            let expected = synthetic::gaussian_mtf(sigma, ring.frequency);
            assert_relative_eq!(ring.modulation, expected, max_relative = 0.05);
        }
        assert_eq!(m.curve.points()[0].modulation, 1.0);
        assert!((m.center.center.0 - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_square_wave_star_uses_fundamental_gain() {
        let sigma = 1.0;
        let frame = synthetic::square_star(201, 201, (100.0, 100.0), 16, 0.1, 0.9, sigma, 4);
        let geometry = star(16, 40.0, 80.0, StarWaveform::SquareWave);
        let m = measure_star(&frame, &geometry, &MeasureSettings::default()).unwrap();
        for ring in &m.rings {
            let expected = synthetic::gaussian_mtf(sigma, ring.frequency);
            assert_relative_eq!(ring.modulation, expected, max_relative = 0.05);
        }
    }

    #[test]
    fn test_coarse_rings_are_excluded() {
        let frame = synthetic::sinusoidal_star(201, 201, (100.0, 100.0), 16, 0.5, 0.4, 1.0);
        let mut settings = MeasureSettings::default();
        settings.star.angular_oversampling = 1.0;
        settings.star.num_radii = 16;

        let m = measure_star(&frame, &star(16, 5.0, 80.0, StarWaveform::Sinusoidal), &settings).unwrap();
        assert!(!m.excluded.is_empty());
        for err in &m.excluded {
            match err {
                MeasureError::InsufficientAngularSampling { radius, required, .. } => {
                    assert!(*radius < 21.0);
                    assert_eq!(*required, 8.0);
                }
                other => panic!("unexpected exclusion {other:?}"),
            }
        }
        assert!(m.rings.iter().all(|r| r.samples_per_cycle >= 8.0));

        let hub_only = star(16, 2.0, 10.0, StarWaveform::Sinusoidal);
        assert!(matches!(
            measure_star(&frame, &hub_only, &settings),
            Err(MeasureError::InsufficientAngularSampling { .. })
        ));
    }

    #[test]
    fn test_angular_spectrum_peaks_at_sector_count() {
        let frame = synthetic::sinusoidal_star(201, 201, (100.0, 100.0), 12, 0.5, 0.4, 0.0);
        let spectrum = angular_spectrum(&frame, (100.0, 100.0), 70.0, &MeasureSettings::default()).unwrap();
        let (peak, value) = spectrum
            .iter()
            .enumerate()
            .skip(1)
            .fold((0, 0.0), |acc, (k, &v)| if v > acc.1 { (k, v) } else { acc });
        assert_eq!(peak, 12);
        assert_relative_eq!(value, 0.8, max_relative = 0.03);
        assert_eq!(spectrum[0], 1.0);
    }

    #[test]
    fn test_star_outside_frame_is_rejected() {
        let frame = synthetic::sinusoidal_star(101, 101, (50.0, 50.0), 16, 0.5, 0.4, 1.0);
        let geometry = StarGeometry {
            center: (50.0, 50.0),
            ..star(16, 10.0, 60.0, StarWaveform::Sinusoidal)
        };
        assert!(matches!(
            geometry.measure_mtf(&frame, &MeasureSettings::default()),
            Err(MeasureError::GeometryOutOfBounds { .. })
        ));
    }
}
