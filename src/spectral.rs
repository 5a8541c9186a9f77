//! FFT helpers shared by the slanted-edge SFR and the spectral focus metrics.

use crate::settings::WindowFunction;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// Magnitudes of the forward DFT of a real signal, bins `0..=n/2`.
pub fn dft_magnitudes(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&x| Complex { re: x, im: 0.0 }).collect();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);
    buffer[..=n / 2].iter().map(|c| c.norm()).collect()
}

/// Window of length `n` centered on the fractional index `center`.
///
/// The taper spans `n` samples, so a window centered off the middle is
/// clamped at its floor value beyond its support.
pub fn window(kind: WindowFunction, n: usize, center: f64) -> Vec<f64> {
    let (a0, floor) = match kind {
        WindowFunction::Rectangular => return vec![1.0; n],
        WindowFunction::Hamming => (0.54, 0.08),
        WindowFunction::Hann => (0.5, 0.0),
    };
    let half = n as f64 / 2.0;
    (0..n)
        .map(|i| {
            let t = (i as f64 - center) / half;
            if t.abs() >= 1.0 {
                floor
            } else {
                a0 + (1.0 - a0) * (PI * t).cos()
            }
        })
        .collect()
}

/// Power spectrum of a mean-removed, Hann-tapered image (row-major).
///
/// Removing the mean keeps exposure out of band ratios; the taper keeps the
/// implicit periodic boundary from leaking into high frequencies.
pub fn power_spectrum_2d(values: &[f64], width: usize, height: usize) -> Vec<f64> {
    debug_assert_eq!(values.len(), width * height);
    if values.is_empty() {
        return Vec::new();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let wx = hann(width);
    let wy = hann(height);

    let mut rows: Vec<Complex<f64>> = Vec::with_capacity(values.len());
    for y in 0..height {
        for x in 0..width {
            let v = (values[y * width + x] - mean) * wx[x] * wy[y];
            rows.push(Complex { re: v, im: 0.0 });
        }
    }

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(width).process(&mut rows);

    let mut cols: Vec<Complex<f64>> = Vec::with_capacity(values.len());
    for x in 0..width {
        for y in 0..height {
            cols.push(rows[y * width + x]);
        }
    }
    planner.plan_fft_forward(height).process(&mut cols);

    let mut power = vec![0.0; values.len()];
    for x in 0..width {
        for y in 0..height {
            power[y * width + x] = cols[x * height + y].norm_sqr();
        }
    }
    power
}

/// Radial frequency in cycles per pixel of DFT bin `(kx, ky)`.
pub fn radial_frequency(kx: usize, ky: usize, width: usize, height: usize) -> f64 {
    let signed = |k: usize, n: usize| {
        if k <= n / 2 {
            k as f64 / n as f64
        } else {
            (k as f64 - n as f64) / n as f64
        }
    };
    let fx = signed(kx, width);
    let fy = signed(ky, height);
    (fx * fx + fy * fy).sqrt()
}

fn hann(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_dft_of_cosine() {
        let n = 64;
        let signal: Vec<f64> = (0..n)
            .map(|i| 1.0 + 0.5 * (2.0 * PI * 4.0 * i as f64 / n as f64).cos())
            .collect();
        let mags = dft_magnitudes(&signal);
        assert_eq!(mags.len(), 33);
        assert_abs_diff_eq!(mags[0], n as f64, epsilon = 1e-9);
        assert_abs_diff_eq!(mags[4], 0.25 * n as f64, epsilon = 1e-9);
        assert_abs_diff_eq!(mags[5], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_windows_peak_at_center() {
        let w = window(WindowFunction::Hamming, 33, 16.0);
        assert_abs_diff_eq!(w[16], 1.0, epsilon = 1e-12);
        assert!(w[0] < 0.1);
        let shifted = window(WindowFunction::Hann, 32, 20.0);
        assert_abs_diff_eq!(shifted[20], 1.0, epsilon = 1e-12);
        assert_eq!(shifted[3], 0.0);
        assert!(window(WindowFunction::Rectangular, 8, 0.0).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_power_spectrum_locates_grating() {
        let (w, h) = (32, 16);
        let mut img = Vec::new();
        for _y in 0..h {
            for x in 0..w {
                img.push(10.0 + (2.0 * PI * 0.25 * x as f64).cos());
            }
        }
        let power = power_spectrum_2d(&img, w, h);
        let (best, _) = power
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
        let (kx, ky) = (best % w, best / w);
        assert_abs_diff_eq!(radial_frequency(kx, ky, w, h), 0.25, epsilon = 1e-12);
        assert!(power[0] < 1e-2 * power[best]);
    }
}
