//! Synthetic calibration targets with known optical response.
//!
//! Stars and edges are rendered analytically as if imaged through a Gaussian
//! PSF of known sigma, whose MTF is `exp(-2 pi^2 sigma^2 f^2)`. Used to
//! validate the measurement engine and to build focus stacks without hardware.
//!
//! Renderers panic on zero-sized frames.

use crate::frame::Frame;
use image::imageops;
use scilib::math::basic::erf;
use std::f64::consts::{PI, SQRT_2};

/// Upper bound on the odd harmonics summed for a blurred square-wave star.
const MAX_HARMONICS: u32 = 4096;

/// Analytic MTF of a Gaussian PSF of `sigma` pixels at `f` cycles per pixel.
pub fn gaussian_mtf(sigma: f64, f: f64) -> f64 {
    (-2.0 * PI * PI * sigma * sigma * f * f).exp()
}

/// Frequency where the Gaussian MTF falls to 0.5, in cycles per pixel.
pub fn gaussian_mtf50(sigma: f64) -> f64 {
    (std::f64::consts::LN_2 / 2.0).sqrt() / (PI * sigma)
}

/// Attenuation of a pattern of `f` cycles per pixel; no blur below zero sigma.
fn attenuation(sigma: f64, f: f64) -> f64 {
    if sigma > 0.0 {
        gaussian_mtf(sigma, f)
    } else {
        1.0
    }
}

/// Sinusoidal star `mean + amplitude * cos(N theta)`, point sampled at pixel
/// centers. With `blur_sigma > 0` the modulation at radius `r` carries the
/// Gaussian attenuation at the local frequency `N / (2 pi r)`.
pub fn sinusoidal_star(
    width: u32,
    height: u32,
    center: (f64, f64),
    sector_pairs: u32,
    mean: f64,
    amplitude: f64,
    blur_sigma: f64,
) -> Frame {
    let n = sector_pairs as f64;
    let data = render(width, height, 1, |x, y| {
        let (dx, dy) = (x - center.0, y - center.1);
        let f = n / (2.0 * PI * dx.hypot(dy));
        mean + amplitude * attenuation(blur_sigma, f) * (n * dy.atan2(dx)).cos()
    });
    finish(width, height, data)
}

/// Binary Siemens star with `supersample`^2 samples per pixel. A blurred star
/// is summed from its odd-harmonic series, each harmonic attenuated at its own
/// local frequency.
#[allow(clippy::too_many_arguments)]
pub fn square_star(
    width: u32,
    height: u32,
    center: (f64, f64),
    sector_pairs: u32,
    low: f64,
    high: f64,
    blur_sigma: f64,
    supersample: u32,
) -> Frame {
    let n = sector_pairs as f64;
    let (mid, half) = ((high + low) / 2.0, (high - low) / 2.0);
    let data = render(width, height, supersample, |x, y| {
        let (dx, dy) = (x - center.0, y - center.1);
        let phase = n * dy.atan2(dx);
        if blur_sigma <= 0.0 {
            return if phase.cos() >= 0.0 { high } else { low };
        }
        let f = n / (2.0 * PI * dx.hypot(dy));
        let mut wave = 0.0;
        for k in 0..MAX_HARMONICS {
            let h = (2 * k + 1) as f64;
            let gain = attenuation(blur_sigma, h * f);
            if gain < 1e-9 {
                break;
            }
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            wave += sign * 4.0 / (PI * h) * gain * (h * phase).cos();
        }
        mid + half * wave
    });
    finish(width, height, data)
}

/// Straight edge through the frame center, tilted `angle_deg` from vertical,
/// dark (`low`) on the left. The edge is blurred analytically by a Gaussian of
/// `sigma`; `supersample > 1` additionally integrates over the pixel area.
pub fn slanted_edge(
    width: u32,
    height: u32,
    angle_deg: f64,
    low: f64,
    high: f64,
    sigma: f64,
    supersample: u32,
) -> Frame {
    let (cx, cy) = ((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0);
    let a = angle_deg.to_radians();
    let (ca, sa) = (a.cos(), a.sin());
    let data = render(width, height, supersample, |x, y| {
        let d = (x - cx) * ca - (y - cy) * sa;
        let step = if sigma > 0.0 {
            normal_cdf(d / sigma)
        } else if d >= 0.0 {
            1.0
        } else {
            0.0
        };
        low + (high - low) * step
    });
    finish(width, height, data)
}

/// Blurs a captured frame with `image::imageops::blur`. Its kernel is
/// truncated, so the response only approximates [`gaussian_mtf`].
pub fn gaussian_blur(frame: &Frame, sigma: f64) -> Frame {
    if sigma <= 0.0 {
        return frame.clone();
    }
    let blurred = imageops::blur(frame.image(), sigma as f32);
    Frame::new(
        frame.width(),
        frame.height(),
        blurred.into_raw(),
        frame.pixel_pitch(),
        frame.bit_depth(),
    )
    .map(|f| f.with_clip_flags(frame.clip_flags()))
    .unwrap_or_else(|_| frame.clone())
}

/// Symmetric focus stack: the middle frame is `sharp`, the ends carry
/// `sigma_max` of blur. Returns `(sigma, frame)` pairs in stack order.
pub fn focus_stack(sharp: &Frame, frames: usize, sigma_max: f64) -> Vec<(f64, Frame)> {
    if frames <= 1 {
        return vec![(0.0, sharp.clone())];
    }
    let center = (frames - 1) as f64 / 2.0;
    (0..frames)
        .map(|i| {
            let sigma = (i as f64 - center).abs() / center * sigma_max;
            (sigma, gaussian_blur(sharp, sigma))
        })
        .collect()
}

fn render(width: u32, height: u32, supersample: u32, f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let ss = supersample.max(1);
    let step = 1.0 / ss as f64;
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for j in 0..ss {
                for i in 0..ss {
                    let sx = x as f64 - 0.5 + (i as f64 + 0.5) * step;
                    let sy = y as f64 - 0.5 + (j as f64 + 0.5) * step;
                    acc += f(sx, sy);
                }
            }
            data.push(acc / (ss * ss) as f64);
        }
    }
    data
}

fn finish(width: u32, height: u32, data: Vec<f64>) -> Frame {
    Frame::new(width, height, data.into_iter().map(|v| v as f32).collect(), 1.0, 16)
        .expect("synthetic frame dimensions are consistent")
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}
