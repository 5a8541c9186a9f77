//! Sub-pixel sampling of frames: ring profiles around a star center,
//! center-bias correction, and perpendicular-distance projection for edges.

use crate::error::{MeasureError, Result};
use crate::frame::{Frame, RoiView};
use crate::geometry::StarGeometry;
use crate::settings::{CenterRefinementSettings, Interpolation};
use crate::sharpness::sobel_at;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Intensity at a fractional pixel position, `None` outside the pixel grid.
pub fn sample(frame: &Frame, x: f64, y: f64, interpolation: Interpolation) -> Option<f64> {
    let max_x = (frame.width() - 1) as f64;
    let max_y = (frame.height() - 1) as f64;
    if !(x >= 0.0 && y >= 0.0 && x <= max_x && y <= max_y) {
        return None;
    }
    if frame.width() < 2 || frame.height() < 2 {
        return Some(frame.get(x.round() as u32, y.round() as u32));
    }
    Some(match interpolation {
        Interpolation::Bilinear => bilinear(frame, x, y),
        Interpolation::Bicubic => bicubic(frame, x, y),
    })
}

fn bilinear(frame: &Frame, x: f64, y: f64) -> f64 {
    let x0 = (x.floor() as u32).min(frame.width() - 2);
    let y0 = (y.floor() as u32).min(frame.height() - 2);
    let tx = x - x0 as f64;
    let ty = y - y0 as f64;

    let top = frame.get(x0, y0) * (1.0 - tx) + frame.get(x0 + 1, y0) * tx;
    let bottom = frame.get(x0, y0 + 1) * (1.0 - tx) + frame.get(x0 + 1, y0 + 1) * tx;
    top * (1.0 - ty) + bottom * ty
}

/// Keys cubic convolution kernel with a = -0.5.
#[inline]
fn keys(s: f64) -> f64 {
    const A: f64 = -0.5;
    let s = s.abs();
    if s <= 1.0 {
        (A + 2.0) * s * s * s - (A + 3.0) * s * s + 1.0
    } else if s < 2.0 {
        A * s * s * s - 5.0 * A * s * s + 8.0 * A * s - 4.0 * A
    } else {
        0.0
    }
}

fn bicubic(frame: &Frame, x: f64, y: f64) -> f64 {
    let xf = x.floor();
    let yf = y.floor();
    let tx = x - xf;
    let ty = y - yf;
    let max_x = frame.width() as i64 - 1;
    let max_y = frame.height() as i64 - 1;

    let mut acc = 0.0;
    for j in -1..=2i64 {
        let wy = keys(ty - j as f64);
        let yy = (yf as i64 + j).clamp(0, max_y) as u32;
        let mut row = 0.0;
        for i in -1..=2i64 {
            let xx = (xf as i64 + i).clamp(0, max_x) as u32;
            row += keys(tx - i as f64) * frame.get(xx, yy);
        }
        acc += wy * row;
    }
    acc
}

/// Intensities sampled at equal angular steps around one circle,
/// starting at angle zero (the +x axis) and turning toward +y.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingProfile {
    pub center: (f64, f64),
    pub radius: f64,
    pub samples: Vec<f64>,
}

impl RingProfile {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn angle(&self, k: usize) -> f64 {
        2.0 * PI * k as f64 / self.samples.len() as f64
    }
}

/// Number of angular samples for a ring: circumference times oversampling.
pub fn ring_sample_count(radius: f64, angular_oversampling: f64) -> usize {
    ((2.0 * PI * radius * angular_oversampling).ceil() as usize).max(8)
}

pub fn sample_ring(
    frame: &Frame,
    center: (f64, f64),
    radius: f64,
    samples: usize,
    interpolation: Interpolation,
) -> Result<RingProfile> {
    let (cx, cy) = center;
    let mut values = Vec::with_capacity(samples);
    for k in 0..samples {
        let theta = 2.0 * PI * k as f64 / samples as f64;
        let x = cx + radius * theta.cos();
        let y = cy + radius * theta.sin();
        let v = sample(frame, x, y, interpolation).ok_or_else(|| {
            MeasureError::GeometryOutOfBounds {
                what: format!("ring of radius {radius:.2}"),
                min_x: cx - radius,
                max_x: cx + radius,
                min_y: cy - radius,
                max_y: cy + radius,
                width: frame.width(),
                height: frame.height(),
            }
        })?;
        values.push(v);
    }
    Ok(RingProfile {
        center,
        radius,
        samples: values,
    })
}

/// Outcome of the star center-bias correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenterEstimate {
    pub center: (f64, f64),
    pub iterations: usize,
    /// Movement in the last iteration, in pixels.
    pub last_shift: f64,
    pub converged: bool,
}

/// Re-estimates the star center as the gradient-energy centroid of an annulus
/// around the current estimate, iterating until the shift drops below the
/// tolerance or the iteration bound is reached.
///
/// Gradient energy of a star falls off as 1/r^2 from its true center, so the
/// centroid of an off-center annulus is pulled toward that center.
pub fn refine_center(
    frame: &Frame,
    star: &StarGeometry,
    settings: &CenterRefinementSettings,
) -> Result<CenterEstimate> {
    star.validate(frame)?;
    let nominal = star.center;
    if !settings.enabled {
        return Ok(CenterEstimate {
            center: nominal,
            iterations: 0,
            last_shift: 0.0,
            converged: true,
        });
    }

    let r_hi = settings.annulus_outer_frac * star.outer_radius;
    let r_lo = (settings.annulus_inner_frac * star.outer_radius)
        .max(star.inner_radius)
        .min(r_hi * 0.5);
    let view = frame.full_view();

    let mut center = nominal;
    let mut last_shift = f64::INFINITY;
    let mut iterations = 0;
    while iterations < settings.max_iterations {
        let Some(next) = gradient_centroid(&view, center, r_lo, r_hi) else {
            debug!("center refinement: no gradient energy around {center:?}");
            break;
        };
        iterations += 1;
        last_shift = ((next.0 - center.0).powi(2) + (next.1 - center.1).powi(2)).sqrt();
        center = next;
        if last_shift < settings.tolerance_px {
            break;
        }
    }

    let drift = ((center.0 - nominal.0).powi(2) + (center.1 - nominal.1).powi(2)).sqrt();
    if drift > r_lo {
        warn!(
            "center refinement drifted {drift:.2} px from nominal {nominal:?}, keeping nominal center"
        );
        return Ok(CenterEstimate {
            center: nominal,
            iterations,
            last_shift,
            converged: false,
        });
    }
    star.check_extent(frame, center)?;

    let converged = last_shift < settings.tolerance_px;
    debug!(
        "center refinement: {nominal:?} -> ({:.3}, {:.3}) in {iterations} iterations, converged={converged}",
        center.0, center.1
    );
    Ok(CenterEstimate {
        center,
        iterations,
        last_shift: if iterations == 0 { 0.0 } else { last_shift },
        converged,
    })
}

fn gradient_centroid(
    view: &RoiView<'_>,
    center: (f64, f64),
    r_lo: f64,
    r_hi: f64,
) -> Option<(f64, f64)> {
    let (cx, cy) = center;
    let x0 = ((cx - r_hi).floor() as i64).max(1) as u32;
    let y0 = ((cy - r_hi).floor() as i64).max(1) as u32;
    let x1 = ((cx + r_hi).ceil() as i64).min(view.width() as i64 - 2).max(0) as u32;
    let y1 = ((cy + r_hi).ceil() as i64).min(view.height() as i64 - 2).max(0) as u32;

    let (lo2, hi2) = (r_lo * r_lo, r_hi * r_hi);
    let (mut sw, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            if d2 < lo2 || d2 > hi2 {
                continue;
            }
            let (gx, gy) = sobel_at(view, x, y);
            let w = gx * gx + gy * gy;
            sw += w;
            sx += w * x as f64;
            sy += w * y as f64;
        }
    }
    if sw <= 0.0 {
        return None;
    }
    Some((sx / sw, sy / sw))
}

/// Fitted edge line in ROI-local coordinates.
///
/// `u` is the coordinate across the edge and `v` the one along it: `(x, y)`
/// for a near-vertical edge, `(y, x)` when `transposed`. The edge passes
/// through `u = offset + slope * v`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeLine {
    pub offset: f64,
    pub slope: f64,
    pub transposed: bool,
}

impl EdgeLine {
    /// Angle between the edge and its scan axis, in degrees.
    pub fn angle_deg(&self) -> f64 {
        self.slope.atan().to_degrees()
    }

    /// Signed distance from the line along its normal, positive toward larger `u`.
    #[inline]
    pub fn distance(&self, u: f64, v: f64) -> f64 {
        (u - self.offset - self.slope * v) / (1.0 + self.slope * self.slope).sqrt()
    }
}

/// One ROI pixel placed on the edge-normal axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeSample {
    pub distance: f64,
    pub value: f64,
}

/// Assigns every ROI pixel its perpendicular distance from `line`.
pub fn project_edge_pixels(view: &RoiView<'_>, line: &EdgeLine) -> Vec<EdgeSample> {
    let mut out = Vec::with_capacity((view.width() * view.height()) as usize);
    for y in 0..view.height() {
        for x in 0..view.width() {
            let (u, v) = if line.transposed {
                (y as f64, x as f64)
            } else {
                (x as f64, y as f64)
            };
            out.push(EdgeSample {
                distance: line.distance(u, v),
                value: view.get(x, y),
            });
        }
    }
    out
}
