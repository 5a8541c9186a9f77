use crate::error::{MeasureError, Result as MeasureResult};
use crate::sharpness::{FocusMetric, MetricRegion};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Kernel used to read intensities at non-integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Bilinear,
    /// Keys cubic convolution (a = -0.5); flatter passband than bilinear.
    Bicubic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CenterRefinementSettings {
    pub enabled: bool,
    pub max_iterations: usize,
    /// Stop once the center moves less than this many pixels.
    pub tolerance_px: f64,
    /// Search band, as fractions of the star's outer radius.
    pub annulus_inner_frac: f64,
    pub annulus_outer_frac: f64,
}

impl Default for CenterRefinementSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 5,
            tolerance_px: 0.1,
            annulus_inner_frac: 0.25,
            annulus_outer_frac: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub interpolation: Interpolation,
    pub center: CenterRefinementSettings,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Bicubic,
            center: CenterRefinementSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarSettings {
    /// Rings sampled between the inner and outer radius of the star.
    pub num_radii: usize,
    /// Angular samples per pixel of ring circumference.
    pub angular_oversampling: f64,
    /// Rings with fewer samples per pattern cycle are excluded.
    pub min_samples_per_cycle: f64,
    /// Harmonic of the sector frequency used for contrast (1 = fundamental).
    pub harmonic: u32,
}

impl Default for StarSettings {
    fn default() -> Self {
        Self {
            num_radii: 20,
            angular_oversampling: 4.0,
            min_samples_per_cycle: 8.0,
            harmonic: 1,
        }
    }
}

/// Taper applied to the line spread function before the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    Hamming,
    Hann,
    Rectangular,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeSettings {
    /// ESF bins per pixel along the edge normal.
    pub oversampling: usize,
    pub min_angle_deg: f64,
    pub max_angle_deg: f64,
    /// Half width of the ESF support, in pixels.
    pub esf_half_width_px: f64,
    /// Moving-average length applied to the ESF, in bins (1 disables it).
    pub esf_smoothing_bins: usize,
    pub window: WindowFunction,
    /// Divide out the response of the discrete derivative and ESF smoothing.
    pub derivative_correction: bool,
    /// Divide out the square pixel aperture.
    pub aperture_correction: bool,
    /// Frequencies where the aperture response drops below this are not reported.
    pub min_aperture_response: f64,
    /// Rows/columns whose edge location misses the first fit by more are dropped.
    pub fit_outlier_px: f64,
    /// Half width of the window, around each line's transition, in which the
    /// edge location is taken as a derivative centroid.
    pub fit_window_px: f64,
    pub max_frequency: f64,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            oversampling: 4,
            min_angle_deg: 2.0,
            max_angle_deg: 30.0,
            esf_half_width_px: 32.0,
            esf_smoothing_bins: 3,
            window: WindowFunction::Hamming,
            derivative_correction: true,
            aperture_correction: false,
            min_aperture_response: 0.2,
            fit_outlier_px: 1.0,
            fit_window_px: 8.0,
            max_frequency: 1.0,
        }
    }
}

/// How the MTF50 crossing is located between the bracketing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingInterpolation {
    Linear,
    MonotoneCubic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtfSettings {
    pub crossing: CrossingInterpolation,
    /// Modulation level reported as the curve's headline frequency (0.5 = MTF50).
    pub threshold: f64,
}

impl Default for MtfSettings {
    fn default() -> Self {
        Self {
            crossing: CrossingInterpolation::Linear,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSettings {
    pub metric: FocusMetric,
    pub region: MetricRegion,
}

impl Default for MetricSettings {
    fn default() -> Self {
        Self {
            metric: FocusMetric::Tenengrad { threshold: None },
            region: MetricRegion::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingKind {
    None,
    MovingAverage,
    /// Quadratic Savitzky-Golay; preserves the vertex of a locally quadratic peak.
    SavitzkyGolay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakInterpolation {
    Parabolic,
    Gaussian,
    /// Gaussian for peaks narrower than `gaussian_max_width_steps`, parabolic otherwise.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakSettings {
    pub smoothing: SmoothingKind,
    /// Odd number of samples.
    pub smoothing_window: usize,
    pub interpolation: PeakInterpolation,
    pub gaussian_max_width_steps: f64,
    /// Fraction of the peak height above baseline at which the width is measured.
    pub width_fraction: f64,
    /// Relative span (max - min) / max below which a curve is flat.
    pub flat_tolerance: f64,
    /// Secondary maxima at least this high (relative to the primary) count as lobes.
    pub lobe_tolerance: f64,
    /// Required dip between a lobe and the primary, relative to peak height.
    pub lobe_prominence: f64,
    pub multi_lobe_penalty: f64,
    /// Peak-to-noise ratio at which the SNR term of the confidence reaches 0.5.
    pub snr_reference: f64,
}

impl Default for PeakSettings {
    fn default() -> Self {
        Self {
            smoothing: SmoothingKind::SavitzkyGolay,
            smoothing_window: 5,
            interpolation: PeakInterpolation::Auto,
            gaussian_max_width_steps: 3.0,
            width_fraction: 0.5,
            flat_tolerance: 0.05,
            lobe_tolerance: 0.5,
            lobe_prominence: 0.1,
            multi_lobe_penalty: 0.5,
            snr_reference: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Worker threads for a sweep; `None` uses one per logical CPU.
    pub workers: Option<usize>,
}

/// Complete configuration of one measurement. Every engine call receives it
/// explicitly; nothing is read from global state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureSettings {
    pub sampler: SamplerSettings,
    pub star: StarSettings,
    pub edge: EdgeSettings,
    pub mtf: MtfSettings,
    pub metric: MetricSettings,
    pub peak: PeakSettings,
    pub sweep: SweepSettings,
}

fn check(ok: bool, field: &str, reason: &str) -> MeasureResult<()> {
    if ok {
        Ok(())
    } else {
        Err(MeasureError::setting(field, reason))
    }
}

impl MeasureSettings {
    pub fn validate(&self) -> MeasureResult<()> {
        let c = &self.sampler.center;
        check(c.tolerance_px > 0.0, "sampler.center.tolerance_px", "must be positive")?;
        check(
            c.annulus_inner_frac >= 0.0 && c.annulus_inner_frac < c.annulus_outer_frac,
            "sampler.center.annulus_inner_frac",
            "must be non-negative and below annulus_outer_frac",
        )?;
        check(
            c.annulus_outer_frac <= 1.0,
            "sampler.center.annulus_outer_frac",
            "must not exceed 1",
        )?;

        let s = &self.star;
        check(s.num_radii >= 2, "star.num_radii", "need at least two rings")?;
        check(
            s.angular_oversampling >= 1.0,
            "star.angular_oversampling",
            "must be at least 1",
        )?;
        check(
            s.min_samples_per_cycle >= 2.0,
            "star.min_samples_per_cycle",
            "must be at least 2",
        )?;
        check(s.harmonic >= 1, "star.harmonic", "must be at least 1")?;

        let e = &self.edge;
        check(e.oversampling >= 2, "edge.oversampling", "must be at least 2")?;
        check(
            e.min_angle_deg >= 0.0 && e.min_angle_deg < e.max_angle_deg && e.max_angle_deg < 45.0,
            "edge.min_angle_deg",
            "need 0 <= min_angle_deg < max_angle_deg < 45",
        )?;
        check(
            e.esf_half_width_px >= 4.0,
            "edge.esf_half_width_px",
            "must be at least 4 px",
        )?;
        check(
            e.esf_smoothing_bins % 2 == 1,
            "edge.esf_smoothing_bins",
            "must be odd",
        )?;
        check(
            e.min_aperture_response > 0.0 && e.min_aperture_response < 1.0,
            "edge.min_aperture_response",
            "must lie in (0, 1)",
        )?;
        check(e.fit_outlier_px > 0.0, "edge.fit_outlier_px", "must be positive")?;
        check(e.fit_window_px >= 2.0, "edge.fit_window_px", "must be at least 2 px")?;
        check(e.max_frequency > 0.0, "edge.max_frequency", "must be positive")?;

        check(
            self.mtf.threshold > 0.0 && self.mtf.threshold < 1.0,
            "mtf.threshold",
            "must lie in (0, 1)",
        )?;

        self.metric.metric.validate()?;

        let p = &self.peak;
        check(
            p.smoothing_window % 2 == 1,
            "peak.smoothing_window",
            "must be odd",
        )?;
        check(
            p.width_fraction > 0.0 && p.width_fraction < 1.0,
            "peak.width_fraction",
            "must lie in (0, 1)",
        )?;
        check(p.flat_tolerance >= 0.0, "peak.flat_tolerance", "must be non-negative")?;
        check(
            p.lobe_tolerance > 0.0 && p.lobe_tolerance <= 1.0,
            "peak.lobe_tolerance",
            "must lie in (0, 1]",
        )?;
        check(
            p.multi_lobe_penalty >= 0.0 && p.multi_lobe_penalty < 1.0,
            "peak.multi_lobe_penalty",
            "must lie in [0, 1)",
        )?;
        check(p.snr_reference > 0.0, "peak.snr_reference", "must be positive")?;

        check(
            self.sweep.workers != Some(0),
            "sweep.workers",
            "must be at least 1",
        )?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json).context("Failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load settings from disk
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    /// Load settings, writing the defaults on first use
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            return Ok(settings);
        }
        Self::load(path)
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json_string()?)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }
}
