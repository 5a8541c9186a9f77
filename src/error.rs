use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard failures of a single measurement.
///
/// Every variant carries the parameters that caused it so callers can report
/// them without re-deriving anything. None of these leave partial state behind:
/// the engine never mutates its inputs.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum MeasureError {
    #[error(
        "{what} spans x [{min_x:.2}, {max_x:.2}], y [{min_y:.2}, {max_y:.2}] \
         outside the {width}x{height} frame"
    )]
    GeometryOutOfBounds {
        what: String,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        width: u32,
        height: u32,
    },

    #[error("degenerate geometry: {reason}")]
    DegenerateGeometry { reason: String },

    #[error(
        "ring at radius {radius:.2} px has {samples_per_cycle:.2} samples per cycle, \
         at least {required:.2} required"
    )]
    InsufficientAngularSampling {
        radius: f64,
        samples_per_cycle: f64,
        required: f64,
    },

    #[error("edge angle {angle_deg:.2} deg is outside the supported range [{min_deg:.2}, {max_deg:.2}]")]
    EdgeAngleOutOfRange {
        angle_deg: f64,
        min_deg: f64,
        max_deg: f64,
    },

    #[error(
        "modulation never crosses {threshold:.2} (curve spans {min_modulation:.3}..{max_modulation:.3} \
         up to {max_frequency:.4} cy/px)"
    )]
    NoCrossing {
        threshold: f64,
        min_modulation: f64,
        max_modulation: f64,
        max_frequency: f64,
    },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSettings { field: String, reason: String },

    #[error("focus curve is {state}, cannot {action}")]
    SweepState { state: String, action: String },

    #[error("sample at position {position} precedes the last accepted position {last}")]
    SampleOutOfOrder { position: f64, last: f64 },
}

pub type Result<T> = std::result::Result<T, MeasureError>;

impl MeasureError {
    pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
        MeasureError::DegenerateGeometry {
            reason: reason.into(),
        }
    }

    pub(crate) fn setting(field: &str, reason: impl Into<String>) -> Self {
        MeasureError::InvalidSettings {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Warning-grade annotations attached to values that are still returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Advisory {
    /// The source pixels were clipped, so the metric no longer scales with focus alone.
    UnreliableMetric { saturated: bool, black_clipped: bool },
}
