//! Optical focus and sharpness measurement.
//!
//! Turns frames of calibration targets into MTF curves (Siemens star or
//! slanted edge), single-number focus metrics, and best-focus estimates over
//! a focus sweep.

pub mod error;
pub mod focus_curve;
pub mod frame;
pub mod geometry;
pub mod mtf;
pub mod pipeline;
pub mod sampler;
pub mod settings;
pub mod sharpness;
pub mod siemens;
pub mod slanted_edge;
pub mod spectral;
pub mod stack;
pub mod synthetic;

pub use error::{Advisory, MeasureError, Result};
pub use focus_curve::{CurveShape, CurveState, FocusCurve, FocusMetricSample, FocusOutcome, PeakEstimate};
pub use frame::{ClipFlags, Frame, Roi, RoiView};
pub use geometry::{EdgeGeometry, StarGeometry, StarWaveform, TargetGeometry};
pub use mtf::{measure_mtf, FrequencyPoint, MtfCurve, MtfProducer};
pub use pipeline::{run_focus_and_mtf, run_sweep, CancelToken, SweepEntry, SweepProgress, SweepReport};
pub use settings::MeasureSettings;
pub use sharpness::{FocusMetric, MetricKind, MetricRegion, MetricValue};
