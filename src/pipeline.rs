use crate::error::{MeasureError, Result};
use crate::focus_curve::{FocusCurve, FocusMetricSample, FocusOutcome};
use crate::frame::Frame;
use crate::geometry::TargetGeometry;
use crate::mtf::{measure_mtf, MtfCurve};
use crate::settings::MeasureSettings;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A frame captured at a commanded stage position.
#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub position: f64,
    pub frame: Frame,
}

/// Cooperative cancellation shared between the caller and a running sweep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepProgress {
    pub completed: usize,
    pub total: usize,
    pub percentage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Failed { error: MeasureError },
    /// Not started because the sweep was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Index of the entry in the caller's input.
    pub index: usize,
    pub position: f64,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Completed,
    /// Partial results; the curve was left in its collecting state.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub status: SweepStatus,
    pub curve: FocusCurve,
    /// One entry per input, in position order.
    pub units: Vec<UnitReport>,
}

impl SweepReport {
    pub fn outcome(&self) -> Option<&FocusOutcome> {
        self.curve.outcome()
    }
}

/// MTF measured on the frame nearest the best-focus estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusMtfReport {
    pub sweep: SweepReport,
    /// Input index and position of the frame chosen for the MTF.
    pub best_index: Option<usize>,
    pub best_position: Option<f64>,
    pub mtf: Option<std::result::Result<MtfCurve, MeasureError>>,
}

/// Evaluates the configured focus metric on every entry in parallel and
/// reduces the results, in position order, into an analyzed focus curve.
///
/// Failing entries are reported per unit and never abort their siblings.
/// `target` is needed when the metric region is a star annulus.
pub fn run_sweep<F>(
    entries: &[SweepEntry],
    target: Option<&TargetGeometry>,
    settings: &MeasureSettings,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<SweepReport>
where
    F: Fn(SweepProgress) + Sync,
{
    settings.validate()?;

    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        entries[a]
            .position
            .total_cmp(&entries[b].position)
            .then(a.cmp(&b))
    });
    let mut last = f64::NEG_INFINITY;
    for &i in &order {
        let position = entries[i].position;
        if !(position.is_finite() && position > last) {
            return Err(MeasureError::SampleOutOfOrder { position, last });
        }
        last = position;
    }

    let star = match target {
        Some(TargetGeometry::Star(star)) => Some(star),
        _ => None,
    };
    let metric = &settings.metric;
    let total = entries.len();
    let completed = AtomicUsize::new(0);

    let work = || -> Vec<(usize, std::result::Result<Option<FocusMetricSample>, MeasureError>)> {
        entries
            .par_iter()
            .enumerate()
            .map(|(index, entry)| {
                if cancel.is_cancelled() {
                    return (index, Ok(None));
                }
                let result = metric.region.view(&entry.frame, star, &settings.sampler.center).map(|view| {
                    let value = metric.metric.evaluate(&view);
                    Some(FocusMetricSample {
                        position: entry.position,
                        value: value.value,
                        kind: value.kind,
                        valid: true,
                        advisory: value.advisory,
                    })
                });

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(SweepProgress {
                    completed: done,
                    total,
                    percentage: (done as f32 / total as f32) * 100.0,
                });
                (index, result)
            })
            .collect()
    };

    let workers = settings.sweep.workers.unwrap_or_else(num_cpus::get);
    let mut results = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(work),
        Err(e) => {
            warn!("failed to build a {workers}-thread pool ({e}), using the global pool");
            work()
        }
    };
    // completion order is arbitrary; restore input order before reducing
    results.sort_by_key(|(index, _)| *index);

    let mut curve = FocusCurve::new();
    let mut units = Vec::with_capacity(total);
    for &index in &order {
        let position = entries[index].position;
        let (_, result) = &results[index];
        let status = match result {
            Ok(Some(sample)) => {
                curve.push(sample.clone())?;
                UnitStatus::Completed
            }
            Ok(None) => UnitStatus::Skipped,
            Err(error) => {
                warn!("sweep unit {index} at {position} failed: {error}");
                curve.push(FocusMetricSample {
                    position,
                    value: 0.0,
                    kind: metric.metric.kind(),
                    valid: false,
                    advisory: None,
                })?;
                UnitStatus::Failed {
                    error: error.clone(),
                }
            }
        };
        units.push(UnitReport {
            index,
            position,
            status,
        });
    }

    let skipped = units
        .iter()
        .filter(|u| u.status == UnitStatus::Skipped)
        .count();
    // a cancel that lands after the last unit still leaves a complete sweep
    let status = if skipped > 0 {
        info!("sweep cancelled: {} of {total} units skipped", skipped);
        SweepStatus::Cancelled
    } else {
        curve.finalize()?;
        curve.analyze(&settings.peak)?;
        info!("sweep finished: {total} units");
        SweepStatus::Completed
    };

    Ok(SweepReport {
        status,
        curve,
        units,
    })
}

/// Runs a sweep, then measures the MTF of `target` on the frame nearest the
/// best-focus position (or the best-effort position of an inconclusive curve).
pub fn run_focus_and_mtf<F>(
    entries: &[SweepEntry],
    target: &TargetGeometry,
    settings: &MeasureSettings,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<FocusMtfReport>
where
    F: Fn(SweepProgress) + Sync,
{
    let sweep = run_sweep(entries, Some(target), settings, cancel, on_progress)?;

    let best = sweep.outcome().and_then(FocusOutcome::peak).and_then(|peak| {
        entries
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                (a.position - peak.position)
                    .abs()
                    .total_cmp(&(b.position - peak.position).abs())
                    .then(ia.cmp(ib))
            })
            .map(|(i, _)| i)
    });

    let mtf = best.map(|i| {
        let result = measure_mtf(&entries[i].frame, target, settings);
        if let Err(e) = &result {
            warn!("MTF at best focus (entry {i}) failed: {e}");
        }
        result
    });

    Ok(FocusMtfReport {
        best_index: best,
        best_position: best.map(|i| entries[i].position),
        sweep,
        mtf,
    })
}
