//! Per-step records and their per-stage summaries.

use mvfuse_core::Stage;
use serde::Serialize;

/// Loss and batch metric of a single `get_loss_metrics` call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub loss: f64,
    /// `None` when the metric is undefined for the batch (e.g. one class only).
    pub metric: Option<f64>,
}

/// Aggregate of one stage over one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub steps: usize,
    /// Mean of the per-step losses; `None` for an empty pass.
    pub mean_loss: Option<f64>,
    /// Metric accumulated over the whole pass.
    pub metric: Option<f64>,
}

impl StageSummary {
    /// Summarize the records of `stage` found in `records`.
    ///
    /// `metric` is the accumulator value for the pass, not an average of
    /// per-batch metrics.
    #[must_use]
    pub fn from_records(stage: Stage, records: &[StepRecord], metric: Option<f64>) -> Self {
        let (steps, loss_sum) = records
            .iter()
            .filter(|r| r.stage == stage)
            .fold((0usize, 0.0f64), |(n, sum), r| (n + 1, sum + r.loss));
        Self {
            stage,
            steps,
            mean_loss: (steps > 0).then(|| loss_sum / steps as f64),
            metric,
        }
    }
}
