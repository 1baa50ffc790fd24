//! Stateful evaluation metrics, one accumulator per stage.
//!
//! Accumulators are mutated in place and are not shared between threads; a
//! multi-worker driver keeps one per worker and combines them with
//! [`Metric::merge`].

use candle_core::{DType, Tensor};
use mvfuse_core::{FinetuneError, Result, Stage};
use std::cmp::Ordering;

/// An epoch-scoped metric accumulator.
pub trait Metric {
    /// Short name for log fields.
    fn name(&self) -> &'static str;

    /// Accumulate one batch and return the metric of that batch alone
    /// (`None` when undefined for the batch).
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] if predictions and targets disagree,
    /// [`FinetuneError::Metric`] if the predictions cannot be scored.
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<Option<f64>>;

    /// Metric over everything accumulated since the last reset.
    fn compute(&self) -> Option<f64>;

    /// Forget all accumulated state.
    fn reset(&mut self);

    /// Fold another accumulator of the same kind into this one.
    fn merge(&mut self, other: &Self);
}

// ---------------------------------------------------------------------------
// Multiclass AUROC
// ---------------------------------------------------------------------------

/// Macro-averaged one-vs-rest area under the ROC curve.
#[derive(Debug, Clone)]
pub struct MulticlassAuroc {
    num_classes: usize,
    /// Row-major `[n, num_classes]` class probabilities.
    probs: Vec<f32>,
    targets: Vec<u32>,
}

impl MulticlassAuroc {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            probs: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Number of accumulated samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn extract(&self, preds: &Tensor, targets: &Tensor) -> Result<(Vec<f32>, Vec<u32>)> {
        let (rows, cols) = preds.dims2().map_err(|_| {
            FinetuneError::ShapeMismatch(format!(
                "AUROC expects [batch, {}] probabilities, got {:?}",
                self.num_classes,
                preds.dims()
            ))
        })?;
        if cols != self.num_classes || targets.dims() != [rows] {
            return Err(FinetuneError::ShapeMismatch(format!(
                "AUROC predictions {:?} do not match {} classes and targets {:?}",
                preds.dims(),
                self.num_classes,
                targets.dims()
            )));
        }
        let probs: Vec<f32> = preds.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        if let Some(pos) = probs.iter().position(|p| !p.is_finite()) {
            return Err(FinetuneError::Metric(format!(
                "AUROC got non-finite probability {} at row {}, class {}",
                probs[pos],
                pos / self.num_classes,
                pos % self.num_classes
            )));
        }
        let labels: Vec<u32> = targets.to_dtype(DType::U32)?.to_vec1()?;
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= self.num_classes) {
            return Err(FinetuneError::ShapeMismatch(format!(
                "target class {bad} outside 0..{}",
                self.num_classes
            )));
        }
        Ok((probs, labels))
    }
}

impl Metric for MulticlassAuroc {
    fn name(&self) -> &'static str {
        "auroc"
    }

    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<Option<f64>> {
        let (probs, labels) = self.extract(preds, targets)?;
        let batch = macro_auroc(&probs, &labels, self.num_classes);
        self.probs.extend_from_slice(&probs);
        self.targets.extend_from_slice(&labels);
        Ok(batch)
    }

    fn compute(&self) -> Option<f64> {
        macro_auroc(&self.probs, &self.targets, self.num_classes)
    }

    fn reset(&mut self) {
        self.probs.clear();
        self.targets.clear();
    }

    fn merge(&mut self, other: &Self) {
        self.probs.extend_from_slice(&other.probs);
        self.targets.extend_from_slice(&other.targets);
    }
}

/// Average the one-vs-rest AUCs of every class that has both positive and
/// negative samples. `None` when no class qualifies.
fn macro_auroc(probs: &[f32], targets: &[u32], num_classes: usize) -> Option<f64> {
    let mut sum = 0.0;
    let mut counted = 0usize;
    for class in 0..num_classes {
        let scores: Vec<f32> = probs.iter().skip(class).step_by(num_classes).copied().collect();
        let positives: Vec<bool> = targets.iter().map(|&t| t as usize == class).collect();
        if let Some(auc) = binary_auc(&scores, &positives) {
            sum += auc;
            counted += 1;
        }
    }
    if counted == 0 {
        None
    } else {
        Some(sum / counted as f64)
    }
}

/// Tie-aware binary ROC AUC (tied scores count half). `None` if either class
/// is absent.
pub fn binary_auc(scores: &[f32], positives: &[bool]) -> Option<f64> {
    let n = scores.len();
    if n == 0 || positives.len() != n {
        return None;
    }
    let mut items: Vec<(f32, bool)> = scores.iter().copied().zip(positives.iter().copied()).collect();
    items.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n_pos = items.iter().filter(|(_, p)| *p).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return None;
    }

    let mut auc_num = 0.0f64;
    let mut neg_below = 0.0f64;
    let mut i = 0;
    while i < n {
        let s = items[i].0;
        let mut j = i;
        let mut pos_tied = 0.0f64;
        let mut neg_tied = 0.0f64;
        // `total_cmp` keeps every group non-empty, NaN included.
        while j < n && items[j].0.total_cmp(&s) == Ordering::Equal {
            if items[j].1 {
                pos_tied += 1.0;
            } else {
                neg_tied += 1.0;
            }
            j += 1;
        }
        auc_num += pos_tied * neg_below + 0.5 * pos_tied * neg_tied;
        neg_below += neg_tied;
        i = j;
    }
    Some(auc_num / (n_pos * n_neg))
}

// ---------------------------------------------------------------------------
// Mean absolute error
// ---------------------------------------------------------------------------

/// Running mean absolute error.
#[derive(Debug, Clone, Default)]
pub struct MeanAbsoluteError {
    abs_error_sum: f64,
    count: usize,
}

impl MeanAbsoluteError {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &'static str {
        "mae"
    }

    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<Option<f64>> {
        if preds.rank() != 1 || preds.dims() != targets.dims() {
            return Err(FinetuneError::ShapeMismatch(format!(
                "MAE expects matching [batch] tensors, got {:?} and {:?}",
                preds.dims(),
                targets.dims()
            )));
        }
        let preds: Vec<f32> = preds.to_dtype(DType::F32)?.to_vec1()?;
        let targets: Vec<f32> = targets.to_dtype(DType::F32)?.to_vec1()?;
        if preds.is_empty() {
            return Ok(None);
        }
        let batch_sum: f64 = preds
            .iter()
            .zip(&targets)
            .map(|(p, t)| f64::from((p - t).abs()))
            .sum();
        self.abs_error_sum += batch_sum;
        self.count += preds.len();
        Ok(Some(batch_sum / preds.len() as f64))
    }

    fn compute(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.abs_error_sum / self.count as f64)
        }
    }

    fn reset(&mut self) {
        self.abs_error_sum = 0.0;
        self.count = 0;
    }

    fn merge(&mut self, other: &Self) {
        self.abs_error_sum += other.abs_error_sum;
        self.count += other.count;
    }
}

// ---------------------------------------------------------------------------
// Per-stage accumulators
// ---------------------------------------------------------------------------

/// Three independent accumulators, one per [`Stage`].
#[derive(Debug, Clone)]
pub struct StageMetrics<M> {
    train: M,
    val: M,
    test: M,
}

impl<M: Metric> StageMetrics<M> {
    /// Build one fresh accumulator per stage.
    pub fn new(mut make: impl FnMut() -> M) -> Self {
        Self {
            train: make(),
            val: make(),
            test: make(),
        }
    }

    pub fn get(&self, stage: Stage) -> &M {
        match stage {
            Stage::Train => &self.train,
            Stage::Val => &self.val,
            Stage::Test => &self.test,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut M {
        match stage {
            Stage::Train => &mut self.train,
            Stage::Val => &mut self.val,
            Stage::Test => &mut self.test,
        }
    }
}
