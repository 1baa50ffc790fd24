//! Task head: projection, loss, output transform and per-stage metrics.
//!
//! The head is built once for a [`TaskMode`] and never re-checks the mode per
//! call; everything task-specific hangs off the [`HeadKind`] variant.
//!
//! # Projection
//!
//! ```text
//! [B, C] → Linear(C, C) → ReLU → Linear(C, 3)                  (classification)
//! [B, C] → Linear(C, C) → ReLU → Linear(C, 1) → sigmoid × 100  (regression)
//! ```

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use mvfuse_core::{FinetuneError, Result, Stage, TaskMode, NUM_CLASSES, SCORE_SCALE};
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::metrics::{MeanAbsoluteError, Metric, MulticlassAuroc, StageMetrics};
use crate::params::{self, Parameter};

/// Huber transition point of the smooth absolute-error loss.
const SMOOTH_L1_BETA: f64 = 1.0;

/// Task-specific state of a [`TaskHead`].
#[derive(Debug, Clone)]
pub enum HeadKind {
    Classification(StageMetrics<MulticlassAuroc>),
    Regression(StageMetrics<MeanAbsoluteError>),
}

/// The two views of one projection output.
#[derive(Debug, Clone)]
pub struct HeadOutputs {
    /// Log-probabilities `[B, 3]` or scores `[B]`.
    pub loss_input: Tensor,
    /// Probabilities `[B, 3]` or scores `[B]`.
    pub metric_input: Tensor,
}

/// Task head sitting on top of the pooled fusion features.
pub struct TaskHead {
    varmap: VarMap,
    fc1: Linear,
    fc2: Linear,
    hidden: usize,
    kind: HeadKind,
}

impl TaskHead {
    /// Build a freshly initialised head for `mode`.
    ///
    /// # Errors
    ///
    /// Fails if parameter allocation fails on `device`.
    pub fn build(mode: TaskMode, hidden: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let outputs = match mode {
            TaskMode::Classification => NUM_CLASSES,
            TaskMode::Regression => 1,
        };
        let fc1 = candle_nn::linear(hidden, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden, outputs, vb.pp("fc2"))?;
        let kind = match mode {
            TaskMode::Classification => {
                HeadKind::Classification(StageMetrics::new(|| MulticlassAuroc::new(NUM_CLASSES)))
            }
            TaskMode::Regression => HeadKind::Regression(StageMetrics::new(MeanAbsoluteError::new)),
        };
        Ok(Self {
            varmap,
            fc1,
            fc2,
            hidden,
            kind,
        })
    }

    #[must_use]
    pub fn mode(&self) -> TaskMode {
        match self.kind {
            HeadKind::Classification(_) => TaskMode::Classification,
            HeadKind::Regression(_) => TaskMode::Regression,
        }
    }

    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// `[B, C]` → raw output: logits `[B, 3]` or scores in `[0, 100]` `[B, 1]`.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] unless `pooled` is `[batch, hidden]`.
    pub fn project(&self, pooled: &Tensor) -> Result<Tensor> {
        match pooled.dims() {
            [_, c] if *c == self.hidden => {}
            other => {
                return Err(FinetuneError::ShapeMismatch(format!(
                    "task head expects [batch, {}], got {other:?}",
                    self.hidden
                )))
            }
        }
        let hidden = self.fc1.forward(pooled)?.relu()?;
        let out = self.fc2.forward(&hidden)?;
        match self.kind {
            HeadKind::Classification(_) => Ok(out),
            HeadKind::Regression(_) => Ok((candle_nn::ops::sigmoid(&out)? * SCORE_SCALE)?),
        }
    }

    /// Split a raw output into loss and metric inputs.
    ///
    /// # Errors
    ///
    /// Tensor errors only.
    pub fn transform(&self, raw: &Tensor) -> Result<HeadOutputs> {
        match self.kind {
            HeadKind::Classification(_) => Ok(HeadOutputs {
                loss_input: candle_nn::ops::log_softmax(raw, D::Minus1)?,
                metric_input: candle_nn::ops::softmax(raw, D::Minus1)?,
            }),
            HeadKind::Regression(_) => {
                let flat = raw.flatten_all()?;
                Ok(HeadOutputs {
                    loss_input: flat.clone(),
                    metric_input: flat,
                })
            }
        }
    }

    /// Scalar loss: NLL over log-probabilities, or smooth L1 over scores.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] if `targets` has the wrong length or
    /// dtype for the task.
    pub fn loss(&self, loss_input: &Tensor, targets: &Tensor) -> Result<Tensor> {
        self.check_targets(loss_input, targets)?;
        match self.kind {
            HeadKind::Classification(_) => Ok(candle_nn::loss::nll(loss_input, targets)?),
            HeadKind::Regression(_) => smooth_l1_loss(loss_input, targets),
        }
    }

    /// Feed one batch into the accumulator of `stage` and return the batch value.
    ///
    /// # Errors
    ///
    /// Shape errors from the metric.
    pub fn update_metric(&mut self, stage: Stage, metric_input: &Tensor, targets: &Tensor) -> Result<Option<f64>> {
        self.check_targets(metric_input, targets)?;
        let metric_input = metric_input.detach();
        match &mut self.kind {
            HeadKind::Classification(m) => m.get_mut(stage).update(&metric_input, targets),
            HeadKind::Regression(m) => m.get_mut(stage).update(&metric_input, targets),
        }
    }

    /// Accumulated metric of `stage` since its last reset.
    #[must_use]
    pub fn compute_metric(&self, stage: Stage) -> Option<f64> {
        match &self.kind {
            HeadKind::Classification(m) => m.get(stage).compute(),
            HeadKind::Regression(m) => m.get(stage).compute(),
        }
    }

    pub fn reset_metric(&mut self, stage: Stage) {
        match &mut self.kind {
            HeadKind::Classification(m) => m.get_mut(stage).reset(),
            HeadKind::Regression(m) => m.get_mut(stage).reset(),
        }
    }

    /// `auroc` or `mae`.
    #[must_use]
    pub fn metric_name(&self) -> &'static str {
        match &self.kind {
            HeadKind::Classification(m) => m.get(Stage::Train).name(),
            HeadKind::Regression(m) => m.get(Stage::Train).name(),
        }
    }

    /// Restore head parameters saved by a previous finetuning run.
    ///
    /// # Errors
    ///
    /// Checkpoint read, key or shape errors.
    pub fn load_checkpoint(&mut self, path: &Path, device: &Device) -> Result<()> {
        let restored = Checkpoint::read(path, device)?.restore(&self.varmap, "")?;
        tracing::info!(path = %path.display(), parameters = restored, "Task head checkpoint loaded");
        Ok(())
    }

    /// The head is always trainable.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter> {
        params::collect(&self.varmap, true)
    }

    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        params::trainable_vars(&self.varmap, true)
    }

    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn check_targets(&self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let batch = preds.dims().first().copied().unwrap_or(0);
        let expected = match self.kind {
            HeadKind::Classification(_) => DType::U32,
            HeadKind::Regression(_) => DType::F32,
        };
        if targets.dims() != [batch] || targets.dtype() != expected {
            return Err(FinetuneError::ShapeMismatch(format!(
                "expected {expected:?} targets of shape [{batch}], got {:?} {:?}",
                targets.dtype(),
                targets.dims()
            )));
        }
        Ok(())
    }
}

/// Mean Huber-style absolute error with `beta = 1`.
fn smooth_l1_loss(preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let diff = (preds - targets)?.abs()?;
    let quadratic = ((&diff * &diff)? * (0.5 / SMOOTH_L1_BETA))?;
    let linear = (&diff - 0.5 * SMOOTH_L1_BETA)?;
    let small = diff.lt(SMOOTH_L1_BETA)?;
    Ok(small.where_cond(&quadratic, &linear)?.mean_all()?)
}
