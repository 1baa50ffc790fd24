//! Composition of the pretrained sub-models with a task head.
//!
//! # Pipeline
//!
//! ```text
//! volumes [B, X, Y, Z]
//!   → ViewEnsemble::forward_all   [B, T, V, C]
//!   → FusionNetwork::forward      [B, T, V, C]
//!   → reshape (B, T·V, C), mean over axis 1   [B, C]
//!   → TaskHead::project           [B, 3] | [B, 1]
//! ```

use candle_core::{DType, Device, Tensor, Var};
use mvfuse_core::{FinetuneConfig, FinetuneError, ModelConfig, Result, Stage, TaskMode};
use std::path::{Path, PathBuf};

use crate::checkpoint;
use crate::ensemble::ViewEnsemble;
use crate::fusion::FusionNetwork;
use crate::head::TaskHead;
use crate::params::{self, Parameter};
use crate::report::StepRecord;

/// File names inside a finetuned model directory.
pub const ENSEMBLE_FILE: &str = "ensemble.safetensors";
pub const FUSION_FILE: &str = "fusion.safetensors";
pub const HEAD_FILE: &str = "head.safetensors";

/// Everything needed to construct a [`ModelComposer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ComposerConfig {
    pub ensemble_checkpoint: PathBuf,
    pub fusion_checkpoint: PathBuf,
    pub finetune_ensemble: bool,
    pub finetune_fusion: bool,
    pub mode: TaskMode,
    pub hidden_size: usize,
    pub model: ModelConfig,
}

impl ComposerConfig {
    #[must_use]
    pub fn from_finetune_config(config: &FinetuneConfig) -> Self {
        Self {
            ensemble_checkpoint: config.ensemble_checkpoint_path.clone(),
            fusion_checkpoint: config.fusion_checkpoint_path.clone(),
            finetune_ensemble: config.finetune_ensemble,
            finetune_fusion: config.finetune_fusion,
            mode: config.task_mode(),
            hidden_size: config.hidden_size,
            model: config.model.clone(),
        }
    }
}

/// Ensemble, fusion network and task head wired into one model.
pub struct ModelComposer {
    ensemble: ViewEnsemble,
    fusion: FusionNetwork,
    head: TaskHead,
    records: Vec<StepRecord>,
}

impl ModelComposer {
    /// Build both sub-models, load their pretrained checkpoints, freeze them
    /// per the finetune flags, and attach a fresh task head.
    ///
    /// # Errors
    ///
    /// Checkpoint errors are fatal: [`FinetuneError::CheckpointShape`] when a
    /// stored shape differs from the configured architecture,
    /// [`FinetuneError::Checkpoint`] for unreadable files or key mismatches.
    pub fn new(config: &ComposerConfig, device: &Device) -> Result<Self> {
        let mut ensemble = ViewEnsemble::new(config.hidden_size, &config.model, device)?;
        ensemble.load_checkpoint(&config.ensemble_checkpoint, device)?;
        ensemble.set_trainable(config.finetune_ensemble);

        let mut fusion = FusionNetwork::new(config.hidden_size, &config.model, device)?;
        fusion.load_checkpoint(&config.fusion_checkpoint, device)?;
        fusion.set_trainable(config.finetune_fusion);

        let head = TaskHead::build(config.mode, config.hidden_size, device)?;
        let composer = Self::from_parts(ensemble, fusion, head)?;

        tracing::info!(
            mode = %config.mode,
            hidden_size = config.hidden_size,
            finetune_ensemble = config.finetune_ensemble,
            finetune_fusion = config.finetune_fusion,
            trainable_parameters = params::element_count(
                &composer
                    .parameters()
                    .into_iter()
                    .filter(|p| p.trainable)
                    .collect::<Vec<_>>()
            ),
            "Model composer ready"
        );
        Ok(composer)
    }

    /// Wire already-built components together.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] if the components disagree on the
    /// hidden size.
    pub fn from_parts(ensemble: ViewEnsemble, fusion: FusionNetwork, head: TaskHead) -> Result<Self> {
        let hidden = ensemble.hidden_size();
        if fusion.hidden_size() != hidden || head.hidden_size() != hidden {
            return Err(FinetuneError::ShapeMismatch(format!(
                "hidden sizes disagree: ensemble {hidden}, fusion {}, head {}",
                fusion.hidden_size(),
                head.hidden_size()
            )));
        }
        Ok(Self {
            ensemble,
            fusion,
            head,
            records: Vec::new(),
        })
    }

    /// Rebuild a model saved with [`ModelComposer::save`].
    ///
    /// The checkpoint paths of `config` are ignored; `dir` supplies all three.
    ///
    /// # Errors
    ///
    /// See [`ModelComposer::new`].
    pub fn load_finetuned(dir: &Path, config: &ComposerConfig, device: &Device) -> Result<Self> {
        let mut composer = Self::new(
            &ComposerConfig {
                ensemble_checkpoint: dir.join(ENSEMBLE_FILE),
                fusion_checkpoint: dir.join(FUSION_FILE),
                ..config.clone()
            },
            device,
        )?;
        composer.head.load_checkpoint(&dir.join(HEAD_FILE), device)?;
        Ok(composer)
    }

    /// Overwrite all parameters in place from a directory written by
    /// [`ModelComposer::save`]. Trainable flags are kept.
    ///
    /// # Errors
    ///
    /// Checkpoint read, key or shape errors.
    pub fn restore(&mut self, dir: &Path, device: &Device) -> Result<()> {
        self.ensemble.load_checkpoint(&dir.join(ENSEMBLE_FILE), device)?;
        self.fusion.load_checkpoint(&dir.join(FUSION_FILE), device)?;
        self.head.load_checkpoint(&dir.join(HEAD_FILE), device)
    }

    /// Write ensemble, fusion and head parameters under `dir`.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Checkpoint`] or I/O errors.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        checkpoint::save(self.ensemble.varmap(), &dir.join(ENSEMBLE_FILE))?;
        checkpoint::save(self.fusion.varmap(), &dir.join(FUSION_FILE))?;
        checkpoint::save(self.head.varmap(), &dir.join(HEAD_FILE))?;
        tracing::info!(dir = %dir.display(), "Finetuned model saved");
        Ok(())
    }

    /// Inference-mode forward pass: `[B, X, Y, Z]` → raw head output.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] on any pipeline shape violation.
    pub fn forward(&self, volumes: &Tensor) -> Result<Tensor> {
        self.forward_t(volumes, false)
    }

    /// Forward pass; `train` enables dropout in the sub-models that are not
    /// frozen.
    ///
    /// # Errors
    ///
    /// See [`ModelComposer::forward`].
    pub fn forward_t(&self, volumes: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.ensemble.forward_all(volumes, train)?;
        let fused = self.fusion.forward(&features, train)?;
        let (batch, time, views, channels) = fused.dims4()?;
        let pooled = fused.reshape((batch, time * views, channels))?.mean(1)?;
        self.head.project(&pooled)
    }

    /// One step of `stage`: forward, update the stage metric, return the loss.
    ///
    /// Training dropout is active only for [`Stage::Train`]. The loss and
    /// batch metric are buffered as a [`StepRecord`] for
    /// [`ModelComposer::drain_records`].
    ///
    /// # Errors
    ///
    /// Any failure, wrapped in [`FinetuneError::Step`] naming `stage`.
    pub fn get_loss_metrics(&mut self, volumes: &Tensor, labels: &Tensor, stage: Stage) -> Result<Tensor> {
        self.step(volumes, labels, stage)
            .map_err(|e| e.in_stage(stage))
    }

    fn step(&mut self, volumes: &Tensor, labels: &Tensor, stage: Stage) -> Result<Tensor> {
        let raw = self.forward_t(volumes, stage == Stage::Train)?;
        let outputs = self.head.transform(&raw)?;
        let metric = self.head.update_metric(stage, &outputs.metric_input, labels)?;
        let loss = self.head.loss(&outputs.loss_input, labels)?;

        let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        tracing::debug!(
            stage = %stage,
            loss = loss_value,
            metric = ?metric,
            metric_name = self.head.metric_name(),
            "Step"
        );
        self.records.push(StepRecord {
            stage,
            loss: loss_value,
            metric,
        });
        Ok(loss)
    }

    /// Take the step records buffered since the last drain.
    pub fn drain_records(&mut self) -> Vec<StepRecord> {
        std::mem::take(&mut self.records)
    }

    /// Accumulated metric of `stage` since its last reset.
    #[must_use]
    pub fn epoch_metric(&self, stage: Stage) -> Option<f64> {
        self.head.compute_metric(stage)
    }

    pub fn reset_metric(&mut self, stage: Stage) {
        self.head.reset_metric(stage);
    }

    #[must_use]
    pub fn metric_name(&self) -> &'static str {
        self.head.metric_name()
    }

    #[must_use]
    pub fn mode(&self) -> TaskMode {
        self.head.mode()
    }

    /// Every parameter, names prefixed by `ensemble.`, `fusion.` or `head.`.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter> {
        let prefixed = |prefix: &str, params: Vec<Parameter>| {
            params
                .into_iter()
                .map(|p| Parameter {
                    name: format!("{prefix}.{}", p.name),
                    ..p
                })
                .collect::<Vec<_>>()
        };
        let mut all = prefixed("ensemble", self.ensemble.parameters());
        all.extend(prefixed("fusion", self.fusion.parameters()));
        all.extend(prefixed("head", self.head.parameters()));
        all
    }

    /// The only variables an optimizer should be built over.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.ensemble.trainable_vars();
        vars.extend(self.fusion.trainable_vars());
        vars.extend(self.head.trainable_vars());
        vars
    }

    #[must_use]
    pub fn ensemble(&self) -> &ViewEnsemble {
        &self.ensemble
    }

    #[must_use]
    pub fn fusion(&self) -> &FusionNetwork {
        &self.fusion
    }

    #[must_use]
    pub fn head(&self) -> &TaskHead {
        &self.head
    }
}
