//! Training-loop driver: split, finetune, keep the best model, test.

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use mvfuse_core::{FinetuneConfig, FinetuneError, Result, Stage};
use mvfuse_data::{BatchIterator, DatasetSplits, Manifest, ManifestSplitter, SplitPlan, VolumeSource};
use mvfuse_model::{ComposerConfig, ModelComposer, StageSummary};
use serde::Serialize;

/// Train and validation summaries of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    /// 1-based.
    pub epoch: usize,
    pub train: StageSummary,
    pub val: StageSummary,
    /// Whether this epoch set a new best monitored loss (and was saved).
    pub improved: bool,
}

/// Outcome of [`fit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitReport {
    pub epochs: Vec<EpochSummary>,
    pub best_epoch: Option<usize>,
    pub test: StageSummary,
}

/// Run the full pipeline from `config`: parse the manifest, split it, load
/// the pretrained sub-models, finetune, and test.
///
/// # Errors
///
/// Every failure is fatal and returned as is.
pub fn run(config: &FinetuneConfig, device: &Device) -> Result<FitReport> {
    config.validate()?;
    let splits = build_splits(config)?;
    let mut composer = ModelComposer::new(&ComposerConfig::from_finetune_config(config), device)?;
    fit(config, &mut composer, &splits, device)
}

/// Compute the split sizes for the configured manifest without decoding any
/// image or loading any model.
///
/// # Errors
///
/// Manifest and ratio errors.
pub fn plan(config: &FinetuneConfig) -> Result<SplitPlan> {
    config.validate()?;
    let manifest = Manifest::load(&config.manifest_path, config.task_mode())?;
    splitter(config)?.plan(manifest.len())
}

/// Evaluate the finetuned model saved under `model_checkpoint_dir` on the
/// test partition.
///
/// # Errors
///
/// Checkpoint, manifest and step errors.
pub fn evaluate(config: &FinetuneConfig, device: &Device) -> Result<StageSummary> {
    config.validate()?;
    let splits = build_splits(config)?;
    let mut composer = ModelComposer::load_finetuned(
        &config.model_checkpoint_dir,
        &ComposerConfig::from_finetune_config(config),
        device,
    )?;
    let mut batches = BatchIterator::new(&splits.test, config.eval_batch_size, device);
    run_eval(&mut composer, &mut batches, Stage::Test)
}

/// Finetune `composer` on `splits`.
///
/// Each epoch runs the train partition (reshuffled per epoch) with an AdamW
/// step per batch, then the validation partition. Whenever the mean
/// validation loss improves the model is written to `model_checkpoint_dir`.
/// Training stops after `max_epochs`, or earlier once `patience` epochs pass
/// without improvement. The best saved model is restored before the final
/// test pass.
///
/// # Errors
///
/// Any step, decode or checkpoint error aborts the run.
pub fn fit(
    config: &FinetuneConfig,
    composer: &mut ModelComposer,
    splits: &DatasetSplits,
    device: &Device,
) -> Result<FitReport> {
    let mut optimizer = AdamW::new(
        composer.trainable_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )?;

    let mut train_batches = BatchIterator::new(&splits.train, config.train_batch_size, device);
    let mut val_batches = BatchIterator::new(&splits.val, config.eval_batch_size, device);

    tracing::info!(
        train = splits.train.len(),
        val = splits.val.len(),
        test = splits.test.len(),
        discarded = splits.plan.discard_size,
        lr = config.learning_rate,
        weight_decay = config.weight_decay,
        max_epochs = config.max_epochs,
        metric = composer.metric_name(),
        "Finetuning started"
    );

    let mut best_loss = f64::INFINITY;
    let mut best_epoch: Option<usize> = None;
    let mut stale_epochs = 0usize;
    let mut epochs = Vec::with_capacity(config.max_epochs);

    for epoch in 0..config.max_epochs {
        train_batches.reshuffle(config.random_seed, epoch);
        while let Some(batch) = train_batches
            .next_batch()
            .map_err(|e| e.in_stage(Stage::Train))?
        {
            let loss = composer.get_loss_metrics(&batch.volumes, &batch.labels, Stage::Train)?;
            optimizer
                .backward_step(&loss)
                .map_err(|e| FinetuneError::from(e).in_stage(Stage::Train))?;
        }
        let train = close_stage(composer, Stage::Train);

        val_batches.rewind();
        let val = run_eval(composer, &mut val_batches, Stage::Val)?;

        // An empty validation partition falls back to the training loss.
        let improved = match val.mean_loss.or(train.mean_loss) {
            Some(loss) if loss < best_loss => {
                best_loss = loss;
                best_epoch = Some(epoch + 1);
                stale_epochs = 0;
                composer.save(&config.model_checkpoint_dir)?;
                true
            }
            _ => {
                stale_epochs += 1;
                false
            }
        };

        tracing::info!(
            epoch = epoch + 1,
            train_loss = ?train.mean_loss,
            train_metric = ?train.metric,
            val_loss = ?val.mean_loss,
            val_metric = ?val.metric,
            improved,
            "Epoch complete"
        );
        epochs.push(EpochSummary {
            epoch: epoch + 1,
            train,
            val,
            improved,
        });

        if config.patience.is_some_and(|patience| stale_epochs >= patience) {
            tracing::info!(
                epoch = epoch + 1,
                stale_epochs,
                "Early stopping: validation loss stopped improving"
            );
            break;
        }
    }

    if let Some(best) = best_epoch {
        composer.restore(&config.model_checkpoint_dir, device)?;
        tracing::info!(best_epoch = best, best_loss, "Restored best model for testing");
    }

    let mut test_batches = BatchIterator::new(&splits.test, config.eval_batch_size, device);
    let test = run_eval(composer, &mut test_batches, Stage::Test)?;
    tracing::info!(
        test_loss = ?test.mean_loss,
        test_metric = ?test.metric,
        metric = composer.metric_name(),
        "Test complete"
    );

    Ok(FitReport {
        epochs,
        best_epoch,
        test,
    })
}

fn splitter(config: &FinetuneConfig) -> Result<ManifestSplitter> {
    ManifestSplitter::new(
        config.val_ratio,
        config.test_ratio,
        config.train_ratio,
        config.random_seed,
    )
}

fn build_splits(config: &FinetuneConfig) -> Result<DatasetSplits> {
    let manifest = Manifest::load(&config.manifest_path, config.task_mode())?;
    let source = VolumeSource::nifti(
        &config.dataset_root,
        config.image_extension.as_str(),
        config.volume_shape.clone(),
    );
    DatasetSplits::build(manifest, &splitter(config)?, source)
}

/// One pass over an evaluation partition, summarized.
fn run_eval(composer: &mut ModelComposer, batches: &mut BatchIterator<'_>, stage: Stage) -> Result<StageSummary> {
    while let Some(batch) = batches.next_batch().map_err(|e| e.in_stage(stage))? {
        composer.get_loss_metrics(&batch.volumes, &batch.labels, stage)?;
    }
    Ok(close_stage(composer, stage))
}

/// Summarize the buffered records of `stage` and reset its metric.
fn close_stage(composer: &mut ModelComposer, stage: Stage) -> StageSummary {
    let records = composer.drain_records();
    let summary = StageSummary::from_records(stage, &records, composer.epoch_metric(stage));
    if summary.steps > 0 && summary.metric.is_none() {
        tracing::warn!(
            stage = %stage,
            metric = composer.metric_name(),
            "Metric undefined for this pass"
        );
    }
    composer.reset_metric(stage);
    summary
}
