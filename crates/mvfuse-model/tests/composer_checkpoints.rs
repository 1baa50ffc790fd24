//! Composer construction from checkpoints, freezing, and finetuning steps.

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use mvfuse_core::{FinetuneError, Label, ModelConfig, Result, Stage, TaskMode};
use mvfuse_data::{BatchIterator, DatasetView, Record, Volume, VolumeDecoder, VolumeSource};
use mvfuse_model::checkpoint;
use mvfuse_model::{ComposerConfig, FusionNetwork, ModelComposer, StageSummary, ViewEnsemble};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const HIDDEN: usize = 8;

fn model_config() -> ModelConfig {
    ModelConfig {
        slices_per_view: 3,
        grid_size: 2,
        fusion_layers: 1,
        dropout: 0.1,
    }
}

/// Pretrained checkpoints written by freshly initialised sub-models.
fn write_checkpoints(dir: &Path, hidden: usize) -> (PathBuf, PathBuf) {
    let device = Device::Cpu;
    let ensemble_path = dir.join("ensemble.safetensors");
    let fusion_path = dir.join("fusion.safetensors");
    let ensemble = ViewEnsemble::new(hidden, &model_config(), &device).unwrap();
    let fusion = FusionNetwork::new(hidden, &model_config(), &device).unwrap();
    checkpoint::save(ensemble.varmap(), &ensemble_path).unwrap();
    checkpoint::save(fusion.varmap(), &fusion_path).unwrap();
    (ensemble_path, fusion_path)
}

fn composer_config(dir: &Path, mode: TaskMode, finetune_ensemble: bool, finetune_fusion: bool) -> ComposerConfig {
    let (ensemble_checkpoint, fusion_checkpoint) = write_checkpoints(dir, HIDDEN);
    ComposerConfig {
        ensemble_checkpoint,
        fusion_checkpoint,
        finetune_ensemble,
        finetune_fusion,
        mode,
        hidden_size: HIDDEN,
        model: model_config(),
    }
}

fn snapshot(vars: &[Tensor]) -> Vec<Vec<f32>> {
    vars.iter()
        .map(|t| t.flatten_all().unwrap().to_vec1().unwrap())
        .collect()
}

#[test]
fn test_frozen_ensemble_has_no_trainable_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let config = composer_config(dir.path(), TaskMode::Classification, false, true);
    let composer = ModelComposer::new(&config, &Device::Cpu).unwrap();

    assert!(composer.ensemble().parameters().iter().all(|p| !p.trainable));
    assert!(composer.ensemble().trainable_vars().is_empty());
    assert!(composer.fusion().parameters().iter().all(|p| p.trainable));
    assert!(!composer.fusion().trainable_vars().is_empty());

    let expected = composer.fusion().trainable_vars().len() + composer.head().trainable_vars().len();
    assert_eq!(composer.trainable_vars().len(), expected);
}

#[test]
fn test_checkpoint_shape_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (ensemble_checkpoint, fusion_checkpoint) = write_checkpoints(dir.path(), HIDDEN + 2);
    let config = ComposerConfig {
        ensemble_checkpoint,
        fusion_checkpoint,
        finetune_ensemble: true,
        finetune_fusion: true,
        mode: TaskMode::Regression,
        hidden_size: HIDDEN,
        model: model_config(),
    };
    let err = ModelComposer::new(&config, &Device::Cpu).err().unwrap();
    assert!(matches!(err, FinetuneError::CheckpointShape { .. }));
}

#[test]
fn test_missing_checkpoint_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = composer_config(dir.path(), TaskMode::Classification, true, true);
    config.fusion_checkpoint = dir.path().join("absent.safetensors");
    let err = ModelComposer::new(&config, &Device::Cpu).err().unwrap();
    assert!(matches!(err, FinetuneError::Checkpoint(_)));
}

#[test]
fn test_optimizer_leaves_frozen_parameters_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = composer_config(dir.path(), TaskMode::Regression, false, true);
    let mut composer = ModelComposer::new(&config, &Device::Cpu).unwrap();

    let frozen: Vec<Tensor> = composer
        .ensemble()
        .parameters()
        .into_iter()
        .map(|p| p.var.as_tensor().clone())
        .collect();
    let trained: Vec<Tensor> = composer
        .fusion()
        .parameters()
        .into_iter()
        .map(|p| p.var.as_tensor().clone())
        .collect();
    let frozen_before = snapshot(&frozen);
    let trained_before = snapshot(&trained);

    let mut optimizer = AdamW::new(
        composer.trainable_vars(),
        ParamsAdamW {
            lr: 1e-2,
            ..Default::default()
        },
    )
    .unwrap();
    let volumes = Tensor::rand(0f32, 1f32, (2, 6, 6, 6), &Device::Cpu).unwrap();
    let labels = Tensor::new(&[25f32, 75.0], &Device::Cpu).unwrap();
    let loss = composer.get_loss_metrics(&volumes, &labels, Stage::Train).unwrap();
    optimizer.backward_step(&loss).unwrap();

    assert_eq!(snapshot(&frozen), frozen_before);
    assert_ne!(snapshot(&trained), trained_before);
}

#[test]
fn test_save_and_load_finetuned_reproduces_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = composer_config(dir.path(), TaskMode::Classification, true, true);
    let composer = ModelComposer::new(&config, &Device::Cpu).unwrap();

    let out_dir = dir.path().join("finetuned");
    composer.save(&out_dir).unwrap();
    let reloaded = ModelComposer::load_finetuned(&out_dir, &config, &Device::Cpu).unwrap();

    let volumes = Tensor::rand(0f32, 1f32, (3, 6, 6, 6), &Device::Cpu).unwrap();
    let a: Vec<Vec<f32>> = composer.forward(&volumes).unwrap().to_vec2().unwrap();
    let b: Vec<Vec<f32>> = reloaded.forward(&volumes).unwrap().to_vec2().unwrap();
    assert_eq!(a, b);
}

/// Fills every volume with its numeric image id.
struct ConstDecoder;

impl VolumeDecoder for ConstDecoder {
    fn decode(&self, path: &Path) -> Result<Volume> {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let value: f32 = stem.parse().unwrap_or(0.0);
        Volume::new(vec![6, 6, 6], vec![value / 10.0; 216])
    }
}

#[test]
fn test_epoch_over_dataset_view() {
    let dir = tempfile::tempdir().unwrap();
    let config = composer_config(dir.path(), TaskMode::Classification, true, false);
    let mut composer = ModelComposer::new(&config, &Device::Cpu).unwrap();

    let records: Arc<[Record]> = (0..6u32)
        .map(|i| Record {
            image_id: i.to_string(),
            raw_label: String::new(),
            label: Label::Class(i % 3),
        })
        .collect::<Vec<_>>()
        .into();
    let source = Arc::new(VolumeSource::new("/scans", "nii", vec![6, 6, 6], Arc::new(ConstDecoder)));
    let view = DatasetView::new(records, (0..6).collect(), source).unwrap();

    let mut batches = BatchIterator::new(&view, 4, &Device::Cpu);
    while let Some(batch) = batches.next_batch().unwrap() {
        composer
            .get_loss_metrics(&batch.volumes, &batch.labels, Stage::Val)
            .unwrap();
    }

    let records = composer.drain_records();
    assert_eq!(records.len(), 2);
    let summary = StageSummary::from_records(Stage::Val, &records, composer.epoch_metric(Stage::Val));
    assert_eq!(summary.steps, 2);
    assert!(summary.mean_loss.is_some_and(f64::is_finite));
    let auroc = summary.metric.unwrap();
    assert!((0.0..=1.0).contains(&auroc));

    composer.reset_metric(Stage::Val);
    assert!(composer.epoch_metric(Stage::Val).is_none());
}
