//! Driver-level scenarios on synthetic volumes.

use candle_core::Device;
use mvfuse_core::{FinetuneConfig, FinetuneError, ModelConfig, Result, Stage, TaskMode};
use mvfuse_data::{DatasetSplits, Manifest, ManifestSplitter, Volume, VolumeDecoder, VolumeSource};
use mvfuse_model::checkpoint;
use mvfuse_model::composer::{ENSEMBLE_FILE, FUSION_FILE, HEAD_FILE};
use mvfuse_model::{ComposerConfig, FusionNetwork, ModelComposer, ViewEnsemble};
use mvfuse_train::trainer;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const SHAPE: [usize; 3] = [6, 6, 6];

fn manifest_text(rows: usize) -> String {
    let groups = ["CN", "AD", "MCI"];
    let mut text = String::from("\"Image Data ID\",\"Subject\",\"Group\",\"Sex\",\"Score\"\n");
    for i in 0..rows {
        text.push_str(&format!(
            "\"{i}\",\"S{i}\",\"{}\",\"M\",\"{}\"\n",
            groups[i % 3],
            10 * (i % 10)
        ));
    }
    text
}

/// Volume intensity follows the image id so classes are not all identical.
struct RampDecoder;

impl VolumeDecoder for RampDecoder {
    fn decode(&self, path: &Path) -> Result<Volume> {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let id: f32 = stem.parse().unwrap_or(0.0);
        let len: usize = SHAPE.iter().product();
        let data = (0..len).map(|v| (id + v as f32) / len as f32).collect();
        Volume::new(SHAPE.to_vec(), data)
    }
}

fn config(dir: &Path, mode: TaskMode) -> FinetuneConfig {
    FinetuneConfig {
        random_seed: 3,
        train_batch_size: 2,
        eval_batch_size: 3,
        ensemble_checkpoint_path: dir.join("pretrained").join("ensemble.safetensors"),
        fusion_checkpoint_path: dir.join("pretrained").join("fusion.safetensors"),
        model_checkpoint_dir: dir.join("finetuned"),
        manifest_path: dir.join("manifest.csv"),
        classification: mode == TaskMode::Classification,
        hidden_size: 4,
        max_epochs: 2,
        volume_shape: SHAPE.to_vec(),
        model: ModelConfig {
            slices_per_view: 2,
            grid_size: 2,
            fusion_layers: 1,
            dropout: 0.0,
        },
        ..FinetuneConfig::default()
    }
}

fn setup(dir: &Path, mode: TaskMode) -> (FinetuneConfig, ModelComposer, DatasetSplits) {
    setup_with(dir, mode, |_| {})
}

fn setup_with(
    dir: &Path,
    mode: TaskMode,
    adjust: impl FnOnce(&mut FinetuneConfig),
) -> (FinetuneConfig, ModelComposer, DatasetSplits) {
    let mut config = config(dir, mode);
    adjust(&mut config);
    let device = Device::Cpu;
    let ensemble = ViewEnsemble::new(config.hidden_size, &config.model, &device).unwrap();
    let fusion = FusionNetwork::new(config.hidden_size, &config.model, &device).unwrap();
    checkpoint::save(ensemble.varmap(), &config.ensemble_checkpoint_path).unwrap();
    checkpoint::save(fusion.varmap(), &config.fusion_checkpoint_path).unwrap();
    let composer = ModelComposer::new(&ComposerConfig::from_finetune_config(&config), &device).unwrap();

    let manifest = Manifest::parse_str(&manifest_text(10), mode).unwrap();
    let splitter = ManifestSplitter::new(config.val_ratio, config.test_ratio, config.train_ratio, config.random_seed).unwrap();
    let source = VolumeSource::new("/scans", "nii", SHAPE.to_vec(), Arc::new(RampDecoder));
    let splits = DatasetSplits::build(manifest, &splitter, source).unwrap();
    (config, composer, splits)
}

#[test]
fn test_fit_classification_reports_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let (config, mut composer, splits) = setup(dir.path(), TaskMode::Classification);
    let report = trainer::fit(&config, &mut composer, &splits, &Device::Cpu).unwrap();

    assert_eq!(report.epochs.len(), 2);
    for (i, epoch) in report.epochs.iter().enumerate() {
        assert_eq!(epoch.epoch, i + 1);
        assert_eq!(epoch.train.stage, Stage::Train);
        // 6 train records in batches of 2, 2 val records in one batch.
        assert_eq!(epoch.train.steps, 3);
        assert_eq!(epoch.val.steps, 1);
        assert!(epoch.train.mean_loss.is_some_and(f64::is_finite));
    }
    assert!(report.epochs[0].improved);
    assert_eq!(report.test.stage, Stage::Test);
    assert_eq!(report.test.steps, 1);

    let best = report.best_epoch.unwrap();
    assert!(report.epochs[best - 1].improved);
    for file in [ENSEMBLE_FILE, FUSION_FILE, HEAD_FILE] {
        assert!(config.model_checkpoint_dir.join(file).exists());
    }
}

#[test]
fn test_fit_regression_metric_is_mae() {
    let dir = tempfile::tempdir().unwrap();
    let (config, mut composer, splits) = setup(dir.path(), TaskMode::Regression);
    let report = trainer::fit(&config, &mut composer, &splits, &Device::Cpu).unwrap();
    let mae = report.test.metric.unwrap();
    assert!((0.0..=100.0).contains(&mae));
    assert_eq!(composer.metric_name(), "mae");
}

#[test]
fn test_fit_stops_after_patience_stale_epochs() {
    let dir = tempfile::tempdir().unwrap();
    // Frozen sub-models and a vanishing step size keep the validation loss
    // bit-identical, so only the first epoch improves.
    let (config, mut composer, splits) = setup_with(dir.path(), TaskMode::Classification, |c| {
        c.finetune_ensemble = false;
        c.finetune_fusion = false;
        c.learning_rate = 1e-30;
        c.max_epochs = 6;
        c.patience = Some(1);
    });
    let report = trainer::fit(&config, &mut composer, &splits, &Device::Cpu).unwrap();

    assert_eq!(report.epochs.len(), 2);
    assert!(report.epochs[0].improved);
    assert!(!report.epochs[1].improved);
    assert_eq!(report.epochs[0].val.mean_loss, report.epochs[1].val.mean_loss);
    assert_eq!(report.best_epoch, Some(1));
}

#[test]
fn test_fit_without_patience_runs_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let (config, mut composer, splits) = setup_with(dir.path(), TaskMode::Classification, |c| {
        c.finetune_ensemble = false;
        c.finetune_fusion = false;
        c.learning_rate = 1e-30;
        c.max_epochs = 3;
    });
    let report = trainer::fit(&config, &mut composer, &splits, &Device::Cpu).unwrap();
    assert_eq!(report.epochs.len(), 3);
    assert_eq!(report.best_epoch, Some(1));
}

#[test]
fn test_plan_reads_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), TaskMode::Classification);
    let mut file = std::fs::File::create(&config.manifest_path).unwrap();
    file.write_all(manifest_text(10).as_bytes()).unwrap();

    let plan = trainer::plan(&config).unwrap();
    assert_eq!((plan.val_size, plan.test_size, plan.train_size, plan.discard_size), (2, 2, 6, 0));

    config.train_ratio = 0.5;
    let plan = trainer::plan(&config).unwrap();
    assert_eq!((plan.train_size, plan.discard_size), (3, 3));
}

#[test]
fn test_run_rejects_bad_ratio_before_io() {
    let dir = tempfile::tempdir().unwrap();
    let config = FinetuneConfig {
        test_ratio: 0.0,
        ..config(dir.path(), TaskMode::Classification)
    };
    let err = trainer::run(&config, &Device::Cpu).unwrap_err();
    assert!(matches!(err, FinetuneError::InvalidRatio { .. }));
}

#[test]
fn test_run_missing_manifest_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), TaskMode::Classification);
    let err = trainer::run(&config, &Device::Cpu).unwrap_err();
    assert!(matches!(err, FinetuneError::Config(_)));
}
