//! Core types, configuration, and errors for mvfuse
//!
//! This crate holds the vocabulary shared by every mvfuse component: the
//! classification/regression switch, the train/val/test stage identifiers,
//! dataset labels, the finetuning configuration surface, and the error
//! taxonomy surfaced to the training-loop driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of spatial views (orthogonal slicing axes) of a volumetric scan.
pub const NUM_VIEWS: usize = 3;

/// Number of diagnostic classes (CN, AD, MCI).
pub const NUM_CLASSES: usize = 3;

/// Upper bound of the regression score range.
pub const SCORE_SCALE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Task & stage identifiers
// ---------------------------------------------------------------------------

/// Which downstream task the composed model is finetuned for.
///
/// Selected once at construction; every component that depends on the task
/// matches on this exhaustively instead of re-checking a flag per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// 3-class diagnostic classification.
    Classification,
    /// Continuous score regression in `[0, 100]`.
    Regression,
}

impl TaskMode {
    /// Map the boolean `classification` switch of the configuration surface.
    #[must_use]
    pub fn from_classification_flag(classification: bool) -> Self {
        if classification {
            Self::Classification
        } else {
            Self::Regression
        }
    }

    /// Zero-based manifest column holding this task's label.
    #[must_use]
    pub fn label_column(self) -> usize {
        match self {
            Self::Classification => 2,
            Self::Regression => 4,
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classification => write!(f, "classification"),
            Self::Regression => write!(f, "regression"),
        }
    }
}

/// One of the three dataset partitions, each with its own metric accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Training partition.
    Train,
    /// Validation partition.
    Val,
    /// Held-out test partition.
    Test,
}

impl Stage {
    /// All stages in reporting order.
    pub const ALL: [Stage; 3] = [Stage::Train, Stage::Val, Stage::Test];

    /// Short lowercase name used in log fields (`train`, `val`, `test`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ground-truth label of a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Label {
    /// Class code: 0 = CN, 1 = AD, 2 = MCI.
    Class(u32),
    /// Continuous clinical score.
    Score(f32),
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Architecture of the pretrained sub-models.
///
/// These values must match the run that produced the checkpoints; they are
/// not tuned during finetuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of pooled slices each view extractor emits (the time axis).
    #[serde(default = "default_slices_per_view")]
    pub slices_per_view: usize,
    /// Side length of the pooled in-plane grid per slice.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    /// Number of self-attention blocks in the fusion network.
    #[serde(default = "default_fusion_layers")]
    pub fusion_layers: usize,
    /// Dropout probability used by both sub-models in training mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_slices_per_view() -> usize {
    16
}

fn default_grid_size() -> usize {
    8
}

fn default_fusion_layers() -> usize {
    2
}

fn default_dropout() -> f32 {
    0.1
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            slices_per_view: default_slices_per_view(),
            grid_size: default_grid_size(),
            fusion_layers: default_fusion_layers(),
            dropout: default_dropout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Full configuration surface of a finetuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Seed for the split permutation and per-epoch shuffles.
    #[serde(default)]
    pub random_seed: u64,
    /// Mini-batch size for the train partition.
    #[serde(default = "default_batch_size")]
    pub train_batch_size: usize,
    /// Mini-batch size for val/test partitions.
    #[serde(default = "default_batch_size")]
    pub eval_batch_size: usize,
    /// Directory holding the volumetric image files.
    #[serde(default = "default_dataset_root")]
    pub dataset_root: PathBuf,
    /// Path to the comma-separated manifest.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Safetensors file with the three per-view extractors (keys prefixed `0.`, `1.`, `2.`).
    #[serde(default = "default_ensemble_checkpoint_path")]
    pub ensemble_checkpoint_path: PathBuf,
    /// Safetensors file with the fusion network parameters.
    #[serde(default = "default_fusion_checkpoint_path")]
    pub fusion_checkpoint_path: PathBuf,
    /// Directory where the best finetuned model is written.
    #[serde(default = "default_model_checkpoint_dir")]
    pub model_checkpoint_dir: PathBuf,
    /// AdamW learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Whether the per-view ensemble receives gradient updates.
    #[serde(default = "default_true")]
    pub finetune_ensemble: bool,
    /// Whether the fusion network receives gradient updates.
    #[serde(default = "default_true")]
    pub finetune_fusion: bool,
    /// `true` for 3-class classification, `false` for score regression.
    #[serde(default = "default_true")]
    pub classification: bool,
    /// Channel width shared by the sub-models and the task head.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Fraction of the post-val/test pool used for training.
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    /// Fraction of the whole manifest used for validation.
    #[serde(default = "default_holdout_ratio")]
    pub val_ratio: f64,
    /// Fraction of the whole manifest used for testing.
    #[serde(default = "default_holdout_ratio")]
    pub test_ratio: f64,
    /// Number of training epochs.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Stop after this many epochs without a validation-loss improvement.
    #[serde(default)]
    pub patience: Option<usize>,
    /// File extension appended to each image identifier.
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// Shape every decoded volume is resized to.
    #[serde(default = "default_volume_shape")]
    pub volume_shape: Vec<usize>,
    /// Pretrained architecture description.
    #[serde(default)]
    pub model: ModelConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_batch_size() -> usize {
    4
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("./adni_data")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("./ADNI1_Annual_2_Yr_3T_4_23_2022.csv")
}

fn default_ensemble_checkpoint_path() -> PathBuf {
    PathBuf::from("./cnn_checkpoints/ensemble.safetensors")
}

fn default_fusion_checkpoint_path() -> PathBuf {
    PathBuf::from("./transformer_checkpoints/fusion.safetensors")
}

fn default_model_checkpoint_dir() -> PathBuf {
    PathBuf::from("./complete_checkpoints")
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-2
}

fn default_true() -> bool {
    true
}

fn default_hidden_size() -> usize {
    10
}

fn default_train_ratio() -> f64 {
    1.0
}

fn default_holdout_ratio() -> f64 {
    0.2
}

fn default_max_epochs() -> usize {
    20
}

fn default_image_extension() -> String {
    "nii".to_string()
}

fn default_volume_shape() -> Vec<usize> {
    vec![150, 150, 200]
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            random_seed: 0,
            train_batch_size: default_batch_size(),
            eval_batch_size: default_batch_size(),
            dataset_root: default_dataset_root(),
            manifest_path: default_manifest_path(),
            ensemble_checkpoint_path: default_ensemble_checkpoint_path(),
            fusion_checkpoint_path: default_fusion_checkpoint_path(),
            model_checkpoint_dir: default_model_checkpoint_dir(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            finetune_ensemble: true,
            finetune_fusion: true,
            classification: true,
            hidden_size: default_hidden_size(),
            train_ratio: default_train_ratio(),
            val_ratio: default_holdout_ratio(),
            test_ratio: default_holdout_ratio(),
            max_epochs: default_max_epochs(),
            patience: None,
            image_extension: default_image_extension(),
            volume_shape: default_volume_shape(),
            model: ModelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FinetuneConfig {
    /// Task selected by the `classification` switch.
    #[must_use]
    pub fn task_mode(&self) -> TaskMode {
        TaskMode::from_classification_flag(self.classification)
    }

    /// Validate the configuration before any file is touched.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::InvalidRatio`] for a ratio outside `(0, 1]`
    /// and [`FinetuneError::Config`] for any other unusable value.
    pub fn validate(&self) -> Result<()> {
        check_ratio("val_ratio", self.val_ratio)?;
        check_ratio("test_ratio", self.test_ratio)?;
        check_ratio("train_ratio", self.train_ratio)?;

        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(FinetuneError::Config(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.hidden_size == 0 {
            return Err(FinetuneError::Config(
                "hidden_size must be at least 1".to_string(),
            ));
        }
        if self.max_epochs == 0 {
            return Err(FinetuneError::Config(
                "max_epochs must be at least 1".to_string(),
            ));
        }
        if self.patience == Some(0) {
            return Err(FinetuneError::Config(
                "patience must be at least 1 when set".to_string(),
            ));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(FinetuneError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.volume_shape.len() != NUM_VIEWS || self.volume_shape.contains(&0) {
            return Err(FinetuneError::Config(format!(
                "volume_shape must have {NUM_VIEWS} non-zero extents, got {:?}",
                self.volume_shape
            )));
        }
        if self.model.slices_per_view == 0 || self.model.grid_size == 0 {
            return Err(FinetuneError::Config(
                "model.slices_per_view and model.grid_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(FinetuneError::Config(format!(
                "model.dropout must lie in [0, 1), got {}",
                self.model.dropout
            )));
        }
        Ok(())
    }
}

/// Reject a split ratio outside `(0, 1]`.
///
/// # Errors
///
/// Returns [`FinetuneError::InvalidRatio`] naming the offending option.
pub fn check_ratio(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(FinetuneError::InvalidRatio {
            reason: format!("{name}={value} must lie in (0, 1]"),
        })
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
///
/// None of these are recovered locally; they abort the run.
#[derive(thiserror::Error, Debug)]
pub enum FinetuneError {
    /// Unusable configuration value or path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Split ratio outside `(0, 1]`, or val/test sizes exceeding the dataset.
    #[error("Invalid ratio: {reason}")]
    InvalidRatio {
        /// Which ratio failed and why.
        reason: String,
    },

    /// Checkpoint unreadable, or missing/unexpected parameters.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint parameter shape differs from the freshly built sub-model.
    #[error("Checkpoint shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    CheckpointShape {
        /// Parameter name.
        name: String,
        /// Shape of the freshly constructed parameter.
        expected: Vec<usize>,
        /// Shape stored in the checkpoint.
        found: Vec<usize>,
    },

    /// Classification label outside the known catalog.
    #[error("Unknown label: '{label}'")]
    UnknownLabel {
        /// The offending raw label string.
        label: String,
    },

    /// Regression label that is not a number.
    #[error("Label parse error: '{raw}' is not a number")]
    LabelParse {
        /// The offending raw label string.
        raw: String,
    },

    /// Malformed manifest row.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Image file missing or corrupt.
    #[error("Decode error for {}: {reason}", path.display())]
    Decode {
        /// Image path.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// Forward-pipeline tensor shape contract violated.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Metric input that cannot be scored, such as NaN predictions from a
    /// diverged run.
    #[error("Metric error: {0}")]
    Metric(String),

    /// Failure raised while processing a batch of the given stage.
    #[error("{stage} step failed: {source}")]
    Step {
        /// Stage being processed.
        stage: Stage,
        /// Underlying failure.
        #[source]
        source: Box<FinetuneError>,
    },

    /// Tensor backend error.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FinetuneError {
    /// Attribute this error to a per-batch step of `stage`.
    #[must_use]
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            already @ Self::Step { .. } => already,
            other => Self::Step {
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// Convenience alias for `std::result::Result<T, FinetuneError>`.
pub type Result<T> = std::result::Result<T, FinetuneError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_mode_from_flag() {
        assert_eq!(
            TaskMode::from_classification_flag(true),
            TaskMode::Classification
        );
        assert_eq!(
            TaskMode::from_classification_flag(false),
            TaskMode::Regression
        );
    }

    #[test]
    fn test_label_columns() {
        assert_eq!(TaskMode::Classification.label_column(), 2);
        assert_eq!(TaskMode::Regression.label_column(), 4);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Train.to_string(), "train");
        assert_eq!(Stage::Val.to_string(), "val");
        assert_eq!(Stage::Test.to_string(), "test");
    }

    #[test]
    fn test_default_config_matches_reference_run() {
        let config = FinetuneConfig::default();
        assert_eq!(config.random_seed, 0);
        assert_eq!(config.train_batch_size, 4);
        assert_eq!(config.eval_batch_size, 4);
        assert!((config.learning_rate - 1e-3).abs() < 1e-12);
        assert!(config.finetune_ensemble);
        assert!(config.finetune_fusion);
        assert!(config.classification);
        assert_eq!(config.hidden_size, 10);
        assert!((config.train_ratio - 1.0).abs() < 1e-12);
        assert!((config.val_ratio - 0.2).abs() < 1e-12);
        assert!((config.test_ratio - 0.2).abs() < 1e-12);
        assert_eq!(config.volume_shape, vec![150, 150, 200]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ratio() {
        let config = FinetuneConfig {
            val_ratio: 0.0,
            ..FinetuneConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, FinetuneError::InvalidRatio { .. }));
        assert!(err.to_string().contains("val_ratio"));
    }

    #[test]
    fn test_validate_rejects_ratio_above_one() {
        let config = FinetuneConfig {
            train_ratio: 1.5,
            ..FinetuneConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FinetuneError::InvalidRatio { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = FinetuneConfig {
            eval_batch_size: 0,
            ..FinetuneConfig::default()
        };
        assert!(matches!(config.validate(), Err(FinetuneError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_volume_shape() {
        let config = FinetuneConfig {
            volume_shape: vec![10, 10],
            ..FinetuneConfig::default()
        };
        assert!(matches!(config.validate(), Err(FinetuneError::Config(_))));
    }

    #[test]
    fn test_config_partial_yaml_uses_defaults() {
        let yaml = r#"
classification: false
hidden_size: 32
model:
  fusion_layers: 4
"#;
        let config: FinetuneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.task_mode(), TaskMode::Regression);
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.model.fusion_layers, 4);
        assert_eq!(config.model.grid_size, 8);
        assert_eq!(config.train_batch_size, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_logging_config_serialization() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: LoggingConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_in_stage_wraps_once() {
        let err = FinetuneError::ShapeMismatch("bad".to_string())
            .in_stage(Stage::Val)
            .in_stage(Stage::Train);
        match err {
            FinetuneError::Step { stage, source } => {
                assert_eq!(stage, Stage::Val);
                assert!(matches!(*source, FinetuneError::ShapeMismatch(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_display_names_offending_value() {
        let err = FinetuneError::UnknownLabel {
            label: "FOO".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown label: 'FOO'");

        let err = FinetuneError::CheckpointShape {
            name: "0.fc1.weight".to_string(),
            expected: vec![10, 64],
            found: vec![10, 32],
        };
        assert!(err.to_string().contains("0.fc1.weight"));
        assert!(err.to_string().contains("[10, 64]"));
    }
}
