//! Model side of mvfuse finetuning.
//!
//! A pretrained per-view feature-extractor ensemble and a pretrained fusion
//! network are loaded from safetensors checkpoints, optionally frozen, and
//! composed with a task-specific head for 3-class diagnosis or score
//! regression.
//!
//! # Modules
//!
//! - [`checkpoint`]: strict safetensors loading and saving
//! - [`ensemble`]: three per-view volumetric feature extractors
//! - [`fusion`]: self-attention over all slices of all views
//! - [`head`]: projection, loss, output transform, per-stage metrics
//! - [`composer`]: the full pipeline and the per-stage step
//! - [`metrics`]: AUROC and MAE accumulators
//! - [`report`]: step records and stage summaries
//! - [`device`]: CUDA/Metal/CPU selection

pub mod checkpoint;
pub mod composer;
pub mod device;
pub mod ensemble;
pub mod fusion;
pub mod head;
pub mod metrics;
pub mod params;
pub mod report;

pub use composer::{ComposerConfig, ModelComposer};
pub use device::{device_label, select_device};
pub use ensemble::ViewEnsemble;
pub use fusion::FusionNetwork;
pub use head::{HeadKind, HeadOutputs, TaskHead};
pub use metrics::{MeanAbsoluteError, Metric, MulticlassAuroc, StageMetrics};
pub use params::Parameter;
pub use report::{StageSummary, StepRecord};
