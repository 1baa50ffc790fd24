//! Finetuning driver for mvfuse.
//!
//! [`config`] loads the YAML configuration surface; [`trainer`] owns the
//! epoch loop, optimizer, checkpoint persistence and reporting around the
//! per-batch step exposed by [`mvfuse_model::ModelComposer`].

pub mod config;
pub mod trainer;

pub use config::{load_config, resolve_config};
pub use trainer::{evaluate, fit, plan, run, EpochSummary, FitReport};
