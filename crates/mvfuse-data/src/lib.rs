//! Dataset assembly for mvfuse finetuning.
//!
//! Turns a flat manifest of labelled volumetric scans into three disjoint,
//! reproducible dataset views (validation, test, train) and batches them into
//! tensors for the model.
//!
//! # Modules
//!
//! - [`labels`]: raw manifest label → class code or score
//! - [`manifest`]: header-skipping CSV manifest parser
//! - [`split`]: seeded three-ratio partitioning with remainder policy
//! - [`volume`]: image decoding and fixed-shape resize
//! - [`dataset`]: lazily decoding dataset views and batch iteration

pub mod dataset;
pub mod labels;
pub mod manifest;
pub mod split;
pub mod volume;

pub use dataset::{Batch, BatchIterator, DatasetSplits, DatasetView};
pub use labels::LabelCatalog;
pub use manifest::{Manifest, Record};
pub use split::{ManifestSplitter, SplitIndices, SplitPlan};
pub use volume::{resize_volume, NiftiDecoder, Volume, VolumeDecoder, VolumeSource};
