//! Per-view volumetric feature extractor ensemble.
//!
//! Each of the three extractors looks at the volume along one spatial axis,
//! pools it into a short sequence of slice summaries, and projects every slice
//! summary to `hidden` channels.
//!
//! # Architecture (per view)
//!
//! ```text
//! [B, X, Y, Z] → orient(view) → pool → [B, T, g, g] → flatten → Linear(g², C) → ReLU → Dropout → Linear(C, C)
//! ```

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Dropout, Module, VarBuilder, VarMap};
use mvfuse_core::{FinetuneError, ModelConfig, Result, NUM_VIEWS};
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::params::{self, Parameter};

/// Feature extractor for a single view.
struct ViewExtractor {
    view: usize,
    fc1: candle_nn::Linear,
    fc2: candle_nn::Linear,
    dropout: Dropout,
    slices: usize,
    grid: usize,
}

impl ViewExtractor {
    fn new(view: usize, hidden: usize, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let grid = config.grid_size;
        let fc1 = candle_nn::linear(grid * grid, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden, hidden, vb.pp("fc2"))?;
        Ok(Self {
            view,
            fc1,
            fc2,
            dropout: Dropout::new(config.dropout),
            slices: config.slices_per_view,
            grid,
        })
    }

    /// `[B, X, Y, Z]` → `[B, T, C]`.
    fn forward_t(&self, volumes: &Tensor, train: bool) -> Result<Tensor> {
        // Slice axis first, then the two in-plane axes.
        let oriented = match self.view {
            0 => volumes.clone(),
            1 => volumes.permute((0, 2, 1, 3))?,
            _ => volumes.permute((0, 3, 1, 2))?,
        };
        let pooled = adaptive_avg_pool(&oriented, 1, self.slices)?;
        let pooled = adaptive_avg_pool(&pooled, 2, self.grid)?;
        let pooled = adaptive_avg_pool(&pooled, 3, self.grid)?;

        let batch = pooled.dim(0)?;
        let tokens = pooled.reshape((batch, self.slices, self.grid * self.grid))?;
        let hidden = self.fc1.forward(&tokens)?.relu()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        Ok(self.fc2.forward(&hidden)?)
    }
}

/// Average `xs` along `dim` into `bins` contiguous, possibly overlapping
/// windows (bin `i` covers `[⌊i·n/bins⌋, ⌈(i+1)·n/bins⌉)`).
///
/// # Errors
///
/// [`FinetuneError::ShapeMismatch`] if the axis is shorter than `bins`.
pub fn adaptive_avg_pool(xs: &Tensor, dim: usize, bins: usize) -> Result<Tensor> {
    let size = xs.dim(dim)?;
    if size < bins {
        return Err(FinetuneError::ShapeMismatch(format!(
            "axis {dim} of {:?} has {size} elements, cannot pool into {bins} bins",
            xs.dims()
        )));
    }
    if size == bins {
        return Ok(xs.clone());
    }
    let parts = (0..bins)
        .map(|i| {
            let start = i * size / bins;
            let end = ((i + 1) * size).div_ceil(bins);
            xs.narrow(dim, start, end - start)?.mean_keepdim(dim)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, dim)?)
}

/// The ensemble of [`NUM_VIEWS`] per-view extractors sharing one parameter store.
///
/// Parameters are named `"{view}.fc1.weight"` etc., which is also the key
/// layout of the ensemble checkpoint.
pub struct ViewEnsemble {
    varmap: VarMap,
    extractors: Vec<ViewExtractor>,
    hidden: usize,
    trainable: bool,
}

impl ViewEnsemble {
    /// Build a randomly initialised, trainable ensemble.
    ///
    /// # Errors
    ///
    /// Fails if parameter allocation fails on `device`.
    pub fn new(hidden: usize, config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let extractors = (0..NUM_VIEWS)
            .map(|view| ViewExtractor::new(view, hidden, config, vb.pp(view.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            varmap,
            extractors,
            hidden,
            trainable: true,
        })
    }

    /// Load every view's parameters from the indexed ensemble checkpoint.
    ///
    /// # Errors
    ///
    /// Checkpoint read/shape errors; also fails if the file carries keys for a
    /// view index the ensemble does not have.
    pub fn load_checkpoint(&mut self, path: &Path, device: &Device) -> Result<()> {
        let checkpoint = Checkpoint::read(path, device)?;
        let mut restored = 0;
        for view in 0..NUM_VIEWS {
            restored += checkpoint.restore(&self.varmap, &format!("{view}."))?;
        }
        if let Some(stray) = checkpoint.names().find(|name| !is_view_key(name)) {
            return Err(FinetuneError::Checkpoint(format!(
                "Unexpected parameter '{stray}' in ensemble checkpoint {}",
                path.display()
            )));
        }
        tracing::info!(
            path = %path.display(),
            views = NUM_VIEWS,
            parameters = restored,
            "Ensemble checkpoint loaded"
        );
        Ok(())
    }

    /// Features of one view: `[B, X, Y, Z]` → `[B, T, C]`.
    ///
    /// Dropout is active only when `train` is set and the ensemble is trainable.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] for a bad view index or input shape.
    pub fn forward(&self, view: usize, volumes: &Tensor, train: bool) -> Result<Tensor> {
        let extractor = self.extractors.get(view).ok_or_else(|| {
            FinetuneError::ShapeMismatch(format!("view index {view} out of range 0..{NUM_VIEWS}"))
        })?;
        if volumes.rank() != 4 {
            return Err(FinetuneError::ShapeMismatch(format!(
                "ensemble expects [batch, x, y, z] volumes, got {:?}",
                volumes.dims()
            )));
        }
        extractor.forward_t(volumes, train && self.trainable)
    }

    /// All views stacked on axis 2: `[B, X, Y, Z]` → `[B, T, V, C]`.
    ///
    /// A frozen ensemble returns detached features, so backpropagation stops
    /// at its output.
    ///
    /// # Errors
    ///
    /// See [`ViewEnsemble::forward`].
    pub fn forward_all(&self, volumes: &Tensor, train: bool) -> Result<Tensor> {
        let features = (0..NUM_VIEWS)
            .map(|view| self.forward(view, volumes, train))
            .collect::<Result<Vec<_>>>()?;
        let features = Tensor::stack(&features, 2)?;
        if self.trainable {
            Ok(features)
        } else {
            Ok(features.detach())
        }
    }

    /// Mark the whole ensemble trainable or frozen. Frozen also means
    /// inference mode: dropout is disabled.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Channel width of the emitted features.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// All parameters with their trainable flag.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter> {
        params::collect(&self.varmap, self.trainable)
    }

    /// Parameters the optimizer may update; empty when frozen.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        params::trainable_vars(&self.varmap, self.trainable)
    }

    /// Underlying parameter store (checkpoint layout).
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

fn is_view_key(name: &str) -> bool {
    name.split_once('.')
        .and_then(|(index, _)| index.parse::<usize>().ok())
        .is_some_and(|view| view < NUM_VIEWS)
}
