//! Cross-view fusion network.
//!
//! Adds a learned per-view embedding to the `[B, T, V, C]` features, flattens
//! the time and view axes into one token axis, and runs pre-norm
//! self-attention blocks over all `T·V` tokens so every slice of every view can
//! attend to every other. The output keeps the input layout.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Dropout, Init, LayerNorm, Linear, Module, VarBuilder, VarMap};
use mvfuse_core::{FinetuneError, ModelConfig, Result, NUM_VIEWS};
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::params::{self, Parameter};

const LAYER_NORM_EPS: f64 = 1e-5;

/// MLP expansion factor inside each block.
const MLP_RATIO: usize = 2;

struct AttentionBlock {
    norm1: LayerNorm,
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    norm2: LayerNorm,
    mlp_in: Linear,
    mlp_out: Linear,
    dropout: Dropout,
    scale: f64,
}

impl AttentionBlock {
    fn new(hidden: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let attn = vb.pp("attn");
        let mlp = vb.pp("mlp");
        Ok(Self {
            norm1: candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("norm1"))?,
            q: candle_nn::linear(hidden, hidden, attn.pp("q"))?,
            k: candle_nn::linear(hidden, hidden, attn.pp("k"))?,
            v: candle_nn::linear(hidden, hidden, attn.pp("v"))?,
            out: candle_nn::linear(hidden, hidden, attn.pp("out"))?,
            norm2: candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("norm2"))?,
            mlp_in: candle_nn::linear(hidden, hidden * MLP_RATIO, mlp.pp("fc1"))?,
            mlp_out: candle_nn::linear(hidden * MLP_RATIO, hidden, mlp.pp("fc2"))?,
            dropout: Dropout::new(dropout),
            scale: 1.0 / (hidden as f64).sqrt(),
        })
    }

    /// `[B, N, C]` → `[B, N, C]`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.norm1.forward(xs)?;
        let q = self.q.forward(&h)?;
        let k = self.k.forward(&h)?;
        let v = self.v.forward(&h)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let attended = self.out.forward(&weights.matmul(&v)?)?;
        let xs = (xs + self.dropout.forward(&attended, train)?)?;

        let h = self.norm2.forward(&xs)?;
        let h = self.mlp_out.forward(&self.mlp_in.forward(&h)?.gelu()?)?;
        xs + self.dropout.forward(&h, train)?
    }
}

/// Fusion network over `[batch, time, view, channel]` features.
pub struct FusionNetwork {
    varmap: VarMap,
    view_embedding: Tensor,
    blocks: Vec<AttentionBlock>,
    hidden: usize,
    trainable: bool,
}

impl FusionNetwork {
    /// Build a randomly initialised, trainable fusion network.
    ///
    /// # Errors
    ///
    /// Fails if parameter allocation fails on `device`.
    pub fn new(hidden: usize, config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let view_embedding = vb.get_with_hints(
            (NUM_VIEWS, hidden),
            "view_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let blocks_vb = vb.pp("blocks");
        let blocks = (0..config.fusion_layers)
            .map(|i| AttentionBlock::new(hidden, config.dropout, blocks_vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            varmap,
            view_embedding,
            blocks,
            hidden,
            trainable: true,
        })
    }

    /// Load the full parameter set from a fusion checkpoint.
    ///
    /// # Errors
    ///
    /// Checkpoint read errors, [`FinetuneError::CheckpointShape`] on a shape
    /// difference, and [`FinetuneError::Checkpoint`] on missing/extra keys.
    pub fn load_checkpoint(&mut self, path: &Path, device: &Device) -> Result<()> {
        let checkpoint = Checkpoint::read(path, device)?;
        let restored = checkpoint.restore(&self.varmap, "")?;
        tracing::info!(
            path = %path.display(),
            parameters = restored,
            blocks = self.blocks.len(),
            "Fusion checkpoint loaded"
        );
        Ok(())
    }

    /// `[B, T, V, C]` → `[B, T, V, C]`.
    ///
    /// Dropout is active only when `train` is set and the network is trainable.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] unless the view axis (third) has
    /// [`NUM_VIEWS`] entries and the channel axis matches the hidden size.
    pub fn forward(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, time, views, channels) = features.dims4().map_err(|_| {
            FinetuneError::ShapeMismatch(format!(
                "fusion expects [batch, time, view, channel], got {:?}",
                features.dims()
            ))
        })?;
        if views != NUM_VIEWS || channels != self.hidden {
            return Err(FinetuneError::ShapeMismatch(format!(
                "fusion expects view axis {NUM_VIEWS} and channel axis {}, got {:?}",
                self.hidden,
                features.dims()
            )));
        }

        let train = train && self.trainable;
        let xs = features.broadcast_add(&self.view_embedding)?;
        let mut tokens = xs.reshape((batch, time * views, channels))?;
        for block in &self.blocks {
            tokens = block.forward_t(&tokens, train)?;
        }
        Ok(tokens.reshape((batch, time, views, channels))?)
    }

    /// Mark the network trainable or frozen. Frozen also means inference
    /// mode: dropout is disabled.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

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
