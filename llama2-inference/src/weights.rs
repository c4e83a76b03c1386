use std::ops::Range;

use anyhow::Result;

use crate::configuration::ModelConfig;
use crate::utils::FloatStorage;

/// Element offsets of every logical tensor inside the flat weight region of a checkpoint.
///
/// Order on disk: token embedding, attention norms, wq, wk, wv, wo, ffn norms,
/// w1 (gate), w2 (down), w3 (up), final norm, and the classifier when it is not shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLayout {
    pub token_embedding_table: Range<usize>,
    pub rms_att_weight: Range<usize>,
    pub wq: Range<usize>,
    pub wk: Range<usize>,
    pub wv: Range<usize>,
    pub wo: Range<usize>,
    pub rms_ffn_weight: Range<usize>,
    pub w1: Range<usize>,
    pub w2: Range<usize>,
    pub w3: Range<usize>,
    pub rms_final_weight: Range<usize>,
    pub wcls: Range<usize>,
    /// Total number of floats stored in the checkpoint.
    pub total: usize,
}

impl TensorLayout {
    /// Computes the layout, failing when the dimensions do not fit in the address space.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, shared_classifier, .. } = *config;
        let kv_dim = config.kv_dim();

        let size = |shape: &[usize]| -> Result<usize> {
            shape
                .iter()
                .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
                .ok_or_else(|| anyhow::anyhow!("Tensor of shape {shape:?} overflows the address space"))
        };

        let mut offset = 0usize;
        let mut next = |count: usize| -> Result<Range<usize>> {
            let end = offset
                .checked_add(count)
                .ok_or_else(|| anyhow::anyhow!("Checkpoint layout overflows the address space"))?;
            let range = offset..end;
            offset = end;
            Ok(range)
        };

        let token_embedding_table = next(size(&[vocab_size, dim])?)?;
        let rms_att_weight = next(size(&[n_layers, dim])?)?;
        let wq = next(size(&[n_layers, dim, dim])?)?;
        let wk = next(size(&[n_layers, kv_dim, dim])?)?;
        let wv = next(size(&[n_layers, kv_dim, dim])?)?;
        let wo = next(size(&[n_layers, dim, dim])?)?;
        let rms_ffn_weight = next(size(&[n_layers, dim])?)?;
        let w1 = next(size(&[n_layers, hidden_dim, dim])?)?;
        let w2 = next(size(&[n_layers, dim, hidden_dim])?)?;
        let w3 = next(size(&[n_layers, hidden_dim, dim])?)?;
        let rms_final_weight = next(dim)?;
        let wcls =
            if shared_classifier { token_embedding_table.clone() } else { next(size(&[vocab_size, dim])?)? };

        if offset.checked_mul(std::mem::size_of::<f32>()).is_none() {
            anyhow::bail!("Checkpoint of {offset} floats overflows the address space");
        }

        Ok(Self {
            token_embedding_table,
            rms_att_weight,
            wq,
            wk,
            wv,
            wo,
            rms_ffn_weight,
            w1,
            w2,
            w3,
            rms_final_weight,
            wcls,
            total: offset,
        })
    }

    /// Number of bytes the weight region occupies on disk.
    pub fn byte_len(&self) -> usize {
        self.total * std::mem::size_of::<f32>()
    }
}

/// Contains all the learned parameters for the transformer model.
///
/// Every tensor is a view into one backing store that is loaded once and never copied.
/// Per-layer accessors do the offset arithmetic.
#[derive(Debug)]
pub struct TransformerWeights {
    storage: FloatStorage,
    layout: TensorLayout,
    dim: usize,
    hidden_dim: usize,
    kv_dim: usize,
}

impl TransformerWeights {
    pub(crate) fn new(config: &ModelConfig, storage: FloatStorage) -> Result<Self> {
        let layout = TensorLayout::new(config)?;

        if storage.len() < layout.total {
            anyhow::bail!("Weight storage holds {} floats, model requires {}", storage.len(), layout.total);
        }

        Ok(Self { storage, layout, dim: config.dim, hidden_dim: config.hidden_dim, kv_dim: config.kv_dim() })
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    #[inline]
    fn tensor(&self, range: &Range<usize>) -> &[f32] {
        &self.storage.as_slice()[range.clone()]
    }

    #[inline]
    fn layer_slice(&self, range: &Range<usize>, layer: usize, size: usize) -> &[f32] {
        &self.tensor(range)[layer * size..(layer + 1) * size]
    }

    /// Shape: [vocab_size, dim]
    pub fn token_embedding_table(&self) -> &[f32] {
        self.tensor(&self.layout.token_embedding_table)
    }

    /// Embedding row of a single token.
    pub fn token_embedding(&self, token: usize) -> &[f32] {
        &self.token_embedding_table()[token * self.dim..(token + 1) * self.dim]
    }

    pub fn rms_att_weight(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.rms_att_weight, layer, self.dim)
    }

    /// Shape: [dim, dim]
    pub fn wq(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.wq, layer, self.dim * self.dim)
    }

    /// Shape: [kv_dim, dim]
    pub fn wk(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.wk, layer, self.kv_dim * self.dim)
    }

    /// Shape: [kv_dim, dim]
    pub fn wv(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.wv, layer, self.kv_dim * self.dim)
    }

    /// Shape: [dim, dim]
    pub fn wo(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.wo, layer, self.dim * self.dim)
    }

    pub fn rms_ffn_weight(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.rms_ffn_weight, layer, self.dim)
    }

    /// Gate projection, shape: [hidden_dim, dim]
    pub fn w1(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.w1, layer, self.hidden_dim * self.dim)
    }

    /// Down projection, shape: [dim, hidden_dim]
    pub fn w2(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.w2, layer, self.dim * self.hidden_dim)
    }

    /// Up projection, shape: [hidden_dim, dim]
    pub fn w3(&self, layer: usize) -> &[f32] {
        self.layer_slice(&self.layout.w3, layer, self.hidden_dim * self.dim)
    }

    pub fn rms_final_weight(&self) -> &[f32] {
        self.tensor(&self.layout.rms_final_weight)
    }

    /// Classifier weights, shape: [vocab_size, dim]. Same memory as the embedding table when shared.
    pub fn wcls(&self) -> &[f32] {
        self.tensor(&self.layout.wcls)
    }
}
