use crate::configuration::{ModelConfig, read_config};
use crate::kernels::{accumulate, dot, matmul, rmsnorm, rmsnorm_inplace, softmax, swiglu};
use crate::utils::{FloatStorage, MemoryMapper};
use crate::weights::{TensorLayout, TransformerWeights};
use anyhow::{Context, Result};
use log::{debug, warn};
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Base frequency for RoPE (Rotary Position Embedding)
const ROPE_BASE_FREQ: f32 = 10000.0;

/// Llama-2 style decoder-only transformer.
///
/// **Architecture Overview:**
/// - **Attention**: Multi-head self-attention with Grouped Query Attention (GQA)
/// - **Position Encoding**: Rotary Position Embedding (RoPE) on interleaved component pairs
/// - **Normalization**: RMSNorm before attention and before the feed-forward block
/// - **Activation**: SwiGLU in feed-forward networks
///
/// The transformer itself is immutable: weights are shared read-only and every
/// mutable buffer (activations and the key/value cache) lives in a [`RunState`]
/// owned by the caller, one per in-flight sequence.
#[derive(Debug)]
pub struct Transformer {
    config: ModelConfig,
    weights: TransformerWeights,
}

impl Transformer {
    /// Builds a transformer from weights already held in memory, laid out as in the checkpoint file.
    pub fn from_weights(config: ModelConfig, weights: Vec<f32>) -> Result<Self> {
        let weights = TransformerWeights::new(&config, FloatStorage::Owned(weights))?;
        Ok(Self { config, weights })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &TransformerWeights {
        &self.weights
    }

    /// Allocates a run state sized for this model.
    pub fn new_state(&self) -> RunState {
        RunState::new(&self.config)
    }

    /// Forward pass for one token at position `pos`, returning the logits over the vocabulary.
    ///
    /// **Process Flow:**
    /// 1. **Token Embedding**: copy the token's embedding row into the residual stream
    /// 2. **Transformer Blocks**: attention and feed-forward with residual connections,
    ///    writing key/value for `pos` into the cache
    /// 3. **Final Normalization**: RMSNorm of the residual stream
    /// 4. **Classification Head**: projection to vocabulary logits
    ///
    /// # Panics
    /// If `pos >= seq_len` (the cache has no room) or `token >= vocab_size`.
    pub fn forward<'s>(&self, state: &'s mut RunState, token: usize, pos: usize) -> &'s mut [f32] {
        assert!(pos < self.config.seq_len, "position {pos} exceeds sequence length {}", self.config.seq_len);
        assert!(token < self.config.vocab_size, "token {token} is outside the vocabulary");
        debug_assert_eq!(state.x.len(), self.config.dim, "run state was sized for another model");

        state.x.copy_from_slice(self.weights.token_embedding(token));

        let rope = RoPE::new(self.config.head_size());
        rope.compute_freqs(pos, &mut state.rope_freqs);

        for layer_idx in 0..self.config.n_layers {
            self.block(layer_idx).forward(pos, state);
        }

        rmsnorm_inplace(&mut state.x, self.weights.rms_final_weight());

        matmul(&mut state.logits, &state.x, self.weights.wcls());

        &mut state.logits
    }

    fn block(&self, layer_idx: usize) -> TransformerBlock<'_> {
        let w = &self.weights;

        TransformerBlock {
            layer_idx,
            attn_norm: w.rms_att_weight(layer_idx),
            attention: MultiHeadAttention {
                wq: w.wq(layer_idx),
                wk: w.wk(layer_idx),
                wv: w.wv(layer_idx),
                wo: w.wo(layer_idx),
                n_heads: self.config.n_heads,
                head_size: self.config.head_size(),
                kv_dim: self.config.kv_dim(),
                kv_mul: self.config.kv_mul(),
                seq_len: self.config.seq_len,
            },
            ffn_norm: w.rms_ffn_weight(layer_idx),
            feed_forward: FeedForward { w1: w.w1(layer_idx), w2: w.w2(layer_idx), w3: w.w3(layer_idx) },
        }
    }
}

/// Rotary Position Embedding (RoPE) over adjacent component pairs `(2i, 2i + 1)` of every head.
///
/// Pair `i` is rotated by `pos * base^(-2i / head_size)`.
struct RoPE {
    head_size: usize,
}

impl RoPE {
    fn new(head_size: usize) -> Self {
        Self { head_size }
    }

    fn compute_freqs(&self, pos: usize, freqs: &mut [(f32, f32)]) {
        debug_assert_eq!(freqs.len(), self.head_size / 2);

        freqs.iter_mut().enumerate().for_each(|(pair_idx, freq_out)| {
            let freq = ROPE_BASE_FREQ.powf(-((2 * pair_idx) as f32) / self.head_size as f32);
            let angle = pos as f32 * freq;
            *freq_out = (angle.cos(), angle.sin());
        });
    }

    /// Rotates every head found in `x` (its length must be a multiple of the head size).
    fn apply(&self, x: &mut [f32], freqs: &[(f32, f32)]) {
        x.chunks_exact_mut(self.head_size).for_each(|head| {
            head.chunks_exact_mut(2).zip(freqs.iter()).for_each(|(pair, &(cos, sin))| {
                let v0 = pair[0];
                let v1 = pair[1];
                pair[0] = v0 * cos - v1 * sin;
                pair[1] = v0 * sin + v1 * cos;
            });
        });
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// `n_heads` query heads read `n_heads / kv_mul` key/value heads, query head `h`
/// uses key/value head `h / kv_mul`.
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
struct MultiHeadAttention<'w> {
    wq: &'w [f32],
    wk: &'w [f32],
    wv: &'w [f32],
    wo: &'w [f32],
    n_heads: usize,
    head_size: usize,
    kv_dim: usize,
    kv_mul: usize,
    seq_len: usize,
}

impl MultiHeadAttention<'_> {
    /// Reads the normalized input from `state.xb`, leaves concatenated head outputs in `state.xb`.
    fn forward(&self, pos: usize, layer_idx: usize, state: &mut RunState) {
        let kv_cache_offset = layer_idx * self.seq_len * self.kv_dim;
        let current_pos = kv_cache_offset + pos * self.kv_dim..kv_cache_offset + (pos + 1) * self.kv_dim;

        // Q, K, V projections, key and value go straight into the cache slot for `pos`
        matmul(&mut state.q, &state.xb, self.wq);
        matmul(&mut state.key_cache[current_pos.clone()], &state.xb, self.wk);
        matmul(&mut state.value_cache[current_pos.clone()], &state.xb, self.wv);

        let rope = RoPE::new(self.head_size);
        rope.apply(&mut state.q, &state.rope_freqs);
        rope.apply(&mut state.key_cache[current_pos], &state.rope_freqs);

        self.compute_attention(pos, kv_cache_offset, state);
    }

    fn compute_attention(&self, pos: usize, kv_cache_offset: usize, state: &mut RunState) {
        let attention_scale = (self.head_size as f32).sqrt().recip();
        let head_size = self.head_size;

        let q = &state.q;
        let key_cache = &state.key_cache;
        let value_cache = &state.value_cache;

        state
            .att
            .par_chunks_mut(self.seq_len)
            .zip(state.xb.par_chunks_mut(head_size))
            .enumerate()
            .take(self.n_heads)
            .for_each(|(head_idx, (att_slice, xb_slice))| {
                let q_head = &q[head_idx * head_size..(head_idx + 1) * head_size];
                let kv_head_offset = kv_cache_offset + (head_idx / self.kv_mul) * head_size;

                // Scores against every cached key up to and including `pos`
                let att_head = &mut att_slice[..=pos];
                att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                    let k_start = kv_head_offset + time_step * self.kv_dim;
                    *att_score = dot(q_head, &key_cache[k_start..k_start + head_size]) * attention_scale;
                });

                softmax(att_head);

                // Weighted sum of the values
                xb_slice.fill(0.0);
                att_head.iter().enumerate().for_each(|(time_step, &attention_weight)| {
                    let v_start = kv_head_offset + time_step * self.kv_dim;
                    xb_slice
                        .iter_mut()
                        .zip(&value_cache[v_start..v_start + head_size])
                        .for_each(|(out, &value)| *out += attention_weight * value);
                });
            });
    }
}

/// Feed-Forward Network with SwiGLU activation: `w2(silu(w1(x)) * w3(x))`.
struct FeedForward<'w> {
    w1: &'w [f32], // Gate projection
    w2: &'w [f32], // Down projection
    w3: &'w [f32], // Up projection
}

impl FeedForward<'_> {
    /// Reads the normalized input from `state.xb`, leaves the output in `state.xb`.
    fn forward(&self, state: &mut RunState) {
        matmul(&mut state.hb, &state.xb, self.w1);
        matmul(&mut state.hb2, &state.xb, self.w3);

        swiglu(&mut state.hb, &state.hb2);

        matmul(&mut state.xb, &state.hb, self.w2);
    }
}

/// Transformer Block - pre-norm decoder layer:
/// ```text
/// x = x + Attention(RMSNorm(x))
/// x = x + FFN(RMSNorm(x))
/// ```
struct TransformerBlock<'w> {
    layer_idx: usize,
    attn_norm: &'w [f32],
    attention: MultiHeadAttention<'w>,
    ffn_norm: &'w [f32],
    feed_forward: FeedForward<'w>,
}

impl TransformerBlock<'_> {
    fn forward(&self, pos: usize, state: &mut RunState) {
        // Attention block with residual connection
        rmsnorm(&mut state.xb, &state.x, self.attn_norm);
        self.attention.forward(pos, self.layer_idx, state);
        matmul(&mut state.xb2, &state.xb, self.attention.wo);
        accumulate(&mut state.x, &state.xb2);

        // Feed-forward block with residual connection
        rmsnorm(&mut state.xb, &state.x, self.ffn_norm);
        self.feed_forward.forward(state);
        accumulate(&mut state.x, &state.xb);
    }
}

/// Builder pattern for loading transformer models from checkpoint files
pub struct TransformerBuilder {
    checkpoint_path: PathBuf,
    ctx_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self { checkpoint_path: checkpoint_path.as_ref().to_path_buf(), ctx_length: None }
    }

    /// Limits the sequence length (and thereby the key/value cache size) below the model maximum.
    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Transformer> {
        let file = File::open(&self.checkpoint_path)
            .with_context(|| format!("Failed to open checkpoint: {}", self.checkpoint_path.display()))?;

        let mut mapper = MemoryMapper::new(file)?;

        let mut config = read_config(&mut mapper)?;
        debug!("{config:#?}");

        let layout = TensorLayout::new(&config).context("Invalid model configuration")?;
        let available = mapper.remaining();

        if available < layout.byte_len() {
            anyhow::bail!(
                "Checkpoint truncated: weights need {} bytes, file has {} after the header ({} total)",
                layout.byte_len(),
                available,
                mapper.len()
            );
        }

        if available > layout.byte_len() {
            warn!("Checkpoint has {} unused trailing bytes", available - layout.byte_len());
        }

        let storage = mapper.into_float_storage(layout.total)?;

        // Apply context length override if provided
        if let Some(ctx_len) = self.ctx_length.filter(|&len| len > 0) {
            config.seq_len = ctx_len.min(config.seq_len);
        }

        let weights = TransformerWeights::new(&config, storage)?;

        Ok(Transformer { config, weights })
    }
}

/// Runtime state for transformer inference.
///
/// Contains the activation buffers overwritten on every step and the key/value
/// cache, which grows by one position per step. Buffers are pre-allocated from
/// the model configuration.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Residual stream, shape: [dim]
    x: Vec<f32>,
    /// Activation inside a residual branch, shape: [dim]
    xb: Vec<f32>,
    /// Additional branch buffer, shape: [dim]
    xb2: Vec<f32>,
    /// Hidden buffer for the FFN gate, shape: [hidden_dim]
    hb: Vec<f32>,
    /// Hidden buffer for the FFN up projection, shape: [hidden_dim]
    hb2: Vec<f32>,
    /// Query buffer, shape: [dim]
    q: Vec<f32>,
    /// Attention scores, shape: [n_heads, seq_len]
    att: Vec<f32>,
    /// Output logits, shape: [vocab_size]
    logits: Vec<f32>,
    /// Keys, shape: [n_layers, seq_len, kv_dim]
    key_cache: Vec<f32>,
    /// Values, shape: [n_layers, seq_len, kv_dim]
    value_cache: Vec<f32>,
    /// (cos, sin) per rotary pair for the current position, shape: [head_size / 2]
    rope_freqs: Vec<(f32, f32)>,
    seq_len: usize,
    kv_dim: usize,
}

impl RunState {
    /// Creates a new runtime state with pre-allocated buffers based on model configuration.
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, n_layers, n_heads, vocab_size, seq_len, .. } = *config;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; dim],
            att: vec![0.0; n_heads * seq_len],
            logits: vec![0.0; vocab_size],
            key_cache: vec![0.0; n_layers * seq_len * kv_dim],
            value_cache: vec![0.0; n_layers * seq_len * kv_dim],
            rope_freqs: vec![(0.0, 0.0); config.head_size() / 2],
            seq_len,
            kv_dim,
        }
    }

    /// Logits produced by the last forward pass.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn key_cache(&self) -> &[f32] {
        &self.key_cache
    }

    pub fn value_cache(&self) -> &[f32] {
        &self.value_cache
    }

    /// Cached key and value rows of `layer` at position `pos`.
    pub fn kv_at(&self, layer: usize, pos: usize) -> (&[f32], &[f32]) {
        let start = (layer * self.seq_len + pos) * self.kv_dim;
        let range = start..start + self.kv_dim;
        (&self.key_cache[range.clone()], &self.value_cache[range])
    }
}

#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod transformer_test;
