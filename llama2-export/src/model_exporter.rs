#[cfg(test)]
#[path = "../tests/unit/model_exporter_test.rs"]
mod model_exporter_test;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use log::info;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::ModelConfig;
use crate::tensor_reader::TensorReader;
use crate::utils::ProgressTracker;

const EMBED_TOKENS: &str = "model.embed_tokens.weight";
const FINAL_NORM: &str = "model.norm.weight";
const LM_HEAD: &str = "lm_head.weight";

/// How a source tensor is rearranged before it is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    AsIs,
    /// Rotary projection with this many heads, stored in the half-split order
    Rotary(usize),
}

/// One tensor of the checkpoint body, in file order.
#[derive(Clone, Debug)]
struct CheckpointTensor {
    name: String,
    elements: usize,
    layout: Layout,
}

/// Writes HuggingFace Llama weights as an f32 checkpoint the inference engine can map.
#[derive(Debug)]
pub struct CheckpointExporter {
    config: ModelConfig,
}

impl CheckpointExporter {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn export_checkpoint(&self, model_path: &Path, output_path: &Path) -> Result<()> {
        let tensor_reader = TensorReader::new(model_path)?;
        log::debug!("Tensor names: {:?}", tensor_reader.tensor_names()?);

        let shared_classifier = self.config.tie_word_embeddings || !tensor_reader.contains(LM_HEAD);
        if shared_classifier {
            info!("Classifier shares the token embedding weights");
        }

        let file = File::create(output_path)
            .with_context(|| format!("Failed to create checkpoint {}", output_path.display()))?;
        let mut writer = BufWriter::new(file);

        self.write_header(&mut writer, shared_classifier)?;

        let tensors = self.checkpoint_tensors(shared_classifier);
        let progress = ProgressTracker::new(tensors.len(), "Exporting");

        for (i, entry) in tensors.iter().enumerate() {
            progress.set_current(i + 1, &entry.name);

            let tensor = tensor_reader.require_tensor(&entry.name)?;
            if tensor.data.len() != entry.elements {
                anyhow::bail!(
                    "Tensor {} has {} elements ({:?}), expected {}",
                    entry.name,
                    tensor.data.len(),
                    tensor.shape,
                    entry.elements
                );
            }

            let data = match entry.layout {
                Layout::AsIs => tensor.data,
                Layout::Rotary(n_heads) => unpermute_rotary(&tensor.data, n_heads, self.config.dim)?,
            };

            data.iter().try_for_each(|&value| writer.write_f32::<LittleEndian>(value))?;
        }

        writer.flush()?;
        info!("💾 Written model checkpoint to {}", output_path.display());

        Ok(())
    }

    /// Writes the seven header fields, negating the vocabulary size when the classifier is shared.
    fn write_header<W: Write>(&self, writer: &mut W, shared_classifier: bool) -> Result<()> {
        let config = &self.config;
        let vocab_size = config.vocab_size as i32;

        for value in [config.dim, config.hidden_dim, config.n_layers, config.n_heads, config.n_kv_heads] {
            writer.write_i32::<LittleEndian>(value as i32)?;
        }
        writer.write_i32::<LittleEndian>(if shared_classifier { -vocab_size } else { vocab_size })?;
        writer.write_i32::<LittleEndian>(config.max_seq_len as i32)?;

        Ok(())
    }

    /// Lists the checkpoint body: every per-layer kind is written for all layers before the next kind.
    fn checkpoint_tensors(&self, shared_classifier: bool) -> Vec<CheckpointTensor> {
        let config = &self.config;
        let (dim, hidden, kv_dim) = (config.dim, config.hidden_dim, config.kv_dim());

        let per_layer: [(&str, usize, Layout); 9] = [
            ("input_layernorm.weight", dim, Layout::AsIs),
            ("self_attn.q_proj.weight", dim * dim, Layout::Rotary(config.n_heads)),
            ("self_attn.k_proj.weight", kv_dim * dim, Layout::Rotary(config.n_kv_heads)),
            ("self_attn.v_proj.weight", kv_dim * dim, Layout::AsIs),
            ("self_attn.o_proj.weight", dim * dim, Layout::AsIs),
            ("post_attention_layernorm.weight", dim, Layout::AsIs),
            ("mlp.gate_proj.weight", hidden * dim, Layout::AsIs),
            ("mlp.down_proj.weight", dim * hidden, Layout::AsIs),
            ("mlp.up_proj.weight", hidden * dim, Layout::AsIs),
        ];

        let mut entries = Vec::with_capacity(2 + per_layer.len() * config.n_layers + usize::from(!shared_classifier));
        entries.push(CheckpointTensor { name: EMBED_TOKENS.to_string(), elements: config.vocab_size * dim, layout: Layout::AsIs });

        for (suffix, elements, layout) in per_layer {
            entries.extend((0..config.n_layers).map(|layer_idx| CheckpointTensor {
                name: format!("model.layers.{layer_idx}.{suffix}"),
                elements,
                layout,
            }));
        }

        entries.push(CheckpointTensor { name: FINAL_NORM.to_string(), elements: dim, layout: Layout::AsIs });

        if !shared_classifier {
            entries.push(CheckpointTensor { name: LM_HEAD.to_string(), elements: config.vocab_size * dim, layout: Layout::AsIs });
        }

        entries
    }
}

/// Reorders the rows of a rotary projection from the half-split layout back to interleaved pairs.
///
/// Within each head, source row `j * half + i` becomes output row `2 * i + j`.
pub fn unpermute_rotary(weights: &[f32], n_heads: usize, cols: usize) -> Result<Vec<f32>> {
    if cols == 0 || n_heads == 0 || weights.len() % (n_heads * cols) != 0 {
        anyhow::bail!("Cannot split {} weights into {} heads of {} columns", weights.len(), n_heads, cols);
    }

    let head_rows = weights.len() / (n_heads * cols);
    if head_rows % 2 != 0 {
        anyhow::bail!("Rotary head size {} is odd", head_rows);
    }
    let half = head_rows / 2;

    let mut output = vec![0.0; weights.len()];
    output.par_chunks_exact_mut(cols).enumerate().for_each(|(row, out)| {
        let (head, within) = (row / head_rows, row % head_rows);
        let (i, j) = (within / 2, within % 2);
        let source = head * head_rows + j * half + i;
        out.copy_from_slice(&weights[source * cols..(source + 1) * cols]);
    });

    Ok(output)
}
