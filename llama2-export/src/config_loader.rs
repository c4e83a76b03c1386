#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path};

/// The only HuggingFace architecture whose weights map onto the checkpoint layout.
pub const SUPPORTED_ARCHITECTURE: &str = "LlamaForCausalLM";

/// Model hyperparameters read from a HuggingFace `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    /// Output projection shares the token embedding weights
    pub tie_word_embeddings: bool,
}

impl ModelConfig {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.head_size() * self.n_kv_heads
    }

    /// Checks the shape constraints the checkpoint format relies on.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("hidden_size", self.dim),
            ("intermediate_size", self.hidden_dim),
            ("num_hidden_layers", self.n_layers),
            ("num_attention_heads", self.n_heads),
            ("num_key_value_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_seq_len),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!("{name} must be positive");
            }
            if i32::try_from(value).is_err() {
                anyhow::bail!("{name} = {value} does not fit the checkpoint header");
            }
        }

        if self.dim % self.n_heads != 0 || self.head_size() % 2 != 0 {
            anyhow::bail!("hidden_size {} does not split into even heads of {} heads", self.dim, self.n_heads);
        }

        if self.n_heads % self.n_kv_heads != 0 {
            anyhow::bail!("num_attention_heads {} is not a multiple of num_key_value_heads {}", self.n_heads, self.n_kv_heads);
        }

        Ok(())
    }
}

/// Loads the model configuration from `config.json` inside a HuggingFace model directory.
pub fn load_hf_config(model_path: &Path) -> Result<ModelConfig> {
    let config_path = model_path.join("config.json");
    let mut file = File::open(&config_path)
        .with_context(|| format!("Failed to open config.json at {}", config_path.display()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    #[derive(Debug, Deserialize)]
    struct HFConfig {
        hidden_size: usize,
        intermediate_size: usize,
        num_hidden_layers: usize,
        num_attention_heads: usize,
        #[serde(default)]
        num_key_value_heads: Option<usize>,
        vocab_size: usize,
        max_position_embeddings: usize,
        #[serde(default)]
        tie_word_embeddings: bool,
        #[serde(default)]
        architectures: Option<Vec<String>>,
    }

    let hf_config: HFConfig =
        serde_json::from_str(&contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {}", err))?;

    match hf_config.architectures.as_deref() {
        None | Some([]) => {}
        Some([architecture]) if architecture == SUPPORTED_ARCHITECTURE => {}
        Some(architectures) => anyhow::bail!("Unsupported architectures: {architectures:?}"),
    }

    let config = ModelConfig {
        dim: hf_config.hidden_size,
        hidden_dim: hf_config.intermediate_size,
        n_layers: hf_config.num_hidden_layers,
        n_heads: hf_config.num_attention_heads,
        n_kv_heads: hf_config.num_key_value_heads.unwrap_or(hf_config.num_attention_heads),
        vocab_size: hf_config.vocab_size,
        max_seq_len: hf_config.max_position_embeddings,
        tie_word_embeddings: hf_config.tie_word_embeddings,
    };

    config.validate().context("Invalid model configuration")?;

    info!("Model configuration loaded:");
    info!("   • Dimensions: {}", config.dim);
    info!("   • Hidden dimensions: {}", config.hidden_dim);
    info!("   • Layers: {}", config.n_layers);
    info!("   • Attention heads: {}", config.n_heads);
    info!("   • KV heads: {}", config.n_kv_heads);
    info!("   • Vocabulary size: {}", config.vocab_size);
    info!("   • Max sequence length: {}", config.max_seq_len);
    info!("   • Tied embeddings: {}", config.tie_word_embeddings);
    info!("");

    Ok(config)
}
