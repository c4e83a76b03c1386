//! # llama2-export
//!
//! Converts a HuggingFace Llama model directory (`config.json`, `*.safetensors`, `tokenizer.json`)
//! into the f32 checkpoint and binary vocabulary read by `llama2-inference`.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use llama2_export::export_model;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! export_model(
//!     Path::new("path/to/huggingface/model"),
//!     Path::new("model.bin"),
//!     Path::new("tokenizer.bin"),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod model_exporter;
pub mod tensor_reader;
pub mod tokenizer_exporter;
mod utils;

pub use config_loader::{ModelConfig, load_hf_config};
pub use model_exporter::CheckpointExporter;
pub use tensor_reader::TensorReader;
pub use tokenizer_exporter::TokenizerExporter;

use anyhow::Result;
use log::info;
use std::path::Path;

/// Export the model weights as an f32 checkpoint and the tokenizer as a binary vocabulary.
pub fn export_model(model_path: &Path, checkpoint_path: &Path, tokenizer_path: &Path) -> Result<()> {
    info!("🚀 Starting model export from {}", model_path.display());
    info!("");

    let config = load_hf_config(model_path)?;

    info!("🧮 Exporting checkpoint...");
    CheckpointExporter::new(config.clone()).export_checkpoint(model_path, checkpoint_path)?;
    info!("");

    info!("🔤 Exporting tokenizer...");
    TokenizerExporter::new().export_tokenizer(model_path, tokenizer_path, config.vocab_size)?;

    info!("");
    info!("✅ Complete export finished successfully!");
    Ok(())
}
