//! Llama-2 inference on the CPU.
//!
//! Loads a flat `f32` checkpoint and a BPE vocabulary, then completes prompts or runs an
//! interactive chat, one token per forward pass.
//!
//! ```rust,no_run
//! use llama2_inference::{InferenceConfig, run_inference};
//!
//! let config = InferenceConfig::builder()
//!     .checkpoint_path(Some(&"stories15M.bin".to_string()))
//!     .prompt(Some(&"Once upon a time".to_string()))
//!     .build()
//!     .map_err(anyhow::Error::msg)?;
//!
//! run_inference(config)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod configuration;
pub mod generation;
pub mod kernels;
pub mod sampler;
pub mod tokenizer;
pub mod transformer;
mod utils;
pub mod weights;

use anyhow::Result;
use log::{debug, info};
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::configuration::ModelConfig;
pub use crate::generation::{ChatPrompts, GenerationOptions, GenerationSummary, chat, generate};
pub use crate::sampler::Sampler;
pub use crate::tokenizer::Tokenizer;
pub use crate::transformer::{RunState, Transformer, TransformerBuilder};

const DEFAULT_TOKENIZER_PATH: &str = "tokenizer.bin";
const DEFAULT_TEMPERATURE: f32 = 1.0;
const DEFAULT_TOPP: f32 = 0.9;
const DEFAULT_STEPS: usize = 256;

/// Generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Chat,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "generate" => Ok(Mode::Generate),
            "chat" => Ok(Mode::Chat),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: String,
    pub tokenizer_path: String,
    pub temperature: f32,
    pub topp: f32,
    /// Number of positions to run, 0 means the model's sequence length
    pub steps: usize,
    pub ctx_length: Option<usize>,
    pub mode: Mode,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub seed: u64,
    pub stop_at_eos: bool,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions { steps: self.steps, stop_at_eos: self.stop_at_eos }
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    tokenizer_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    ctx_length: Option<usize>,
    mode: Option<String>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    seed: Option<u64>,
    stop_at_eos: Option<bool>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn stop_at_eos(mut self, stop_at_eos: Option<bool>) -> Self {
        self.stop_at_eos = stop_at_eos;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let mode = match self.mode {
            Some(mode) => mode.parse()?,
            None => Mode::Generate,
        };

        Ok(InferenceConfig {
            checkpoint_path: self.checkpoint_path.ok_or("checkpoint_path is required")?,
            tokenizer_path: self.tokenizer_path.unwrap_or_else(|| DEFAULT_TOKENIZER_PATH.to_string()),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE).max(0.0),
            topp: self.topp.filter(|topp| (0.0..=1.0).contains(topp)).unwrap_or(DEFAULT_TOPP),
            steps: self.steps.unwrap_or(DEFAULT_STEPS),
            ctx_length: self.ctx_length,
            mode,
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or_default()
            }),
            stop_at_eos: self.stop_at_eos.unwrap_or(true),
        })
    }
}

/// Runs inference, writing generated text to stdout.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let transformer = TransformerBuilder::new(&inference_config.checkpoint_path)
        .with_ctx_length(inference_config.ctx_length)
        .build()?;

    debug!("{transformer:#?}");

    let transformer_config = transformer.config();

    let tokenizer = Tokenizer::new(&inference_config.tokenizer_path, transformer_config.vocab_size)?;

    debug!("{tokenizer:#?}");

    let mut sampler = Sampler::new(
        transformer_config.vocab_size,
        inference_config.temperature,
        inference_config.topp,
        inference_config.seed,
    );

    let options = inference_config.generation_options();
    let prompt = inference_config.prompt.as_deref();
    let system_prompt = inference_config.system_prompt.as_deref();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    // Run
    let summary = match inference_config.mode {
        Mode::Generate => generate(&transformer, &tokenizer, &mut sampler, prompt.unwrap_or(""), options, &mut out)?,
        Mode::Chat => {
            let prompts = ChatPrompts { user: prompt, system: system_prompt };
            chat(&transformer, &tokenizer, &mut sampler, prompts, options, &mut io::stdin().lock(), &mut out)?
        }
    };
    out.flush()?;

    info!("Ran {} positions, generated {} tokens", summary.positions, summary.generated.len());

    Ok(())
}
