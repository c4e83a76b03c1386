use std::io::Cursor;

use crate::utils::MemoryMapper;
use anyhow::{Context, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};

/// Size of the checkpoint header in bytes (7 i32 fields).
pub const HEADER_SIZE: usize = 28;

/// Configuration struct for transformer models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Transformer (embedding) dimension
    pub dim: usize,
    /// Feed-forward hidden dimension
    pub hidden_dim: usize,
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads, can be less than query heads (multi-query / grouped-query attention)
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Maximum sequence length
    pub seq_len: usize,
    /// Classifier reuses the token embedding table
    pub shared_classifier: bool,
}

impl ModelConfig {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of a single key (or value) row in the cache.
    pub fn kv_dim(&self) -> usize {
        self.head_size() * self.n_kv_heads
    }

    /// How many query heads share one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Converts back to the on-disk header where the vocabulary sign carries the sharing flag.
    pub fn to_header(&self) -> [i32; 7] {
        let vocab_size = self.vocab_size as i32;
        [
            self.dim as i32,
            self.hidden_dim as i32,
            self.n_layers as i32,
            self.n_heads as i32,
            self.n_kv_heads as i32,
            if self.shared_classifier { -vocab_size } else { vocab_size },
            self.seq_len as i32,
        ]
    }
}

/// Raw checkpoint header as stored in the file.
#[derive(Debug, Clone, Copy)]
struct CheckpointHeader {
    dim: i32,
    hidden_dim: i32,
    n_layers: i32,
    n_heads: i32,
    n_kv_heads: i32,
    vocab_size: i32,
    seq_len: i32,
}

impl TryFrom<CheckpointHeader> for ModelConfig {
    type Error = Error;

    fn try_from(header: CheckpointHeader) -> Result<ModelConfig> {
        validate_header(&header).with_context(|| "Invalid model configuration")?;

        Ok(ModelConfig {
            dim: header.dim as usize,
            hidden_dim: header.hidden_dim as usize,
            n_layers: header.n_layers as usize,
            n_heads: header.n_heads as usize,
            n_kv_heads: header.n_kv_heads as usize,
            vocab_size: header.vocab_size.unsigned_abs() as usize,
            seq_len: header.seq_len as usize,
            shared_classifier: header.vocab_size < 0,
        })
    }
}

/// Reads and validates the model configuration from checkpoint data (mapper).
///
/// The configuration is stored as 7 consecutive i32 values in little-endian format:
/// `dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len`.
/// A negative `vocab_size` means the classifier shares the token embedding weights.
pub(crate) fn read_config(mapper: &mut MemoryMapper) -> Result<ModelConfig> {
    let data = mapper.get_bytes(HEADER_SIZE).context("Checkpoint is too short to hold a header")?;
    parse_header(data)
}

/// Parses a checkpoint header from raw bytes.
pub fn parse_header(data: &[u8]) -> Result<ModelConfig> {
    if data.len() < HEADER_SIZE {
        anyhow::bail!("Insufficient data for config: need {} bytes, got {}", HEADER_SIZE, data.len());
    }

    let mut cursor = Cursor::new(data);

    macro_rules! read_i32 {
        ($field:literal) => {
            cursor.read_i32::<LittleEndian>().with_context(|| format!("Failed to read {}", $field))?
        };
    }

    let header = CheckpointHeader {
        dim: read_i32!("dimension"),
        hidden_dim: read_i32!("hidden dimension"),
        n_layers: read_i32!("number of layers"),
        n_heads: read_i32!("number of heads"),
        n_kv_heads: read_i32!("number of KV heads"),
        vocab_size: read_i32!("vocabulary size"),
        seq_len: read_i32!("sequence length"),
    };

    header.try_into()
}

/// Validates the model configuration to ensure it's supported.
fn validate_header(header: &CheckpointHeader) -> Result<()> {
    let dimensions = [
        ("dim", header.dim),
        ("hidden_dim", header.hidden_dim),
        ("n_layers", header.n_layers),
        ("n_heads", header.n_heads),
        ("n_kv_heads", header.n_kv_heads),
        ("seq_len", header.seq_len),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
        }
    }

    if header.vocab_size == 0 || header.vocab_size == i32::MIN {
        anyhow::bail!("Invalid vocab_size: {}", header.vocab_size);
    }

    if header.dim % header.n_heads != 0 {
        anyhow::bail!("dim {} is not divisible by n_heads {}", header.dim, header.n_heads);
    }

    if header.n_heads % header.n_kv_heads != 0 {
        anyhow::bail!("n_heads {} is not divisible by n_kv_heads {}", header.n_heads, header.n_kv_heads);
    }

    let head_size = header.dim / header.n_heads;
    if head_size % 2 != 0 {
        anyhow::bail!("head size {head_size} must be even for rotary embeddings");
    }

    Ok(())
}
