use anyhow::{Context, Result};
use log::{debug, info};
use memmap2::Mmap;
use rayon::prelude::*;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use std::{
    fs::File,
    mem,
    path::{Path, PathBuf},
};

/// A tensor converted to `f32` together with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Reads tensors by name from every SafeTensors shard of a model directory.
///
/// Shards are memory-mapped once; a lookup only parses the small JSON header of each shard.
#[derive(Debug)]
pub struct TensorReader {
    shards: Vec<(PathBuf, Mmap)>,
}

impl TensorReader {
    pub fn new(model_path: &Path) -> Result<Self> {
        let mut paths = std::fs::read_dir(model_path)
            .with_context(|| format!("Failed to read directory: {}", model_path.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();

        if paths.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", model_path.display());
        }

        // shard names carry their index, keep lookups deterministic
        paths.sort();

        let shards = paths
            .into_iter()
            .map(|path| {
                let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
                // SAFETY: the mapping is read-only and the exporter never writes into its own input files.
                let mmap =
                    unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?;
                SafeTensors::deserialize(&mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;
                Ok((path, mmap))
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Found {} safetensor files", shards.len());

        Ok(Self { shards })
    }

    /// Names of all tensors across shards, sorted.
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (path, mmap) in &self.shards {
            let tensors =
                SafeTensors::deserialize(mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;
            names.extend(tensors.names().into_iter().cloned());
        }
        names.sort();

        Ok(names)
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.shards.iter().any(|(_, mmap)| {
            SafeTensors::deserialize(mmap).is_ok_and(|tensors| tensors.tensor(tensor_name).is_ok())
        })
    }

    /// Loads a tensor by name, converting from BF16/F32 to F32. Returns `None` when no shard has it.
    pub fn load_tensor(&self, tensor_name: &str) -> Result<Option<Tensor>> {
        for (path, mmap) in &self.shards {
            let tensors =
                SafeTensors::deserialize(mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;

            if let Ok(view) = tensors.tensor(tensor_name) {
                debug!("Loading {tensor_name} {:?} {:?} from {}", view.dtype(), view.shape(), path.display());
                let data = convert_tensor_to_f32(&view, tensor_name)?;
                return Ok(Some(Tensor { shape: view.shape().to_vec(), data }));
            }
        }

        Ok(None)
    }

    /// Loads a tensor that must exist.
    pub fn require_tensor(&self, tensor_name: &str) -> Result<Tensor> {
        self.load_tensor(tensor_name)?.ok_or_else(|| anyhow::anyhow!("Missing weight tensor: {}", tensor_name))
    }
}

fn convert_tensor_to_f32(view: &TensorView, tensor_name: &str) -> Result<Vec<f32>> {
    let data = view.data();
    let expected_elements = view.shape().iter().product::<usize>();

    match view.dtype() {
        Dtype::F32 => {
            validate_tensor_size(data.len(), expected_elements * mem::size_of::<f32>(), tensor_name, "F32")?;
            Ok(convert_f32_data(data))
        }
        Dtype::BF16 => {
            validate_tensor_size(data.len(), expected_elements * 2, tensor_name, "BF16")?;
            Ok(convert_bf16_data(data))
        }
        dtype => anyhow::bail!("Unsupported tensor dtype {:?} for {}", dtype, tensor_name),
    }
}

fn validate_tensor_size(actual_bytes: usize, expected_bytes: usize, tensor_name: &str, dtype_name: &str) -> Result<()> {
    if actual_bytes != expected_bytes {
        anyhow::bail!(
            "{} tensor {} size mismatch. Expected {} bytes, got {}",
            dtype_name,
            tensor_name,
            expected_bytes,
            actual_bytes
        );
    }
    Ok(())
}

fn convert_f32_data(data: &[u8]) -> Vec<f32> {
    data.par_chunks_exact(mem::size_of::<f32>())
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// BF16 is the upper half of an F32, so widening is a shift.
fn convert_bf16_data(data: &[u8]) -> Vec<f32> {
    data.par_chunks_exact(2)
        .map(|chunk| f32::from_bits(u32::from(u16::from_le_bytes([chunk[0], chunk[1]])) << 16))
        .collect()
}
