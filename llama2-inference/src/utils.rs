use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::mem;
use std::slice;

/// Sequential reader over a memory-mapped checkpoint file.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        // SAFETY: the mapping is read-only; the checkpoint must not be modified while it is loaded.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file).context("Failed to create memory mapping")? };
        Ok(Self { mmap, offset: 0 })
    }

    /// Total size of the mapped file in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn remaining(&self) -> usize {
        self.mmap.len() - self.offset
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            anyhow::bail!("Insufficient data: need {} bytes, have {} remaining", count, self.remaining());
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    /// Turns the next `count` floats into a storage that borrows the mapping for its whole lifetime.
    pub fn into_float_storage(self, count: usize) -> Result<FloatStorage> {
        let bytes_needed = count * mem::size_of::<f32>();

        if bytes_needed > self.remaining() {
            anyhow::bail!("Insufficient data: need {} bytes, have {} remaining", bytes_needed, self.remaining());
        }

        if cfg!(target_endian = "big") {
            anyhow::bail!("Memory-mapped checkpoints require a little-endian host");
        }

        let start = &self.mmap[self.offset..];
        if start.as_ptr().align_offset(mem::align_of::<f32>()) != 0 {
            anyhow::bail!("Weights at byte offset {} are not aligned for f32 access", self.offset);
        }

        Ok(FloatStorage::Mapped { mmap: self.mmap, offset: self.offset, len: count })
    }
}

/// Backing store of all model floats: either a view into the mapped checkpoint or an owned buffer.
pub(crate) enum FloatStorage {
    Mapped { mmap: Mmap, offset: usize, len: usize },
    Owned(Vec<f32>),
}

impl FloatStorage {
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        match self {
            FloatStorage::Mapped { mmap, offset, len } => {
                let bytes = &mmap[*offset..*offset + *len * mem::size_of::<f32>()];
                // SAFETY: bounds and alignment were checked in `into_float_storage`,
                // the host is little-endian and every bit pattern is a valid f32.
                unsafe { slice::from_raw_parts(bytes.as_ptr() as *const f32, *len) }
            }
            FloatStorage::Owned(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FloatStorage::Mapped { len, .. } => *len,
            FloatStorage::Owned(data) => data.len(),
        }
    }
}

impl std::fmt::Debug for FloatStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            FloatStorage::Mapped { .. } => "mapped",
            FloatStorage::Owned(_) => "owned",
        };

        f.debug_struct("FloatStorage").field("kind", &kind).field("floats", &self.len()).finish()
    }
}
