#[cfg(test)]
#[path = "../tests/unit/tokenizer_exporter_test.rs"]
mod tests;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

/// SentencePiece marks a word boundary with this character instead of a space.
const SPACE_MARKER: char = '▁';

/// Tokenizer exporter converting a HuggingFace `tokenizer.json` into the binary vocabulary format
#[derive(Debug)]
pub struct TokenizerExporter;

/// One vocabulary entry as written to the binary file.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEntry {
    pub bytes: Vec<u8>,
    pub score: f32,
}

impl TokenizerExporter {
    const TOKENIZER_FILE_NAME: &'static str = "tokenizer.json";
    const DEFAULT_SCORE: f32 = -1e6;

    pub const fn new() -> Self {
        Self
    }

    /// Export the tokenizer of `model_path` with exactly `vocab_size` entries.
    pub fn export_tokenizer(&self, model_path: &Path, output_path: &Path, vocab_size: usize) -> Result<()> {
        let tokenizer_data = self.load_tokenizer_json(model_path)?;
        let entries = self.build_entries(&tokenizer_data, vocab_size)?;

        self.write_tokenizer_file(output_path, &entries)
    }

    /// Orders tokens by id and scores them, earlier merges scoring higher.
    pub fn build_entries(&self, tokenizer_data: &Value, vocab_size: usize) -> Result<Vec<TokenEntry>> {
        let mut vocab = self.extract_vocabulary(tokenizer_data)?;
        self.add_special_tokens(tokenizer_data, &mut vocab);

        let merge_ranks = self.extract_merge_ranks(tokenizer_data);

        let mut tokens_by_id: Vec<Option<&str>> = vec![None; vocab_size];
        let mut ignored = 0;
        for (token, &id) in &vocab {
            match tokens_by_id.get_mut(id) {
                Some(slot) => *slot = Some(token.as_str()),
                None => ignored += 1,
            }
        }

        if ignored > 0 {
            warn!("Ignored {ignored} tokens with ids outside the vocabulary size {vocab_size}");
        }

        let missing = tokens_by_id.iter().filter(|token| token.is_none()).count();
        if missing > 0 {
            warn!("{missing} token ids have no entry, writing them as empty tokens");
        }

        info!("📊 Found {} tokens in vocabulary, {} merges", vocab.len(), merge_ranks.len());

        Ok(tokens_by_id
            .into_iter()
            .map(|token| match token {
                Some(token) => TokenEntry {
                    bytes: token.replace(SPACE_MARKER, " ").into_bytes(),
                    score: merge_ranks.get(token).map_or(Self::DEFAULT_SCORE, |&rank| -((rank + 1) as f32).ln()),
                },
                None => TokenEntry { bytes: Vec::new(), score: Self::DEFAULT_SCORE },
            })
            .collect())
    }

    fn load_tokenizer_json(&self, model_path: &Path) -> Result<Value> {
        let tokenizer_path = model_path.join(Self::TOKENIZER_FILE_NAME);

        if !tokenizer_path.exists() {
            anyhow::bail!("tokenizer.json not found in model directory: {}", model_path.display());
        }

        let mut file = File::open(&tokenizer_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse tokenizer.json from {}", tokenizer_path.display()))
    }

    fn write_tokenizer_file(&self, output_path: &Path, entries: &[TokenEntry]) -> Result<()> {
        let file = File::create(output_path)
            .with_context(|| format!("Failed to create tokenizer file {}", output_path.display()))?;
        let mut writer = BufWriter::new(file);

        let max_token_length = entries.iter().map(|entry| entry.bytes.len()).max().unwrap_or(0);
        writer.write_i32::<LittleEndian>(max_token_length as i32)?;

        for entry in entries {
            writer.write_f32::<LittleEndian>(entry.score)?;
            writer.write_i32::<LittleEndian>(entry.bytes.len() as i32)?;
            writer.write_all(&entry.bytes)?;
        }

        writer.flush()?;
        info!("💾 Written tokenizer model to {}", output_path.display());
        Ok(())
    }

    fn extract_vocabulary(&self, tokenizer_data: &Value) -> Result<HashMap<String, usize>> {
        let vocab_obj = tokenizer_data
            .pointer("/model/vocab")
            .or_else(|| tokenizer_data.pointer("/vocab"))
            .and_then(|v| v.as_object())
            .ok_or_else(|| anyhow::anyhow!("Could not find vocabulary in tokenizer.json"))?;

        Ok(vocab_obj
            .iter()
            .filter_map(|(token, id)| id.as_u64().map(|id| (token.clone(), id as usize)))
            .collect())
    }

    /// Special tokens listed under `added_tokens` that the model vocabulary lacks.
    fn add_special_tokens(&self, tokenizer_data: &Value, vocab: &mut HashMap<String, usize>) {
        let Some(added_tokens) = tokenizer_data.pointer("/added_tokens").and_then(|v| v.as_array()) else {
            return;
        };

        let added_count = added_tokens
            .iter()
            .filter_map(|token_info| {
                let id = token_info.pointer("/id")?.as_u64()? as usize;
                let content = token_info.pointer("/content")?.as_str()?;

                if vocab.contains_key(content) {
                    return None;
                }
                vocab.insert(content.to_string(), id);
                Some(())
            })
            .count();

        if added_count > 0 {
            info!("🎯 Added {added_count} special tokens from added_tokens");
        }
    }

    /// Maps each merge result to the rank of the first merge producing it.
    ///
    /// Merges come either as `"left right"` strings or as `["left", "right"]` pairs.
    fn extract_merge_ranks(&self, tokenizer_data: &Value) -> HashMap<String, usize> {
        let Some(merges) = tokenizer_data.pointer("/model/merges").and_then(|m| m.as_array()) else {
            return HashMap::new();
        };

        let mut ranks = HashMap::with_capacity(merges.len());
        for (rank, merge) in merges.iter().enumerate() {
            let merged = match merge {
                Value::String(pair) => pair.split_once(' ').map(|(left, right)| format!("{left}{right}")),
                Value::Array(pair) => match pair.as_slice() {
                    [Value::String(left), Value::String(right)] => Some(format!("{left}{right}")),
                    _ => None,
                },
                _ => None,
            };

            match merged {
                Some(merged) => {
                    ranks.entry(merged).or_insert(rank);
                }
                None => warn!("Skipping malformed merge #{rank}: {merge}"),
            }
        }

        ranks
    }
}

impl Default for TokenizerExporter {
    fn default() -> Self {
        Self::new()
    }
}
