//! Byte-pair-encoding tokenizer for Llama-2 style vocabularies.
//!
//! - Loads the vocabulary and merge scores from a binary file.
//! - Encodes text by looking up every code point (falling back to raw byte tokens), then greedily merging
//!   the best scoring adjacent pair until nothing merges.
//! - Decodes token ids back to byte pieces, which are not necessarily valid UTF-8 on their own.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::slice;

/// Unknown token id.
pub const UNK_TOKEN_ID: usize = 0;
/// Beginning-of-sequence token id.
pub const BOS_TOKEN_ID: usize = 1;
/// End-of-sequence token id.
pub const EOS_TOKEN_ID: usize = 2;
/// Raw byte `b` is token `b + BYTE_FALLBACK_OFFSET`.
pub const BYTE_FALLBACK_OFFSET: usize = 3;

/// Tokenizer for byte-level BPE models.
///
/// The sorted index is built once at construction, so a constructed tokenizer is always ready to encode.
pub struct Tokenizer {
    /// Vocabulary: each token is a byte sequence (not necessarily valid UTF-8)
    vocab: Vec<Vec<u8>>,
    /// Merge scores for BPE merges (higher is better)
    merge_scores: Vec<f32>,
    /// Maximum token length (in bytes)
    max_token_length: usize,
    /// Token ids ordered by their bytes, for binary search
    sorted_ids: Vec<usize>,
    /// Every byte value, so single-byte pieces can be returned as slices
    byte_pieces: [u8; 256],
}

impl Tokenizer {
    /// Loads a tokenizer holding `vocab_size` entries from a vocabulary file.
    pub fn new(tokenizer_path: impl AsRef<Path>, vocab_size: usize) -> Result<Self> {
        let tokenizer_path = tokenizer_path.as_ref();
        let file = File::open(tokenizer_path)
            .with_context(|| format!("Failed to open tokenizer: {}", tokenizer_path.display()))?;

        Self::from_reader(BufReader::new(file), vocab_size)
            .with_context(|| format!("Failed to load tokenizer from {}", tokenizer_path.display()))
    }

    /// Reads the vocabulary format: `i32` max token length, then `f32` score, `i32` length and raw bytes per entry.
    pub fn from_reader<R: Read>(mut reader: R, vocab_size: usize) -> Result<Self> {
        if vocab_size <= EOS_TOKEN_ID {
            anyhow::bail!("Vocabulary of {vocab_size} tokens cannot hold the special tokens");
        }

        let max_token_length = reader.read_i32::<LittleEndian>().context("Failed to read max token length")?;
        let max_token_length = usize::try_from(max_token_length)
            .with_context(|| format!("Invalid max token length: {max_token_length}"))?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut merge_scores = Vec::with_capacity(vocab_size);

        for token_id in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .with_context(|| format!("Failed to read score of token {token_id}"))?;

            let len = reader
                .read_i32::<LittleEndian>()
                .with_context(|| format!("Failed to read length of token {token_id}"))?;
            let len = usize::try_from(len).with_context(|| format!("Invalid length {len} of token {token_id}"))?;
            if len > max_token_length {
                anyhow::bail!("Token {token_id} has length {len}, above the declared maximum {max_token_length}");
            }

            let mut token_bytes = vec![0u8; len];
            reader
                .read_exact(&mut token_bytes)
                .with_context(|| format!("Failed to read {len} bytes of token {token_id}"))?;

            merge_scores.push(score);
            vocab.push(token_bytes);
        }

        let mut sorted_ids: Vec<usize> = (0..vocab_size).collect();
        sorted_ids.sort_by(|&a, &b| vocab[a].cmp(&vocab[b]));

        Ok(Self { vocab, merge_scores, max_token_length, sorted_ids, byte_pieces: std::array::from_fn(|b| b as u8) })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn max_token_length(&self) -> usize {
        self.max_token_length
    }

    /// Raw bytes of a token, empty for ids outside the vocabulary.
    pub fn piece(&self, token: usize) -> &[u8] {
        self.vocab.get(token).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn score(&self, token: usize) -> Option<f32> {
        self.merge_scores.get(token).copied()
    }

    /// Looks up a byte string in the vocabulary and returns its token id, the lowest one on duplicates.
    pub fn str_lookup(&self, bytes: &[u8]) -> Option<usize> {
        let idx = self.sorted_ids.partition_point(|&id| self.vocab[id].as_slice() < bytes);
        self.sorted_ids.get(idx).copied().filter(|&id| self.vocab[id] == bytes)
    }

    /// Encodes text into token ids.
    ///
    /// 1. Optionally emits BOS, then a leading space token for non-empty text.
    /// 2. Looks up every code point, falling back to one token per UTF-8 byte on a miss.
    /// 3. Repeatedly merges the adjacent pair whose concatenation is the best scoring vocabulary entry,
    ///    until no pair merges. Every merge shortens the sequence by one.
    /// 4. Optionally appends EOS.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<usize> {
        let mut tokens = Vec::with_capacity(text.len() + 3);

        if bos {
            tokens.push(BOS_TOKEN_ID);
        }

        // The vocabulary treats words as starting with a space
        if !text.is_empty() {
            match self.str_lookup(b" ") {
                Some(id) => tokens.push(id),
                None => tokens.push(self.byte_token(b' ')),
            }
        }

        let mut utf8_buffer = [0u8; 4];
        for ch in text.chars() {
            let code_point = ch.encode_utf8(&mut utf8_buffer).as_bytes();

            match self.str_lookup(code_point) {
                Some(id) => tokens.push(id),
                None => tokens.extend(code_point.iter().map(|&byte| self.byte_token(byte))),
            }
        }

        self.merge(&mut tokens);

        if eos {
            tokens.push(EOS_TOKEN_ID);
        }

        tokens
    }

    /// Merges adjacent pairs until none is in the vocabulary, returning the number of merges.
    fn merge(&self, tokens: &mut Vec<usize>) -> usize {
        let mut merges = 0;
        let mut merged_bytes = Vec::with_capacity(self.max_token_length * 2 + 2);

        loop {
            let mut best: Option<(usize, usize, f32)> = None;

            for (idx, pair) in tokens.windows(2).enumerate() {
                merged_bytes.clear();
                merged_bytes.extend_from_slice(self.piece(pair[0]));
                merged_bytes.extend_from_slice(self.piece(pair[1]));

                if let Some(id) = self.str_lookup(&merged_bytes) {
                    let score = self.merge_scores[id];
                    if best.is_none_or(|(_, _, best_score)| score > best_score) {
                        best = Some((idx, id, score));
                    }
                }
            }

            let Some((idx, id, _)) = best else {
                break;
            };

            tokens[idx] = id;
            tokens.remove(idx + 1);
            merges += 1;
        }

        merges
    }

    fn byte_token(&self, byte: u8) -> usize {
        let id = byte as usize + BYTE_FALLBACK_OFFSET;
        if id < self.vocab.len() {
            id
        } else {
            warn!("No byte token for 0x{byte:02X} in a vocabulary of {} entries", self.vocab.len());
            UNK_TOKEN_ID
        }
    }

    /// Decodes `token` into its byte piece, given the token that precedes it.
    ///
    /// The leading space of the first piece after BOS is dropped, and raw byte tokens of the
    /// form `<0xHH>` decode to the single byte they stand for.
    pub fn decode(&self, prev_token: usize, token: usize) -> &[u8] {
        let mut piece = self.piece(token);

        if prev_token == BOS_TOKEN_ID && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }

        match parse_byte_piece(piece) {
            Some(byte) => slice::from_ref(&self.byte_pieces[byte as usize]),
            None => piece,
        }
    }
}

/// Parses `<0xHH>` into the byte value it names.
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    match piece {
        [b'<', b'0', b'x', hi, lo, b'>'] => {
            let hex = [*hi, *lo];
            u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()
        }
        _ => None,
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let special = |id: usize| (id, String::from_utf8_lossy(self.piece(id)).into_owned());

        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("max_token_length", &self.max_token_length)
            .field("bos_token", &special(BOS_TOKEN_ID))
            .field("eos_token", &special(EOS_TOKEN_ID))
            .finish_non_exhaustive()
    }
}
