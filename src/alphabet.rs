//! ESM-2 alphabet and batch converter
//!
//! ESM models use a fixed character-level vocabulary, so there is no
//! tokenizer file to load: every residue maps to exactly one token.
//! A batch is converted to the layout the encoder expects:
//!
//! ```text
//! index:   0       1 .. L      L+1     L+2 .. max_len+1
//! token:   <cls>   residues    <eos>   <pad> ...
//! ```
//!
//! Index 0 and index `L+1` are the marker tokens that the reassembler strips.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Beginning-of-sequence marker (`<cls>`)
pub const CLS_IDX: u32 = 0;
/// Padding token (`<pad>`)
pub const PAD_IDX: u32 = 1;
/// End-of-sequence marker (`<eos>`)
pub const EOS_IDX: u32 = 2;
/// Unknown residue (`<unk>`)
pub const UNK_IDX: u32 = 3;
/// Mask token (`<mask>`)
pub const MASK_IDX: u32 = 32;

/// Residue tokens in vocabulary order, starting at index 4.
const RESIDUE_TOKENS: [char; 27] = [
    'L', 'A', 'G', 'V', 'S', 'E', 'R', 'T', 'I', 'D', 'P', 'K', 'Q', 'N', 'F', 'Y', 'M', 'H', 'W',
    'C', 'X', 'B', 'U', 'Z', 'O', '.', '-',
];

/// Character-level ESM vocabulary.
#[derive(Debug, Clone)]
pub struct EsmAlphabet {
    residue_to_id: HashMap<char, u32>,
}

impl Default for EsmAlphabet {
    fn default() -> Self {
        Self::esm2()
    }
}

impl EsmAlphabet {
    /// The ESM-1b / ESM-2 alphabet (33 tokens).
    pub fn esm2() -> Self {
        let residue_to_id = RESIDUE_TOKENS
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32 + 4))
            .collect();
        Self { residue_to_id }
    }

    /// Total vocabulary size including specials and the alignment filler.
    pub fn vocab_size(&self) -> usize {
        MASK_IDX as usize + 1
    }

    pub fn padding_idx(&self) -> u32 {
        PAD_IDX
    }

    /// Token ID for a single residue (`<unk>` when not in the vocabulary).
    pub fn residue_id(&self, residue: char) -> u32 {
        self.residue_to_id.get(&residue).copied().unwrap_or(UNK_IDX)
    }

    /// Encode the residues of one sequence, without markers.
    pub fn encode(&self, sequence: &str) -> Vec<u32> {
        sequence.chars().map(|c| self.residue_id(c)).collect()
    }

    /// Convert a batch of sequences into a marker-bracketed, right-padded token batch.
    pub fn batch(&self, sequences: &[String]) -> TokenBatch {
        let residue_lengths: Vec<usize> = sequences.iter().map(|s| s.chars().count()).collect();
        let max_tokens = residue_lengths.iter().max().copied().unwrap_or(0) + 2;

        let mut ids = Vec::with_capacity(sequences.len() * max_tokens);
        for (seq, &len) in sequences.iter().zip(&residue_lengths) {
            ids.push(CLS_IDX);
            ids.extend(self.encode(seq));
            ids.push(EOS_IDX);
            ids.extend(std::iter::repeat(PAD_IDX).take(max_tokens - len - 2));
        }

        TokenBatch {
            ids,
            batch_size: sequences.len(),
            max_tokens,
            residue_lengths,
        }
    }
}

/// A tokenized batch, row-major `(batch_size, max_tokens)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<u32>,
    batch_size: usize,
    max_tokens: usize,
    residue_lengths: Vec<usize>,
}

impl TokenBatch {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Token window length including both markers and padding.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Residue count of every sequence, markers excluded.
    pub fn residue_lengths(&self) -> &[usize] {
        &self.residue_lengths
    }

    /// Token IDs of row `b` (including markers and padding).
    pub fn row(&self, b: usize) -> Option<&[u32]> {
        if b >= self.batch_size {
            return None;
        }
        Some(&self.ids[b * self.max_tokens..(b + 1) * self.max_tokens])
    }

    /// Materialize as a `u32` tensor of shape `(batch_size, max_tokens)`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.ids.clone(),
            (self.batch_size, self.max_tokens),
            device,
        )?)
    }
}
