//! Per-layer latent cache for one batch, and per-sequence reassembly

use anyhow::Result;
use candle_core::{Device, Tensor};

/// First residue position in a token window (index 0 is the leading marker).
pub const FIRST_RESIDUE: usize = 1;

/// Latents for every layer of one batch.
///
/// Each tensor is batch-major `(batch, max_tokens, d_hidden)` on the host.
/// The cache lives for a single batch iteration.
#[derive(Debug)]
pub struct LayerLatents {
    layers: Vec<Tensor>,
}

impl LayerLatents {
    /// Create an empty cache with capacity for n_layers
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            layers: Vec::with_capacity(n_layers),
        }
    }

    /// Add one layer's latent tensor, moving it to host memory.
    ///
    /// All layers must share the same `(batch, max_tokens, d_hidden)` shape.
    pub fn push(&mut self, latents: Tensor) -> Result<()> {
        let latents = latents.to_device(&Device::Cpu)?;
        anyhow::ensure!(
            latents.rank() == 3,
            "Layer latents must be (batch, tokens, hidden), got {:?}",
            latents.dims()
        );
        if let Some(first) = self.layers.first() {
            anyhow::ensure!(
                first.dims() == latents.dims(),
                "Layer latents shape {:?} differs from first layer {:?}",
                latents.dims(),
                first.dims()
            );
        }
        self.layers.push(latents);
        Ok(())
    }

    /// Get the latent tensor for a specific layer
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(layer)
    }

    /// Get the number of cached layers
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// `(batch, max_tokens, d_hidden)` shared by all layers.
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        let first = self
            .layers
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cache is empty"))?;
        Ok(first.dims3()?)
    }

    /// Residue-aligned latents of one sequence in the batch.
    ///
    /// Takes token positions `[1, residue_len + 1)` of row `b` from every
    /// layer and stacks them into `(n_layers, residue_len, d_hidden)`.
    /// The window must hold both markers (`residue_len + 2 <= max_tokens`);
    /// anything shorter means the tokenizer truncated the sequence.
    pub fn sequence(&self, b: usize, residue_len: usize) -> Result<Tensor> {
        let (batch, max_tokens, _) = self.dims()?;
        anyhow::ensure!(b < batch, "Row {b} out of range (batch size {batch})");
        anyhow::ensure!(
            residue_len + 2 <= max_tokens,
            "Sequence {b} has {residue_len} residues but the token window is {max_tokens} \
             (expected marker, residues, marker)"
        );

        let slices = self
            .layers
            .iter()
            .map(|layer| Ok(layer.get(b)?.narrow(0, FIRST_RESIDUE, residue_len)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&slices, 0)?.contiguous()?)
    }

    /// Reassemble every row of the batch, in order.
    ///
    /// `sequences` must be the batch's input strings; residue length is
    /// counted in characters.
    pub fn into_sequences(self, sequences: &[String]) -> Result<Vec<Tensor>> {
        let (batch, _, _) = self.dims()?;
        anyhow::ensure!(
            batch == sequences.len(),
            "Cache holds {batch} rows but {} sequences were given",
            sequences.len()
        );
        sequences
            .iter()
            .enumerate()
            .map(|(b, seq)| self.sequence(b, seq.chars().count()))
            .collect()
    }
}
