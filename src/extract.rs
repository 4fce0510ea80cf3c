//! Layer-wise latent extraction
//!
//! Runs the encoder one layer at a time and applies the transcoder's
//! per-layer encode path to each layer's output as soon as it exists:
//!
//! ```text
//! tokens → embed · scale → layer 0 → normalize − b_pre[0] → W_enc[0] + b_enc[0] → top-k → host
//!                        → layer 1 → ...
//! ```
//!
//! Only one layer's dense pre-activations are ever resident on the device.
//! Sparse latents are moved to host memory before the next layer runs, then
//! the batch is reassembled into one `(n_layers, L, d_hidden)` array per
//! sequence.

use anyhow::Result;
use candle_core::{Device, Tensor};
use tracing::{debug, warn};

use crate::archive::RaggedActivations;
use crate::batch::{partition, DEFAULT_BATCH_SIZE};
use crate::cache::LayerLatents;
use crate::clt::{top_k_sparsify, CrossLayerTranscoder};
use crate::masks::{create_key_padding_bias, create_padding_mask};
use crate::model::ProteinEncoder;

/// Knobs for a single extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Layers to run, starting from layer 0
    pub n_layers: usize,
    /// Nonzero latents kept per token position
    pub k: usize,
    /// Sequences per encoder batch
    pub batch_size: usize,
    /// Hide padded keys from self-attention (off: attention also sees padding)
    pub mask_padding_in_attention: bool,
}

impl ExtractionOptions {
    /// Options covering every transcoder layer with the transcoder's own `k`.
    pub fn for_transcoder(clt: &CrossLayerTranscoder) -> Result<Self> {
        Ok(Self {
            n_layers: clt.config().n_layers,
            k: clt.k()?,
            batch_size: DEFAULT_BATCH_SIZE,
            mask_padding_in_attention: false,
        })
    }
}

/// Encoder + transcoder pair producing per-residue sparse latents
pub struct LatentExtractor<'a, E: ProteinEncoder + ?Sized> {
    encoder: &'a E,
    clt: &'a CrossLayerTranscoder,
    options: ExtractionOptions,
}

impl<'a, E: ProteinEncoder + ?Sized> LatentExtractor<'a, E> {
    /// Pair an encoder with a transcoder.
    ///
    /// Fails when more layers are requested than the transcoder has, or when
    /// the two models disagree on `d_model`. Requesting more layers than the
    /// encoder has is allowed: extraction stops at the encoder's last layer.
    pub fn new(
        encoder: &'a E,
        clt: &'a CrossLayerTranscoder,
        options: ExtractionOptions,
    ) -> Result<Self> {
        let clt_config = clt.config();
        anyhow::ensure!(
            options.n_layers <= clt_config.n_layers,
            "Requested {} layers but the CLT only has {}",
            options.n_layers,
            clt_config.n_layers
        );
        anyhow::ensure!(
            encoder.d_model() == clt_config.d_model,
            "Encoder hidden size {} does not match CLT d_model {}",
            encoder.d_model(),
            clt_config.d_model
        );
        anyhow::ensure!(
            options.batch_size > 0,
            "Batch size must be positive, got {}",
            options.batch_size
        );
        if options.n_layers > encoder.n_layers() {
            warn!(
                "Requested {} layers but the encoder only has {}; extracting {}",
                options.n_layers,
                encoder.n_layers(),
                encoder.n_layers()
            );
        }
        Ok(Self {
            encoder,
            clt,
            options,
        })
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Number of layers actually extracted
    pub fn effective_layers(&self) -> usize {
        self.options.n_layers.min(self.encoder.n_layers())
    }

    /// Sparse latents for every extracted layer of one batch.
    ///
    /// Each cached layer is `(batch, max_tokens, d_hidden)` on the host,
    /// with token index 0 being the leading marker.
    pub fn extract_batch(&self, sequences: &[String]) -> Result<LayerLatents> {
        let device = self.encoder.device();
        let batch = self.encoder.tokenize_batch(sequences)?;
        let tokens = batch.to_tensor(device)?;

        let mut x = (self.encoder.embed(&tokens)? * self.encoder.embed_scale())?;

        let key_padding_bias = if self.options.mask_padding_in_attention {
            let mask = create_padding_mask(&tokens, self.encoder.padding_idx())?;
            Some(create_key_padding_bias(&mask, x.dtype())?)
        } else {
            None
        };

        let n_layers = self.effective_layers();
        let mut latents = LayerLatents::with_capacity(n_layers);
        for layer in 0..n_layers {
            x = self
                .encoder
                .forward_layer(&x, layer, key_padding_bias.as_ref())?;
            latents.push(self.encode_layer(&x, layer)?)?;
        }

        debug!(
            "Batch of {} sequences ({} tokens): {} layers extracted",
            batch.batch_size(),
            batch.max_tokens(),
            latents.n_layers()
        );
        Ok(latents)
    }

    /// Transcoder encode path for one layer's hidden states, ending on the host.
    fn encode_layer(&self, hidden: &Tensor, layer: usize) -> Result<Tensor> {
        // Top-k runs host-side; the dense pre-activations leave the device here
        let pre_acts = self
            .clt
            .pre_activations(hidden, layer)?
            .to_device(&Device::Cpu)?;
        top_k_sparsify(&pre_acts, self.options.k)
    }

    /// Per-sequence latent arrays for one batch, in input order.
    pub fn batch_latents(&self, sequences: &[String]) -> Result<Vec<Tensor>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        self.extract_batch(sequences)?.into_sequences(sequences)
    }

    /// Ragged per-sequence latents for a whole group of sequences.
    ///
    /// Element `i` has shape `(n_layers, chars(sequences[i]), d_hidden)`.
    pub fn extract(&self, sequences: &[String]) -> Result<RaggedActivations> {
        let batches = partition(sequences, self.options.batch_size)?;
        let mut out = RaggedActivations::with_capacity(sequences.len());
        for (i, batch) in batches.iter().enumerate() {
            debug!("Batch {}/{}", i + 1, batches.len());
            out.extend(self.batch_latents(batch)?)?;
        }
        Ok(out)
    }
}
