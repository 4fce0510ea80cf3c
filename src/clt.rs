//! Cross-Layer Transcoder (CLT) encoder side
//!
//! Loads the per-layer encoder parameters of a trained CLT from a
//! safetensors checkpoint and exposes the pieces of its activation path
//! so the extractor can recompute latents from encoder hidden states.
//!
//! # CLT Encode Path
//!
//! For the hidden state `x` after encoder layer `l`:
//! ```text
//! x_n      = (x - mean(x)) / (std(x) + eps)      per token, no affine
//! pre_acts = W_enc[l] @ (x_n - b_pre[l]) + b_enc[l]
//! latents  = TopK(pre_acts, k)                    k highest values kept, rest 0
//! ```
//!
//! # Checkpoint Layout
//!
//! One safetensors file (tensor names may carry a `clt.` prefix):
//! - `b_pre`: shape `[n_layers, d_model]`: pre-encoder bias
//! - `b_enc`: shape `[n_layers, d_hidden]`: encoder bias
//! - `encoders.{l}.weight`: shape `[d_hidden, d_model]`: encoder weight for layer `l`
//! - header metadata `k`: top-k sparsity used during training

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::Linear;
use safetensors::tensor::{SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Epsilon added to the standard deviation in [`CrossLayerTranscoder::normalize`].
pub const NORM_EPS: f64 = 1e-5;

/// Metadata key holding the top-k sparsity.
pub const K_METADATA_KEY: &str = "k";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Identifies a single CLT latent by its layer and index within that layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CltFeatureId {
    /// Layer whose encoder produces this latent (0..n_layers)
    pub layer: usize,
    /// Latent index within the layer (0..d_hidden)
    pub index: usize,
}

impl std::fmt::Display for CltFeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}:{}", self.layer, self.index)
    }
}

/// CLT configuration auto-detected from tensor shapes and checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CltConfig {
    /// Number of encoder layers (one per base-model layer)
    pub n_layers: usize,
    /// Hidden dimension of the base model
    pub d_model: usize,
    /// Latent dimension per layer
    pub d_hidden: usize,
    /// Top-k sparsity, if the checkpoint recorded one
    pub k: Option<usize>,
}

// ---------------------------------------------------------------------------
// CrossLayerTranscoder
// ---------------------------------------------------------------------------

/// Encoder side of a cross-layer transcoder.
///
/// All parameters live on one device; they are small next to the
/// activations they are applied to.
pub struct CrossLayerTranscoder {
    config: CltConfig,
    b_pre: Vec<Tensor>,
    encoders: Vec<Linear>,
    b_enc: Vec<Tensor>,
}

impl CrossLayerTranscoder {
    /// Open a CLT checkpoint and move its parameters to `device` as F32.
    pub fn open(path: &Path, device: &Device) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read CLT checkpoint {}", path.display()))?;
        let (_, metadata) = SafeTensors::read_metadata(&data)
            .with_context(|| format!("Failed to read header of {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;

        let prefix = if st.names().iter().any(|n| n.as_str() == "clt.b_pre") {
            "clt."
        } else {
            ""
        };

        let b_pre = tensor_from_view(
            &st.tensor(&format!("{prefix}b_pre"))
                .context("Tensor 'b_pre' not found in CLT checkpoint")?,
            device,
        )?
        .to_dtype(DType::F32)?;
        let b_enc = tensor_from_view(
            &st.tensor(&format!("{prefix}b_enc"))
                .context("Tensor 'b_enc' not found in CLT checkpoint")?,
            device,
        )?
        .to_dtype(DType::F32)?;

        let (n_layers, _) = b_pre.dims2().context("Expected 2D b_pre")?;
        let mut weights = Vec::with_capacity(n_layers);
        for layer in 0..n_layers {
            let name = format!("{prefix}encoders.{layer}.weight");
            let view = st
                .tensor(&name)
                .with_context(|| format!("Tensor '{name}' not found in CLT checkpoint"))?;
            weights.push(tensor_from_view(&view, device)?.to_dtype(DType::F32)?);
        }

        let k = match metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(K_METADATA_KEY))
        {
            Some(raw) => Some(
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid CLT metadata k = {raw:?}"))?,
            ),
            None => None,
        };

        let clt = Self::from_tensors(&b_pre, weights, &b_enc, k)?;
        info!(
            "CLT config: {} layers, d_model={}, d_hidden={}, k={:?}",
            clt.config.n_layers, clt.config.d_model, clt.config.d_hidden, clt.config.k
        );
        Ok(clt)
    }

    /// Build a transcoder from raw parameters.
    ///
    /// # Shapes
    /// - `b_pre`: `[n_layers, d_model]`
    /// - `encoder_weights[l]`: `[d_hidden, d_model]`
    /// - `b_enc`: `[n_layers, d_hidden]`
    pub fn from_tensors(
        b_pre: &Tensor,
        encoder_weights: Vec<Tensor>,
        b_enc: &Tensor,
        k: Option<usize>,
    ) -> Result<Self> {
        let (n_layers, d_model) = b_pre.dims2()?;
        let (enc_layers, d_hidden) = b_enc.dims2()?;
        anyhow::ensure!(n_layers > 0, "CLT has no layers");
        anyhow::ensure!(
            enc_layers == n_layers && encoder_weights.len() == n_layers,
            "Layer count mismatch: b_pre={n_layers}, b_enc={enc_layers}, encoders={}",
            encoder_weights.len()
        );
        for (layer, w) in encoder_weights.iter().enumerate() {
            anyhow::ensure!(
                w.dims() == [d_hidden, d_model],
                "Encoder {layer} has shape {:?}, expected [{d_hidden}, {d_model}]",
                w.dims()
            );
        }

        let b_pre: Vec<Tensor> = (0..n_layers)
            .map(|l| b_pre.i(l))
            .collect::<candle_core::Result<_>>()?;
        let b_enc: Vec<Tensor> = (0..n_layers)
            .map(|l| b_enc.i(l))
            .collect::<candle_core::Result<_>>()?;
        let encoders = encoder_weights
            .into_iter()
            .map(|w| Linear::new(w, None))
            .collect();

        Ok(Self {
            config: CltConfig {
                n_layers,
                d_model,
                d_hidden,
                k,
            },
            b_pre,
            encoders,
            b_enc,
        })
    }

    /// Access the auto-detected CLT configuration.
    pub fn config(&self) -> &CltConfig {
        &self.config
    }

    /// Replace the checkpoint's top-k sparsity.
    pub fn with_k(mut self, k: usize) -> Self {
        self.config.k = Some(k);
        self
    }

    /// Top-k sparsity; errors when neither the checkpoint nor the caller set one.
    pub fn k(&self) -> Result<usize> {
        self.config.k.ok_or_else(|| {
            anyhow::anyhow!("CLT checkpoint has no '{K_METADATA_KEY}' metadata; pass k explicitly")
        })
    }

    // --- Encode path pieces ---

    /// Standardize every vector along the last axis (no affine parameters).
    ///
    /// Uses the unbiased standard deviation.
    pub fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(D::Minus1)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / n.saturating_sub(1).max(1) as f64)?;
        let std = (var.sqrt()? + NORM_EPS)?;
        Ok(centered.broadcast_div(&std)?)
    }

    /// Pre-encoder bias for `layer`, shape `[d_model]`.
    pub fn pre_encoder_bias(&self, layer: usize) -> Result<&Tensor> {
        self.check_layer(layer)?;
        Ok(&self.b_pre[layer])
    }

    /// Linear encoder (no bias) for `layer`: `[.., d_model]` → `[.., d_hidden]`.
    pub fn encoder_linear(&self, layer: usize) -> Result<&Linear> {
        self.check_layer(layer)?;
        Ok(&self.encoders[layer])
    }

    /// Encoder bias for `layer`, shape `[d_hidden]`.
    pub fn encoder_bias(&self, layer: usize) -> Result<&Tensor> {
        self.check_layer(layer)?;
        Ok(&self.b_enc[layer])
    }

    /// Dense pre-activations for `layer`: normalize, subtract `b_pre`, encode, add `b_enc`.
    ///
    /// `x` is `(.., d_model)`; the result is `(.., d_hidden)` on the same device.
    pub fn pre_activations(&self, x: &Tensor, layer: usize) -> Result<Tensor> {
        let x = self.normalize(x)?;
        let x = x.broadcast_sub(self.pre_encoder_bias(layer)?)?;
        let pre_acts = self.encoder_linear(layer)?.forward(&x)?;
        Ok(pre_acts.broadcast_add(self.encoder_bias(layer)?)?)
    }

    /// Write the parameters (and `k`, if set) back to a safetensors checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let b_pre = Tensor::stack(&self.b_pre, 0)?;
        let b_enc = Tensor::stack(&self.b_enc, 0)?;

        let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = vec![
            ("b_pre".to_string(), b_pre.dims().to_vec(), f32_le_bytes(&b_pre)?),
            ("b_enc".to_string(), b_enc.dims().to_vec(), f32_le_bytes(&b_enc)?),
        ];
        for (layer, enc) in self.encoders.iter().enumerate() {
            buffers.push((
                format!("encoders.{layer}.weight"),
                enc.weight().dims().to_vec(),
                f32_le_bytes(enc.weight())?,
            ));
        }

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                Ok((
                    name.clone(),
                    TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let metadata = self
            .config
            .k
            .map(|k| HashMap::from([(K_METADATA_KEY.to_string(), k.to_string())]));

        let data = safetensors::serialize(views, &metadata)?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write CLT checkpoint {}", path.display()))?;
        Ok(())
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        anyhow::ensure!(
            layer < self.config.n_layers,
            "Layer {layer} out of range (CLT has {} layers)",
            self.config.n_layers
        );
        Ok(())
    }
}

/// Keep the `k` highest values along the last axis of every row, zero the rest.
///
/// Ties are resolved by the sort order of `arg_sort_last_dim`. With
/// `k >= width` the input is returned unchanged; `k == 0` yields zeros.
///
/// No ReLU is applied, before or after selection. A kept latent can be
/// negative, so downstream code must treat any nonzero value as active
/// (`value != 0.0`), not only positive ones. A row with fewer than `k`
/// positive values still keeps `k` entries.
///
/// Intended for host tensors: wide rows exceed what candle's GPU
/// arg-sort supports.
pub fn top_k_sparsify(x: &Tensor, k: usize) -> Result<Tensor> {
    let width = x.dim(D::Minus1)?;
    if k >= width {
        return Ok(x.clone());
    }
    if k == 0 {
        return Ok(x.zeros_like()?);
    }
    let x = x.contiguous()?;
    let order = x.arg_sort_last_dim(false)?;
    let keep = order.narrow(D::Minus1, 0, k)?.contiguous()?;
    let values = x.gather(&keep, D::Minus1)?;
    Ok(x.zeros_like()?.scatter_add(&keep, &values, D::Minus1)?)
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
pub(crate) fn tensor_from_view(view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

/// Little-endian F32 bytes of a tensor (converted and flattened on the fly).
pub(crate) fn f32_le_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let values: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
