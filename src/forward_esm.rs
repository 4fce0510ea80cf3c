//! ESM-2 forward pass, one layer at a time
//!
//! Custom implementation that exposes each transformer layer separately so
//! the extractor can read the hidden state after every layer.
//!
//! Based on the HuggingFace `EsmModel` layout:
//! - pre-LayerNorm attention and feed-forward blocks with residuals
//! - rotary position embeddings on q/k (rotate-half form)
//! - biases on every projection, exact (erf) GELU in the MLP
//!
//! Token dropout, the final `emb_layer_norm_after` and the LM head are not
//! part of the layer-feeding path and are not loaded.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::alphabet::{EsmAlphabet, TokenBatch};
use crate::model::{is_pickle_weights, resolve_weight_files, ProteinEncoder};

/// Model configuration (matches HuggingFace config.json for ESM-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EsmConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

fn default_vocab_size() -> usize {
    33
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_pad_token_id() -> u32 {
    1
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl EsmConfig {
    /// ESM-2 8M (`esm2_t6_8M_UR50D`) dimensions.
    pub fn esm2_t6_8m() -> Self {
        Self {
            hidden_size: 320,
            num_hidden_layers: 6,
            num_attention_heads: 20,
            intermediate_size: 1280,
            vocab_size: default_vocab_size(),
            layer_norm_eps: default_layer_norm_eps(),
            pad_token_id: default_pad_token_id(),
            rope_theta: default_rope_theta(),
        }
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary Position Embeddings, computed for the window length of each batch
struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    fn new(dim: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, len), device)?;
        Ok(Self { inv_freq })
    }

    /// `(cos, sin)`, each `[seq_len, dim/2]`
    fn cos_sin(&self, seq_len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        let positions: Vec<f32> = (0..seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), self.inv_freq.device())?;
        let freqs = positions.matmul(&self.inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

/// Multi-head self-attention with biased projections
struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    layer_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &EsmConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let query = linear(hidden, hidden, vb.pp("self").pp("query"))?;
        let key = linear(hidden, hidden, vb.pp("self").pp("key"))?;
        let value = linear(hidden, hidden, vb.pp("self").pp("value"))?;
        let dense = linear(hidden, hidden, vb.pp("output").pp("dense"))?;
        let layer_norm = layer_norm(hidden, config.layer_norm_eps, vb.pp("LayerNorm"))?;

        Ok(Self {
            query,
            key,
            value,
            dense,
            layer_norm,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Pre-LN attention block including its residual connection.
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        key_padding_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let residual = x;
        let h = self.layer_norm.forward(x)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let q = (self.query.forward(&h)? * scale)?;
        let k = self.key.forward(&h)?;
        let v = self.value.forward(&h)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (cos, sin) = rotary.cos_sin(seq_len, q.dtype())?;
        let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

        let attn_weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let attn_weights = match key_padding_bias {
            Some(bias) => attn_weights.broadcast_add(bias)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok((residual + self.dense.forward(&attn_output)?)?)
    }
}

/// Feed-forward block (pre-LN, erf GELU)
struct FeedForward {
    layer_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &EsmConfig) -> Result<Self> {
        let layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("LayerNorm"),
        )?;
        let intermediate = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
        )?;
        let output = linear(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("output").pp("dense"),
        )?;
        Ok(Self {
            layer_norm,
            intermediate,
            output,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.layer_norm.forward(x)?;
        let h = self.intermediate.forward(&h)?.gelu_erf()?;
        let h = self.output.forward(&h)?;
        Ok((residual + h)?)
    }
}

/// Single encoder layer
struct EsmLayer {
    attention: SelfAttention,
    feed_forward: FeedForward,
}

impl EsmLayer {
    fn load(vb: VarBuilder, config: &EsmConfig) -> Result<Self> {
        let attention = SelfAttention::load(vb.pp("attention"), config)?;
        let feed_forward = FeedForward::load(vb.clone(), config)?;
        Ok(Self {
            attention,
            feed_forward,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        key_padding_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = self.attention.forward(x, rotary, key_padding_bias)?;
        self.feed_forward.forward(&x)
    }
}

/// ESM-2 encoder with per-layer forward access
pub struct EsmEncoder {
    alphabet: EsmAlphabet,
    word_embeddings: Embedding,
    layers: Vec<EsmLayer>,
    rotary: RotaryEmbedding,
    config: EsmConfig,
    device: Device,
}

impl EsmEncoder {
    /// Load an ESM-2 encoder from a local path or HuggingFace repo id.
    ///
    /// See [`resolve_weight_files`] for the accepted `source` forms.
    pub fn load(source: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading ESM-2 encoder from: {source}");
        let files = resolve_weight_files(source)?;

        let config_str = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let config: EsmConfig =
            serde_json::from_str(&config_str).context("Failed to parse ESM config.json")?;
        info!(
            "Encoder config: {} layers, {} hidden, {} heads",
            config.num_hidden_layers, config.hidden_size, config.num_attention_heads
        );

        let is_pickle = files.weights.iter().any(|p| is_pickle_weights(p));
        let vb = if is_pickle {
            anyhow::ensure!(
                files.weights.len() == 1,
                "Sharded pytorch checkpoints are not supported"
            );
            VarBuilder::from_pth(&files.weights[0], dtype, device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? }
        };

        // EsmForMaskedLM checkpoints nest the encoder under `esm.`
        let vb = if vb.contains_tensor("esm.embeddings.word_embeddings.weight") {
            vb.pp("esm")
        } else {
            vb
        };

        Self::from_varbuilder(vb, config, device)
    }

    /// Build the encoder from an already-prefixed `VarBuilder`.
    pub fn from_varbuilder(vb: VarBuilder, config: EsmConfig, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            "hidden_size {} is not divisible by {} heads",
            config.hidden_size,
            config.num_attention_heads
        );
        anyhow::ensure!(
            config.head_dim() % 2 == 0,
            "Rotary embeddings need an even head dimension, got {}",
            config.head_dim()
        );

        let word_embeddings = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("embeddings").pp("word_embeddings"),
        )?;

        let vb_layers = vb.pp("encoder").pp("layer");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(EsmLayer::load(vb_layers.pp(i.to_string()), &config)?);
        }

        let rotary = RotaryEmbedding::new(config.head_dim(), config.rope_theta, device)?;

        info!("Encoder loaded with {} layers", layers.len());

        Ok(Self {
            alphabet: EsmAlphabet::esm2(),
            word_embeddings,
            layers,
            rotary,
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &EsmConfig {
        &self.config
    }
}

impl ProteinEncoder for EsmEncoder {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn padding_idx(&self) -> u32 {
        self.config.pad_token_id
    }

    fn embed_scale(&self) -> f64 {
        1.0
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn tokenize_batch(&self, sequences: &[String]) -> Result<TokenBatch> {
        Ok(self.alphabet.batch(sequences))
    }

    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(self.word_embeddings.forward(tokens)?)
    }

    fn forward_layer(
        &self,
        x: &Tensor,
        layer: usize,
        key_padding_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let block = self.layers.get(layer).ok_or_else(|| {
            anyhow::anyhow!(
                "Layer {layer} out of range (encoder has {} layers)",
                self.layers.len()
            )
        })?;
        anyhow::ensure!(
            x.dim(D::Minus1)? == self.config.hidden_size,
            "Expected hidden size {}, got shape {:?}",
            self.config.hidden_size,
            x.dims()
        );
        block.forward(x, &self.rotary, key_padding_bias)
    }
}
