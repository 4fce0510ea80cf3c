//! Padding masks for batched encoder passes
//!
//! Two related tensors are derived from a token batch:
//!
//! - the *non-padding mask* `(batch, tokens)`, `1` where `token != <pad>`;
//! - the *key padding bias* `(batch, 1, 1, tokens)`, `0.0` for real keys and
//!   `-inf` for padded keys, broadcast-added to attention scores before softmax.
//!
//! The encoder only receives the bias when padding-aware attention is enabled.

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Non-padding mask for a `(batch, tokens)` token tensor.
///
/// Returns a `u8` tensor of the same shape: `1` for real tokens (markers
/// included), `0` for padding.
pub fn create_padding_mask(tokens: &Tensor, padding_idx: u32) -> Result<Tensor> {
    Ok(tokens.ne(padding_idx)?)
}

/// Additive attention bias that hides padded key positions.
///
/// # Returns
///
/// A tensor of shape `[batch, 1, 1, tokens]` in `dtype` where:
/// - `0.0` for keys that can be attended to
/// - `-inf` for padded keys
///
/// # Example
///
/// For a mask row `[1, 1, 1, 0]`:
/// ```text
/// [[[[0, 0, 0, -inf]]]]
/// ```
pub fn create_key_padding_bias(padding_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, tokens) = padding_mask.dims2()?;
    let valid: Vec<u8> = padding_mask.flatten_all()?.to_vec1()?;
    let bias: Vec<f32> = valid
        .iter()
        .map(|&v| if v != 0 { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    Ok(Tensor::from_vec(bias, (batch, 1, 1, tokens), padding_mask.device())?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::{EsmAlphabet, PAD_IDX};
    use candle_core::Device;

    #[test]
    fn test_padding_mask_values() {
        let alphabet = EsmAlphabet::esm2();
        let batch = alphabet.batch(&["MKV".to_string(), "M".to_string()]);
        let tokens = batch.to_tensor(&Device::Cpu).unwrap();

        let mask = create_padding_mask(&tokens, PAD_IDX).unwrap();
        assert_eq!(mask.dims(), &[2, 5]);

        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1, 1, 1, 1, 1]);
        assert_eq!(rows[1], vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_key_padding_bias_shape_and_values() {
        let mask = Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 1, 1]], &Device::Cpu).unwrap();
        let bias = create_key_padding_bias(&mask, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[2, 1, 1, 4]);

        let data: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&data[..3], &[0.0, 0.0, 0.0]);
        assert!(data[3].is_infinite() && data[3] < 0.0);
        assert!(data[4..].iter().all(|&v| v == 0.0));
    }
}
