//! Encoder backend contract, device selection and weight resolution
//!
//! The extraction pipeline only talks to the protein encoder through
//! [`ProteinEncoder`]; `forward_esm` provides the ESM-2 implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::alphabet::TokenBatch;

/// Layer-by-layer protein sequence encoder.
///
/// All activations are batch-major `(batch, tokens, d_model)`.
pub trait ProteinEncoder {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn padding_idx(&self) -> u32;
    /// Multiplier applied to the raw token embedding before layer 0.
    fn embed_scale(&self) -> f64;
    fn device(&self) -> &Device;

    // --- Forward pieces ---
    fn tokenize_batch(&self, sequences: &[String]) -> Result<TokenBatch>;
    /// Raw (unscaled) token embedding: `(batch, tokens)` → `(batch, tokens, d_model)`.
    fn embed(&self, tokens: &Tensor) -> Result<Tensor>;
    /// Run a single transformer layer.
    ///
    /// `key_padding_bias` is the additive `(batch, 1, 1, tokens)` bias from
    /// [`crate::masks::create_key_padding_bias`]; `None` attends over the
    /// full padded window.
    fn forward_layer(
        &self,
        x: &Tensor,
        layer: usize,
        key_padding_bias: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Compute device requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceChoice {
    /// CUDA device 0 when available, otherwise CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Resolve a [`DeviceChoice`] into a candle device.
///
/// `Cuda` fails loudly when no CUDA device can be opened; `Auto` falls back to CPU.
pub fn select_device(choice: DeviceChoice) -> Result<Device> {
    let device = match choice {
        DeviceChoice::Cpu => {
            info!("Forcing CPU mode");
            Device::Cpu
        }
        DeviceChoice::Cuda => Device::new_cuda(0).context("CUDA device requested but unavailable")?,
        DeviceChoice::Auto => match Device::cuda_if_available(0) {
            Ok(dev) if dev.is_cuda() => {
                info!("Using CUDA device");
                dev
            }
            _ => {
                info!("CUDA not available, using CPU");
                Device::Cpu
            }
        },
    };
    Ok(device)
}

/// Local files backing a pretrained encoder.
#[derive(Debug, Clone)]
pub struct WeightFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Locate `config.json` and weight files for an encoder.
///
/// `source` may be:
/// - a local weight file (`.safetensors`, `.bin`, `.pth`, `.pt`) with `config.json` beside it,
/// - a local directory holding `config.json` and `model.safetensors` (or a sharded index),
/// - a HuggingFace repo id (e.g. `facebook/esm2_t6_8M_UR50D`), downloaded via `hf_hub`.
pub fn resolve_weight_files(source: &str) -> Result<WeightFiles> {
    let path = Path::new(source);
    if path.is_file() {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = dir.join("config.json");
        // fair-esm `.pt` checkpoints ship without config.json and use their own tensor names
        anyhow::ensure!(
            config.is_file() || path.extension().and_then(|e| e.to_str()) != Some("pt"),
            "{} looks like a fair-esm checkpoint, which is not supported: pass a HuggingFace \
             repo id (e.g. facebook/esm2_t6_8M_UR50D) or a converted checkpoint with \
             HuggingFace tensor names and a config.json beside it",
            path.display()
        );
        anyhow::ensure!(
            config.is_file(),
            "Expected config.json next to encoder weights {}",
            path.display()
        );
        return Ok(WeightFiles {
            config,
            weights: vec![path.to_path_buf()],
        });
    }
    if path.is_dir() {
        let config = path.join("config.json");
        anyhow::ensure!(
            config.is_file(),
            "Encoder directory {} has no config.json",
            path.display()
        );
        let index_path = path.join("model.safetensors.index.json");
        let weights = if index_path.is_file() {
            shard_names(&index_path)?
                .into_iter()
                .map(|name| path.join(name))
                .collect()
        } else {
            let single = path.join("model.safetensors");
            anyhow::ensure!(
                single.is_file(),
                "Encoder directory {} has no model.safetensors",
                path.display()
            );
            vec![single]
        };
        return Ok(WeightFiles { config, weights });
    }

    info!("Resolving encoder weights from HuggingFace: {source}");
    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(source.to_string(), RepoType::Model));
    let config = repo
        .get("config.json")
        .with_context(|| format!("Failed to download config.json from {source}"))?;

    let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let mut paths = Vec::new();
        for shard in shard_names(&index_path)? {
            let p = repo
                .get(&shard)
                .with_context(|| format!("Failed to download {shard}"))?;
            paths.push(p);
        }
        paths
    } else if let Ok(p) = repo.get("model.safetensors") {
        vec![p]
    } else {
        let p = repo
            .get("pytorch_model.bin")
            .with_context(|| format!("No safetensors or pytorch weights found in {source}"))?;
        vec![p]
    };

    Ok(WeightFiles { config, weights })
}

/// Whether `path` is a pytorch pickle checkpoint (`.bin`, `.pth` or `.pt`).
pub fn is_pickle_weights(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("bin" | "pth" | "pt")
    )
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {}", index_path.display()))?;
    let index: SafetensorsIndex = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", index_path.display()))?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_cpu() {
        let device = select_device(DeviceChoice::Cpu).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_select_auto_always_succeeds() {
        assert!(select_device(DeviceChoice::Auto).is_ok());
    }

    #[test]
    fn test_resolve_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        let files = resolve_weight_files(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.config, dir.path().join("config.json"));
        assert_eq!(files.weights, vec![dir.path().join("model.safetensors")]);
    }

    #[test]
    fn test_resolve_local_sharded_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let files = resolve_weight_files(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_resolve_local_file_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("esm.safetensors");
        std::fs::write(&weights, b"").unwrap();
        assert!(resolve_weight_files(weights.to_str().unwrap()).is_err());

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let files = resolve_weight_files(weights.to_str().unwrap()).unwrap();
        assert_eq!(files.weights, vec![weights]);
    }

    #[test]
    fn test_resolve_fair_esm_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("esm2_t6_8M_UR50D.pt");
        std::fs::write(&weights, b"").unwrap();
        let err = resolve_weight_files(weights.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("fair-esm"), "{err}");

        // Converted checkpoints with a config are loaded as pickles
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let files = resolve_weight_files(weights.to_str().unwrap()).unwrap();
        assert!(is_pickle_weights(&files.weights[0]));
        assert!(!is_pickle_weights(Path::new("model.safetensors")));
    }
}
