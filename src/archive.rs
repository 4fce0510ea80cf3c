//! Ragged per-sequence latent archives
//!
//! One archive holds the latents of one `(group, target family)` pair:
//!
//! - `activations`: one F32 tensor `(n_layers, L_i, d_hidden)` per sequence
//! - `entries`: sequence identifiers, parallel to `activations`
//! - `sequences`: raw sequences, parallel to `activations`
//!
//! On disk this is a gzip-compressed safetensors payload. Each element is
//! stored as its own tensor `activations.{i}`; `entries` and `sequences`
//! travel as JSON arrays in the safetensors header metadata. The file is
//! written to a temporary path in the output directory and renamed into
//! place, so a failed run never leaves a partial archive behind.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use safetensors::tensor::SafeTensors;
use tracing::info;

use crate::clt::tensor_from_view;

/// Format tag stored in the archive header.
pub const ARCHIVE_FORMAT: &str = "clt-latents/ragged-v1";

/// File extension of written archives.
pub const ARCHIVE_EXTENSION: &str = "safetensors.gz";

/// Which side of a family split a group of sequences comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    /// Members of the target family
    Positives,
    /// Sequences outside the target family
    Negatives,
}

impl Group {
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Positives => "positives",
            Group::Negatives => "negatives",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{group}_{target}.safetensors.gz`
pub fn archive_file_name(group: Group, target: &str) -> String {
    format!("{group}_{target}.{ARCHIVE_EXTENSION}")
}

// ---------------------------------------------------------------------------
// RaggedActivations
// ---------------------------------------------------------------------------

/// Ordered collection of per-sequence latent arrays with differing lengths.
///
/// Elements are never stacked into one dense tensor. Every element is a
/// rank-3 F32 host tensor `(n_layers, L, d_hidden)`, and all elements share
/// `n_layers` and `d_hidden`.
#[derive(Debug, Clone, Default)]
pub struct RaggedActivations {
    arrays: Vec<Tensor>,
}

impl RaggedActivations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            arrays: Vec::with_capacity(n),
        }
    }

    /// Append one sequence's latents; shape disagreements are hard errors.
    pub fn push(&mut self, array: Tensor) -> Result<()> {
        anyhow::ensure!(
            array.rank() == 3,
            "Ragged element {} must be (n_layers, L, d_hidden), got {:?}",
            self.arrays.len(),
            array.dims()
        );
        let array = array.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        if let Some(first) = self.arrays.first() {
            let (layers, _, hidden) = first.dims3()?;
            let (l, _, h) = array.dims3()?;
            anyhow::ensure!(
                l == layers && h == hidden,
                "Ragged element {} has shape {:?}, expected ({layers}, _, {hidden})",
                self.arrays.len(),
                array.dims()
            );
        }
        self.arrays.push(array);
        Ok(())
    }

    pub fn extend(&mut self, arrays: impl IntoIterator<Item = Tensor>) -> Result<()> {
        for array in arrays {
            self.push(array)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Tensor> {
        self.arrays.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.arrays.iter()
    }

    /// Per-element shapes `(n_layers, L_i, d_hidden)`.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.arrays.iter().map(|a| a.dims().to_vec()).collect()
    }
}

// ---------------------------------------------------------------------------
// LatentArchive
// ---------------------------------------------------------------------------

/// Latents plus the metadata needed to map them back to sequences.
#[derive(Debug, Clone)]
pub struct LatentArchive {
    activations: RaggedActivations,
    entries: Vec<String>,
    sequences: Vec<String>,
}

impl LatentArchive {
    /// Bundle the three parallel fields, checking lengths and per-element shapes.
    pub fn new(
        activations: RaggedActivations,
        entries: Vec<String>,
        sequences: Vec<String>,
    ) -> Result<Self> {
        anyhow::ensure!(
            activations.len() == entries.len() && entries.len() == sequences.len(),
            "Archive fields disagree: {} activations, {} entries, {} sequences",
            activations.len(),
            entries.len(),
            sequences.len()
        );
        for (i, (array, seq)) in activations.iter().zip(&sequences).enumerate() {
            let residues = seq.chars().count();
            anyhow::ensure!(
                array.dim(1)? == residues,
                "activations[{i}] covers {} positions but sequence {i} has {residues} residues",
                array.dim(1)?
            );
        }
        Ok(Self {
            activations,
            entries,
            sequences,
        })
    }

    pub fn activations(&self) -> &RaggedActivations {
        &self.activations
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn sequences(&self) -> &[String] {
        &self.sequences
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize, compress and atomically write the archive to `path`.
    ///
    /// The uncompressed safetensors payload is staged in a temporary file
    /// beside `path` and streamed through the gzip encoder, so only one
    /// element's bytes are held in memory at a time.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let staging = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        safetensors::serialize_to_file(self.named_arrays(), &Some(self.header()?), staging.path())
            .with_context(|| format!("Failed to serialize archive for {}", path.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        {
            let mut payload = std::fs::File::open(staging.path())?;
            let mut gz = GzEncoder::new(tmp.as_file_mut(), Compression::default());
            std::io::copy(&mut payload, &mut gz)?;
            gz.finish()?.sync_all()?;
        }
        drop(staging);
        tmp.persist(path)
            .with_context(|| format!("Failed to move archive into place at {}", path.display()))?;
        sync_dir(&dir)
            .with_context(|| format!("Failed to sync directory {}", dir.display()))?;

        info!("Saved {} sequences to {}", self.len(), path.display());
        Ok(())
    }

    /// Read and validate an archive written by [`LatentArchive::write`].
    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open archive {}", path.display()))?;
        let mut payload = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut payload)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;
        Self::from_safetensors(&payload)
            .with_context(|| format!("Invalid latent archive {}", path.display()))
    }

    /// `activations.{i}` names paired with the element tensors.
    fn named_arrays(&self) -> impl Iterator<Item = (String, &Tensor)> {
        self.activations
            .iter()
            .enumerate()
            .map(|(i, a)| (format!("activations.{i}"), a))
    }

    fn header(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            ("format".to_string(), ARCHIVE_FORMAT.to_string()),
            ("n_sequences".to_string(), self.len().to_string()),
            ("entries".to_string(), serde_json::to_string(&self.entries)?),
            ("sequences".to_string(), serde_json::to_string(&self.sequences)?),
        ]))
    }

    fn from_safetensors(payload: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(payload)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Archive header has no metadata"))?;
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| anyhow::anyhow!("Archive metadata is missing '{key}'"))
        };

        let format = field("format")?;
        anyhow::ensure!(
            format == ARCHIVE_FORMAT,
            "Unsupported archive format {format:?}"
        );
        let n: usize = field("n_sequences")?.parse().context("Invalid n_sequences")?;
        let entries: Vec<String> =
            serde_json::from_str(field("entries")?).context("Invalid entries field")?;
        let sequences: Vec<String> =
            serde_json::from_str(field("sequences")?).context("Invalid sequences field")?;

        let st = SafeTensors::deserialize(payload)?;
        anyhow::ensure!(
            st.names().len() == n,
            "Archive declares {n} sequences but stores {} arrays",
            st.names().len()
        );
        let mut activations = RaggedActivations::with_capacity(n);
        for i in 0..n {
            let view = st
                .tensor(&format!("activations.{i}"))
                .with_context(|| format!("Archive is missing activations.{i}"))?;
            activations.push(tensor_from_view(&view, &Device::Cpu)?)?;
        }

        Self::new(activations, entries, sequences)
    }
}

/// Fsync a directory so a rename inside it survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
